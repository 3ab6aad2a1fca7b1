//! HTTP middleware
//!
//! Provides request/response logging and outbound-call timing

pub mod logging;
