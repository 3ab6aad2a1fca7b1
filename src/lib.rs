//! Payment orchestration engine
//!
//! A unified facade over a mobile-money push-payment gateway, a
//! redirect/capture provider, and a synchronous card gateway. All three
//! completion models (asynchronous callback, explicit capture, synchronous
//! response) converge on one ledger whose status transitions are
//! terminal-once and idempotent.

pub mod api;
pub mod clock;
pub mod config;
#[cfg(feature = "database")]
pub mod database;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
