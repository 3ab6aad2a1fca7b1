//! Background workers

pub mod status_reconciler;

pub use status_reconciler::{ReconcilerConfig, StatusReconciler, SweepReport};
