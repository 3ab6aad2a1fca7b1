//! Inbound payment operations and callback handling

pub mod callback_ingester;
pub mod payment_service;
pub mod response;

pub use callback_ingester::{CallbackIngester, IngestOutcome};
pub use payment_service::PaymentService;
pub use response::ApiResponse;
