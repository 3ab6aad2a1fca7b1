//! Payment requests, gateway adapters and the token cache they share

pub mod error;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod token_cache;
pub mod types;
pub mod validator;

pub use error::{GatewayError, GatewayResult, TokenError};
pub use provider::{CallbackEvent, CallbackMetadata, GatewayAdapter, GatewayStatus, InitiateOutcome};
pub use registry::GatewayRegistry;
pub use token_cache::{AccessToken, AccessTokenCache, ClientCredentialsSource, GrantStyle, TokenSource};
pub use types::{MethodDetails, PaymentMethod, PaymentRequest, PaymentStatus};
pub use validator::{InvalidField, PaymentRequestValidator, ValidationErrors};
