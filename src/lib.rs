#![doc = include_str!("../README.md")]

pub mod codec;
pub mod error;
pub mod error_uri;
pub mod middleware;
pub mod oauth;
pub mod pkce;
pub mod state_store;
pub mod types;

// Re-exports for convenient access
pub use codec::{SealedSession, SealingKey, SessionCodec};
pub use error::Error;
pub use error_uri::validate_error_uri;
pub use middleware::{
    AuthState, CurrentSession, PortalAuthConfig, auth_routes, gatekeeper,
};
pub use oauth::{ClientCredentials, TokenBroker, TokenClient, TokenResponse};
pub use state_store::StateStore;
pub use types::{PendingAuthState, Role, Session, SessionMetadata, TokenBundle};
