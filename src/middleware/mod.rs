//! Axum integration: the request gatekeeper, auth routes, and configuration.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use carelink_auth::middleware::{AuthState, PortalAuthConfig, auth_routes, gatekeeper};
//!
//! let config = PortalAuthConfig::from_env()?;
//! let credentials = config.credentials_from_env()?;
//! let state = AuthState::new(config, credentials);
//!
//! let app = axum::Router::new()
//!     .merge(portal_routes())             // your FHIR/UI handlers
//!     .layer(axum::middleware::from_fn_with_state(state.clone(), gatekeeper))
//!     .merge(auth_routes(state));         // login / callback / logout
//! ```
//!
//! Handlers behind the gatekeeper receive the validated session via the
//! [`CurrentSession`] extractor.

mod config;
mod cookies;
mod error;
mod extractor;
mod gatekeeper;
mod routes;
mod state;

pub use config::{
    CredentialResolver, IssuerConfig, PortalAuthConfig, StaticCredentials,
};
pub use cookies::{META_COOKIE, TOKEN_COOKIE};
pub use error::AuthError;
pub use extractor::CurrentSession;
pub use gatekeeper::{CookieUpdate, GateAction, GateDecision, evaluate, gatekeeper};
pub use routes::auth_routes;
pub use state::AuthState;
