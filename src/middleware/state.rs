use std::sync::Arc;

use crate::codec::SessionCodec;
use crate::oauth::{TokenBroker, TokenClient};
use crate::state_store::StateStore;

use super::config::{CredentialResolver, IssuerConfig, PortalAuthConfig, PortalSettings};

/// Shared state for the gatekeeper and auth route handlers.
#[derive(Clone)]
pub struct AuthState {
    pub(crate) tokens: Arc<dyn TokenBroker>,
    pub(crate) codec: Arc<SessionCodec>,
    pub(crate) states: Arc<StateStore>,
    pub(crate) credentials: Arc<dyn CredentialResolver>,
    pub(crate) issuers: Arc<Vec<IssuerConfig>>,
    pub(crate) settings: Arc<PortalSettings>,
}

impl AuthState {
    /// Build runtime state from configuration with the HTTP token client.
    #[must_use]
    pub fn new(config: PortalAuthConfig, credentials: impl CredentialResolver + 'static) -> Self {
        Self::with_broker(config, credentials, Arc::new(TokenClient::new()))
    }

    /// Build runtime state with an explicit [`TokenBroker`]; tests use this
    /// to swap in a stub instead of a live token endpoint.
    #[must_use]
    pub fn with_broker(
        config: PortalAuthConfig,
        credentials: impl CredentialResolver + 'static,
        tokens: Arc<dyn TokenBroker>,
    ) -> Self {
        let state_ttl_ms = config.settings.state_ttl_ms;
        Self {
            tokens,
            codec: Arc::new(SessionCodec::new(config.sealing_key)),
            states: Arc::new(StateStore::new(state_ttl_ms)),
            credentials: Arc::new(credentials),
            issuers: Arc::new(config.issuers),
            settings: Arc::new(config.settings),
        }
    }

    /// Issuer configuration by identity, or the first configured issuer when
    /// the caller does not name one.
    pub(crate) fn issuer(&self, iss: Option<&str>) -> Option<&IssuerConfig> {
        match iss {
            Some(iss) => self.issuers.iter().find(|i| i.issuer == iss),
            None => self.issuers.first(),
        }
    }
}
