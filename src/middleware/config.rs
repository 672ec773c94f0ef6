use std::collections::HashMap;

use url::Url;

use crate::codec::SealingKey;
use crate::error::Error;
use crate::oauth::ClientCredentials;
use crate::types::Role;

/// One trusted FHIR authorization server.
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// Issuer identity; also the FHIR base URL and the `aud` parameter of
    /// the authorization request.
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub revocation_endpoint: Option<String>,
}

/// Resolves confidential-client credentials for an issuer + role pair.
///
/// The portal registers a separate OAuth client per role at each issuer;
/// where those registrations live (env, vault, database) is the consumer's
/// business, so this is a trait seam rather than a concrete store.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, issuer: &str, role: Role) -> Option<ClientCredentials>;
}

/// Map-backed resolver, filled from the environment or by hand in tests.
#[derive(Default)]
pub struct StaticCredentials {
    entries: HashMap<(String, Role), ClientCredentials>,
}

impl StaticCredentials {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, issuer: impl Into<String>, role: Role, creds: ClientCredentials) -> Self {
        self.entries.insert((issuer.into(), role), creds);
        self
    }
}

impl CredentialResolver for StaticCredentials {
    fn resolve(&self, issuer: &str, role: Role) -> Option<ClientCredentials> {
        self.entries.get(&(issuer.to_owned(), role)).cloned()
    }
}

/// Runtime settings shared by the gatekeeper and the auth routes.
#[derive(Clone)]
pub(crate) struct PortalSettings {
    pub(crate) session_lifetime_secs: i64,
    pub(crate) refresh_buffer_ms: i64,
    pub(crate) state_ttl_ms: i64,
    pub(crate) secure_cookies: bool,
    pub(crate) auth_path: String,
    pub(crate) entry_path: String,
    pub(crate) login_page: String,
    pub(crate) public_prefixes: Vec<String>,
    pub(crate) route_roles: Vec<(String, Role)>,
    pub(crate) dashboards: HashMap<Role, String>,
    pub(crate) scopes: HashMap<Role, Vec<String>>,
}

impl PortalSettings {
    pub(crate) fn defaults() -> Self {
        Self {
            session_lifetime_secs: 7 * 24 * 60 * 60,
            refresh_buffer_ms: 300_000,
            state_ttl_ms: 10 * 60 * 1000,
            secure_cookies: true,
            auth_path: "/auth".into(),
            entry_path: "/".into(),
            login_page: "/login".into(),
            public_prefixes: vec![
                "/auth".into(),
                "/login".into(),
                "/assets".into(),
                "/health".into(),
            ],
            route_roles: vec![
                ("/patient".into(), Role::Patient),
                ("/provider".into(), Role::Practitioner),
                ("/api/patient".into(), Role::Patient),
                ("/api/provider".into(), Role::Practitioner),
            ],
            dashboards: HashMap::from([
                (Role::Patient, "/patient/home".to_string()),
                (Role::Practitioner, "/provider/home".to_string()),
            ]),
            scopes: HashMap::from([
                (
                    Role::Patient,
                    vec![
                        "openid".to_string(),
                        "fhirUser".to_string(),
                        "launch/patient".to_string(),
                        "patient/*.read".to_string(),
                        "offline_access".to_string(),
                    ],
                ),
                (
                    Role::Practitioner,
                    vec![
                        "openid".to_string(),
                        "fhirUser".to_string(),
                        "user/*.read".to_string(),
                        "offline_access".to_string(),
                    ],
                ),
            ]),
        }
    }

    pub(crate) fn dashboard(&self, role: Role) -> &str {
        self.dashboards
            .get(&role)
            .map(String::as_str)
            .unwrap_or(self.entry_path.as_str())
    }
}

/// Portal authentication configuration.
///
/// Use [`from_env()`](PortalAuthConfig::from_env) for convention-based setup,
/// or [`new()`](PortalAuthConfig::new) with `with_*` methods for full control.
pub struct PortalAuthConfig {
    pub(crate) sealing_key: SealingKey,
    pub(crate) issuers: Vec<IssuerConfig>,
    pub(crate) settings: PortalSettings,
}

impl PortalAuthConfig {
    /// Config for a single trusted issuer with default settings.
    #[must_use]
    pub fn new(sealing_key: SealingKey, issuer: IssuerConfig) -> Self {
        Self {
            sealing_key,
            issuers: vec![issuer],
            settings: PortalSettings::defaults(),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `PORTAL_FHIR_ISSUER`: issuer identity / FHIR base URL
    /// - `PORTAL_AUTHORIZE_URL`, `PORTAL_TOKEN_URL`: IdP endpoints
    ///
    /// # Optional env vars
    /// - `PORTAL_REVOKE_URL`: token revocation endpoint
    /// - `PORTAL_SESSION_KEY`: base64 32-byte sealing key (ephemeral when unset)
    /// - `PORTAL_SESSION_LIFETIME`: e.g. `7d`, `2h`, `30m` (default `7d`)
    /// - `PORTAL_REFRESH_BUFFER_MS`: refresh window before expiry (default 300000)
    /// - `DEV_AUTH`: `1`/`true` disables the secure cookie attribute
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigMissing`] if required vars are missing or values
    /// fail to parse.
    pub fn from_env() -> Result<Self, Error> {
        let issuer = require_env("PORTAL_FHIR_ISSUER")?;
        let authorization_endpoint = require_env("PORTAL_AUTHORIZE_URL")?;
        let token_endpoint = require_env("PORTAL_TOKEN_URL")?;
        let revocation_endpoint = std::env::var("PORTAL_REVOKE_URL").ok();

        let sealing_key = match std::env::var("PORTAL_SESSION_KEY") {
            Ok(encoded) => SealingKey::from_base64(&encoded)?,
            Err(_) => SealingKey::generate(),
        };

        let mut config = Self::new(
            sealing_key,
            IssuerConfig {
                issuer,
                authorization_endpoint,
                token_endpoint,
                revocation_endpoint,
            },
        );

        if let Ok(lifetime) = std::env::var("PORTAL_SESSION_LIFETIME") {
            config = config.with_session_lifetime(&lifetime)?;
        }
        if let Ok(buffer) = std::env::var("PORTAL_REFRESH_BUFFER_MS") {
            let buffer_ms: i64 = buffer
                .parse()
                .map_err(|e| Error::ConfigMissing(format!("PORTAL_REFRESH_BUFFER_MS: {e}")))?;
            config.settings.refresh_buffer_ms = buffer_ms;
        }
        let dev_auth = matches!(std::env::var("DEV_AUTH").as_deref(), Ok("1") | Ok("true"));
        config.settings.secure_cookies = !dev_auth;

        Ok(config)
    }

    /// Per-role credentials from environment variables
    /// (`PORTAL_PATIENT_CLIENT_ID`/`_SECRET`/`_REDIRECT_URI` and the
    /// `PORTAL_PROVIDER_*` triple), registered against the configured issuer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigMissing`] when a triple is only partially set
    /// or a redirect URI fails to parse.
    pub fn credentials_from_env(&self) -> Result<StaticCredentials, Error> {
        let mut creds = StaticCredentials::new();
        for (prefix, role) in [
            ("PORTAL_PATIENT", Role::Patient),
            ("PORTAL_PROVIDER", Role::Practitioner),
        ] {
            if let Some(entry) = role_credentials_from_env(prefix)? {
                for issuer in &self.issuers {
                    creds = creds.with(issuer.issuer.clone(), role, entry.clone());
                }
            }
        }
        Ok(creds)
    }

    /// Parse and set the session lifetime from a string like `7d`, `2h`, `30m`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigMissing`] on an unparsable lifetime.
    pub fn with_session_lifetime(mut self, lifetime: &str) -> Result<Self, Error> {
        self.settings.session_lifetime_secs = parse_lifetime_secs(lifetime)?;
        Ok(self)
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: IssuerConfig) -> Self {
        self.issuers.push(issuer);
        self
    }

    #[must_use]
    pub fn with_refresh_buffer_ms(mut self, buffer_ms: i64) -> Self {
        self.settings.refresh_buffer_ms = buffer_ms;
        self
    }

    #[must_use]
    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.settings.secure_cookies = secure;
        self
    }

    #[must_use]
    pub fn with_auth_path(mut self, path: impl Into<String>) -> Self {
        self.settings.auth_path = path.into();
        self
    }

    #[must_use]
    pub fn with_public_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.settings.public_prefixes.push(prefix.into());
        self
    }

    #[must_use]
    pub fn with_route_role(mut self, prefix: impl Into<String>, role: Role) -> Self {
        self.settings.route_roles.push((prefix.into(), role));
        self
    }

    #[must_use]
    pub fn with_dashboard(mut self, role: Role, path: impl Into<String>) -> Self {
        self.settings.dashboards.insert(role, path.into());
        self
    }

    #[must_use]
    pub fn with_scopes(mut self, role: Role, scopes: Vec<String>) -> Self {
        self.settings.scopes.insert(role, scopes);
        self
    }
}

fn require_env(name: &str) -> Result<String, Error> {
    std::env::var(name).map_err(|_| Error::ConfigMissing(format!("{name} is required")))
}

fn role_credentials_from_env(prefix: &str) -> Result<Option<ClientCredentials>, Error> {
    let client_id = std::env::var(format!("{prefix}_CLIENT_ID")).ok();
    let client_secret = std::env::var(format!("{prefix}_CLIENT_SECRET")).ok();
    let redirect_uri = std::env::var(format!("{prefix}_REDIRECT_URI")).ok();

    match (client_id, client_secret, redirect_uri) {
        (None, None, None) => Ok(None),
        (Some(client_id), Some(client_secret), Some(redirect_uri)) => {
            let redirect_uri: Url = redirect_uri
                .parse()
                .map_err(|e| Error::ConfigMissing(format!("{prefix}_REDIRECT_URI: {e}")))?;
            Ok(Some(ClientCredentials {
                client_id,
                client_secret,
                redirect_uri,
            }))
        }
        _ => Err(Error::ConfigMissing(format!(
            "{prefix}_CLIENT_ID, {prefix}_CLIENT_SECRET and {prefix}_REDIRECT_URI must be set together"
        ))),
    }
}

/// Parse a session lifetime string (`7d`, `2h`, `30m`, `45s`, or plain
/// seconds) into seconds.
pub(crate) fn parse_lifetime_secs(lifetime: &str) -> Result<i64, Error> {
    let lifetime = lifetime.trim();
    let bad = || Error::ConfigMissing(format!("unparsable session lifetime: {lifetime:?}"));

    if lifetime.is_empty() {
        return Err(bad());
    }
    let (number, unit) = match lifetime.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&lifetime[..idx], Some(c)),
        _ => (lifetime, None),
    };
    let value: i64 = number.parse().map_err(|_| bad())?;
    if value <= 0 {
        return Err(bad());
    }
    let secs = match unit {
        None | Some('s') => value,
        Some('m') => value * 60,
        Some('h') => value * 3600,
        Some('d') => value * 86_400,
        Some(_) => return Err(bad()),
    };
    Ok(secs)
}
