/// Errors raised by the authentication subsystem.
///
/// Replay (`StateNotFound`) and cookie-decode (`Decode`) failures are never
/// retried: callers clear both session cookies and force re-authentication.
/// `ConfigMissing` indicates a deployment problem, not a user problem, and is
/// surfaced loudly rather than degraded around.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The `state` parameter matched no pending login (expired, replayed, or forged).
    #[error("login state not found or already used")]
    StateNotFound,

    /// The authorization-code exchange with the token endpoint failed.
    #[error("token exchange failed ({status:?}): {detail}")]
    TokenExchange { status: Option<u16>, detail: String },

    /// A refresh_token grant failed.
    #[error("token refresh failed ({status:?}): {detail}")]
    Refresh { status: Option<u16>, detail: String },

    /// A session cookie failed to decrypt or parse. Carries no detail: a
    /// corrupt cookie is "no session", never a partially trusted one.
    #[error("session cookie could not be decoded")]
    Decode,

    /// Session data could not be sealed.
    #[error("session sealing failed: {0}")]
    Seal(String),

    /// No client credentials or issuer configuration for the given issuer/role.
    #[error("missing configuration: {0}")]
    ConfigMissing(String),

    /// A login role parameter was not one of the supported values.
    #[error("unsupported role: {0}")]
    UnsupportedRole(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
