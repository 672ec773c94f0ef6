use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Portal user class.
///
/// Exactly two roles exist: patients booking appointments and
/// providers/practitioners managing their schedules. Role is fixed at login
/// and checked against route prefixes on every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    Practitioner,
}

impl Role {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Practitioner => "practitioner",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" => Ok(Self::Patient),
            "practitioner" | "provider" => Ok(Self::Practitioner),
            other => Err(Error::UnsupportedRole(other.to_owned())),
        }
    }
}

/// Volatile half of a session: the OAuth token material.
///
/// Replaced wholesale by every refresh, never partially mutated. Sealed into
/// its own cookie so refreshing does not touch the metadata half.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absolute expiry, epoch milliseconds.
    pub expires_at_ms: i64,
}

// Token material must never reach logs in full.
impl std::fmt::Debug for TokenBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBundle")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &self.refresh_token.as_deref().map(redact))
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

fn redact(token: &str) -> String {
    let head: String = token.chars().take(6).collect();
    format!("{head}…[redacted]")
}

/// Stable half of a session: who the user is and where their FHIR data lives.
///
/// Set once at login and immutable afterwards, except for the cached display
/// name which dashboards may fill in lazily.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub practitioner_id: Option<String>,
    pub fhir_base_url: String,
    pub client_id: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Display name cached after the first profile fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// A validated session, rebuilt fresh on every request from the two
/// decrypted cookies. Downstream FHIR and UI handlers receive this value and
/// treat `tokens.access_token` as opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub tokens: TokenBundle,
    pub meta: SessionMetadata,
}

impl Session {
    /// Milliseconds until hard expiry (negative when already expired).
    #[must_use]
    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        self.tokens.expires_at_ms - now_ms
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.meta.role
    }
}

/// Record created at login launch and consumed exactly once by the callback.
///
/// Lives only in the nonce store for the duration of the handshake; never
/// persisted, never sent to the browser.
#[derive(Debug, Clone)]
pub struct PendingAuthState {
    pub issuer: String,
    pub role: Role,
    pub code_verifier: String,
    pub token_endpoint: String,
    pub revocation_endpoint: Option<String>,
    pub created_at_ms: i64,
}

/// Current wall-clock time as epoch milliseconds.
#[must_use]
pub(crate) fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
