//! OAuth token-endpoint client for the SMART-on-FHIR handshake.
//!
//! The portal is a confidential client: every grant request authenticates
//! with HTTP Basic `client_id:client_secret` and a form-encoded body. The
//! secret lives server-side only and never reaches the browser.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use url::Url;

use crate::error::Error;
use crate::types::TokenBundle;

/// Default token lifetime when the IdP omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Confidential-client credentials resolved per issuer and role.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: Url,
}

/// Token-endpoint response, including SMART launch-context pass-throughs.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    /// Patient launch context granted to this session.
    #[serde(default)]
    pub patient: Option<String>,
    #[serde(default, rename = "fhirUser")]
    pub fhir_user: Option<String>,
    #[serde(default)]
    pub encounter: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Convert to the volatile session half, resolving `expires_in` to an
    /// absolute epoch-millisecond deadline (3600 s when absent).
    #[must_use]
    pub fn into_bundle(self, now_ms: i64) -> TokenBundle {
        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        TokenBundle {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at_ms: now_ms + (expires_in as i64) * 1000,
        }
    }
}

/// Seam over the two grant operations, so the gatekeeper and callback
/// handler can be exercised without a network.
#[async_trait]
pub trait TokenBroker: Send + Sync {
    /// `grant_type=authorization_code` exchange.
    async fn exchange_code(
        &self,
        code: &str,
        token_endpoint: &str,
        credentials: &ClientCredentials,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse, Error>;

    /// `grant_type=refresh_token` renewal.
    async fn refresh(
        &self,
        refresh_token: &str,
        token_endpoint: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<TokenResponse, Error>;

    /// Best-effort RFC 7009 revocation (logout path). Failures are logged by
    /// callers and otherwise ignored.
    async fn revoke(
        &self,
        token: &str,
        revocation_endpoint: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<(), Error>;
}

/// HTTP implementation of [`TokenBroker`].
pub struct TokenClient {
    http: reqwest::Client,
}

impl TokenClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn parse_token_response(
        response: reqwest::Response,
        failure: fn(Option<u16>, String) -> Error,
    ) -> Result<TokenResponse, Error> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failure(Some(status.as_u16()), body));
        }
        // Fail closed on unparsable JSON too, not just HTTP errors.
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| failure(None, format!("unparsable token response: {e}")))
    }
}

impl Default for TokenClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenBroker for TokenClient {
    async fn exchange_code(
        &self,
        code: &str,
        token_endpoint: &str,
        credentials: &ClientCredentials,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse, Error> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", credentials.redirect_uri.as_str()),
        ];
        if let Some(verifier) = code_verifier {
            params.push(("code_verifier", verifier));
        }

        let response = self
            .http
            .post(token_endpoint)
            .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::TokenExchange {
                status: None,
                detail: e.to_string(),
            })?;

        Self::parse_token_response(response, |status, detail| Error::TokenExchange {
            status,
            detail,
        })
        .await
    }

    async fn refresh(
        &self,
        refresh_token: &str,
        token_endpoint: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<TokenResponse, Error> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .http
            .post(token_endpoint)
            .basic_auth(client_id, Some(client_secret))
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Refresh {
                status: None,
                detail: e.to_string(),
            })?;

        Self::parse_token_response(response, |status, detail| Error::Refresh {
            status,
            detail,
        })
        .await
    }

    async fn revoke(
        &self,
        token: &str,
        revocation_endpoint: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<(), Error> {
        let params = [("token", token)];
        let response = self
            .http
            .post(revocation_endpoint)
            .basic_auth(client_id, Some(client_secret))
            .form(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "token revocation returned non-success");
        }
        Ok(())
    }
}

/// Identity claims pulled from an id token, when one is present and decodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdClaims {
    pub profile: Option<String>,
    pub fhir_user: Option<String>,
}

/// Decode the payload of a dot-separated identity token without verifying
/// its signature — we only mine optional display claims from it, trust comes
/// from the token endpoint's TLS channel. Any decode failure yields empty
/// claims rather than failing the login.
#[must_use]
pub fn decode_id_claims(id_token: &str) -> IdClaims {
    fn try_decode(id_token: &str) -> Option<IdClaims> {
        let mut segments = id_token.split('.');
        let payload_b64 = match (segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_)) => payload,
            _ => return None,
        };
        if segments.next().is_some() {
            return None;
        }
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let json: JsonValue = serde_json::from_slice(&payload).ok()?;
        Some(IdClaims {
            profile: json.get("profile").and_then(JsonValue::as_str).map(String::from),
            fhir_user: json.get("fhirUser").and_then(JsonValue::as_str).map(String::from),
        })
    }
    try_decode(id_token).unwrap_or_default()
}

/// Trailing id segment of a FHIR reference like `Practitioner/123`.
#[must_use]
pub fn reference_id(reference: &str) -> Option<&str> {
    reference.rsplit('/').next().filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_payload(json: &str) -> String {
        format!("hdr.{}.sig", URL_SAFE_NO_PAD.encode(json))
    }

    #[test]
    fn test_id_claims_decode_from_middle_segment() {
        let token = encode_payload(
            r#"{"sub":"u1","profile":"Patient/p-1","fhirUser":"Practitioner/pr-9"}"#,
        );
        let claims = decode_id_claims(&token);
        assert_eq!(claims.profile.as_deref(), Some("Patient/p-1"));
        assert_eq!(claims.fhir_user.as_deref(), Some("Practitioner/pr-9"));
    }

    #[test]
    fn test_id_claims_decode_failure_is_empty_not_fatal() {
        for garbage in [
            "",
            "only-one-segment",
            "two.segments",
            "a.%%%.c",
            "a.b.c.d",
            &encode_payload("not json"),
        ] {
            assert_eq!(decode_id_claims(garbage), IdClaims::default(), "{garbage}");
        }
    }

    #[test]
    fn test_id_claims_missing_fields_are_none() {
        let token = encode_payload(r#"{"sub":"u1"}"#);
        assert_eq!(decode_id_claims(&token), IdClaims::default());
    }

    #[test]
    fn test_expires_in_defaults_to_an_hour() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"AT1"}"#).unwrap();
        let bundle = response.into_bundle(1_000);
        assert_eq!(bundle.expires_at_ms, 1_000 + 3_600_000);
        assert_eq!(bundle.access_token, "AT1");
        assert!(bundle.refresh_token.is_none());
    }

    #[test]
    fn test_explicit_expires_in_is_honored() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"AT1","refresh_token":"RT1","expires_in":600}"#,
        )
        .unwrap();
        let bundle = response.into_bundle(0);
        assert_eq!(bundle.expires_at_ms, 600_000);
        assert_eq!(bundle.refresh_token.as_deref(), Some("RT1"));
    }

    #[test]
    fn test_launch_context_fields_pass_through() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"AT1","patient":"p-1","fhirUser":"Practitioner/pr-9",
               "encounter":"e-3","scope":"launch/patient openid"}"#,
        )
        .unwrap();
        assert_eq!(response.patient.as_deref(), Some("p-1"));
        assert_eq!(response.fhir_user.as_deref(), Some("Practitioner/pr-9"));
        assert_eq!(response.encounter.as_deref(), Some("e-3"));
        assert_eq!(response.scope.as_deref(), Some("launch/patient openid"));
    }

    #[test]
    fn test_reference_id_takes_trailing_segment() {
        assert_eq!(reference_id("Practitioner/pr-9"), Some("pr-9"));
        assert_eq!(reference_id("https://fhir.example.org/Patient/p-1"), Some("p-1"));
        assert_eq!(reference_id("p-1"), Some("p-1"));
        assert_eq!(reference_id(""), None);
        assert_eq!(reference_id("Patient/"), None);
    }
}
