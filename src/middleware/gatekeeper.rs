//! Per-request session gatekeeper.
//!
//! Runs ahead of every protected handler: decodes the two session cookies,
//! refreshes the access token when it is inside the refresh buffer, and
//! enforces role-route rules. The decision core is a pure-ish function from
//! an immutable request descriptor (path + cookie values + clock) to an
//! explicit [`GateDecision`]; only the axum wrapper at the bottom touches
//! the actual request and response.
//!
//! No request is ever served on a token known to be expired: the handler is
//! blocked until the (single) refresh attempt resolves, and a failed refresh
//! deterministically ends the session. There is no retry within a request.

use axum::Json;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header::SET_COOKIE};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::Cookie;
use serde_json::json;

use crate::oauth::TokenResponse;
use crate::types::{Role, Session, now_ms};

use super::cookies;
use super::state::AuthState;

/// What happens to the request.
#[derive(Debug)]
pub enum GateAction {
    /// Public route: pass through untouched.
    Forward,
    /// Validated (possibly refreshed) session attached for the handler.
    ForwardWith(Box<Session>),
    /// Send the browser elsewhere (entry point or dashboard).
    Redirect(String),
    /// API rejection, JSON body.
    Deny(StatusCode),
}

/// Cookie side effects accompanying the action.
#[derive(Debug)]
pub enum CookieUpdate {
    None,
    /// Refresh succeeded: replace only the volatile token cookie.
    SetToken(String),
    /// Defensive clear of both halves.
    Clear,
}

/// Outcome of gatekeeping one request.
#[derive(Debug)]
pub struct GateDecision {
    pub action: GateAction,
    pub cookies: CookieUpdate,
}

impl GateDecision {
    fn forward() -> Self {
        Self { action: GateAction::Forward, cookies: CookieUpdate::None }
    }
}

enum RouteClass {
    Public,
    Landing,
    Protected { required: Option<Role>, api: bool },
}

fn classify(path: &str, state: &AuthState) -> RouteClass {
    if path == state.settings.entry_path {
        return RouteClass::Landing;
    }
    if state
        .settings
        .public_prefixes
        .iter()
        .any(|prefix| path_has_prefix(path, prefix))
    {
        return RouteClass::Public;
    }
    let required = state
        .settings
        .route_roles
        .iter()
        .filter(|(prefix, _)| path_has_prefix(path, prefix))
        // Most specific rule wins: /api/patient over /api.
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, role)| *role);
    RouteClass::Protected {
        required,
        api: path_has_prefix(path, "/api"),
    }
}

/// Prefix match on path-segment boundaries, so `/patient` does not capture
/// `/patients-export`.
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Decide what to do with a request, given the raw cookie values and clock.
pub async fn evaluate(
    state: &AuthState,
    path: &str,
    token_cookie: Option<&str>,
    meta_cookie: Option<&str>,
    now_ms: i64,
) -> GateDecision {
    let (required, api) = match classify(path, state) {
        RouteClass::Public => return GateDecision::forward(),
        RouteClass::Landing => {
            // A returning user with an intact session skips the landing page.
            if let (Some(tok), Some(meta)) = (token_cookie, meta_cookie) {
                if let Ok(session) = state.codec.decode(tok, meta) {
                    let dashboard = state.settings.dashboard(session.role()).to_owned();
                    return GateDecision {
                        action: GateAction::Redirect(dashboard),
                        cookies: CookieUpdate::None,
                    };
                }
            }
            return GateDecision::forward();
        }
        RouteClass::Protected { required, api, .. } => (required, api),
    };

    let (Some(tok), Some(meta)) = (token_cookie, meta_cookie) else {
        // Half-present cookies are as useless as none; clear whatever is there.
        let cookies = if token_cookie.is_some() || meta_cookie.is_some() {
            CookieUpdate::Clear
        } else {
            CookieUpdate::None
        };
        return GateDecision { action: unauthenticated(state, api), cookies };
    };

    let session = match state.codec.decode(tok, meta) {
        Ok(session) => session,
        Err(_) => {
            tracing::warn!(path, "session cookies failed to decode, clearing");
            return GateDecision {
                action: unauthenticated(state, api),
                cookies: CookieUpdate::Clear,
            };
        }
    };

    if let Some(required) = required {
        if session.role() != required {
            tracing::warn!(
                path,
                role = %session.role(),
                required = %required,
                "role-route mismatch"
            );
            // Rejected regardless of token validity; the session itself stays.
            return GateDecision {
                action: if api {
                    GateAction::Deny(StatusCode::UNAUTHORIZED)
                } else {
                    GateAction::Redirect(state.settings.entry_path.clone())
                },
                cookies: CookieUpdate::None,
            };
        }
    }

    if session.remaining_ms(now_ms) > state.settings.refresh_buffer_ms {
        return GateDecision {
            action: GateAction::ForwardWith(Box::new(session)),
            cookies: CookieUpdate::None,
        };
    }

    // ExpiringSoon: exactly one refresh attempt, then Valid or Expired.
    match attempt_refresh(state, &session).await {
        Some(response) => {
            let mut refreshed = session;
            let mut bundle = response.into_bundle(now_ms);
            // The IdP may rotate the refresh token; keep the old one only
            // when the response omits it.
            if bundle.refresh_token.is_none() {
                bundle.refresh_token = refreshed.tokens.refresh_token.take();
            }
            refreshed.tokens = bundle;
            match state.codec.seal_tokens(&refreshed.tokens) {
                Ok(token_cipher) => GateDecision {
                    action: GateAction::ForwardWith(Box::new(refreshed)),
                    cookies: CookieUpdate::SetToken(token_cipher),
                },
                Err(e) => {
                    tracing::error!(error = %e, "failed to re-seal refreshed tokens");
                    GateDecision {
                        action: unauthenticated(state, api),
                        cookies: CookieUpdate::Clear,
                    }
                }
            }
        }
        None => GateDecision {
            action: unauthenticated(state, api),
            cookies: CookieUpdate::Clear,
        },
    }
}

/// One refresh attempt; `None` covers every failure mode (no refresh token,
/// unresolvable credentials, failed HTTP call).
async fn attempt_refresh(state: &AuthState, session: &Session) -> Option<TokenResponse> {
    let refresh_token = session.tokens.refresh_token.as_deref()?;
    let Some(creds) = state
        .credentials
        .resolve(&session.meta.fhir_base_url, session.role())
    else {
        tracing::error!(
            issuer = %session.meta.fhir_base_url,
            role = %session.role(),
            "no client credentials resolvable for refresh"
        );
        return None;
    };

    match state
        .tokens
        .refresh(
            refresh_token,
            &session.meta.token_endpoint,
            &creds.client_id,
            &creds.client_secret,
        )
        .await
    {
        Ok(response) => Some(response),
        Err(e) => {
            tracing::warn!(error = %e, "token refresh failed, ending session");
            None
        }
    }
}

fn unauthenticated(state: &AuthState, api: bool) -> GateAction {
    if api {
        GateAction::Deny(StatusCode::UNAUTHORIZED)
    } else {
        GateAction::Redirect(state.settings.entry_path.clone())
    }
}

/// Axum middleware wrapper: reads cookies, applies the decision, attaches
/// the validated session for downstream extractors.
pub async fn gatekeeper(
    State(state): State<AuthState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    let token_cookie = jar.get(cookies::TOKEN_COOKIE).map(|c| c.value().to_owned());
    let meta_cookie = jar.get(cookies::META_COOKIE).map(|c| c.value().to_owned());

    let decision = evaluate(
        &state,
        &path,
        token_cookie.as_deref(),
        meta_cookie.as_deref(),
        now_ms(),
    )
    .await;

    let mut response = match decision.action {
        GateAction::Forward => next.run(request).await,
        GateAction::ForwardWith(session) => {
            request.extensions_mut().insert(*session);
            next.run(request).await
        }
        GateAction::Redirect(location) => Redirect::to(&location).into_response(),
        GateAction::Deny(status) => {
            (status, Json(json!({ "error": "unauthorized" }))).into_response()
        }
    };

    match decision.cookies {
        CookieUpdate::None => {}
        CookieUpdate::SetToken(token_cipher) => {
            let cookie = cookies::token_cookie(
                token_cipher,
                state.settings.session_lifetime_secs,
                state.settings.secure_cookies,
            );
            append_cookie(&mut response, &cookie);
        }
        CookieUpdate::Clear => {
            let (tok, meta) = cookies::clear_session_cookies();
            append_cookie(&mut response, &tok);
            append_cookie(&mut response, &meta);
        }
    }
    response
}

pub(crate) fn append_cookie(response: &mut Response, cookie: &Cookie<'static>) {
    match cookie.to_string().parse() {
        Ok(value) => {
            response.headers_mut().append(SET_COOKIE, value);
        }
        Err(e) => tracing::error!(error = %e, "unencodable Set-Cookie header"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::codec::SealingKey;
    use crate::error::Error;
    use crate::oauth::{ClientCredentials, TokenBroker, TokenResponse};
    use crate::types::{SessionMetadata, TokenBundle};

    use super::super::config::{IssuerConfig, PortalAuthConfig, StaticCredentials};
    use super::*;

    const ISSUER: &str = "https://fhir.example.org";
    const REFRESH_BUFFER_MS: i64 = 300_000;

    /// Stub broker: counts refresh calls, answers from a canned result.
    struct StubBroker {
        refresh_calls: AtomicUsize,
        refresh_result: Option<TokenResponse>,
    }

    impl StubBroker {
        fn refreshing(response: TokenResponse) -> Self {
            Self { refresh_calls: AtomicUsize::new(0), refresh_result: Some(response) }
        }

        fn failing() -> Self {
            Self { refresh_calls: AtomicUsize::new(0), refresh_result: None }
        }

        fn calls(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenBroker for StubBroker {
        async fn exchange_code(
            &self,
            _code: &str,
            _token_endpoint: &str,
            _credentials: &ClientCredentials,
            _code_verifier: Option<&str>,
        ) -> Result<TokenResponse, Error> {
            panic!("gatekeeper must never exchange authorization codes");
        }

        async fn refresh(
            &self,
            _refresh_token: &str,
            _token_endpoint: &str,
            _client_id: &str,
            _client_secret: &str,
        ) -> Result<TokenResponse, Error> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refresh_result.clone().ok_or(Error::Refresh {
                status: Some(400),
                detail: "invalid_grant".into(),
            })
        }

        async fn revoke(
            &self,
            _token: &str,
            _revocation_endpoint: &str,
            _client_id: &str,
            _client_secret: &str,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    fn fresh_tokens() -> TokenResponse {
        serde_json::from_str(r#"{"access_token":"AT2","refresh_token":"RT2","expires_in":3600}"#)
            .unwrap()
    }

    fn test_state(broker: Arc<StubBroker>) -> AuthState {
        let config = PortalAuthConfig::new(
            SealingKey::new([3u8; 32]),
            IssuerConfig {
                issuer: ISSUER.into(),
                authorization_endpoint: format!("{ISSUER}/oauth/authorize"),
                token_endpoint: format!("{ISSUER}/oauth/token"),
                revocation_endpoint: None,
            },
        );
        let creds = ClientCredentials {
            client_id: "portal-patient".into(),
            client_secret: "s3cret".into(),
            redirect_uri: "https://portal.example.com/auth/callback".parse().unwrap(),
        };
        let resolver = StaticCredentials::new()
            .with(ISSUER, Role::Patient, creds.clone())
            .with(ISSUER, Role::Practitioner, creds);
        AuthState::with_broker(config, resolver, broker)
    }

    fn seal_session(
        state: &AuthState,
        role: Role,
        refresh_token: Option<&str>,
        expires_at_ms: i64,
    ) -> (String, String) {
        let tokens = TokenBundle {
            access_token: "AT1".into(),
            refresh_token: refresh_token.map(String::from),
            expires_at_ms,
        };
        let meta = SessionMetadata {
            role,
            patient_id: (role == Role::Patient).then(|| "p-1".into()),
            practitioner_id: (role == Role::Practitioner).then(|| "pr-9".into()),
            fhir_base_url: ISSUER.into(),
            client_id: "portal-patient".into(),
            token_endpoint: format!("{ISSUER}/oauth/token"),
            revocation_endpoint: None,
            username: None,
            display_name: None,
        };
        let sealed = state.codec.encode(&tokens, &meta).unwrap();
        (sealed.token_cipher, sealed.meta_cipher)
    }

    #[tokio::test]
    async fn test_public_prefix_bypasses_without_decoding() {
        let broker = Arc::new(StubBroker::failing());
        let state = test_state(broker.clone());
        // Garbage cookies must not matter on a public route.
        let decision = evaluate(&state, "/assets/app.css", Some("junk"), Some("junk"), 0).await;
        assert!(matches!(decision.action, GateAction::Forward));
        assert!(matches!(decision.cookies, CookieUpdate::None));
        assert_eq!(broker.calls(), 0);
    }

    #[tokio::test]
    async fn test_landing_redirects_to_dashboard_with_intact_session() {
        let state = test_state(Arc::new(StubBroker::failing()));
        let now = now_ms();
        let (tok, meta) = seal_session(&state, Role::Patient, None, now + 3_600_000);
        let decision = evaluate(&state, "/", Some(&tok), Some(&meta), now).await;
        match decision.action {
            GateAction::Redirect(url) => assert_eq!(url, "/patient/home"),
            other => panic!("expected redirect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_landing_without_session_renders_publicly() {
        let state = test_state(Arc::new(StubBroker::failing()));
        let decision = evaluate(&state, "/", None, None, 0).await;
        assert!(matches!(decision.action, GateAction::Forward));
    }

    #[tokio::test]
    async fn test_missing_cookies_redirect_page_routes_to_entry() {
        let state = test_state(Arc::new(StubBroker::failing()));
        let decision = evaluate(&state, "/patient/appointments", None, None, 0).await;
        match decision.action {
            GateAction::Redirect(url) => assert_eq!(url, "/"),
            other => panic!("expected redirect, got {other:?}"),
        }
        assert!(matches!(decision.cookies, CookieUpdate::None));
    }

    #[tokio::test]
    async fn test_missing_cookies_deny_api_routes_with_401() {
        let state = test_state(Arc::new(StubBroker::failing()));
        let decision = evaluate(&state, "/api/patient/appointments", None, None, 0).await;
        assert!(matches!(
            decision.action,
            GateAction::Deny(StatusCode::UNAUTHORIZED)
        ));
    }

    #[tokio::test]
    async fn test_undecodable_cookies_are_cleared_defensively() {
        let state = test_state(Arc::new(StubBroker::failing()));
        let decision =
            evaluate(&state, "/patient/appointments", Some("junk"), Some("junk"), 0).await;
        assert!(matches!(decision.action, GateAction::Redirect(_)));
        assert!(matches!(decision.cookies, CookieUpdate::Clear));
    }

    #[tokio::test]
    async fn test_half_present_cookies_count_as_unauthenticated() {
        let state = test_state(Arc::new(StubBroker::failing()));
        let now = now_ms();
        let (tok, _) = seal_session(&state, Role::Patient, None, now + 3_600_000);
        let decision = evaluate(&state, "/patient/home", Some(&tok), None, now).await;
        assert!(matches!(decision.action, GateAction::Redirect(_)));
        assert!(matches!(decision.cookies, CookieUpdate::Clear));
    }

    #[tokio::test]
    async fn test_valid_session_forwards_without_refresh() {
        let broker = Arc::new(StubBroker::refreshing(fresh_tokens()));
        let state = test_state(broker.clone());
        let now = now_ms();
        let (tok, meta) = seal_session(&state, Role::Patient, Some("RT1"), now + 3_600_000);

        let decision = evaluate(&state, "/patient/home", Some(&tok), Some(&meta), now).await;
        match decision.action {
            GateAction::ForwardWith(session) => {
                assert_eq!(session.role(), Role::Patient);
                assert_eq!(session.tokens.access_token, "AT1");
            }
            other => panic!("expected forward, got {other:?}"),
        }
        assert_eq!(broker.calls(), 0);
    }

    #[tokio::test]
    async fn test_expiring_session_refreshes_exactly_once() {
        let broker = Arc::new(StubBroker::refreshing(fresh_tokens()));
        let state = test_state(broker.clone());
        let now = now_ms();
        // Inside the buffer but not yet expired.
        let (tok, meta) =
            seal_session(&state, Role::Patient, Some("RT1"), now + REFRESH_BUFFER_MS - 1);

        let decision = evaluate(&state, "/patient/home", Some(&tok), Some(&meta), now).await;
        assert_eq!(broker.calls(), 1);
        match decision.action {
            GateAction::ForwardWith(session) => {
                assert_eq!(session.tokens.access_token, "AT2");
                assert!(session.remaining_ms(now) > REFRESH_BUFFER_MS);
            }
            other => panic!("expected forward, got {other:?}"),
        }
        // Only the token half is re-sealed; the old metadata cookie must
        // still pair with the replacement.
        match decision.cookies {
            CookieUpdate::SetToken(new_tok) => {
                let session = state.codec.decode(&new_tok, &meta).unwrap();
                assert_eq!(session.tokens.access_token, "AT2");
                assert_eq!(session.tokens.refresh_token.as_deref(), Some("RT2"));
            }
            other => panic!("expected token cookie update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_keeps_old_refresh_token_when_response_omits_it() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"AT2","expires_in":3600}"#).unwrap();
        let broker = Arc::new(StubBroker::refreshing(response));
        let state = test_state(broker);
        let now = now_ms();
        let (tok, meta) = seal_session(&state, Role::Patient, Some("RT1"), now + 1_000);

        let decision = evaluate(&state, "/patient/home", Some(&tok), Some(&meta), now).await;
        match decision.action {
            GateAction::ForwardWith(session) => {
                assert_eq!(session.tokens.refresh_token.as_deref(), Some("RT1"));
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_clears_and_redirects() {
        let broker = Arc::new(StubBroker::refreshing(fresh_tokens()));
        let state = test_state(broker.clone());
        let now = now_ms();
        let (tok, meta) = seal_session(&state, Role::Patient, None, now - 1);

        let decision = evaluate(&state, "/patient/home", Some(&tok), Some(&meta), now).await;
        match decision.action {
            GateAction::Redirect(url) => assert_eq!(url, "/"),
            other => panic!("expected redirect, got {other:?}"),
        }
        assert!(matches!(decision.cookies, CookieUpdate::Clear));
        assert_eq!(broker.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_refresh_is_not_retried_within_a_request() {
        let broker = Arc::new(StubBroker::failing());
        let state = test_state(broker.clone());
        let now = now_ms();
        let (tok, meta) = seal_session(&state, Role::Patient, Some("RT1"), now + 1_000);

        let decision = evaluate(&state, "/api/patient/visits", Some(&tok), Some(&meta), now).await;
        assert!(matches!(
            decision.action,
            GateAction::Deny(StatusCode::UNAUTHORIZED)
        ));
        assert!(matches!(decision.cookies, CookieUpdate::Clear));
        assert_eq!(broker.calls(), 1);
    }

    #[tokio::test]
    async fn test_role_mismatch_rejects_despite_valid_token() {
        let broker = Arc::new(StubBroker::refreshing(fresh_tokens()));
        let state = test_state(broker.clone());
        let now = now_ms();
        let (tok, meta) = seal_session(&state, Role::Patient, Some("RT1"), now + 3_600_000);

        let decision = evaluate(&state, "/provider/schedule", Some(&tok), Some(&meta), now).await;
        match decision.action {
            GateAction::Redirect(url) => assert_eq!(url, "/"),
            other => panic!("expected redirect, got {other:?}"),
        }
        // Session stays intact, no cookie churn, no refresh.
        assert!(matches!(decision.cookies, CookieUpdate::None));
        assert_eq!(broker.calls(), 0);
    }

    #[tokio::test]
    async fn test_role_mismatch_on_api_route_is_denied() {
        let state = test_state(Arc::new(StubBroker::failing()));
        let now = now_ms();
        let (tok, meta) = seal_session(&state, Role::Patient, None, now + 3_600_000);
        let decision =
            evaluate(&state, "/api/provider/schedule", Some(&tok), Some(&meta), now).await;
        assert!(matches!(
            decision.action,
            GateAction::Deny(StatusCode::UNAUTHORIZED)
        ));
    }

    #[test]
    fn test_prefix_matching_respects_segment_boundaries() {
        assert!(path_has_prefix("/patient", "/patient"));
        assert!(path_has_prefix("/patient/home", "/patient"));
        assert!(!path_has_prefix("/patients-export", "/patient"));
        assert!(!path_has_prefix("/api", "/api/patient"));
    }
}
