//! Login launch, OAuth callback, and logout handlers.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use url::Url;

use crate::error_uri::validate_error_uri;
use crate::oauth::{decode_id_claims, reference_id};
use crate::pkce::PkcePair;
use crate::types::{Role, SessionMetadata, now_ms};

use super::cookies;
use super::error::AuthError;
use super::gatekeeper::append_cookie;
use super::state::AuthState;

/// Router for the authentication endpoints:
/// `GET {auth_path}/login/{role}`, `GET {auth_path}/callback`,
/// `GET|POST {auth_path}/logout`.
pub fn auth_routes(state: AuthState) -> Router {
    let auth_path = state.settings.auth_path.clone();
    Router::new()
        .route(&format!("{auth_path}/login/{{role}}"), get(login))
        .route(&format!("{auth_path}/callback"), get(callback))
        .route(&format!("{auth_path}/logout"), get(logout).post(logout))
        .with_state(state)
}

// ── Login launch ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct LoginParams {
    /// Optional issuer override for multi-tenant deployments.
    iss: Option<String>,
}

async fn login(
    State(state): State<AuthState>,
    Path(role): Path<String>,
    Query(params): Query<LoginParams>,
) -> Result<Redirect, Response> {
    let role: Role = role
        .parse()
        .map_err(|_| login_error(&state, "unsupported_role"))?;

    let issuer = state
        .issuer(params.iss.as_deref())
        .cloned()
        .ok_or_else(|| AuthError::Config("no issuer configured".into()).into_response())?;

    let Some(creds) = state.credentials.resolve(&issuer.issuer, role) else {
        return Err(AuthError::Config(format!(
            "no client registered for {} as {role}",
            issuer.issuer
        ))
        .into_response());
    };

    let pkce = PkcePair::generate();
    let state_id = state.states.create(
        issuer.issuer.clone(),
        role,
        pkce.verifier,
        issuer.token_endpoint.clone(),
        issuer.revocation_endpoint.clone(),
    );

    let scopes = state
        .settings
        .scopes
        .get(&role)
        .map(|s| s.join(" "))
        .unwrap_or_else(|| "openid".into());

    let mut url: Url = issuer
        .authorization_endpoint
        .parse()
        .map_err(|e| AuthError::Config(format!("bad authorization endpoint: {e}")).into_response())?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &creds.client_id)
        .append_pair("redirect_uri", creds.redirect_uri.as_str())
        .append_pair("scope", &scopes)
        .append_pair("state", &state_id)
        .append_pair("aud", &issuer.issuer)
        .append_pair("code_challenge", &pkce.challenge)
        .append_pair("code_challenge_method", "S256");

    tracing::info!(issuer = %issuer.issuer, %role, "launching authorization redirect");
    Ok(Redirect::to(url.as_str()))
}

// ── Callback ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
    error_uri: Option<String>,
}

async fn callback(
    State(state): State<AuthState>,
    Query(params): Query<CallbackParams>,
) -> Result<Response, Response> {
    if params.error.is_some() {
        return Err(idp_error_response(&state, &params));
    }

    let code = params
        .code
        .ok_or_else(|| login_error(&state, "missing_code"))?;
    let state_id = params
        .state
        .ok_or_else(|| login_error(&state, "missing_state"))?;

    // Atomic consume: the authoritative CSRF/replay gate.
    let pending = state
        .states
        .retrieve_and_invalidate(&state_id)
        .map_err(|_| {
            tracing::warn!("callback with unknown or already-consumed state");
            login_error(&state, "invalid_state")
        })?;

    // Codes are single-use at the IdP; never attempt a second exchange.
    if !state.states.begin_code_exchange(&code) {
        tracing::warn!("duplicate callback for an authorization code");
        return Err(login_error(&state, "duplicate_callback"));
    }

    let Some(creds) = state.credentials.resolve(&pending.issuer, pending.role) else {
        return Err(AuthError::Config(format!(
            "no client registered for {} as {}",
            pending.issuer, pending.role
        ))
        .into_response());
    };

    let token_response = state
        .tokens
        .exchange_code(
            &code,
            &pending.token_endpoint,
            &creds,
            Some(&pending.code_verifier),
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "token exchange failed");
            login_error(&state, "token_exchange_failed")
        })?;

    // Identity claims are best-effort; a malformed id token costs us the
    // display name, not the login.
    let claims = token_response
        .id_token
        .as_deref()
        .map(decode_id_claims)
        .unwrap_or_default();

    // A patient login without a patient launch context cannot scope any
    // FHIR reads; treat as a recoverable validation failure, no session.
    if pending.role == Role::Patient && token_response.patient.is_none() {
        tracing::warn!(issuer = %pending.issuer, "patient login without patient launch context");
        return Err(login_error(&state, "missing_patient_context"));
    }

    let patient_id = token_response.patient.clone();
    let practitioner_id = token_response
        .fhir_user
        .as_deref()
        .or(claims.fhir_user.as_deref())
        .filter(|r| r.contains("Practitioner"))
        .and_then(reference_id)
        .map(String::from);

    let meta = SessionMetadata {
        role: pending.role,
        patient_id,
        practitioner_id,
        fhir_base_url: pending.issuer.clone(),
        client_id: creds.client_id.clone(),
        token_endpoint: pending.token_endpoint.clone(),
        revocation_endpoint: pending.revocation_endpoint.clone(),
        username: claims.profile.clone(),
        display_name: None,
    };
    let tokens = token_response.into_bundle(now_ms());

    let sealed = state
        .codec
        .encode(&tokens, &meta)
        .map_err(|e| AuthError::Internal(e.to_string()).into_response())?;

    tracing::info!(issuer = %pending.issuer, role = %pending.role, "login complete");

    let mut response =
        Redirect::to(state.settings.dashboard(pending.role)).into_response();
    let (tok, meta_cookie) = cookies::session_cookies(
        &sealed,
        state.settings.session_lifetime_secs,
        state.settings.secure_cookies,
    );
    append_cookie(&mut response, &tok);
    append_cookie(&mut response, &meta_cookie);
    Ok(response)
}

/// Compose the redirect for an IdP-reported authorization error.
///
/// Looks up the trusted issuer without consuming the pending login, strips
/// markup-significant characters from everything the IdP sent, and only
/// forwards `error_uri` when it survives validation against that issuer —
/// re-checked immediately before it is attached to the redirect.
fn idp_error_response(state: &AuthState, params: &CallbackParams) -> Response {
    let trusted_issuer = params
        .state
        .as_deref()
        .and_then(|id| state.states.peek_issuer(id));

    let error = sanitize(params.error.as_deref().unwrap_or("unknown_error"));
    let description = params.error_description.as_deref().map(sanitize);

    let validated_uri = params
        .error_uri
        .as_deref()
        .and_then(|uri| validate_error_uri(uri, trusted_issuer.as_deref()));

    tracing::warn!(
        error = %error,
        description = description.as_deref().unwrap_or(""),
        error_uri_ok = validated_uri.is_some(),
        "authorization error from IdP"
    );

    let mut location = format!(
        "{}?error={}",
        state.settings.login_page,
        urlencoding::encode(&error)
    );
    if let Some(description) = &description {
        location.push_str(&format!("&error_description={}", urlencoding::encode(description)));
    }
    // Second validation layer right before the link is emitted.
    if let Some(uri) = params
        .error_uri
        .as_deref()
        .and_then(|uri| validate_error_uri(uri, trusted_issuer.as_deref()))
    {
        location.push_str(&format!("&error_uri={}", urlencoding::encode(uri.as_str())));
    }
    Redirect::to(&location).into_response()
}

// ── Logout ─────────────────────────────────────────────────────────

async fn logout(State(state): State<AuthState>, jar: CookieJar) -> Response {
    // Best-effort revocation; the cookies are cleared regardless.
    if let (Some(tok), Some(meta)) = (
        jar.get(cookies::TOKEN_COOKIE),
        jar.get(cookies::META_COOKIE),
    ) {
        if let Ok(session) = state.codec.decode(tok.value(), meta.value()) {
            revoke_session_tokens(&state, &session).await;
        }
    }

    let mut response = Redirect::to(&state.settings.entry_path).into_response();
    let (tok, meta) = cookies::clear_session_cookies();
    append_cookie(&mut response, &tok);
    append_cookie(&mut response, &meta);
    response
}

async fn revoke_session_tokens(state: &AuthState, session: &crate::types::Session) {
    let Some(endpoint) = session.meta.revocation_endpoint.as_deref() else {
        return;
    };
    let Some(creds) = state
        .credentials
        .resolve(&session.meta.fhir_base_url, session.role())
    else {
        return;
    };
    let token = session
        .tokens
        .refresh_token
        .as_deref()
        .unwrap_or(&session.tokens.access_token);
    if let Err(e) = state
        .tokens
        .revoke(token, endpoint, &creds.client_id, &creds.client_secret)
        .await
    {
        tracing::warn!(error = %e, "token revocation failed during logout");
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn login_error(state: &AuthState, code: &str) -> Response {
    let encoded = urlencoding::encode(code);
    Redirect::to(&format!("{}?error={encoded}", state.settings.login_page)).into_response()
}

/// Strip characters that could break out of an attribute or element when the
/// message is later rendered.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '<' | '>' | '\'' | '"'))
        .collect()
}
