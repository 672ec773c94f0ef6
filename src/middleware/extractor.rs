use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::types::Session;

use super::error::AuthError;

/// Validated session for the current request, attached by the gatekeeper.
///
/// Use as an axum extractor in handlers behind the gatekeeper layer.
/// Rejects with `401 Unauthorized` when no session was attached (e.g. the
/// handler was mounted outside the gatekeeper by mistake).
///
/// ```rust,ignore
/// async fn appointments(CurrentSession(session): CurrentSession) -> impl IntoResponse {
///     fhir_client.list_appointments(&session).await
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CurrentSession(pub Session);

impl<S: Send + Sync> FromRequestParts<S> for CurrentSession {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Session>()
            .cloned()
            .map(CurrentSession)
            .ok_or(AuthError::Unauthenticated)
    }
}
