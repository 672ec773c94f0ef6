use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration;

use crate::codec::SealedSession;

/// Volatile half: sealed token bundle. Name is stable across deploys so
/// existing sessions survive a rollout.
pub const TOKEN_COOKIE: &str = "cl_session_t";
/// Stable half: sealed session metadata.
pub const META_COOKIE: &str = "cl_session_m";

fn sealed_cookie(name: &str, value: String, max_age_secs: i64, secure: bool) -> Cookie<'static> {
    Cookie::build((name.to_owned(), value))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .path("/")
        .max_age(Duration::seconds(max_age_secs))
        .build()
}

/// Both session cookies for a freshly sealed session.
pub(crate) fn session_cookies(
    sealed: &SealedSession,
    max_age_secs: i64,
    secure: bool,
) -> (Cookie<'static>, Cookie<'static>) {
    (
        sealed_cookie(TOKEN_COOKIE, sealed.token_cipher.clone(), max_age_secs, secure),
        sealed_cookie(META_COOKIE, sealed.meta_cipher.clone(), max_age_secs, secure),
    )
}

/// Replacement token cookie after a refresh; the metadata cookie is untouched.
pub(crate) fn token_cookie(
    token_cipher: String,
    max_age_secs: i64,
    secure: bool,
) -> Cookie<'static> {
    sealed_cookie(TOKEN_COOKIE, token_cipher, max_age_secs, secure)
}

/// Removal cookies for both halves.
pub(crate) fn clear_session_cookies() -> (Cookie<'static>, Cookie<'static>) {
    let clear = |name: &str| {
        Cookie::build((name.to_owned(), String::new()))
            .path("/")
            .max_age(Duration::ZERO)
            .build()
    };
    (clear(TOKEN_COOKIE), clear(META_COOKIE))
}
