//! Validation of IdP-supplied `error_uri` values.
//!
//! The authorization server may attach a documentation link to an error
//! redirect. That link arrives on an unauthenticated request, so it is an
//! open-redirect vector unless pinned to the issuer we actually launched
//! against. Callers validate once when composing the error message and again
//! immediately before rendering anything clickable.

use url::Url;

/// Validate an `error_uri` against the trusted issuer of the pending login.
///
/// Rules, all fail-closed:
/// - non-https schemes are rejected outright;
/// - with a known issuer, the URI host must equal the issuer host or be a
///   subdomain of it;
/// - with no issuer (state unknown or expired) the URI is rejected
///   unconditionally rather than trusted on faith.
#[must_use]
pub fn validate_error_uri(uri: &str, trusted_issuer: Option<&str>) -> Option<Url> {
    let url = Url::parse(uri).ok()?;
    if url.scheme() != "https" {
        return None;
    }
    let issuer = Url::parse(trusted_issuer?).ok()?;
    let issuer_host = issuer.host_str()?;
    let host = url.host_str()?;

    if host == issuer_host || is_subdomain_of(host, issuer_host) {
        Some(url)
    } else {
        None
    }
}

fn is_subdomain_of(host: &str, parent: &str) -> bool {
    host.len() > parent.len() + 1
        && host.ends_with(parent)
        && host.as_bytes()[host.len() - parent.len() - 1] == b'.'
}
