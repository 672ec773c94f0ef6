use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};

/// A PKCE verifier and its S256 challenge, generated together at login launch.
///
/// The verifier stays server-side (inside the pending-login record); only the
/// challenge travels to the authorization endpoint.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// Generate a fresh verifier (48 random bytes, base64url → 64 chars,
    /// within RFC 7636's 43–128 range) and its `BASE64URL(SHA256(verifier))`
    /// challenge.
    #[must_use]
    pub fn generate() -> Self {
        let verifier = random_token(48);
        let challenge = challenge_for(&verifier);
        Self { verifier, challenge }
    }
}

/// S256 challenge for an existing verifier.
#[must_use]
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Cryptographically random URL-safe token from `n` random bytes.
///
/// Also used for state-nonce identifiers, so unpredictability is a security
/// requirement here, not a nicety.
#[must_use]
pub fn random_token(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}
