//! Encrypted session-cookie codec.
//!
//! A session is sealed into two independent ciphertexts under one
//! process-wide AES-256-GCM key: the volatile token half and the stable
//! metadata half. Splitting them means a refresh re-seals only the token
//! half and never rewrites metadata that did not change.
//!
//! Wire format per half: `base64url(nonce || ciphertext || tag)`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use rand::Rng;

use crate::error::Error;
use crate::types::{Session, SessionMetadata, TokenBundle};

const NONCE_LEN: usize = 12;

/// Process-wide 256-bit sealing key.
#[derive(Clone)]
pub struct SealingKey {
    key: [u8; 32],
}

impl SealingKey {
    #[must_use]
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Parse a standard-base64 encoded 32-byte key (the deployment format).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigMissing`] when the encoding is invalid or the
    /// decoded length is not 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| Error::ConfigMissing(format!("sealing key is not valid base64: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::ConfigMissing("sealing key must be exactly 32 bytes".into()))?;
        Ok(Self { key })
    }

    /// Fresh random key. Sessions sealed under it do not survive a restart,
    /// so this is for development and tests only.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill(&mut key);
        Self { key }
    }
}

/// The two sealed cookie values produced for one session.
#[derive(Debug, Clone)]
pub struct SealedSession {
    pub token_cipher: String,
    pub meta_cipher: String,
}

/// Seals and opens the two session halves.
pub struct SessionCodec {
    key: SealingKey,
}

impl SessionCodec {
    #[must_use]
    pub fn new(key: SealingKey) -> Self {
        Self { key }
    }

    /// Seal both halves of a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Seal`] if serialization or encryption fails.
    pub fn encode(
        &self,
        tokens: &TokenBundle,
        meta: &SessionMetadata,
    ) -> Result<SealedSession, Error> {
        Ok(SealedSession {
            token_cipher: self.seal(tokens)?,
            meta_cipher: self.seal(meta)?,
        })
    }

    /// Re-seal only the volatile token half (the refresh path).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Seal`] if serialization or encryption fails.
    pub fn seal_tokens(&self, tokens: &TokenBundle) -> Result<String, Error> {
        self.seal(tokens)
    }

    /// Open both halves and rebuild the session.
    ///
    /// Fails closed: any decryption or parse error on either half yields
    /// [`Error::Decode`] with no detail about which half or why.
    pub fn decode(&self, token_cipher: &str, meta_cipher: &str) -> Result<Session, Error> {
        let tokens: TokenBundle = self.open(token_cipher)?;
        let meta: SessionMetadata = self.open(meta_cipher)?;
        if tokens.access_token.is_empty()
            || meta.fhir_base_url.is_empty()
            || meta.client_id.is_empty()
            || meta.token_endpoint.is_empty()
        {
            return Err(Error::Decode);
        }
        Ok(Session { tokens, meta })
    }

    fn seal<T: serde::Serialize>(&self, value: &T) -> Result<String, Error> {
        let plaintext = serde_json::to_vec(value).map_err(|e| Error::Seal(e.to_string()))?;
        let cipher = Aes256Gcm::new_from_slice(&self.key.key)
            .map_err(|e| Error::Seal(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| Error::Seal("encryption failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(blob))
    }

    fn open<T: serde::de::DeserializeOwned>(&self, sealed: &str) -> Result<T, Error> {
        let blob = URL_SAFE_NO_PAD.decode(sealed).map_err(|_| Error::Decode)?;
        if blob.len() <= NONCE_LEN {
            return Err(Error::Decode);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);

        let cipher =
            Aes256Gcm::new_from_slice(&self.key.key).map_err(|_| Error::Decode)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Decode)?;

        serde_json::from_slice(&plaintext).map_err(|_| Error::Decode)
    }
}
