//! Authenticated encryption of structured payloads using ChaCha20-Poly1305
//!
//! Every payload that leaves a peer, whether on an open channel or through
//! the signaling relay, is a JSON value sealed into an [`Envelope`] with a
//! fresh random nonce.
//!
//! # Wire Format
//!
//! ```text
//! { "iv": base64url(nonce, 12 bytes), "ct": base64url(ciphertext + tag) }
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{PeerError, PeerResult};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Symmetric key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// Encode bytes as unpadded base64url.
pub fn b64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode unpadded base64url. Trailing `=` padding is tolerated.
pub fn b64url_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(s.trim_end_matches('='))
}

/// A sealed payload: nonce plus ciphertext, both base64url encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Nonce used for this envelope
    pub iv: String,
    /// Ciphertext with the 16-byte authentication tag appended
    pub ct: String,
}

impl Envelope {
    /// Serialize for transport as a single JSON text frame.
    pub fn to_json(&self) -> PeerResult<String> {
        serde_json::to_string(self).map_err(|e| PeerError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame. A frame that is not an envelope is a
    /// decryption failure, not a serialization one: nothing readable came in.
    pub fn from_json(text: &str) -> PeerResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| PeerError::Decryption(format!("Malformed envelope: {}", e)))
    }
}

/// Pairwise symmetric key.
///
/// Derived once per friend from static ECDH and reused for the data channel
/// and the signaling channel alike. There is no rotation.
///
/// # Example
///
/// ```
/// use peermsg_core::crypto::SessionKey;
///
/// let key = SessionKey::from_bytes(SessionKey::generate_key());
/// let envelope = key.seal(&vec!["hello", "world"]).unwrap();
/// let opened: Vec<String> = key.open(&envelope).unwrap();
///
/// assert_eq!(opened, vec!["hello", "world"]);
/// ```
#[derive(Clone)]
pub struct SessionKey {
    bytes: [u8; KEY_SIZE],
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey").finish_non_exhaustive()
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for SessionKey {}

impl SessionKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new((&bytes).into()),
            bytes,
        }
    }

    /// Generate a new random 32-byte key.
    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Generate a random 12-byte nonce.
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Encrypt raw bytes with a caller-provided nonce (no nonce prepended).
    pub fn encrypt_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> PeerResult<Vec<u8>> {
        self.cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|e| PeerError::Serialization(format!("Encryption failed: {}", e)))
    }

    /// Decrypt raw bytes with the nonce they were sealed under.
    pub fn decrypt_with_nonce(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> PeerResult<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| PeerError::Decryption(format!("{}", e)))
    }

    /// Seal a structured value.
    ///
    /// The value is serialized to JSON and encrypted under a fresh random
    /// nonce, so sealing the same value twice yields different envelopes.
    pub fn seal<T: Serialize + ?Sized>(&self, value: &T) -> PeerResult<Envelope> {
        let plaintext =
            serde_json::to_vec(value).map_err(|e| PeerError::Serialization(e.to_string()))?;
        let nonce = Self::generate_nonce();
        let ciphertext = self.encrypt_with_nonce(&plaintext, &nonce)?;

        Ok(Envelope {
            iv: b64url_encode(&nonce),
            ct: b64url_encode(&ciphertext),
        })
    }

    /// Open an envelope and deserialize its value.
    ///
    /// # Errors
    ///
    /// `PeerError::Decryption` on bad base64, wrong nonce length, tag
    /// mismatch, wrong key, or a plaintext that does not decode as `T`.
    pub fn open<T: DeserializeOwned>(&self, envelope: &Envelope) -> PeerResult<T> {
        let nonce_bytes = b64url_decode(&envelope.iv)
            .map_err(|e| PeerError::Decryption(format!("Malformed iv: {}", e)))?;
        let nonce: [u8; NONCE_SIZE] = nonce_bytes.as_slice().try_into().map_err(|_| {
            PeerError::Decryption(format!(
                "Nonce must be {} bytes, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            ))
        })?;
        let ciphertext = b64url_decode(&envelope.ct)
            .map_err(|e| PeerError::Decryption(format!("Malformed ciphertext: {}", e)))?;

        let plaintext = self.decrypt_with_nonce(&ciphertext, &nonce)?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| PeerError::Decryption(format!("Undecodable plaintext: {}", e)))
    }
}
