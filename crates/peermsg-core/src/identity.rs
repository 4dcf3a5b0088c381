//! Long-term identity and pairwise key agreement
//!
//! An identity is a static X25519 key pair. Its fingerprint is the SHA-256
//! digest of the raw public key, rendered as hex in groups of four so it can
//! be compared by eye when verifying a friend out of band:
//!
//! ```text
//! 3f2a 9c41 07be ... (16 groups)
//! ```
//!
//! Two identities derive the same [`SessionKey`] from each other's public
//! keys. The Diffie-Hellman output is used directly as the symmetric key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::{b64url_decode, b64url_encode, SessionKey};
use crate::error::{PeerError, PeerResult};

/// Raw public key length for X25519
pub const PUBLIC_KEY_LEN: usize = 32;

/// Number of fingerprint groups shown in compact displays
const SHORT_FINGERPRINT_GROUPS: usize = 6;

/// Compute the display fingerprint of a raw public key.
pub fn fingerprint(public_raw: &[u8]) -> String {
    let digest = Sha256::digest(public_raw);
    hex::encode(digest)
        .as_bytes()
        .chunks(4)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// First groups of a fingerprint, for lists and prompts.
pub fn short_fingerprint(fp: &str) -> String {
    fp.split(' ')
        .take(SHORT_FINGERPRINT_GROUPS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a base64url public key into its raw 32 bytes.
pub fn decode_public_key(public_b64: &str) -> PeerResult<[u8; PUBLIC_KEY_LEN]> {
    let bytes = b64url_decode(public_b64)
        .map_err(|e| PeerError::Identity(format!("Invalid public key encoding: {}", e)))?;
    bytes.as_slice().try_into().map_err(|_| {
        PeerError::Identity(format!(
            "Public key must be {} bytes, got {}",
            PUBLIC_KEY_LEN,
            bytes.len()
        ))
    })
}

/// Persisted form of an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    /// base64url raw public key
    pub public_key_raw: String,
    /// base64url raw secret scalar
    pub private_key_raw: String,
    /// Grouped hex fingerprint
    pub fingerprint: String,
}

/// A local identity: static key pair plus fingerprint.
#[derive(Clone)]
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
    fingerprint: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Generate a fresh identity.
    ///
    /// Fails only if the platform entropy source is unavailable.
    pub fn generate() -> PeerResult<Self> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| PeerError::Identity(format!("Entropy source failed: {}", e)))?;
        Ok(Self::from_secret_bytes(seed))
    }

    /// Rebuild an identity from a raw secret scalar.
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = PublicKey::from(&secret);
        let fingerprint = fingerprint(public.as_bytes());
        Self {
            secret,
            public,
            fingerprint,
        }
    }

    /// Grouped hex fingerprint of this identity.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Raw public key bytes.
    pub fn public_key_raw(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.public.as_bytes()
    }

    /// base64url public key, the form exchanged in pairing codes.
    pub fn public_key_b64(&self) -> String {
        b64url_encode(self.public.as_bytes())
    }

    /// Derive the pairwise session key with another identity.
    ///
    /// Deterministic and commutative: both ends of a pair get the same key.
    pub fn derive_session_key(&self, their_public_raw: &[u8]) -> PeerResult<SessionKey> {
        let their: [u8; PUBLIC_KEY_LEN] = their_public_raw.try_into().map_err(|_| {
            PeerError::Identity(format!(
                "Public key must be {} bytes, got {}",
                PUBLIC_KEY_LEN,
                their_public_raw.len()
            ))
        })?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(their));
        // Low-order points give a secret every party can compute
        if !shared.was_contributory() {
            return Err(PeerError::Identity(
                "Public key is a low-order point".to_string(),
            ));
        }
        Ok(SessionKey::from_bytes(*shared.as_bytes()))
    }

    /// Same as [`derive_session_key`](Self::derive_session_key) for a
    /// base64url public key.
    pub fn derive_session_key_b64(&self, their_public_b64: &str) -> PeerResult<SessionKey> {
        let raw = decode_public_key(their_public_b64)?;
        self.derive_session_key(&raw)
    }

    /// Export for persistence.
    pub fn to_record(&self) -> IdentityRecord {
        IdentityRecord {
            public_key_raw: self.public_key_b64(),
            private_key_raw: b64url_encode(self.secret.as_bytes()),
            fingerprint: self.fingerprint.clone(),
        }
    }

    /// Restore from persistence, checking that the stored public key and
    /// fingerprint still match the secret.
    pub fn from_record(record: &IdentityRecord) -> PeerResult<Self> {
        let secret_bytes = b64url_decode(&record.private_key_raw)
            .map_err(|e| PeerError::Identity(format!("Invalid private key encoding: {}", e)))?;
        let secret: [u8; 32] = secret_bytes
            .as_slice()
            .try_into()
            .map_err(|_| PeerError::Identity("Private key must be 32 bytes".to_string()))?;

        let identity = Self::from_secret_bytes(secret);
        if identity.public_key_b64() != record.public_key_raw
            || identity.fingerprint != record.fingerprint
        {
            return Err(PeerError::Identity(
                "Stored identity does not match its private key".to_string(),
            ));
        }
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let identity = Identity::generate().unwrap();
        let fp = identity.fingerprint();

        let groups: Vec<&str> = fp.split(' ').collect();
        assert_eq!(groups.len(), 16);
        assert!(groups
            .iter()
            .all(|g| g.len() == 4 && g.chars().all(|c| c.is_ascii_hexdigit())));
    }

    #[test]
    fn test_fingerprint_is_digest_of_public_key() {
        let identity = Identity::generate().unwrap();
        let expected = hex::encode(Sha256::digest(identity.public_key_raw()));
        assert_eq!(identity.fingerprint().replace(' ', ""), expected);
        assert_eq!(identity.fingerprint(), fingerprint(identity.public_key_raw()));
    }

    #[test]
    fn test_known_fingerprint() {
        // SHA-256 of 32 zero bytes
        let fp = fingerprint(&[0u8; 32]);
        assert!(fp.starts_with("6668 7aad f862 bd77"));
        assert_eq!(
            fp.replace(' ', ""),
            "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
        );
    }

    #[test]
    fn test_short_fingerprint() {
        let fp = "aaaa bbbb cccc dddd eeee ffff 0000 1111";
        assert_eq!(short_fingerprint(fp), "aaaa bbbb cccc dddd eeee ffff");
    }

    #[test]
    fn test_session_key_is_commutative() {
        let alice = Identity::generate().unwrap();
        let bob = Identity::generate().unwrap();

        let ab = alice.derive_session_key(bob.public_key_raw()).unwrap();
        let ba = bob.derive_session_key(alice.public_key_raw()).unwrap();
        assert_eq!(ab, ba);

        let envelope = ab.seal("hi bob").unwrap();
        assert_eq!(ba.open::<String>(&envelope).unwrap(), "hi bob");
    }

    #[test]
    fn test_session_key_is_deterministic() {
        let alice = Identity::generate().unwrap();
        let bob = Identity::generate().unwrap();

        let k1 = alice.derive_session_key_b64(&bob.public_key_b64()).unwrap();
        let k2 = alice.derive_session_key_b64(&bob.public_key_b64()).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_third_party_cannot_open() {
        let alice = Identity::generate().unwrap();
        let bob = Identity::generate().unwrap();
        let eve = Identity::generate().unwrap();

        let key = alice.derive_session_key(bob.public_key_raw()).unwrap();
        let eve_key = eve.derive_session_key(bob.public_key_raw()).unwrap();

        let envelope = key.seal("private").unwrap();
        assert!(eve_key.open::<String>(&envelope).is_err());
    }

    #[test]
    fn test_rejects_short_public_key() {
        let alice = Identity::generate().unwrap();
        assert!(matches!(
            alice.derive_session_key(&[1, 2, 3]),
            Err(PeerError::Identity(_))
        ));
    }

    #[test]
    fn test_rejects_low_order_public_key() {
        let alice = Identity::generate().unwrap();
        let mut one = [0u8; PUBLIC_KEY_LEN];
        one[0] = 1;
        for point in [[0u8; PUBLIC_KEY_LEN], one] {
            assert!(matches!(
                alice.derive_session_key(&point),
                Err(PeerError::Identity(_))
            ));
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let identity = Identity::generate().unwrap();
        let restored = Identity::from_record(&identity.to_record()).unwrap();

        assert_eq!(restored.fingerprint(), identity.fingerprint());
        assert_eq!(restored.public_key_raw(), identity.public_key_raw());
    }

    #[test]
    fn test_record_mismatch_rejected() {
        let identity = Identity::generate().unwrap();
        let other = Identity::generate().unwrap();

        let mut record = identity.to_record();
        record.fingerprint = other.fingerprint().to_string();

        assert!(matches!(
            Identity::from_record(&record),
            Err(PeerError::Identity(_))
        ));
    }
}
