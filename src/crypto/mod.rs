//! Key agreement, key derivation and the transient key set of one handshake.

use p521::ecdh::EphemeralSecret;
use p521::elliptic_curve::sec1::ToEncodedPoint;
use p521::PublicKey;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub mod cipher;
pub mod credentials;

pub use cipher::{EncryptedPayload, SealedCredentials};
pub use credentials::{CredentialSource, Credentials, StaticCredentials};

/// PBKDF2-HMAC-SHA256 iteration count shared with the relay.
pub const PBKDF2_ROUNDS: u32 = 10_000;
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid peer key: {0}")]
    InvalidPeerKey(String),
    #[error("invalid nonce: {0}")]
    InvalidNonce(String),
    #[error("encoding: {0}")]
    Encoding(String),
    #[error("encryption failed")]
    Seal,
    #[error("decryption failed")]
    Open,
}

/// Ephemeral key agreement used by the handshake.
pub trait KeyExchange: Send + Sync {
    /// SEC1 uncompressed public key.
    fn public_key(&self) -> Vec<u8>;
    /// Raw shared secret (x coordinate) with the peer's SEC1 public key.
    fn shared_secret(&self, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError>;
}

/// ECDH over secp521r1.
pub struct P521KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl P521KeyExchange {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }
}

impl Default for P521KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for P521KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P521KeyExchange").finish_non_exhaustive()
    }
}

impl KeyExchange for P521KeyExchange {
    fn public_key(&self) -> Vec<u8> {
        self.public.to_encoded_point(false).as_bytes().to_vec()
    }

    fn shared_secret(&self, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let peer = PublicKey::from_sec1_bytes(peer_public)
            .map_err(|e| CryptoError::InvalidPeerKey(e.to_string()))?;
        let shared = self.secret.diffie_hellman(&peer);
        Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    }
}

/// PBKDF2-HMAC-SHA256 with the protocol's fixed iteration count and output size.
pub fn derive_key(secret: &[u8], salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, PBKDF2_ROUNDS, &mut key[..]);
    key
}

/// Keys and salts produced by one key exchange. Zeroed on drop.
///
/// The two salts are the relay-issued nonces in their hex form, exactly as
/// they travel on the wire; the relay re-derives both keys from them.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TransientKeys {
    payload_key: [u8; KEY_LEN],
    code_key: [u8; KEY_LEN],
    nonce: [u8; NONCE_LEN],
    salt1: String,
    salt2: String,
}

impl TransientKeys {
    /// Derives the payload key from `nk` and the security-code key from `st`.
    /// `nk` doubles as the GCM nonce and must decode to 12 bytes.
    pub fn derive(shared_secret: &[u8], nk_hex: &str, st_hex: &str) -> Result<Self, CryptoError> {
        let nonce_bytes =
            hex::decode(nk_hex).map_err(|e| CryptoError::InvalidNonce(e.to_string()))?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidNonce(format!("expected {NONCE_LEN} bytes, got {}", nonce_bytes.len()))
        })?;
        hex::decode(st_hex).map_err(|e| CryptoError::InvalidNonce(e.to_string()))?;
        let payload_key = derive_key(shared_secret, nk_hex.as_bytes());
        let code_key = derive_key(shared_secret, st_hex.as_bytes());
        Ok(Self {
            payload_key: *payload_key,
            code_key: *code_key,
            nonce,
            salt1: nk_hex.to_string(),
            salt2: st_hex.to_string(),
        })
    }

    pub fn payload_key(&self) -> &[u8; KEY_LEN] {
        &self.payload_key
    }

    pub fn code_key(&self) -> &[u8; KEY_LEN] {
        &self.code_key
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    pub fn salt1(&self) -> &str {
        &self.salt1
    }

    pub fn salt2(&self) -> &str {
        &self.salt2
    }
}

impl std::fmt::Debug for TransientKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransientKeys")
            .field("salt1", &self.salt1)
            .field("salt2", &self.salt2)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree_on_the_secret() {
        let a = P521KeyExchange::new();
        let b = P521KeyExchange::new();
        let ab = a.shared_secret(&b.public_key()).unwrap();
        let ba = b.shared_secret(&a.public_key()).unwrap();
        assert_eq!(*ab, *ba);
        assert_eq!(ab.len(), 66);
    }

    #[test]
    fn rejects_garbage_peer_key() {
        let a = P521KeyExchange::new();
        assert!(matches!(
            a.shared_secret(&[4, 1, 2, 3]),
            Err(CryptoError::InvalidPeerKey(_))
        ));
    }

    #[test]
    fn salts_produce_independent_keys() {
        let secret = [7u8; 66];
        let keys = TransientKeys::derive(&secret, &"11".repeat(12), &"22".repeat(12)).unwrap();
        assert_ne!(keys.payload_key(), keys.code_key());
        assert_eq!(keys.salt1(), "11".repeat(12));
        assert_eq!(*keys.payload_key(), *derive_key(&secret, "11".repeat(12).as_bytes()));
    }

    #[test]
    fn nonce_must_be_twelve_bytes() {
        let secret = [7u8; 66];
        assert!(TransientKeys::derive(&secret, "abcd", "abcd").is_err());
        assert!(TransientKeys::derive(&secret, "zz", "abcd").is_err());
    }
}
