//! # Transit Key Abstraction
//!
//! A transit key is a named asymmetric key with TTL metadata that can
//! encrypt and decrypt arbitrary-length payloads and serialize itself to a
//! self-describing byte envelope. Two variants exist:
//!
//! - [`KyberKey`]: ML-KEM (Kyber) 512/768/1024, the post-quantum default
//! - [`RsaKey`]: RSA-OAEP with SHA-512, sizes 2048..=4096
//!
//! The set is closed: [`TransitKey`] is the sum of the variants, and the
//! factory functions dispatch on the `type` tag (at construction) or on the
//! leading envelope field (at unpack).

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub mod envelope;
pub mod kyber;
pub mod rsa;

pub use envelope::{EnvelopeError, SEPARATOR_BYTE};
pub use kyber::{KyberKey, KyberSize, KYBER_KEY_TYPE};
pub use rsa::{RsaKey, RSA_KEY_TYPE};

/// Default key lifetime when a create request does not override it.
pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(25 * 60);

/// Transit key errors
#[derive(Error, Debug)]
pub enum KeyError {
    /// Key type tag not recognized by the factory
    #[error("unknown key type: {0}")]
    UnknownKeyType(String),

    /// Size tag outside the variant's supported range
    #[error("unsupported key size: {0}")]
    UnsupportedKeySize(String),

    /// Key pair generation failed
    #[error("key generation failed: {0}")]
    Generation(String),

    /// Envelope parse error
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Primitive encrypt/decrypt failure
    #[error("crypto operation failed: {0}")]
    Crypto(String),

    /// Key material serialization failed
    #[error("key serialization failed: {0}")]
    Serialization(String),
}

pub type KeyResult<T> = Result<T, KeyError>;

/// A named transit key, polymorphic over the supported primitives.
#[derive(Debug)]
pub enum TransitKey {
    /// ML-KEM (Kyber) key
    Kyber(KyberKey),
    /// RSA-OAEP key
    Rsa(RsaKey),
}

impl TransitKey {
    /// Construct a new key of the given type and size.
    ///
    /// `key_type` is `"kyber"` (sizes `512`/`768`/`1024`) or `"rsa"`
    /// (decimal bit counts in `2048..=4096`).
    pub fn new(key_type: &str, size: &str, name: &str, ttl: Duration) -> KeyResult<Self> {
        match key_type {
            KYBER_KEY_TYPE => {
                let size = KyberSize::parse(size)?;
                Ok(TransitKey::Kyber(KyberKey::generate(name, size, ttl)?))
            }
            RSA_KEY_TYPE => Ok(TransitKey::Rsa(RsaKey::generate(name, size, ttl)?)),
            other => Err(KeyError::UnknownKeyType(other.to_string())),
        }
    }

    /// Deserialize a packed envelope, dispatching on its leading type field.
    pub fn unpack(data: &[u8]) -> KeyResult<Self> {
        let parts = envelope::split_fields(data, 2)?;
        match envelope::text_field(parts[0])? {
            KYBER_KEY_TYPE => Ok(TransitKey::Kyber(KyberKey::unpack(data)?)),
            RSA_KEY_TYPE => Ok(TransitKey::Rsa(RsaKey::unpack(data)?)),
            other => Err(KeyError::UnknownKeyType(other.to_string())),
        }
    }

    /// Key name (cache key).
    pub fn name(&self) -> &str {
        match self {
            TransitKey::Kyber(k) => k.name(),
            TransitKey::Rsa(k) => k.name(),
        }
    }

    /// Variant type tag (`"kyber"` or `"rsa"`).
    pub fn key_type(&self) -> &'static str {
        match self {
            TransitKey::Kyber(_) => KYBER_KEY_TYPE,
            TransitKey::Rsa(_) => RSA_KEY_TYPE,
        }
    }

    /// Size tag as carried in the envelope.
    pub fn size(&self) -> String {
        match self {
            TransitKey::Kyber(k) => k.size().as_str().to_string(),
            TransitKey::Rsa(k) => k.bits().to_string(),
        }
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            TransitKey::Kyber(k) => k.created_at(),
            TransitKey::Rsa(k) => k.created_at(),
        }
    }

    /// Time-to-live; zero means the key never expires.
    pub fn ttl(&self) -> Duration {
        match self {
            TransitKey::Kyber(k) => k.ttl(),
            TransitKey::Rsa(k) => k.ttl(),
        }
    }

    /// Replace the TTL without touching key material.
    pub fn set_ttl(&mut self, ttl: Duration) {
        match self {
            TransitKey::Kyber(k) => k.set_ttl(ttl),
            TransitKey::Rsa(k) => k.set_ttl(ttl),
        }
    }

    /// Whether the key's lifetime has elapsed.
    pub fn is_expired(&self) -> bool {
        let ttl = self.ttl();
        if ttl.is_zero() {
            return false;
        }
        match (Utc::now() - self.created_at()).to_std() {
            Ok(age) => age > ttl,
            Err(_) => false,
        }
    }

    /// Absolute expiry instant, or `None` for non-expiring keys.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = self.ttl();
        if ttl.is_zero() {
            return None;
        }
        chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| self.created_at() + ttl)
    }

    /// Encrypt a payload with this key.
    pub fn encrypt(&self, plaintext: &[u8]) -> KeyResult<Vec<u8>> {
        match self {
            TransitKey::Kyber(k) => k.encrypt(plaintext),
            TransitKey::Rsa(k) => k.encrypt(plaintext),
        }
    }

    /// Decrypt a payload with this key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> KeyResult<Vec<u8>> {
        match self {
            TransitKey::Kyber(k) => k.decrypt(ciphertext),
            TransitKey::Rsa(k) => k.decrypt(ciphertext),
        }
    }

    /// Serialize to the self-describing envelope.
    pub fn pack(&self) -> KeyResult<Vec<u8>> {
        match self {
            TransitKey::Kyber(k) => k.pack(),
            TransitKey::Rsa(k) => k.pack(),
        }
    }
}
