//! # RSA Transit Keys
//!
//! RSA-OAEP transit keys for deployments that cannot yet take the
//! post-quantum variants. Payloads of arbitrary length are chunked into
//! OAEP-sized blocks: encryption steps through the plaintext in blocks of
//! `modulus − 2·hash − 2` bytes (SHA-512), decryption in blocks of the
//! modulus size, and per-block outputs are concatenated.
//!
//! Key material serializes as PEM (SPKI public, PKCS#8 private) inside the
//! envelope, length-prefixed so the two documents can be split apart again.

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha512;
use std::time::Duration;

use super::envelope::{self, EnvelopeError, EnvelopeWriter};
use super::{KeyError, KeyResult};

/// Type tag carried in the envelope for RSA keys.
pub const RSA_KEY_TYPE: &str = "rsa";

/// Smallest accepted modulus size in bits.
pub const MIN_KEY_BITS: usize = 2048;

/// Largest accepted modulus size in bits.
pub const MAX_KEY_BITS: usize = 4096;

// SHA-512 digest size, which fixes the OAEP overhead per block
const OAEP_HASH_SIZE: usize = 64;

// type, size, name, created-at, ttl, pub-len, priv-len, material
const ENVELOPE_FIELDS: usize = 8;

/// A named RSA transit key with TTL metadata.
pub struct RsaKey {
    name: String,
    bits: usize,
    public_key: RsaPublicKey,
    private_key: RsaPrivateKey,
    created_at: DateTime<Utc>,
    ttl: Duration,
}

impl RsaKey {
    /// Generate a fresh key pair.
    ///
    /// `size` is a decimal bit count in `2048..=4096`; anything else is
    /// rejected with a descriptive error.
    pub fn generate(name: impl Into<String>, size: &str, ttl: Duration) -> KeyResult<Self> {
        let bits: usize = size
            .parse()
            .map_err(|_| KeyError::UnsupportedKeySize(size.to_string()))?;
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
            return Err(KeyError::UnsupportedKeySize(size.to_string()));
        }

        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| KeyError::Generation(e.to_string()))?;
        let public_key = private_key.to_public_key();

        Ok(Self {
            name: name.into(),
            bits,
            public_key,
            private_key,
            created_at: Utc::now(),
            ttl,
        })
    }

    /// Key name (cache key).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Creation timestamp (preserved across pack/unpack).
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time-to-live; zero means the key never expires.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Replace the TTL.
    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }

    /// Encrypt `plaintext` block-by-block with OAEP/SHA-512.
    pub fn encrypt(&self, plaintext: &[u8]) -> KeyResult<Vec<u8>> {
        let step = self.public_key.size() - 2 * OAEP_HASH_SIZE - 2;
        let mut rng = OsRng;
        let mut ciphertext = Vec::new();

        for chunk in plaintext.chunks(step) {
            let block = self
                .public_key
                .encrypt(&mut rng, Oaep::new::<Sha512>(), chunk)
                .map_err(|e| KeyError::Crypto(format!("oaep encrypt failed: {e}")))?;
            ciphertext.extend_from_slice(&block);
        }

        Ok(ciphertext)
    }

    /// Decrypt `ciphertext` block-by-block with OAEP/SHA-512.
    pub fn decrypt(&self, ciphertext: &[u8]) -> KeyResult<Vec<u8>> {
        let step = self.public_key.size();
        let mut plaintext = Vec::new();

        for chunk in ciphertext.chunks(step) {
            let block = self
                .private_key
                .decrypt(Oaep::new::<Sha512>(), chunk)
                .map_err(|e| KeyError::Crypto(format!("oaep decrypt failed: {e}")))?;
            plaintext.extend_from_slice(&block);
        }

        Ok(plaintext)
    }

    /// Serialize to the self-describing envelope.
    pub fn pack(&self) -> KeyResult<Vec<u8>> {
        let public_pem = self
            .public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::Serialization(e.to_string()))?;
        let private_pem = self
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::Serialization(e.to_string()))?;

        let mut w = EnvelopeWriter::new();
        w.field(RSA_KEY_TYPE);
        w.field(&self.bits.to_string());
        w.field(&self.name);
        w.field(&envelope::format_timestamp(self.created_at));
        w.field(&envelope::format_ttl(self.ttl));
        w.field(&public_pem.len().to_string());
        w.field(&private_pem.len().to_string());
        w.material(public_pem.as_bytes());
        w.material(private_pem.as_bytes());
        Ok(w.into_bytes())
    }

    /// Deserialize from a packed envelope.
    pub fn unpack(data: &[u8]) -> KeyResult<Self> {
        let parts = envelope::split_fields(data, ENVELOPE_FIELDS)?;

        let key_type = envelope::text_field(parts[0])?;
        if key_type != RSA_KEY_TYPE {
            return Err(KeyError::UnknownKeyType(key_type.to_string()));
        }

        let size = envelope::text_field(parts[1])?;
        let bits: usize = size
            .parse()
            .map_err(|_| KeyError::UnsupportedKeySize(size.to_string()))?;
        let name = envelope::text_field(parts[2])?.to_string();
        let created_at = envelope::parse_timestamp(parts[3])?;
        let ttl = envelope::parse_ttl(parts[4])?;

        let public_len: usize = envelope::text_field(parts[5])?
            .parse()
            .map_err(|_| EnvelopeError::InvalidFormat("bad public key length".to_string()))
            .map_err(KeyError::Envelope)?;
        let private_len: usize = envelope::text_field(parts[6])?
            .parse()
            .map_err(|_| EnvelopeError::InvalidFormat("bad private key length".to_string()))
            .map_err(KeyError::Envelope)?;

        let material = parts[7];
        if material.len() < public_len + private_len {
            return Err(KeyError::Envelope(EnvelopeError::MaterialTooShort {
                expected: public_len + private_len,
                actual: material.len(),
            }));
        }

        let public_pem = envelope::text_field(&material[..public_len])?;
        let private_pem = envelope::text_field(&material[public_len..public_len + private_len])?;

        let public_key = RsaPublicKey::from_public_key_pem(public_pem)
            .map_err(|e| KeyError::Serialization(e.to_string()))?;
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_pem)
            .map_err(|e| KeyError::Serialization(e.to_string()))?;

        Ok(Self {
            name,
            bits,
            public_key,
            private_key,
            created_at,
            ttl,
        })
    }
}

impl std::fmt::Debug for RsaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKey")
            .field("name", &self.name)
            .field("bits", &self.bits)
            .field("created_at", &self.created_at)
            .field("ttl", &self.ttl)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}
