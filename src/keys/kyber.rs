//! # Kyber-Family Transit Keys
//!
//! Post-quantum transit keys over the ML-KEM (Kyber) lattice KEM in its
//! 512/768/1024 parameter sets. Arbitrary-length payloads are processed in
//! fixed 32-byte frames: each frame encapsulates a fresh shared secret
//! against the recipient key and XOR-masks the frame with it, so a frame's
//! ciphertext is the KEM ciphertext followed by the masked block.
//!
//! Encryption is deterministic per key: a per-key CSPRNG seed drives the
//! encapsulation RNG, so identical plaintexts produce identical ciphertexts
//! under the same key. The final frame is zero-padded; decryption strips
//! trailing `0x00` bytes, which means plaintexts that naturally end in NUL
//! bytes come back truncated. Callers that must preserve trailing NULs need
//! to frame their payloads themselves.

use chrono::{DateTime, Utc};
use fips203::traits::{Decaps, Encaps, KeyGen, SerDes};
use fips203::{ml_kem_1024, ml_kem_512, ml_kem_768};
use rand::rngs::OsRng;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::time::Duration;
use zeroize::Zeroize;

use super::envelope::{self, EnvelopeError, EnvelopeWriter};
use super::{KeyError, KeyResult};

/// Type tag carried in the envelope for Kyber-family keys.
pub const KYBER_KEY_TYPE: &str = "kyber";

/// Plaintext frame size in bytes (the KEM shared-secret length).
pub const PLAINTEXT_SIZE: usize = fips203::SSK_LEN;

/// Per-key encryption seed size in bytes.
pub const SEED_SIZE: usize = 32;

// type, size, name, created-at, ttl, material
const ENVELOPE_FIELDS: usize = 6;

/// Kyber parameter set selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KyberSize {
    /// ML-KEM-512 (security category 1)
    Kyber512,
    /// ML-KEM-768 (security category 3)
    Kyber768,
    /// ML-KEM-1024 (security category 5)
    Kyber1024,
}

impl KyberSize {
    /// Parse a size tag (`"512"`, `"768"`, `"1024"`).
    pub fn parse(tag: &str) -> KeyResult<Self> {
        match tag {
            "512" => Ok(KyberSize::Kyber512),
            "768" => Ok(KyberSize::Kyber768),
            "1024" => Ok(KyberSize::Kyber1024),
            other => Err(KeyError::UnsupportedKeySize(other.to_string())),
        }
    }

    /// The envelope size tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            KyberSize::Kyber512 => "512",
            KyberSize::Kyber768 => "768",
            KyberSize::Kyber1024 => "1024",
        }
    }

    /// Packed public (encapsulation) key size in bytes.
    pub fn public_key_size(&self) -> usize {
        match self {
            KyberSize::Kyber512 => ml_kem_512::EK_LEN,
            KyberSize::Kyber768 => ml_kem_768::EK_LEN,
            KyberSize::Kyber1024 => ml_kem_1024::EK_LEN,
        }
    }

    /// Packed private (decapsulation) key size in bytes.
    pub fn private_key_size(&self) -> usize {
        match self {
            KyberSize::Kyber512 => ml_kem_512::DK_LEN,
            KyberSize::Kyber768 => ml_kem_768::DK_LEN,
            KyberSize::Kyber1024 => ml_kem_1024::DK_LEN,
        }
    }

    /// KEM ciphertext size in bytes for one frame.
    pub fn kem_ciphertext_size(&self) -> usize {
        match self {
            KyberSize::Kyber512 => ml_kem_512::CT_LEN,
            KyberSize::Kyber768 => ml_kem_768::CT_LEN,
            KyberSize::Kyber1024 => ml_kem_1024::CT_LEN,
        }
    }

    /// Total ciphertext frame size: KEM ciphertext plus the masked block.
    pub fn ciphertext_size(&self) -> usize {
        self.kem_ciphertext_size() + PLAINTEXT_SIZE
    }
}

/// A named Kyber transit key with TTL metadata.
pub struct KyberKey {
    name: String,
    size: KyberSize,
    seed: [u8; SEED_SIZE],
    public_key: Vec<u8>,
    private_key: Vec<u8>,
    created_at: DateTime<Utc>,
    ttl: Duration,
}

impl KyberKey {
    /// Generate a fresh key pair and encryption seed.
    pub fn generate(name: impl Into<String>, size: KyberSize, ttl: Duration) -> KeyResult<Self> {
        let mut rng = OsRng;
        let (public_key, private_key) = match size {
            KyberSize::Kyber512 => {
                let (ek, dk) = ml_kem_512::KG::try_keygen_with_rng(&mut rng)
                    .map_err(|e| KeyError::Generation(e.to_string()))?;
                (ek.into_bytes().to_vec(), dk.into_bytes().to_vec())
            }
            KyberSize::Kyber768 => {
                let (ek, dk) = ml_kem_768::KG::try_keygen_with_rng(&mut rng)
                    .map_err(|e| KeyError::Generation(e.to_string()))?;
                (ek.into_bytes().to_vec(), dk.into_bytes().to_vec())
            }
            KyberSize::Kyber1024 => {
                let (ek, dk) = ml_kem_1024::KG::try_keygen_with_rng(&mut rng)
                    .map_err(|e| KeyError::Generation(e.to_string()))?;
                (ek.into_bytes().to_vec(), dk.into_bytes().to_vec())
            }
        };

        let mut seed = [0u8; SEED_SIZE];
        OsRng.fill_bytes(&mut seed);

        Ok(Self {
            name: name.into(),
            size,
            seed,
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

    /// Parameter set of this key.
    pub fn size(&self) -> KyberSize {
        self.size
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

    /// Encrypt `plaintext` frame-by-frame.
    ///
    /// The ciphertext length is `ceil(len / PLAINTEXT_SIZE)` frames of
    /// [`KyberSize::ciphertext_size`] bytes; an empty plaintext yields an
    /// empty ciphertext. The final frame is zero-padded.
    pub fn encrypt(&self, plaintext: &[u8]) -> KeyResult<Vec<u8>> {
        let handle = self.encaps_handle()?;
        let mut rng = ChaCha20Rng::from_seed(self.seed);

        let frames = (plaintext.len() + PLAINTEXT_SIZE - 1) / PLAINTEXT_SIZE;
        let mut ciphertext = Vec::with_capacity(frames * self.size.ciphertext_size());

        for chunk in plaintext.chunks(PLAINTEXT_SIZE) {
            let mut block = [0u8; PLAINTEXT_SIZE];
            block[..chunk.len()].copy_from_slice(chunk);

            let (secret, encapsulated) = handle.encapsulate(&mut rng)?;
            for (b, s) in block.iter_mut().zip(secret.iter()) {
                *b ^= s;
            }

            ciphertext.extend_from_slice(&encapsulated);
            ciphertext.extend_from_slice(&block);
        }

        Ok(ciphertext)
    }

    /// Decrypt `ciphertext` frame-by-frame and strip zero padding.
    ///
    /// A short trailing frame is treated as an invalid tail and ignored.
    /// Trailing `0x00` bytes of the recovered plaintext are removed, so
    /// plaintexts ending in NUL bytes are truncated (see module docs).
    pub fn decrypt(&self, ciphertext: &[u8]) -> KeyResult<Vec<u8>> {
        let handle = self.decaps_handle()?;
        let frame = self.size.ciphertext_size();
        let kem_len = self.size.kem_ciphertext_size();

        let mut plaintext = Vec::with_capacity(ciphertext.len() / frame * PLAINTEXT_SIZE);
        for chunk in ciphertext.chunks(frame) {
            if chunk.len() < frame {
                break;
            }
            let (encapsulated, masked) = chunk.split_at(kem_len);
            let secret = handle.decapsulate(encapsulated)?;
            plaintext.extend(masked.iter().zip(secret.iter()).map(|(m, s)| m ^ s));
        }

        while plaintext.last() == Some(&0) {
            plaintext.pop();
        }

        Ok(plaintext)
    }

    /// Serialize to the self-describing envelope.
    pub fn pack(&self) -> KeyResult<Vec<u8>> {
        let mut w = EnvelopeWriter::new();
        w.field(KYBER_KEY_TYPE);
        w.field(self.size.as_str());
        w.field(&self.name);
        w.field(&envelope::format_timestamp(self.created_at));
        w.field(&envelope::format_ttl(self.ttl));
        w.material(&self.seed);
        w.material(&self.public_key);
        w.material(&self.private_key);
        Ok(w.into_bytes())
    }

    /// Deserialize from a packed envelope.
    pub fn unpack(data: &[u8]) -> KeyResult<Self> {
        let parts = envelope::split_fields(data, ENVELOPE_FIELDS)?;

        let key_type = envelope::text_field(parts[0])?;
        if key_type != KYBER_KEY_TYPE {
            return Err(KeyError::UnknownKeyType(key_type.to_string()));
        }

        let size = KyberSize::parse(envelope::text_field(parts[1])?)?;
        let name = envelope::text_field(parts[2])?.to_string();
        let created_at = envelope::parse_timestamp(parts[3])?;
        let ttl = envelope::parse_ttl(parts[4])?;

        let material = parts[5];
        let expected = SEED_SIZE + size.public_key_size() + size.private_key_size();
        if material.len() < expected {
            return Err(KeyError::Envelope(EnvelopeError::MaterialTooShort {
                expected,
                actual: material.len(),
            }));
        }

        let mut seed = [0u8; SEED_SIZE];
        seed.copy_from_slice(&material[..SEED_SIZE]);
        let public_key = material[SEED_SIZE..SEED_SIZE + size.public_key_size()].to_vec();
        let private_key = material
            [SEED_SIZE + size.public_key_size()..SEED_SIZE + size.public_key_size() + size.private_key_size()]
            .to_vec();

        Ok(Self {
            name,
            size,
            seed,
            public_key,
            private_key,
            created_at,
            ttl,
        })
    }

    fn encaps_handle(&self) -> KeyResult<EncapsHandle> {
        let malformed = || KeyError::Crypto("malformed public key material".to_string());
        match self.size {
            KyberSize::Kyber512 => {
                let bytes: [u8; ml_kem_512::EK_LEN] =
                    self.public_key.as_slice().try_into().map_err(|_| malformed())?;
                let ek = ml_kem_512::EncapsKey::try_from_bytes(bytes)
                    .map_err(|e| KeyError::Crypto(e.to_string()))?;
                Ok(EncapsHandle::Kyber512(ek))
            }
            KyberSize::Kyber768 => {
                let bytes: [u8; ml_kem_768::EK_LEN] =
                    self.public_key.as_slice().try_into().map_err(|_| malformed())?;
                let ek = ml_kem_768::EncapsKey::try_from_bytes(bytes)
                    .map_err(|e| KeyError::Crypto(e.to_string()))?;
                Ok(EncapsHandle::Kyber768(ek))
            }
            KyberSize::Kyber1024 => {
                let bytes: [u8; ml_kem_1024::EK_LEN] =
                    self.public_key.as_slice().try_into().map_err(|_| malformed())?;
                let ek = ml_kem_1024::EncapsKey::try_from_bytes(bytes)
                    .map_err(|e| KeyError::Crypto(e.to_string()))?;
                Ok(EncapsHandle::Kyber1024(ek))
            }
        }
    }

    fn decaps_handle(&self) -> KeyResult<DecapsHandle> {
        let malformed = || KeyError::Crypto("malformed private key material".to_string());
        match self.size {
            KyberSize::Kyber512 => {
                let bytes: [u8; ml_kem_512::DK_LEN] =
                    self.private_key.as_slice().try_into().map_err(|_| malformed())?;
                let dk = ml_kem_512::DecapsKey::try_from_bytes(bytes)
                    .map_err(|e| KeyError::Crypto(e.to_string()))?;
                Ok(DecapsHandle::Kyber512(dk))
            }
            KyberSize::Kyber768 => {
                let bytes: [u8; ml_kem_768::DK_LEN] =
                    self.private_key.as_slice().try_into().map_err(|_| malformed())?;
                let dk = ml_kem_768::DecapsKey::try_from_bytes(bytes)
                    .map_err(|e| KeyError::Crypto(e.to_string()))?;
                Ok(DecapsHandle::Kyber768(dk))
            }
            KyberSize::Kyber1024 => {
                let bytes: [u8; ml_kem_1024::DK_LEN] =
                    self.private_key.as_slice().try_into().map_err(|_| malformed())?;
                let dk = ml_kem_1024::DecapsKey::try_from_bytes(bytes)
                    .map_err(|e| KeyError::Crypto(e.to_string()))?;
                Ok(DecapsHandle::Kyber1024(dk))
            }
        }
    }
}

impl Drop for KyberKey {
    fn drop(&mut self) {
        self.seed.zeroize();
        self.private_key.zeroize();
    }
}

impl std::fmt::Debug for KyberKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KyberKey")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("created_at", &self.created_at)
            .field("ttl", &self.ttl)
            .field("seed", &"[REDACTED]")
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Parsed encapsulation key, one variant per parameter set.
enum EncapsHandle {
    Kyber512(ml_kem_512::EncapsKey),
    Kyber768(ml_kem_768::EncapsKey),
    Kyber1024(ml_kem_1024::EncapsKey),
}

impl EncapsHandle {
    fn encapsulate(&self, rng: &mut ChaCha20Rng) -> KeyResult<([u8; PLAINTEXT_SIZE], Vec<u8>)> {
        match self {
            EncapsHandle::Kyber512(ek) => {
                let (ssk, ct) = ek
                    .try_encaps_with_rng(rng)
                    .map_err(|e| KeyError::Crypto(e.to_string()))?;
                Ok((ssk.into_bytes(), ct.into_bytes().to_vec()))
            }
            EncapsHandle::Kyber768(ek) => {
                let (ssk, ct) = ek
                    .try_encaps_with_rng(rng)
                    .map_err(|e| KeyError::Crypto(e.to_string()))?;
                Ok((ssk.into_bytes(), ct.into_bytes().to_vec()))
            }
            EncapsHandle::Kyber1024(ek) => {
                let (ssk, ct) = ek
                    .try_encaps_with_rng(rng)
                    .map_err(|e| KeyError::Crypto(e.to_string()))?;
                Ok((ssk.into_bytes(), ct.into_bytes().to_vec()))
            }
        }
    }
}

/// Parsed decapsulation key, one variant per parameter set.
enum DecapsHandle {
    Kyber512(ml_kem_512::DecapsKey),
    Kyber768(ml_kem_768::DecapsKey),
    Kyber1024(ml_kem_1024::DecapsKey),
}

impl DecapsHandle {
    fn decapsulate(&self, encapsulated: &[u8]) -> KeyResult<[u8; PLAINTEXT_SIZE]> {
        let malformed = || KeyError::Crypto("malformed ciphertext frame".to_string());
        match self {
            DecapsHandle::Kyber512(dk) => {
                let bytes: [u8; ml_kem_512::CT_LEN] =
                    encapsulated.try_into().map_err(|_| malformed())?;
                let ct = ml_kem_512::CipherText::try_from_bytes(bytes)
                    .map_err(|e| KeyError::Crypto(e.to_string()))?;
                let ssk = dk
                    .try_decaps(&ct)
                    .map_err(|e| KeyError::Crypto(e.to_string()))?;
                Ok(ssk.into_bytes())
            }
            DecapsHandle::Kyber768(dk) => {
                let bytes: [u8; ml_kem_768::CT_LEN] =
                    encapsulated.try_into().map_err(|_| malformed())?;
                let ct = ml_kem_768::CipherText::try_from_bytes(bytes)
                    .map_err(|e| KeyError::Crypto(e.to_string()))?;
                let ssk = dk
                    .try_decaps(&ct)
                    .map_err(|e| KeyError::Crypto(e.to_string()))?;
                Ok(ssk.into_bytes())
            }
            DecapsHandle::Kyber1024(dk) => {
                let bytes: [u8; ml_kem_1024::CT_LEN] =
                    encapsulated.try_into().map_err(|_| malformed())?;
                let ct = ml_kem_1024::CipherText::try_from_bytes(bytes)
                    .map_err(|e| KeyError::Crypto(e.to_string()))?;
                let ssk = dk
                    .try_decaps(&ct)
                    .map_err(|e| KeyError::Crypto(e.to_string()))?;
                Ok(ssk.into_bytes())
            }
        }
    }
}
