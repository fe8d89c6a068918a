//! A thin adapter over the external authenticated-encryption primitive the
//! rest of the driver treats as out of scope.
//!
//! [`CryptoProvider`] is the seam the context state machine calls through
//! when it encrypts a marking's value or decrypts a ciphertext blob's
//! payload. [`AeadCryptoProvider`] is a concrete reference implementation
//! (AES-256-GCM) used by tests and the demo CLI; it makes no claim of
//! bit-for-bit compatibility with any particular production KMS-backed
//! encryption scheme.

#![deny(unsafe_code)]

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use fle_core::{Algorithm, Error};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
/// Length of freshly generated data-key material, matching the historical
/// 96-byte layout (32 bytes each for encryption, MAC, and a reserved third
/// segment) even though this façade's AEAD only consumes the first 32.
const DATA_KEY_MATERIAL_LEN: usize = 96;

/// The seam between the context state machine and the symmetric crypto
/// primitive.
pub trait CryptoProvider: Send + Sync {
    /// Encrypt `plaintext` under `key_material`. `iv` is the caller-supplied
    /// 16-byte initialization vector for deterministic encryption; it is
    /// absent for random encryption, where the provider draws its own.
    fn encrypt(
        &self,
        key_material: &[u8],
        algorithm: Algorithm,
        iv: Option<[u8; 16]>,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error>;

    /// Decrypt a ciphertext payload under `key_material`.
    fn decrypt(&self, key_material: &[u8], algorithm: Algorithm, ciphertext: &[u8]) -> Result<Vec<u8>, Error>;

    /// Generate fresh, random local key material for a new data key (prior
    /// to wrapping it for the key vault via an external KMS call).
    fn generate_data_key(&self) -> Vec<u8>;
}

/// Reference [`CryptoProvider`]: AES-256-GCM keyed by the first 32 bytes of
/// the supplied key material. The nonce is prefixed onto the ciphertext;
/// for deterministic encryption it is derived from the caller's iv via
/// `SHA-256(iv)[..12]`, so the same plaintext + key + iv always produce the
/// same ciphertext.
#[derive(Debug, Default, Clone, Copy)]
pub struct AeadCryptoProvider;

impl AeadCryptoProvider {
    fn cipher(key_material: &[u8]) -> Result<Aes256Gcm, Error> {
        if key_material.len() < 32 {
            return Err(Error::CryptoFailure("key material shorter than 32 bytes".to_string()));
        }
        let key = Key::<Aes256Gcm>::from_slice(&key_material[..32]);
        Ok(Aes256Gcm::new(key))
    }

    fn nonce_from_iv(iv: [u8; 16]) -> [u8; NONCE_LEN] {
        let digest = Sha256::digest(iv);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);
        nonce
    }
}

impl CryptoProvider for AeadCryptoProvider {
    fn encrypt(
        &self,
        key_material: &[u8],
        algorithm: Algorithm,
        iv: Option<[u8; 16]>,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let cipher = Self::cipher(key_material)?;
        let nonce_bytes = match algorithm {
            Algorithm::Deterministic => {
                let iv = iv.ok_or_else(|| Error::CryptoFailure("deterministic encryption requires an iv".to_string()))?;
                Self::nonce_from_iv(iv)
            }
            Algorithm::Random => Aes256Gcm::generate_nonce(&mut OsRng).into(),
        };
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut body = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::CryptoFailure("aead encrypt failed".to_string()))?;
        let mut out = nonce_bytes.to_vec();
        out.append(&mut body);
        Ok(out)
    }

    fn decrypt(&self, key_material: &[u8], _algorithm: Algorithm, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        let cipher = Self::cipher(key_material)?;
        if ciphertext.len() < NONCE_LEN {
            return Err(Error::CryptoFailure("ciphertext shorter than nonce".to_string()));
        }
        let (nonce_bytes, body) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher.decrypt(nonce, body).map_err(|_| Error::CryptoFailure("aead decrypt failed".to_string()))
    }

    fn generate_data_key(&self) -> Vec<u8> {
        let mut material = vec![0u8; DATA_KEY_MATERIAL_LEN];
        OsRng.fill_bytes(&mut material);
        material
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn deterministic_round_trip_is_stable() {
        let provider = AeadCryptoProvider;
        let iv = [1u8; 16];
        let a = provider.encrypt(&key(), Algorithm::Deterministic, Some(iv), b"hello").unwrap();
        let b = provider.encrypt(&key(), Algorithm::Deterministic, Some(iv), b"hello").unwrap();
        assert_eq!(a, b, "deterministic encryption must be stable for the same key+iv+plaintext");
        let decrypted = provider.decrypt(&key(), Algorithm::Deterministic, &a).unwrap();
        assert_eq!(decrypted, b"hello");
    }

    #[test]
    fn random_round_trip_varies() {
        let provider = AeadCryptoProvider;
        let a = provider.encrypt(&key(), Algorithm::Random, None, b"hello").unwrap();
        let b = provider.encrypt(&key(), Algorithm::Random, None, b"hello").unwrap();
        assert_ne!(a, b);
        assert_eq!(provider.decrypt(&key(), Algorithm::Random, &a).unwrap(), b"hello");
    }

    #[test]
    fn deterministic_requires_iv() {
        let provider = AeadCryptoProvider;
        assert!(provider.encrypt(&key(), Algorithm::Deterministic, None, b"hello").is_err());
    }

    #[test]
    fn generated_data_keys_are_full_length_and_distinct() {
        let provider = AeadCryptoProvider;
        let a = provider.generate_data_key();
        let b = provider.generate_data_key();
        assert_eq!(a.len(), DATA_KEY_MATERIAL_LEN);
        assert_ne!(a, b);
    }
}
