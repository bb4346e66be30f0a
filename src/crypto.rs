//! Cryptographic primitives for the model vault
//! Handles per-user key derivation, authenticated encryption, and content digests

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Salt length for key derivation (32 bytes)
pub const SALT_LEN: usize = 32;

/// Nonce length for AES-GCM (96 bits)
pub const IV_LEN: usize = 12;

/// Key length for AES-256 (256 bits)
pub const KEY_LEN: usize = 32;

/// Detached authentication tag length for AES-GCM (128 bits)
pub const TAG_LEN: usize = 16;

/// Iteration floor for PBKDF2-HMAC-SHA256
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

/// Method label persisted alongside every encrypted payload
pub const ENCRYPTION_METHOD: &str = "aes-256-gcm";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),
}

/// Process-lifetime secret from which all per-user keys are derived.
/// Zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret {
    secret: Vec<u8>,
}

impl MasterSecret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { secret: bytes }
    }

    /// Wrap a passphrase string as secret material
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self {
            secret: passphrase.as_bytes().to_vec(),
        }
    }

    /// Generate a random 256-bit secret
    pub fn generate() -> Self {
        let mut secret = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut secret);
        Self { secret }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.secret
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterSecret(REDACTED)")
    }
}

/// Per-user encryption key derived from the master secret and a stored salt.
/// Zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    key: [u8; KEY_LEN],
}

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { key: bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DerivedKey(REDACTED)")
    }
}

/// Derive a per-user key with PBKDF2-HMAC-SHA256.
/// Rejects iteration counts below the floor.
pub fn derive_user_key(
    secret: &[u8],
    salt: &[u8; SALT_LEN],
    iterations: u32,
) -> Result<DerivedKey, CryptoError> {
    if iterations < MIN_KDF_ITERATIONS {
        return Err(CryptoError::KeyDerivation(format!(
            "iteration count {} below floor {}",
            iterations, MIN_KDF_ITERATIONS
        )));
    }
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(secret, salt, iterations, &mut key);
    Ok(DerivedKey { key })
}

/// Generate a random salt for key derivation
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Key identifier: first 8 hex characters of SHA-256 over the raw salt
/// bytes. Safe to store in cleartext; reveals nothing about the key itself.
pub fn key_id_for_salt(salt: &[u8; SALT_LEN]) -> String {
    sha256_hex(salt)[..8].to_string()
}

/// SHA-256 digest of the input, hex-encoded
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// First 8 hex characters of the SHA-256 digest, for short stable ids
pub fn stable_hash8(input: &str) -> String {
    sha256_hex(input.as_bytes())[..8].to_string()
}

/// AES-256-GCM output with the authentication tag split off the ciphertext
#[derive(Debug, Clone)]
pub struct SealedPayload {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LEN],
    pub tag: [u8; TAG_LEN],
}

/// Encryption operations
pub struct Crypto;

impl Crypto {
    /// Encrypt data with AES-256-GCM under a fresh random nonce.
    /// The authentication tag is returned detached.
    pub fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<SealedPayload, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let mut combined = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        if combined.len() < TAG_LEN {
            return Err(CryptoError::Encryption(
                "ciphertext shorter than authentication tag".to_string(),
            ));
        }

        let tag_bytes = combined.split_off(combined.len() - TAG_LEN);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&tag_bytes);

        Ok(SealedPayload {
            ciphertext: combined,
            iv,
            tag,
        })
    }

    /// Decrypt data encrypted with `encrypt`. Fails on any tag mismatch.
    pub fn decrypt(key: &[u8; KEY_LEN], sealed: &SealedPayload) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;

        let nonce = Nonce::from_slice(&sealed.iv);
        let mut combined = Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN);
        combined.extend_from_slice(&sealed.ciphertext);
        combined.extend_from_slice(&sealed.tag);

        cipher
            .decrypt(nonce, combined.as_ref())
            .map_err(|e| CryptoError::Decryption(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_secret_generation() {
        let a = MasterSecret::generate();
        let b = MasterSecret::generate();
        assert_eq!(a.as_bytes().len(), KEY_LEN);
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_master_secret_debug_redacted() {
        let secret = MasterSecret::from_passphrase("super-secret");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_derive_user_key_deterministic() {
        let salt = generate_salt();
        let a = derive_user_key(b"master", &salt, MIN_KDF_ITERATIONS).unwrap();
        let b = derive_user_key(b"master", &salt, MIN_KDF_ITERATIONS).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_derive_user_key_salt_sensitive() {
        let salt_a = generate_salt();
        let salt_b = generate_salt();
        let a = derive_user_key(b"master", &salt_a, MIN_KDF_ITERATIONS).unwrap();
        let b = derive_user_key(b"master", &salt_b, MIN_KDF_ITERATIONS).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_derive_user_key_rejects_low_iterations() {
        let salt = generate_salt();
        let result = derive_user_key(b"master", &salt, MIN_KDF_ITERATIONS - 1);
        assert!(matches!(result, Err(CryptoError::KeyDerivation(_))));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [0x42u8; KEY_LEN];
        let plaintext = b"model parameters go here";

        let sealed = Crypto::encrypt(&key, plaintext).unwrap();
        assert_ne!(sealed.ciphertext.as_slice(), plaintext.as_slice());

        let decrypted = Crypto::decrypt(&key, &sealed).unwrap();
        assert_eq!(decrypted.as_slice(), plaintext.as_slice());
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let key = [0x11u8; KEY_LEN];
        let wrong = [0x22u8; KEY_LEN];

        let sealed = Crypto::encrypt(&key, b"sensitive data").unwrap();
        assert!(Crypto::decrypt(&wrong, &sealed).is_err());
    }

    #[test]
    fn test_decrypt_tampered_ciphertext_fails() {
        let key = [0x33u8; KEY_LEN];
        let mut sealed = Crypto::encrypt(&key, b"tamper target").unwrap();
        if let Some(byte) = sealed.ciphertext.first_mut() {
            *byte ^= 0xFF;
        }
        assert!(Crypto::decrypt(&key, &sealed).is_err());
    }

    #[test]
    fn test_decrypt_tampered_tag_fails() {
        let key = [0x44u8; KEY_LEN];
        let mut sealed = Crypto::encrypt(&key, b"tag target").unwrap();
        sealed.tag[0] ^= 0x01;
        assert!(Crypto::decrypt(&key, &sealed).is_err());
    }

    #[test]
    fn test_nonces_are_unique() {
        let key = [0x55u8; KEY_LEN];
        let a = Crypto::encrypt(&key, b"same input").unwrap();
        let b = Crypto::encrypt(&key, b"same input").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        let digest = sha256_hex(b"test content");
        assert_eq!(
            digest,
            "6ae8a75555209fd6c44157c0aed8016e763ff435a19cf186f76863140143ff72"
        );
    }

    #[test]
    fn test_stable_hash8_shape() {
        let a = stable_hash8("user-123");
        let b = stable_hash8("user-123");
        let c = stable_hash8("user-124");
        assert_eq!(a.len(), 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_id_for_salt_stable() {
        let salt = [7u8; SALT_LEN];
        let a = key_id_for_salt(&salt);
        let b = key_id_for_salt(&salt);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn test_key_id_is_prefix_of_salt_digest() {
        let salt = [7u8; SALT_LEN];
        assert_eq!(key_id_for_salt(&salt), sha256_hex(&salt)[..8]);
    }

    #[test]
    fn property_encrypt_decrypt_roundtrip_random_payloads() {
        let key = [0x66u8; KEY_LEN];
        let sizes = [0usize, 1, 7, 32, 255, 1024, 4096];

        for size in sizes {
            let mut payload = vec![0u8; size];
            OsRng.fill_bytes(&mut payload);

            let sealed = Crypto::encrypt(&key, &payload).unwrap();
            let decrypted = Crypto::decrypt(&key, &sealed).unwrap();
            assert_eq!(decrypted, payload, "roundtrip failed for size {}", size);
        }

        for _ in 0..64 {
            let mut len_byte = [0u8; 1];
            OsRng.fill_bytes(&mut len_byte);
            let mut payload = vec![0u8; len_byte[0] as usize];
            OsRng.fill_bytes(&mut payload);

            let sealed = Crypto::encrypt(&key, &payload).unwrap();
            let decrypted = Crypto::decrypt(&key, &sealed).unwrap();
            assert_eq!(decrypted, payload);
        }
    }

    #[test]
    fn property_wrong_key_cannot_decrypt_random_payloads() {
        let key = [0x11u8; KEY_LEN];
        let wrong = [0x22u8; KEY_LEN];

        for _ in 0..32 {
            let mut payload = vec![0u8; 64];
            OsRng.fill_bytes(&mut payload);

            let sealed = Crypto::encrypt(&key, &payload).unwrap();
            assert!(Crypto::decrypt(&wrong, &sealed).is_err());
        }
    }
}
