//! Vault configuration
//! Base directory, master secret sourcing, and tunables with safe floors

use std::path::PathBuf;

use thiserror::Error;

use crate::crypto::{MasterSecret, MIN_KDF_ITERATIONS};

const SERVICE_NAME: &str = "ModelVault";
const MASTER_SECRET_ENTRY: &str = "master-secret";

/// Environment variable consulted before the OS keychain
pub const MASTER_SECRET_ENV: &str = "MODELVAULT_SECRET";

/// Free-space floor below which migrations flag system instability (256 MB)
pub const DEFAULT_LOW_DISK_THRESHOLD: u64 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Platform data directory not found")]
    DataDirNotFound,

    #[error("Keychain error: {0}")]
    Keychain(String),
}

/// Settings for one vault instance. Consumed by `ModelStore::open`.
pub struct VaultConfig {
    pub base_dir: PathBuf,
    pub master_secret: MasterSecret,
    pub kdf_iterations: u32,
    pub compression_enabled: bool,
    pub low_disk_threshold: u64,
}

impl VaultConfig {
    /// Config rooted at the platform data directory
    pub fn new(master_secret: MasterSecret) -> Result<Self, ConfigError> {
        let base_dir = dirs::data_dir()
            .map(|dir| dir.join("ModelVault"))
            .ok_or(ConfigError::DataDirNotFound)?;
        Ok(Self::at(base_dir, master_secret))
    }

    /// Config rooted at an explicit directory
    pub fn at(base_dir: impl Into<PathBuf>, master_secret: MasterSecret) -> Self {
        Self {
            base_dir: base_dir.into(),
            master_secret,
            kdf_iterations: MIN_KDF_ITERATIONS,
            compression_enabled: true,
            low_disk_threshold: DEFAULT_LOW_DISK_THRESHOLD,
        }
    }

    /// Set the key derivation work factor. Values below the floor are clamped.
    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf_iterations = iterations.max(MIN_KDF_ITERATIONS);
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    pub fn with_low_disk_threshold(mut self, bytes: u64) -> Self {
        self.low_disk_threshold = bytes;
        self
    }
}

/// Master-secret sources for operating contexts
pub struct SecretSource;

impl SecretSource {
    /// Resolve the master secret: environment variable first, then the OS
    /// keychain. First keychain use generates and stores a fresh secret.
    pub fn resolve() -> Result<MasterSecret, ConfigError> {
        if let Ok(value) = std::env::var(MASTER_SECRET_ENV) {
            if !value.is_empty() {
                return Ok(MasterSecret::from_passphrase(&value));
            }
        }
        Self::from_keychain()
    }

    /// Load the secret from the OS keychain, generating one on first use
    pub fn from_keychain() -> Result<MasterSecret, ConfigError> {
        let entry = keyring::Entry::new(SERVICE_NAME, MASTER_SECRET_ENTRY)
            .map_err(|e| ConfigError::Keychain(e.to_string()))?;

        match entry.get_secret() {
            Ok(bytes) => Ok(MasterSecret::new(bytes)),
            Err(keyring::Error::NoEntry) => {
                let secret = MasterSecret::generate();
                entry
                    .set_secret(secret.as_bytes())
                    .map_err(|e| ConfigError::Keychain(e.to_string()))?;
                Ok(secret)
            }
            Err(e) => Err(ConfigError::Keychain(e.to_string())),
        }
    }

    /// Check whether the OS keychain is reachable
    pub fn keychain_available() -> bool {
        keyring::Entry::new(SERVICE_NAME, "availability-probe").is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_base_dir() {
        let config = VaultConfig::at("/tmp/vault-test", MasterSecret::generate());
        assert_eq!(config.base_dir, PathBuf::from("/tmp/vault-test"));
        assert_eq!(config.kdf_iterations, MIN_KDF_ITERATIONS);
        assert!(config.compression_enabled);
    }

    #[test]
    fn test_kdf_iterations_clamped_to_floor() {
        let config = VaultConfig::at("/tmp/vault-test", MasterSecret::generate())
            .with_kdf_iterations(1_000);
        assert_eq!(config.kdf_iterations, MIN_KDF_ITERATIONS);

        let config = VaultConfig::at("/tmp/vault-test", MasterSecret::generate())
            .with_kdf_iterations(250_000);
        assert_eq!(config.kdf_iterations, 250_000);
    }

    #[test]
    fn test_builder_settings() {
        let config = VaultConfig::at("/tmp/vault-test", MasterSecret::generate())
            .with_compression(false)
            .with_low_disk_threshold(1024);
        assert!(!config.compression_enabled);
        assert_eq!(config.low_disk_threshold, 1024);
    }

    #[test]
    fn test_env_secret_resolution() {
        std::env::set_var(MASTER_SECRET_ENV, "env-test-secret");
        let secret = SecretSource::resolve().expect("env secret should resolve");
        assert_eq!(secret.as_bytes(), b"env-test-secret");
        std::env::remove_var(MASTER_SECRET_ENV);
    }

    #[test]
    fn test_keychain_availability() {
        // Informational: CI environments may not expose a keychain
        println!("keychain available: {}", SecretSource::keychain_available());
    }
}
