//! ModelVault - Encrypted persistence and migration for per-user personalization models

pub mod audit;
pub mod config;
pub mod crypto;
pub mod layout;
pub mod migration;
pub mod model;
pub mod store;
pub mod validation;

pub use config::{SecretSource, VaultConfig};
pub use migration::{MigrationManager, MigrationState};
pub use model::{ModelDraft, UserModel};
pub use store::{ModelStore, StoreError};
