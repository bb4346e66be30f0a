//! Encrypted per-user model store
//!
//! Canonical persistence for personalization models. Every payload is
//! checksummed, optionally compressed, then encrypted under a per-user key
//! before it reaches the disk. Mutating operations are serialized per user;
//! distinct users proceed independently.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::audit::{AuditEvent, AuditLog, AuditSeverity};
use crate::config::VaultConfig;
use crate::crypto::{
    self, Crypto, CryptoError, DerivedKey, MasterSecret, SealedPayload, ENCRYPTION_METHOD, IV_LEN,
    SALT_LEN, TAG_LEN,
};
use crate::layout::{self, VaultLayout};
use crate::model::{
    BackupBundle, BackupInfo, BackupMetadata, BackupRegistry, CompressionResult,
    DataIntegrityCheck, EncryptedModelData, IntegrityIssue, IssueKind, ModelDraft, ModelPayload,
    PerformanceImpact, RestoreResult, StoredModel, UserModel, VersionTriple,
    BACKUP_BUNDLE_FORMAT, STORED_MODEL_FORMAT,
};
use crate::validation::{self, ValidationError};

/// Backups kept per user; older snapshots are evicted oldest-first
pub const MAX_BACKUPS_PER_USER: usize = 10;

/// zstd level used for payload compression
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Identity already exists: {0}")]
    AlreadyExists(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Nothing is stored for the addressed user. Callers branch on this to
    /// create a default model instead of surfacing an error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Stored data exists but failed verification
    pub fn is_integrity(&self) -> bool {
        matches!(self, StoreError::Integrity(_))
    }
}

/// Derived key plus its cleartext identifier
pub(crate) struct UserKey {
    pub(crate) key: DerivedKey,
    pub(crate) key_id: String,
}

/// Encrypted, backup-aware store for per-user models
pub struct ModelStore {
    layout: VaultLayout,
    secret: MasterSecret,
    kdf_iterations: u32,
    compression_enabled: bool,
    low_disk_threshold: u64,
    audit: AuditLog,
    models: RwLock<HashMap<String, StoredModel>>,
    keys: RwLock<HashMap<String, Arc<UserKey>>>,
    registries: RwLock<HashMap<String, BackupRegistry>>,
    user_locks: RwLock<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ModelStore {
    /// Open (or create) a vault rooted at the configured base directory
    pub fn open(config: VaultConfig) -> Result<Self, StoreError> {
        let layout = VaultLayout::new(&config.base_dir);
        layout.init()?;
        let audit = AuditLog::new(layout.audit_dir());

        info!(base = %config.base_dir.display(), "model vault opened");

        Ok(Self {
            layout,
            secret: config.master_secret,
            kdf_iterations: config.kdf_iterations,
            compression_enabled: config.compression_enabled,
            low_disk_threshold: config.low_disk_threshold,
            audit,
            models: RwLock::new(HashMap::new()),
            keys: RwLock::new(HashMap::new()),
            registries: RwLock::new(HashMap::new()),
            user_locks: RwLock::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        self.layout.base()
    }

    /// Free-space floor consulted during migration planning
    pub fn low_disk_threshold(&self) -> u64 {
        self.low_disk_threshold
    }

    pub(crate) fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    // ---------------------------------------------------------------
    // Locking and key management
    // ---------------------------------------------------------------

    /// Per-user mutex serializing every mutating operation for one user.
    /// The migration manager locks through this same table, so a migration
    /// attempt and a direct save for the same user can never interleave.
    pub(crate) fn user_lock(&self, user_id: &str) -> Arc<AsyncMutex<()>> {
        {
            let locks = self.user_locks.read();
            if let Some(lock) = locks.get(user_id) {
                return lock.clone();
            }
        }
        let mut locks = self.user_locks.write();
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn load_or_create_salt(&self, user_id: &str) -> Result<[u8; SALT_LEN], StoreError> {
        let path = self.layout.salt_path(user_id);
        if path.exists() {
            let bytes = fs::read(&path)?;
            let salt: [u8; SALT_LEN] = bytes.as_slice().try_into().map_err(|_| {
                StoreError::Integrity(format!("salt file for {} has unexpected length", user_id))
            })?;
            return Ok(salt);
        }
        let salt = crypto::generate_salt();
        layout::write_private_file(&path, &salt)?;
        Ok(salt)
    }

    /// Derive (or fetch) the per-user key. Derivation runs on the blocking
    /// pool; a concurrent derivation for the same user keeps whichever entry
    /// landed first.
    async fn user_key(&self, user_id: &str) -> Result<Arc<UserKey>, StoreError> {
        let cached = self.keys.read().get(user_id).cloned();
        if let Some(key) = cached {
            return Ok(key);
        }

        let salt = self.load_or_create_salt(user_id)?;
        let key_id = crypto::key_id_for_salt(&salt);
        let secret = Zeroizing::new(self.secret.as_bytes().to_vec());
        let iterations = self.kdf_iterations;

        let derived =
            tokio::task::spawn_blocking(move || crypto::derive_user_key(&secret, &salt, iterations))
                .await
                .map_err(|e| CryptoError::KeyDerivation(e.to_string()))??;

        let key = Arc::new(UserKey {
            key: derived,
            key_id,
        });
        let mut cache = self.keys.write();
        Ok(cache.entry(user_id.to_string()).or_insert(key).clone())
    }

    // ---------------------------------------------------------------
    // Payload sealing
    // ---------------------------------------------------------------

    /// Checksum, optionally compress, then encrypt a serialized payload.
    /// The checksum always covers the uncompressed plaintext.
    fn seal_bytes(
        &self,
        key: &UserKey,
        plaintext: &[u8],
        compress: bool,
    ) -> Result<EncryptedModelData, StoreError> {
        let checksum = crypto::sha256_hex(plaintext);
        let original_size = plaintext.len() as u64;

        let (body, compressed_size) = if compress {
            let compressed = zstd::encode_all(plaintext, COMPRESSION_LEVEL)?;
            if (compressed.len() as u64) < original_size {
                let size = compressed.len() as u64;
                (compressed, size)
            } else {
                (plaintext.to_vec(), original_size)
            }
        } else {
            (plaintext.to_vec(), original_size)
        };

        let sealed = Crypto::encrypt(key.key.as_bytes(), &body)?;

        Ok(EncryptedModelData {
            ciphertext: sealed.ciphertext,
            encryption_method: ENCRYPTION_METHOD.to_string(),
            key_id: key.key_id.clone(),
            checksum,
            compressed_size,
            original_size,
            iv: sealed.iv.to_vec(),
            auth_tag: sealed.tag.to_vec(),
        })
    }

    fn seal_payload(
        &self,
        key: &UserKey,
        payload: &ModelPayload,
    ) -> Result<EncryptedModelData, StoreError> {
        let plaintext = serde_json::to_vec(payload)?;
        validation::validate_payload_size(plaintext.len())?;
        self.seal_bytes(key, &plaintext, self.compression_enabled)
    }

    /// Decrypt and decompress without comparing checksums
    fn decrypt_body(
        &self,
        key: &UserKey,
        data: &EncryptedModelData,
    ) -> Result<Vec<u8>, StoreError> {
        let iv: [u8; IV_LEN] = data
            .iv
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Integrity("iv has unexpected length".to_string()))?;
        let tag: [u8; TAG_LEN] = data
            .auth_tag
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Integrity("auth tag has unexpected length".to_string()))?;

        let sealed = SealedPayload {
            ciphertext: data.ciphertext.clone(),
            iv,
            tag,
        };
        let body = Crypto::decrypt(key.key.as_bytes(), &sealed)?;

        if data.is_compressed() {
            Ok(zstd::decode_all(body.as_slice())?)
        } else {
            Ok(body)
        }
    }

    /// Decrypt, decompress, and verify the plaintext against the stored
    /// checksum
    fn open_payload_bytes(
        &self,
        key: &UserKey,
        data: &EncryptedModelData,
    ) -> Result<Vec<u8>, StoreError> {
        let plaintext = self.decrypt_body(key, data)?;
        let actual = crypto::sha256_hex(&plaintext);
        if actual != data.checksum {
            return Err(StoreError::Integrity(format!(
                "checksum mismatch: expected {}, got {}",
                data.checksum, actual
            )));
        }
        Ok(plaintext)
    }

    /// Decrypt and verify a model's payload
    pub async fn decode_payload(&self, model: &UserModel) -> Result<ModelPayload, StoreError> {
        let key = self.user_key(&model.user_id).await?;
        let bytes = self.open_payload_bytes(&key, &model.model_data)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    // ---------------------------------------------------------------
    // Envelope IO
    // ---------------------------------------------------------------

    /// Read the live model envelope from disk. A missing file is None; an
    /// unreadable envelope is an integrity failure, not a missing model.
    fn load_stored(&self, user_id: &str) -> Result<Option<StoredModel>, StoreError> {
        let path = self.layout.model_path(user_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let stored = serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::Integrity(format!("model envelope for {} is corrupt: {}", user_id, e))
        })?;
        Ok(Some(stored))
    }

    /// Cached envelope if present, otherwise the disk copy
    fn stored_snapshot(&self, user_id: &str) -> Result<Option<StoredModel>, StoreError> {
        let cached = self.models.read().get(user_id).cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        self.load_stored(user_id)
    }

    fn persist_stored(&self, user_id: &str, stored: &StoredModel) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(stored)?;
        layout::write_private_file(&self.layout.model_path(user_id), &bytes)?;
        self.models
            .write()
            .insert(user_id.to_string(), stored.clone());
        Ok(())
    }

    fn peek_version(&self, user_id: &str) -> Option<String> {
        self.stored_snapshot(user_id)
            .ok()
            .flatten()
            .map(|stored| stored.model.version)
    }

    // ---------------------------------------------------------------
    // Save / load
    // ---------------------------------------------------------------

    /// Persist a model. An existing model is snapshotted to a backup before
    /// being replaced, and backup retention runs before the envelope is
    /// written so the embedded backup list matches the backups directory.
    pub async fn save(&self, user_id: &str, draft: ModelDraft) -> Result<UserModel, StoreError> {
        validation::validate_user_id(user_id)?;

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        self.save_locked(user_id, draft).await
    }

    /// Save body. Caller holds the user lock.
    pub(crate) async fn save_locked(
        &self,
        user_id: &str,
        draft: ModelDraft,
    ) -> Result<UserModel, StoreError> {
        if draft.user_id != user_id {
            return Err(ValidationError::UserIdMismatch(draft.user_id.clone()).into());
        }
        validation::validate_draft(&draft)?;

        let key = self.user_key(user_id).await?;
        let prior = self.stored_snapshot(user_id)?;

        if let Some(prior) = &prior {
            let from = VersionTriple::parse(&prior.model.version);
            let to = VersionTriple::parse(&draft.version);
            if let (Some(from), Some(to)) = (from, to) {
                if to < from {
                    return Err(ValidationError::VersionRegression {
                        from: prior.model.version.clone(),
                        to: draft.version.clone(),
                    }
                    .into());
                }
            }
            self.create_backup(user_id, &key, prior, "pre-save snapshot")?;
        }

        let model_data = self.seal_payload(&key, &draft.payload)?;
        self.enforce_backup_retention(user_id)?;
        let registry = self.registry_snapshot(user_id)?;

        let model = UserModel {
            user_id: user_id.to_string(),
            version: draft.version,
            created_at: draft.created_at,
            last_updated: Utc::now(),
            model_data,
            metadata: draft.metadata,
            performance: draft.performance,
            backup_info: registry.entries,
        };
        let stored = StoredModel {
            format_version: STORED_MODEL_FORMAT,
            revision: crate::model::next_revision_id(user_id),
            model,
        };

        self.persist_stored(user_id, &stored)?;

        info!(user = user_id, version = %stored.model.version, revision = %stored.revision, "model saved");
        self.audit.record_event(
            AuditEvent::ModelSaved,
            AuditSeverity::Info,
            format!("model saved for {} at version {}", user_id, stored.model.version),
        );

        Ok(stored.model)
    }

    /// Load a model, verifying decryptability and checksum on the first read.
    /// Subsequent loads return the cached copy.
    pub async fn load(&self, user_id: &str) -> Result<UserModel, StoreError> {
        validation::validate_user_id(user_id)?;

        let cached = self.models.read().get(user_id).map(|s| s.model.clone());
        if let Some(model) = cached {
            return Ok(model);
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        self.load_locked(user_id).await
    }

    /// Load body. Caller holds the user lock, so a concurrent save cannot
    /// land between the disk read and the cache insert.
    pub(crate) async fn load_locked(&self, user_id: &str) -> Result<UserModel, StoreError> {
        if let Some(stored) = self.models.read().get(user_id) {
            return Ok(stored.model.clone());
        }

        let stored = self
            .load_stored(user_id)?
            .ok_or_else(|| StoreError::NotFound(format!("no model stored for {}", user_id)))?;

        let key = self.user_key(user_id).await?;
        self.open_payload_bytes(&key, &stored.model.model_data)?;

        self.models
            .write()
            .insert(user_id.to_string(), stored.clone());

        info!(user = user_id, version = %stored.model.version, "model loaded");
        self.audit.record_event(
            AuditEvent::ModelLoaded,
            AuditSeverity::Info,
            format!("model loaded for {}", user_id),
        );

        Ok(stored.model)
    }

    pub fn exists(&self, user_id: &str) -> bool {
        self.models.read().contains_key(user_id) || self.layout.model_path(user_id).exists()
    }

    /// User ids with a live model on disk
    pub fn user_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.layout.models_dir())? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Total bytes stored under the vault directory
    pub fn disk_usage(&self) -> std::io::Result<u64> {
        fn dir_size(path: &Path) -> std::io::Result<u64> {
            let mut total = 0u64;
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    total += dir_size(&entry.path())?;
                } else if file_type.is_file() {
                    total += entry.metadata()?.len();
                }
            }
            Ok(total)
        }
        dir_size(self.layout.base())
    }

    // ---------------------------------------------------------------
    // Backups
    // ---------------------------------------------------------------

    /// Snapshot the current model into a new backup bundle
    pub async fn backup(&self, user_id: &str) -> Result<BackupInfo, StoreError> {
        validation::validate_user_id(user_id)?;

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        self.backup_locked(user_id).await
    }

    /// Backup body. Caller holds the user lock.
    pub(crate) async fn backup_locked(&self, user_id: &str) -> Result<BackupInfo, StoreError> {
        let stored = self
            .stored_snapshot(user_id)?
            .ok_or_else(|| StoreError::NotFound(format!("no model to back up for {}", user_id)))?;
        let key = self.user_key(user_id).await?;
        let info = self.create_backup(user_id, &key, &stored, "on-demand snapshot")?;
        self.refresh_backup_info(user_id, stored)?;
        Ok(info)
    }

    /// Rewrite the live envelope so its embedded backup list matches the
    /// registry after a new bundle and retention have landed. Caller holds
    /// the user lock.
    fn refresh_backup_info(&self, user_id: &str, mut stored: StoredModel) -> Result<(), StoreError> {
        let registry = self.registry_snapshot(user_id)?;
        if stored.model.backup_info == registry.entries {
            return Ok(());
        }
        stored.model.backup_info = registry.entries;
        stored.revision = crate::model::next_revision_id(user_id);
        self.persist_stored(user_id, &stored)
    }

    /// Write one backup bundle and its registry entry. Caller holds the
    /// user lock.
    fn create_backup(
        &self,
        user_id: &str,
        key: &UserKey,
        stored: &StoredModel,
        description: &str,
    ) -> Result<BackupInfo, StoreError> {
        let verified = self
            .open_payload_bytes(key, &stored.model.model_data)
            .is_ok();
        if !verified {
            warn!(user = user_id, "backing up a model that fails verification");
            self.audit.record_event(
                AuditEvent::IntegrityFailure,
                AuditSeverity::Warning,
                format!("backup source for {} failed verification", user_id),
            );
        }

        let snapshot_bytes = serde_json::to_vec(stored)?;
        let backup_id = crate::model::next_backup_id();
        let location = self.layout.backup_path(user_id, &backup_id);

        let sealed = Crypto::encrypt(key.key.as_bytes(), &snapshot_bytes)?;
        let sealed_snapshot = EncryptedModelData {
            ciphertext: sealed.ciphertext,
            encryption_method: ENCRYPTION_METHOD.to_string(),
            key_id: key.key_id.clone(),
            checksum: crypto::sha256_hex(&snapshot_bytes),
            compressed_size: snapshot_bytes.len() as u64,
            original_size: snapshot_bytes.len() as u64,
            iv: sealed.iv.to_vec(),
            auth_tag: sealed.tag.to_vec(),
        };

        let info = BackupInfo {
            backup_id: backup_id.clone(),
            user_id: user_id.to_string(),
            model_version: stored.model.version.clone(),
            created_at: Utc::now(),
            size: snapshot_bytes.len() as u64,
            location: location.display().to_string(),
            checksum: stored.model.model_data.checksum.clone(),
            metadata: BackupMetadata {
                data_integrity: verified,
                compression_used: stored.model.model_data.is_compressed(),
                encryption_used: true,
                tags: Vec::new(),
                description: description.to_string(),
            },
        };

        let bundle = BackupBundle {
            format_version: BACKUP_BUNDLE_FORMAT,
            info: info.clone(),
            sealed_snapshot,
        };

        layout::create_secure_dir(&self.layout.user_backup_dir(user_id))?;
        layout::write_private_file(&location, &serde_json::to_vec_pretty(&bundle)?)?;

        let mut registry = self.registry_snapshot(user_id)?;
        registry.user_id = user_id.to_string();
        registry.entries.insert(0, info.clone());
        self.persist_registry(user_id, &registry)?;
        self.enforce_backup_retention(user_id)?;

        info!(user = user_id, backup = %backup_id, "backup created");
        self.audit.record_event(
            AuditEvent::BackupCreated,
            AuditSeverity::Info,
            format!("backup {} created for {}", backup_id, user_id),
        );

        Ok(info)
    }

    /// Current backup registry entries, newest first
    pub fn list_backups(&self, user_id: &str) -> Result<Vec<BackupInfo>, StoreError> {
        validation::validate_user_id(user_id)?;
        Ok(self.registry_snapshot(user_id)?.entries)
    }

    fn registry_snapshot(&self, user_id: &str) -> Result<BackupRegistry, StoreError> {
        let cached = self.registries.read().get(user_id).cloned();
        if let Some(registry) = cached {
            return Ok(registry);
        }

        let path = self.layout.registry_path(user_id);
        if !path.exists() {
            return Ok(BackupRegistry {
                user_id: user_id.to_string(),
                entries: Vec::new(),
            });
        }
        let bytes = fs::read(&path)?;
        let registry: BackupRegistry = serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::Integrity(format!("backup registry for {} is corrupt: {}", user_id, e))
        })?;
        // Unlocked readers must not clobber a registry a writer cached after
        // our disk read.
        Ok(self
            .registries
            .write()
            .entry(user_id.to_string())
            .or_insert(registry)
            .clone())
    }

    fn persist_registry(
        &self,
        user_id: &str,
        registry: &BackupRegistry,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(registry)?;
        layout::write_private_file(&self.layout.registry_path(user_id), &bytes)?;
        self.registries
            .write()
            .insert(user_id.to_string(), registry.clone());
        Ok(())
    }

    /// Drop registry entries beyond the cap and delete their bundles.
    /// Entries are newest-first, so eviction trims the tail.
    fn enforce_backup_retention(&self, user_id: &str) -> Result<(), StoreError> {
        let mut registry = self.registry_snapshot(user_id)?;
        if registry.entries.len() <= MAX_BACKUPS_PER_USER {
            return Ok(());
        }

        let evicted = registry.entries.split_off(MAX_BACKUPS_PER_USER);
        for info in &evicted {
            let path = self.layout.backup_path(user_id, &info.backup_id);
            layout::secure_delete_file(&path)?;
            info!(user = user_id, backup = %info.backup_id, "backup evicted by retention cap");
            self.audit.record_event(
                AuditEvent::BackupEvicted,
                AuditSeverity::Info,
                format!("backup {} evicted for {}", info.backup_id, user_id),
            );
        }
        self.persist_registry(user_id, &registry)
    }

    fn read_bundle(&self, user_id: &str, backup_id: &str) -> Result<BackupBundle, StoreError> {
        let path = self.layout.backup_path(user_id, backup_id);
        if !path.exists() {
            return Err(StoreError::NotFound(format!(
                "backup {} not found for {}",
                backup_id, user_id
            )));
        }
        let bytes = fs::read(&path)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::Integrity(format!("backup bundle {} is corrupt: {}", backup_id, e))
        })
    }

    /// Reconstruct a backup and install it as the live model
    pub async fn restore(
        &self,
        user_id: &str,
        backup_id: &str,
    ) -> Result<RestoreResult, StoreError> {
        validation::validate_user_id(user_id)?;
        validation::validate_backup_id(backup_id)?;

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        self.restore_locked(user_id, backup_id).await
    }

    /// Restore body. Caller holds the user lock.
    pub(crate) async fn restore_locked(
        &self,
        user_id: &str,
        backup_id: &str,
    ) -> Result<RestoreResult, StoreError> {
        let started = Instant::now();

        let registry = self.registry_snapshot(user_id)?;
        if !registry.entries.iter().any(|b| b.backup_id == backup_id) {
            return Err(StoreError::NotFound(format!(
                "backup {} not registered for {}",
                backup_id, user_id
            )));
        }

        let key = self.user_key(user_id).await?;
        let bundle = self.read_bundle(user_id, backup_id)?;
        let snapshot_bytes = self.open_payload_bytes(&key, &bundle.sealed_snapshot)?;
        let snapshot: StoredModel = serde_json::from_slice(&snapshot_bytes).map_err(|e| {
            StoreError::Integrity(format!("backup snapshot {} is corrupt: {}", backup_id, e))
        })?;

        let previous_version = self.peek_version(user_id);

        // The snapshot carries the backup list as of its creation; install it
        // with the registry as it stands now.
        let mut model = snapshot.model;
        model.backup_info = registry.entries;

        let installed = StoredModel {
            format_version: STORED_MODEL_FORMAT,
            revision: crate::model::next_revision_id(user_id),
            model,
        };
        self.persist_stored(user_id, &installed)?;

        let integrity = self.verify_with_key(&key, &installed.model);
        let result = RestoreResult {
            user_id: user_id.to_string(),
            backup_id: backup_id.to_string(),
            previous_version,
            restored_version: installed.model.version.clone(),
            restored_checksum: installed.model.model_data.checksum.clone(),
            integrity,
            restore_time_ms: started.elapsed().as_millis() as u64,
        };

        info!(user = user_id, backup = backup_id, version = %result.restored_version, "backup restored");
        self.audit.record_event(
            AuditEvent::BackupRestored,
            AuditSeverity::Info,
            format!("backup {} restored for {}", backup_id, user_id),
        );

        Ok(result)
    }

    // ---------------------------------------------------------------
    // Compression
    // ---------------------------------------------------------------

    /// Recompress the stored payload and refresh size bookkeeping.
    /// Impact numbers come from this pass's measurements.
    pub async fn compress(&self, user_id: &str) -> Result<CompressionResult, StoreError> {
        validation::validate_user_id(user_id)?;

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let key = self.user_key(user_id).await?;
        let stored = self
            .stored_snapshot(user_id)?
            .ok_or_else(|| StoreError::NotFound(format!("no model stored for {}", user_id)))?;

        let started = Instant::now();
        let previous_stored_size = stored.model.model_data.compressed_size;

        let plaintext = self.open_payload_bytes(&key, &stored.model.model_data)?;
        let model_data = self.seal_bytes(&key, &plaintext, true)?;

        let original_size = model_data.original_size;
        let compressed_size = model_data.compressed_size;

        let mut updated = stored;
        updated.model.model_data = model_data;
        updated.revision = crate::model::next_revision_id(user_id);
        self.persist_stored(user_id, &updated)?;

        let latency_ms = started.elapsed().as_millis() as u64;
        let ratio = if original_size == 0 {
            1.0
        } else {
            compressed_size as f64 / original_size as f64
        };

        info!(
            user = user_id,
            original = original_size,
            compressed = compressed_size,
            "model recompressed"
        );

        Ok(CompressionResult {
            user_id: user_id.to_string(),
            original_size,
            compressed_size,
            compression_ratio: ratio,
            performance_impact: PerformanceImpact {
                latency_ms,
                memory_delta_bytes: compressed_size as i64 - previous_stored_size as i64,
                throughput_delta: 1.0 - ratio,
            },
        })
    }

    // ---------------------------------------------------------------
    // Identity
    // ---------------------------------------------------------------

    /// Move a user's model, backups, and key material to a new user id.
    /// The payload and every recoverable backup are re-encrypted under a
    /// fresh key derived for the new identity; the old identity's files are
    /// scrubbed afterwards.
    pub async fn rename_identity(
        &self,
        old_user_id: &str,
        new_user_id: &str,
    ) -> Result<UserModel, StoreError> {
        validation::validate_user_id(old_user_id)?;
        validation::validate_user_id(new_user_id)?;
        if old_user_id == new_user_id {
            return Err(ValidationError::UserIdMismatch(new_user_id.to_string()).into());
        }

        // lock both identities in a stable order
        let (first, second) = if old_user_id < new_user_id {
            (old_user_id, new_user_id)
        } else {
            (new_user_id, old_user_id)
        };
        let lock_first = self.user_lock(first);
        let _guard_first = lock_first.lock().await;
        let lock_second = self.user_lock(second);
        let _guard_second = lock_second.lock().await;

        if self.exists(new_user_id)
            || self.layout.registry_path(new_user_id).exists()
            || self.layout.user_backup_dir(new_user_id).exists()
        {
            return Err(StoreError::AlreadyExists(new_user_id.to_string()));
        }

        let stored_old = self.stored_snapshot(old_user_id)?.ok_or_else(|| {
            StoreError::NotFound(format!("no model stored for {}", old_user_id))
        })?;

        let old_key = self.user_key(old_user_id).await?;
        let new_key = self.user_key(new_user_id).await?;

        // re-encrypt the live payload under the new identity's key
        let plaintext = self.open_payload_bytes(&old_key, &stored_old.model.model_data)?;
        let mut model = stored_old.model.clone();
        model.user_id = new_user_id.to_string();
        model.model_data = self.seal_bytes(&new_key, &plaintext, self.compression_enabled)?;
        model.last_updated = Utc::now();

        // carry backups over, re-encrypting bundle and payload
        let old_registry = self.registry_snapshot(old_user_id)?;
        let mut new_entries = Vec::new();
        for info in &old_registry.entries {
            match self.transfer_bundle(old_user_id, new_user_id, &old_key, &new_key, info) {
                Ok(entry) => new_entries.push(entry),
                Err(e) => {
                    warn!(
                        user = old_user_id,
                        backup = %info.backup_id,
                        "backup skipped during rename: {}",
                        e
                    );
                    self.audit.record_event(
                        AuditEvent::IntegrityFailure,
                        AuditSeverity::Warning,
                        format!(
                            "backup {} skipped during rename of {}: {}",
                            info.backup_id, old_user_id, e
                        ),
                    );
                }
            }
        }

        if !new_entries.is_empty() {
            self.persist_registry(
                new_user_id,
                &BackupRegistry {
                    user_id: new_user_id.to_string(),
                    entries: new_entries.clone(),
                },
            )?;
        }

        model.backup_info = new_entries;
        let stored_new = StoredModel {
            format_version: STORED_MODEL_FORMAT,
            revision: crate::model::next_revision_id(new_user_id),
            model,
        };
        self.persist_stored(new_user_id, &stored_new)?;

        // scrub the old identity
        self.remove_user_files(old_user_id)?;
        self.forget_user(old_user_id);

        info!(from = old_user_id, to = new_user_id, "identity renamed");
        self.audit.record_event(
            AuditEvent::IdentityRenamed,
            AuditSeverity::Info,
            format!("identity renamed from {} to {}", old_user_id, new_user_id),
        );

        Ok(stored_new.model)
    }

    /// Re-encrypt one backup bundle for a new identity
    fn transfer_bundle(
        &self,
        old_user_id: &str,
        new_user_id: &str,
        old_key: &UserKey,
        new_key: &UserKey,
        info: &BackupInfo,
    ) -> Result<BackupInfo, StoreError> {
        let bundle = self.read_bundle(old_user_id, &info.backup_id)?;
        let snapshot_bytes = self.open_payload_bytes(old_key, &bundle.sealed_snapshot)?;
        let snapshot: StoredModel = serde_json::from_slice(&snapshot_bytes).map_err(|e| {
            StoreError::Integrity(format!("backup snapshot {} is corrupt: {}", info.backup_id, e))
        })?;

        let inner_plain = self.open_payload_bytes(old_key, &snapshot.model.model_data)?;

        let mut moved = snapshot;
        moved.model.user_id = new_user_id.to_string();
        moved.model.model_data = self.seal_bytes(
            new_key,
            &inner_plain,
            moved.model.model_data.is_compressed(),
        )?;

        let moved_bytes = serde_json::to_vec(&moved)?;
        let location = self.layout.backup_path(new_user_id, &info.backup_id);
        let sealed = Crypto::encrypt(new_key.key.as_bytes(), &moved_bytes)?;

        let mut new_info = info.clone();
        new_info.user_id = new_user_id.to_string();
        new_info.location = location.display().to_string();
        new_info.size = moved_bytes.len() as u64;

        let new_bundle = BackupBundle {
            format_version: BACKUP_BUNDLE_FORMAT,
            info: new_info.clone(),
            sealed_snapshot: EncryptedModelData {
                ciphertext: sealed.ciphertext,
                encryption_method: ENCRYPTION_METHOD.to_string(),
                key_id: new_key.key_id.clone(),
                checksum: crypto::sha256_hex(&moved_bytes),
                compressed_size: moved_bytes.len() as u64,
                original_size: moved_bytes.len() as u64,
                iv: sealed.iv.to_vec(),
                auth_tag: sealed.tag.to_vec(),
            },
        };

        layout::create_secure_dir(&self.layout.user_backup_dir(new_user_id))?;
        layout::write_private_file(&location, &serde_json::to_vec_pretty(&new_bundle)?)?;

        Ok(new_info)
    }

    // ---------------------------------------------------------------
    // Deletion
    // ---------------------------------------------------------------

    /// Remove a user's model, backups, registry, and key material.
    /// Idempotent: deleting an absent user succeeds.
    pub async fn delete(&self, user_id: &str) -> Result<(), StoreError> {
        validation::validate_user_id(user_id)?;

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        self.remove_user_files(user_id)?;
        self.forget_user(user_id);

        info!(user = user_id, "model deleted");
        self.audit.record_event(
            AuditEvent::ModelDeleted,
            AuditSeverity::Info,
            format!("all stored data removed for {}", user_id),
        );
        Ok(())
    }

    fn remove_user_files(&self, user_id: &str) -> Result<(), StoreError> {
        layout::secure_delete_file(&self.layout.model_path(user_id))?;

        let backup_dir = self.layout.user_backup_dir(user_id);
        if backup_dir.exists() {
            for entry in fs::read_dir(&backup_dir)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    layout::secure_delete_file(&entry.path())?;
                }
            }
            fs::remove_dir_all(&backup_dir)?;
        }

        let registry_path = self.layout.registry_path(user_id);
        if registry_path.exists() {
            fs::remove_file(&registry_path)?;
        }

        layout::secure_delete_file(&self.layout.salt_path(user_id))?;
        Ok(())
    }

    fn forget_user(&self, user_id: &str) {
        self.models.write().remove(user_id);
        self.keys.write().remove(user_id);
        self.registries.write().remove(user_id);
    }

    // ---------------------------------------------------------------
    // Verification
    // ---------------------------------------------------------------

    /// Full integrity check: structure, checksum, and internal consistency.
    /// Never errors; every finding lands in the returned issue list.
    pub async fn verify_model(&self, model: &UserModel) -> Result<DataIntegrityCheck, StoreError> {
        let key = self.user_key(&model.user_id).await?;
        Ok(self.verify_with_key(&key, model))
    }

    pub(crate) fn verify_with_key(&self, key: &UserKey, model: &UserModel) -> DataIntegrityCheck {
        let mut issues = Vec::new();
        let mut structure_valid = true;
        let mut data_consistent = true;

        // structural checks
        let mut structural = |condition: bool, description: &str, affected: &[&str]| {
            if condition {
                issues.push(IntegrityIssue::new(
                    IssueKind::StructureCorruption,
                    description,
                    affected,
                ));
            }
            condition
        };

        structure_valid &= !structural(model.user_id.trim().is_empty(), "userId is empty", &["userId"]);
        structure_valid &= !structural(
            VersionTriple::parse(&model.version).is_none(),
            "version is not a major.minor.patch triple",
            &["version"],
        );
        structure_valid &= !structural(
            model.model_data.encryption_method != ENCRYPTION_METHOD,
            "unknown encryption method",
            &["modelData.encryptionMethod"],
        );
        structure_valid &= !structural(
            model.model_data.key_id.trim().is_empty(),
            "keyId is empty",
            &["modelData.keyId"],
        );
        structure_valid &= !structural(
            model.model_data.checksum.len() != 64
                || !model
                    .model_data
                    .checksum
                    .chars()
                    .all(|c| c.is_ascii_hexdigit()),
            "checksum is not a SHA-256 hex digest",
            &["modelData.checksum"],
        );
        structure_valid &= !structural(
            model.model_data.iv.len() != IV_LEN,
            "iv has unexpected length",
            &["modelData.iv"],
        );
        structure_valid &= !structural(
            model.model_data.auth_tag.len() != TAG_LEN,
            "auth tag has unexpected length",
            &["modelData.authTag"],
        );
        structure_valid &= !structural(
            model.model_data.ciphertext.is_empty(),
            "ciphertext is empty",
            &["modelData.ciphertext"],
        );
        structure_valid &= !structural(
            model.metadata.model_type.trim().is_empty(),
            "modelType is empty",
            &["metadata.modelType"],
        );

        // checksum verification requires a successful decrypt
        let mut checksum_valid = true;
        let mut plaintext = None;
        match self.decrypt_body(key, &model.model_data) {
            Ok(body) => {
                let actual = crypto::sha256_hex(&body);
                if actual != model.model_data.checksum {
                    checksum_valid = false;
                    issues.push(IntegrityIssue::new(
                        IssueKind::ChecksumMismatch,
                        format!(
                            "stored checksum {} does not match recomputed {}",
                            model.model_data.checksum, actual
                        ),
                        &["modelData.checksum"],
                    ));
                }
                plaintext = Some(body);
            }
            Err(e) => {
                checksum_valid = false;
                issues.push(IntegrityIssue::new(
                    IssueKind::ChecksumMismatch,
                    format!("payload cannot be decrypted for verification: {}", e),
                    &["modelData.ciphertext"],
                ));
            }
        }

        // consistency checks
        let metrics = [
            (model.performance.accuracy, "performance.accuracy"),
            (model.performance.precision, "performance.precision"),
            (model.performance.recall, "performance.recall"),
        ];
        for (value, field) in metrics {
            if !(0.0..=1.0).contains(&value) {
                data_consistent = false;
                issues.push(IntegrityIssue::new(
                    IssueKind::DataInconsistency,
                    format!("{} is outside [0, 1]: {}", field, value),
                    &[field],
                ));
            }
        }
        if model.model_data.compressed_size > model.model_data.original_size {
            data_consistent = false;
            issues.push(IntegrityIssue::new(
                IssueKind::DataInconsistency,
                "compressed size exceeds original size",
                &["modelData.compressedSize"],
            ));
        }
        if model.created_at > model.last_updated {
            data_consistent = false;
            issues.push(IntegrityIssue::new(
                IssueKind::DataInconsistency,
                "createdAt is later than lastUpdated",
                &["createdAt"],
            ));
        }

        if let Some(body) = &plaintext {
            match serde_json::from_slice::<ModelPayload>(body) {
                Ok(payload) => {
                    if payload.schema_version != model.version {
                        data_consistent = false;
                        issues.push(IntegrityIssue::new(
                            IssueKind::DataInconsistency,
                            format!(
                                "payload schemaVersion {} disagrees with model version {}",
                                payload.schema_version, model.version
                            ),
                            &["version"],
                        ));
                    }
                    if model.model_data.original_size != body.len() as u64 {
                        data_consistent = false;
                        issues.push(IntegrityIssue::new(
                            IssueKind::DataInconsistency,
                            "originalSize does not match decrypted payload length",
                            &["modelData.originalSize"],
                        ));
                    }
                }
                Err(e) => {
                    structure_valid = false;
                    issues.push(IntegrityIssue::new(
                        IssueKind::StructureCorruption,
                        format!("decrypted payload is not a valid model payload: {}", e),
                        &["modelData"],
                    ));
                }
            }
        }

        DataIntegrityCheck::from_findings(checksum_valid, structure_valid, data_consistent, issues)
    }

    /// Recompute the payload digest and length from the decrypted plaintext
    pub async fn recompute_payload_digest(
        &self,
        model: &UserModel,
    ) -> Result<(String, u64), StoreError> {
        if model.model_data.ciphertext.is_empty() {
            return Err(StoreError::Integrity(
                "ciphertext is empty; checksum cannot be recomputed".to_string(),
            ));
        }
        let key = self.user_key(&model.user_id).await?;
        let plaintext = self.decrypt_body(&key, &model.model_data)?;
        Ok((crypto::sha256_hex(&plaintext), plaintext.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MIN_KDF_ITERATIONS;
    use tempfile::TempDir;

    fn test_store(temp: &TempDir) -> ModelStore {
        let config = VaultConfig::at(
            temp.path().join("vault"),
            MasterSecret::new(b"unit-test-secret".to_vec()),
        );
        ModelStore::open(config).expect("open store")
    }

    fn test_key() -> UserKey {
        let salt = [9u8; SALT_LEN];
        UserKey {
            key: crypto::derive_user_key(b"unit-test-secret", &salt, MIN_KDF_ITERATIONS)
                .expect("derive"),
            key_id: crypto::key_id_for_salt(&salt),
        }
    }

    #[test]
    fn test_seal_and_open_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = test_store(&temp);
        let key = test_key();

        let plaintext = b"{\"weights\":[0.25,0.5,0.75]}".repeat(64);
        let sealed = store.seal_bytes(&key, &plaintext, true).unwrap();

        assert_eq!(sealed.encryption_method, ENCRYPTION_METHOD);
        assert_eq!(sealed.original_size, plaintext.len() as u64);
        assert!(sealed.is_compressed(), "repetitive payload should compress");

        let opened = store.open_payload_bytes(&key, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_seal_skips_compression_without_gain() {
        let temp = TempDir::new().unwrap();
        let store = test_store(&temp);
        let key = test_key();

        // 32 random-ish bytes will not compress
        let plaintext: Vec<u8> = (0u8..32).collect();
        let sealed = store.seal_bytes(&key, &plaintext, true).unwrap();
        assert!(!sealed.is_compressed());
        assert_eq!(sealed.compressed_size, sealed.original_size);

        let opened = store.open_payload_bytes(&key, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_open_rejects_checksum_tamper() {
        let temp = TempDir::new().unwrap();
        let store = test_store(&temp);
        let key = test_key();

        let mut sealed = store.seal_bytes(&key, b"payload body", false).unwrap();
        sealed.checksum = "0".repeat(64);

        let result = store.open_payload_bytes(&key, &sealed);
        assert!(matches!(result, Err(StoreError::Integrity(_))));
    }

    #[test]
    fn test_verify_flags_structure_and_consistency() {
        let temp = TempDir::new().unwrap();
        let store = test_store(&temp);
        let key = test_key();

        let payload = ModelPayload {
            schema_version: "1.0.0".to_string(),
            format_revision: 0,
            parameters: serde_json::json!({"weights": [1.0]}),
        };
        let plaintext = serde_json::to_vec(&payload).unwrap();
        let model_data = store.seal_bytes(&key, &plaintext, false).unwrap();

        let now = Utc::now();
        let mut model = UserModel {
            user_id: "unit-user".to_string(),
            version: "1.0.0".to_string(),
            created_at: now,
            last_updated: now,
            model_data,
            metadata: crate::model::ModelMetadata {
                model_type: "personalization".to_string(),
                description: String::new(),
                schema_fields: vec![],
                tags: vec![],
            },
            performance: crate::model::ModelPerformance {
                accuracy: 0.9,
                precision: 0.9,
                recall: 0.9,
                sample_count: 10,
                last_evaluated: now,
            },
            backup_info: vec![],
        };

        let check = store.verify_with_key(&key, &model);
        assert!(check.passed, "clean model should verify: {:?}", check.issues);

        model.performance.accuracy = 1.5;
        model.model_data.encryption_method = "rot13".to_string();
        let check = store.verify_with_key(&key, &model);
        assert!(!check.passed);
        assert!(!check.structure_valid);
        assert!(!check.data_consistent);
        assert!(check
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::StructureCorruption));
        assert!(check
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::DataInconsistency));
    }
}
