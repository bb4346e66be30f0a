//! Data model for persisted user models, backups, and disk envelopes
//!
//! Field names serialize in camelCase so envelopes stay readable alongside
//! the engine's other JSON artifacts. Binary fields serialize as base64.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto;

/// Envelope format generation for the live model file
pub const STORED_MODEL_FORMAT: u32 = 1;

/// Envelope format generation for backup bundles
pub const BACKUP_BUNDLE_FORMAT: u32 = 1;

pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Parsed `major.minor.patch` version used for compatibility analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionTriple {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl VersionTriple {
    /// Parse a bare `major.minor.patch` string. Returns None for anything else.
    pub fn parse(version: &str) -> Option<Self> {
        let mut parts = version.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
        })
    }
}

impl std::fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Storage revision id assigned at every durable write: time-ordered,
/// suffixed with a stable hash of the user id.
pub fn next_revision_id(user_id: &str) -> String {
    format!(
        "v{}_{}",
        Utc::now().timestamp_millis(),
        crypto::stable_hash8(user_id)
    )
}

/// Backup bundle id: time-ordered with a short random suffix
pub fn next_backup_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("bk_{}_{}", Utc::now().timestamp_millis(), &suffix[..8])
}

/// Encrypted payload plus the bookkeeping needed to verify and restore it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedModelData {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    pub encryption_method: String,
    pub key_id: String,
    /// SHA-256 hex of the serialized plaintext, computed before compression
    /// and encryption
    pub checksum: String,
    pub compressed_size: u64,
    pub original_size: u64,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
}

impl EncryptedModelData {
    /// True when the payload was stored compressed and must be
    /// decompressed after decryption
    pub fn is_compressed(&self) -> bool {
        self.compressed_size < self.original_size
    }
}

/// Descriptive metadata carried with every model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    pub model_type: String,
    pub description: String,
    pub schema_fields: Vec<String>,
    pub tags: Vec<String>,
}

/// Rolling evaluation metrics for a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPerformance {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub sample_count: u64,
    pub last_evaluated: DateTime<Utc>,
}

/// Decrypted model payload: the learning state plus internal bookkeeping.
/// `schema_version` must agree with the owning model's version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPayload {
    pub schema_version: String,
    pub format_revision: u32,
    pub parameters: serde_json::Value,
}

/// Input to a save: the plaintext model state before encryption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDraft {
    pub user_id: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub payload: ModelPayload,
    pub metadata: ModelMetadata,
    pub performance: ModelPerformance,
}

/// Canonical persisted model record. `model_data` holds the encrypted
/// payload; everything else is cleartext bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserModel {
    pub user_id: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub model_data: EncryptedModelData,
    pub metadata: ModelMetadata,
    pub performance: ModelPerformance,
    pub backup_info: Vec<BackupInfo>,
}

/// Flags and tags recorded with each backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub data_integrity: bool,
    pub compression_used: bool,
    pub encryption_used: bool,
    pub tags: Vec<String>,
    pub description: String,
}

/// Registry entry describing one backup bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub backup_id: String,
    pub user_id: String,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
    /// Serialized snapshot size before encryption, in bytes
    pub size: u64,
    pub location: String,
    /// Payload checksum of the snapshotted model
    pub checksum: String,
    pub metadata: BackupMetadata,
}

/// Per-user backup index, newest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRegistry {
    pub user_id: String,
    pub entries: Vec<BackupInfo>,
}

/// On-disk live model file: cleartext bookkeeping wrapped around the
/// encrypted payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredModel {
    pub format_version: u32,
    pub revision: String,
    pub model: UserModel,
}

/// On-disk backup bundle: an independently encrypted snapshot of a
/// `StoredModel` plus its cleartext registry entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupBundle {
    pub format_version: u32,
    pub info: BackupInfo,
    pub sealed_snapshot: EncryptedModelData,
}

/// Integrity issue classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    ChecksumMismatch,
    StructureCorruption,
    DataInconsistency,
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IssueKind::ChecksumMismatch => "checksum_mismatch",
            IssueKind::StructureCorruption => "structure_corruption",
            IssueKind::DataInconsistency => "data_inconsistency",
        };
        write!(f, "{}", name)
    }
}

/// One finding from an integrity check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityIssue {
    #[serde(rename = "type")]
    pub kind: IssueKind,
    pub description: String,
    pub affected_data: Vec<String>,
}

impl IntegrityIssue {
    pub fn new(kind: IssueKind, description: impl Into<String>, affected: &[&str]) -> Self {
        Self {
            kind,
            description: description.into(),
            affected_data: affected.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Result of a full integrity check over one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataIntegrityCheck {
    pub passed: bool,
    pub checksum_valid: bool,
    pub structure_valid: bool,
    pub data_consistent: bool,
    pub issues: Vec<IntegrityIssue>,
    pub checked_at: DateTime<Utc>,
}

impl DataIntegrityCheck {
    /// Build a check from accumulated findings
    pub fn from_findings(
        checksum_valid: bool,
        structure_valid: bool,
        data_consistent: bool,
        issues: Vec<IntegrityIssue>,
    ) -> Self {
        Self {
            passed: checksum_valid && structure_valid && data_consistent,
            checksum_valid,
            structure_valid,
            data_consistent,
            issues,
            checked_at: Utc::now(),
        }
    }

    /// All-failed check carrying a single structural finding. Used when the
    /// subject of the check could not be located at all.
    pub fn rejected(description: impl Into<String>, affected: &[&str]) -> Self {
        Self {
            passed: false,
            checksum_valid: false,
            structure_valid: false,
            data_consistent: false,
            issues: vec![IntegrityIssue::new(
                IssueKind::StructureCorruption,
                description,
                affected,
            )],
            checked_at: Utc::now(),
        }
    }
}

/// Estimated operational impact derived from measured sizes and timings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceImpact {
    pub latency_ms: u64,
    /// Change in stored bytes; negative means space was reclaimed
    pub memory_delta_bytes: i64,
    /// Fraction of read bytes avoided relative to the previous layout
    pub throughput_delta: f64,
}

/// Outcome of an explicit recompression pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionResult {
    pub user_id: String,
    pub original_size: u64,
    pub compressed_size: u64,
    pub compression_ratio: f64,
    pub performance_impact: PerformanceImpact,
}

/// Outcome of restoring a backup over the live model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub user_id: String,
    pub backup_id: String,
    pub previous_version: Option<String>,
    pub restored_version: String,
    pub restored_checksum: String,
    pub integrity: DataIntegrityCheck,
    pub restore_time_ms: u64,
}
