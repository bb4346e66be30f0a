//! Input validation for vault operations
//! User ids become file names, so they are checked before touching the disk

use thiserror::Error;

use crate::model::{ModelDraft, VersionTriple};

/// Maximum user id length
pub const MAX_USER_ID_LEN: usize = 128;

/// Maximum serialized payload size (16 MB)
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Empty input not allowed: {0}")]
    Empty(&'static str),

    #[error("User id contains invalid characters: {0}")]
    InvalidUserId(String),

    #[error("User id exceeds {MAX_USER_ID_LEN} characters")]
    UserIdTooLong,

    #[error("User id does not match the addressed record: {0}")]
    UserIdMismatch(String),

    #[error("Backup id contains invalid characters: {0}")]
    InvalidBackupId(String),

    #[error("User id uses a reserved suffix: {0}")]
    ReservedUserId(String),

    #[error("Invalid version string: {0}")]
    InvalidVersion(String),

    #[error("Version regression: {from} -> {to}")]
    VersionRegression { from: String, to: String },

    #[error("Model is missing required content: {0}")]
    MissingContent(&'static str),

    #[error("Input too large: {size} bytes (max: {max} bytes)")]
    InputTooLarge { size: usize, max: usize },
}

/// Validate a user id used as a file-name component.
/// ASCII alphanumerics plus '-', '_', '.', with no leading dot.
pub fn validate_user_id(user_id: &str) -> Result<(), ValidationError> {
    if user_id.trim().is_empty() {
        return Err(ValidationError::Empty("userId"));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(ValidationError::UserIdTooLong);
    }
    if user_id.starts_with('.') {
        return Err(ValidationError::InvalidUserId(user_id.to_string()));
    }
    let valid = user_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(ValidationError::InvalidUserId(user_id.to_string()));
    }
    // Registry files live as `<userId>_registry` in the backups directory, so
    // an id carrying that suffix would collide with another user's registry.
    if user_id.ends_with(crate::layout::REGISTRY_SUFFIX) {
        return Err(ValidationError::ReservedUserId(user_id.to_string()));
    }
    Ok(())
}

/// Validate a backup id before using it as a file-name component
pub fn validate_backup_id(backup_id: &str) -> Result<(), ValidationError> {
    if backup_id.trim().is_empty() {
        return Err(ValidationError::Empty("backupId"));
    }
    let valid = backup_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if !valid {
        return Err(ValidationError::InvalidBackupId(backup_id.to_string()));
    }
    Ok(())
}

/// Require a bare `major.minor.patch` version string
pub fn validate_version(version: &str) -> Result<(), ValidationError> {
    if version.trim().is_empty() {
        return Err(ValidationError::Empty("version"));
    }
    VersionTriple::parse(version)
        .map(|_| ())
        .ok_or_else(|| ValidationError::InvalidVersion(version.to_string()))
}

/// Reject oversized serialized payloads before they reach the cipher
pub fn validate_payload_size(size: usize) -> Result<(), ValidationError> {
    if size > MAX_PAYLOAD_BYTES {
        return Err(ValidationError::InputTooLarge {
            size,
            max: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(())
}

/// Completeness check run before a save. Field presence is enforced by the
/// types; this rejects semantically empty content.
pub fn validate_draft(draft: &ModelDraft) -> Result<(), ValidationError> {
    validate_user_id(&draft.user_id)?;
    validate_version(&draft.version)?;
    if draft.payload.parameters.is_null() {
        return Err(ValidationError::MissingContent("payload.parameters"));
    }
    if draft.payload.schema_version.trim().is_empty() {
        return Err(ValidationError::MissingContent("payload.schemaVersion"));
    }
    if draft.metadata.model_type.trim().is_empty() {
        return Err(ValidationError::MissingContent("metadata.modelType"));
    }
    Ok(())
}
