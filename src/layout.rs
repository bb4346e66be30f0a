//! On-disk layout for the model vault
//! One base directory holding models/, backups/, keys/, and audit/

use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Owner-only directory mode
pub const DIR_PERMISSIONS: u32 = 0o700;

/// Owner-only file mode
pub const FILE_PERMISSIONS: u32 = 0o600;

const MODELS_DIR: &str = "models";
const BACKUPS_DIR: &str = "backups";
const KEYS_DIR: &str = "keys";
const AUDIT_DIR: &str = "audit";
pub(crate) const REGISTRY_SUFFIX: &str = "_registry";
const SALT_EXT: &str = "salt";

/// Path schema for one vault instance
#[derive(Debug, Clone)]
pub struct VaultLayout {
    base: PathBuf,
}

impl VaultLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Create the directory tree with private permissions. Idempotent.
    pub fn init(&self) -> std::io::Result<()> {
        create_secure_dir(&self.base)?;
        create_secure_dir(&self.models_dir())?;
        create_secure_dir(&self.backups_dir())?;
        create_secure_dir(&self.keys_dir())?;
        create_secure_dir(&self.audit_dir())?;
        Ok(())
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn models_dir(&self) -> PathBuf {
        self.base.join(MODELS_DIR)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.base.join(BACKUPS_DIR)
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.base.join(KEYS_DIR)
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.base.join(AUDIT_DIR)
    }

    /// Live model envelope for one user
    pub fn model_path(&self, user_id: &str) -> PathBuf {
        self.models_dir().join(user_id)
    }

    /// Directory holding one user's backup bundles
    pub fn user_backup_dir(&self, user_id: &str) -> PathBuf {
        self.backups_dir().join(user_id)
    }

    /// One backup bundle
    pub fn backup_path(&self, user_id: &str, backup_id: &str) -> PathBuf {
        self.user_backup_dir(user_id).join(backup_id)
    }

    /// Per-user backup registry, kept next to the bundle directory
    pub fn registry_path(&self, user_id: &str) -> PathBuf {
        self.backups_dir().join(format!("{}{}", user_id, REGISTRY_SUFFIX))
    }

    /// Per-user key derivation salt
    pub fn salt_path(&self, user_id: &str) -> PathBuf {
        self.keys_dir().join(format!("{}.{}", user_id, SALT_EXT))
    }
}

/// Restrict filesystem permissions on a path (Unix only)
#[cfg(unix)]
pub fn set_secure_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    let permissions = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
pub fn set_secure_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Create a directory (and parents) with owner-only permissions
pub fn create_secure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    set_secure_permissions(path, DIR_PERMISSIONS)
}

/// Write a file atomically with owner-only permissions.
/// Contents land in a temp file in the same directory, get synced,
/// then replace the target with a rename.
pub fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("no parent directory for {}", path.display()),
        )
    })?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    set_secure_permissions(temp.path(), FILE_PERMISSIONS)?;
    temp.persist(path).map_err(|e| e.error)?;

    // rename may carry over looser modes on some platforms
    set_secure_permissions(path, FILE_PERMISSIONS)
}

/// Overwrite a file with zeros before unlinking it.
/// Best-effort scrub; missing files are not an error.
pub fn secure_delete_file(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let metadata = fs::metadata(path)?;
    let size = metadata.len() as usize;

    if size > 0 {
        let mut file = fs::OpenOptions::new().write(true).open(path)?;
        let chunk = vec![0u8; size.min(1024 * 1024)];
        let mut written = 0usize;
        while written < size {
            let to_write = chunk.len().min(size - written);
            file.write_all(&chunk[..to_write])?;
            written += to_write;
        }
        file.sync_all()?;
    }

    fs::remove_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let layout = VaultLayout::new("/tmp/vault");
        assert_eq!(layout.model_path("alice"), PathBuf::from("/tmp/vault/models/alice"));
        assert_eq!(
            layout.backup_path("alice", "bk_1"),
            PathBuf::from("/tmp/vault/backups/alice/bk_1")
        );
        assert_eq!(
            layout.registry_path("alice"),
            PathBuf::from("/tmp/vault/backups/alice_registry")
        );
        assert_eq!(
            layout.salt_path("alice"),
            PathBuf::from("/tmp/vault/keys/alice.salt")
        );
    }

    #[test]
    fn test_init_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let layout = VaultLayout::new(temp.path().join("vault"));
        layout.init().unwrap();
        layout.init().unwrap();
        assert!(layout.models_dir().is_dir());
        assert!(layout.backups_dir().is_dir());
        assert!(layout.keys_dir().is_dir());
        assert!(layout.audit_dir().is_dir());
    }

    #[test]
    fn test_write_private_file_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.json");

        write_private_file(&path, b"first").unwrap();
        write_private_file(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_private_file_permissions() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("private.bin");

        write_private_file(&path, b"secret").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, FILE_PERMISSIONS);
    }

    #[test]
    fn test_secure_delete_removes_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("doomed.bin");
        fs::write(&path, b"sensitive").unwrap();

        secure_delete_file(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_secure_delete_missing_file_ok() {
        let temp = TempDir::new().unwrap();
        assert!(secure_delete_file(&temp.path().join("absent")).is_ok());
    }
}
