//! Rootfs storage driver contract and the directory-backed default.

use std::fs;
use std::path::PathBuf;

use strata_core::{Result, StrataConfig, StrataError};

use crate::imports::copy_dir_recursive;

/// Create, snapshot, restore, and delete named rootfs bundles.
///
/// The build driver owns the lifecycle: `.working` is created (or
/// restored) at the start of each layer and snapshotted under the layer's
/// name at the end. Implementations with cheaper snapshots (btrfs, zfs,
/// overlay) plug in here.
pub trait Storage {
    /// Create an empty bundle directory.
    fn create(&self, name: &str) -> Result<()>;

    /// Copy bundle `source` to a new bundle `dest`.
    fn snapshot(&self, source: &str, dest: &str) -> Result<()>;

    /// Materialize bundle `dest` from snapshot `source`.
    fn restore(&self, source: &str, dest: &str) -> Result<()>;

    /// Remove a bundle. Removing an absent bundle is a no-op.
    fn delete(&self, name: &str) -> Result<()>;

    /// Whether a bundle with this name exists.
    fn exists(&self, name: &str) -> bool;

    /// Release any resources held for the rootfs area.
    fn detach(&self) -> Result<()>;
}

/// Plain-directory storage: bundles are directories under `rootfs_dir`
/// and snapshots are recursive copies.
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn new(config: &StrataConfig) -> Result<Self> {
        fs::create_dir_all(&config.rootfs_dir).map_err(|e| {
            StrataError::StorageError(format!(
                "failed to create rootfs dir {}: {}",
                config.rootfs_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            root: config.rootfs_dir.clone(),
        })
    }

    fn bundle(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Storage for DirStorage {
    fn create(&self, name: &str) -> Result<()> {
        fs::create_dir_all(self.bundle(name)).map_err(|e| {
            StrataError::StorageError(format!("failed to create bundle {}: {}", name, e))
        })
    }

    fn snapshot(&self, source: &str, dest: &str) -> Result<()> {
        let src = self.bundle(source);
        if !src.is_dir() {
            return Err(StrataError::StorageError(format!(
                "cannot snapshot missing bundle {}",
                source
            )));
        }
        copy_dir_recursive(&src, &self.bundle(dest))
    }

    fn restore(&self, source: &str, dest: &str) -> Result<()> {
        let src = self.bundle(source);
        if !src.is_dir() {
            return Err(StrataError::StorageError(format!(
                "cannot restore missing snapshot {}",
                source
            )));
        }
        copy_dir_recursive(&src, &self.bundle(dest))
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.bundle(name);
        if path.exists() {
            fs::remove_dir_all(&path).map_err(|e| {
                StrataError::StorageError(format!("failed to delete bundle {}: {}", name, e))
            })?;
        }
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.bundle(name).is_dir()
    }

    fn detach(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(tmp: &TempDir) -> DirStorage {
        let config = StrataConfig {
            oci_dir: tmp.path().join("oci"),
            rootfs_dir: tmp.path().join("roots"),
            strata_dir: tmp.path().join(".strata"),
        };
        DirStorage::new(&config).unwrap()
    }

    #[test]
    fn test_create_and_exists() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);

        assert!(!storage.exists(".working"));
        storage.create(".working").unwrap();
        assert!(storage.exists(".working"));
    }

    #[test]
    fn test_snapshot_and_restore_round_trip() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);

        storage.create(".working").unwrap();
        let rootfs = tmp.path().join("roots/.working/rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        fs::write(rootfs.join("state"), "built").unwrap();

        storage.snapshot(".working", "base").unwrap();
        storage.delete(".working").unwrap();
        assert!(!storage.exists(".working"));

        storage.restore("base", ".working").unwrap();
        assert_eq!(
            fs::read_to_string(tmp.path().join("roots/.working/rootfs/state")).unwrap(),
            "built"
        );
    }

    #[test]
    fn test_snapshot_missing_source_fails() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        assert!(matches!(
            storage.snapshot("ghost", "copy"),
            Err(StrataError::StorageError(_))
        ));
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let tmp = TempDir::new().unwrap();
        let storage = storage(&tmp);
        storage.delete("never-existed").unwrap();
    }
}
