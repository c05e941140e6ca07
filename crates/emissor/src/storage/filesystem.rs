use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// Filesystem blob store for certificate containers.
///
/// Blobs are addressed by a relative path under the base directory; the
/// database keeps that relative path, so the base directory can move
/// between environments without rewriting rows.
pub struct BlobStorage {
    base_directory: PathBuf,
}

impl BlobStorage {
    pub fn new<P: AsRef<Path>>(base_directory: P) -> Self {
        Self {
            base_directory: base_directory.as_ref().to_path_buf(),
        }
    }

    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    fn resolve(&self, relative_path: &str) -> PathBuf {
        self.base_directory.join(relative_path)
    }

    /// Writes a blob at `relative_path`, creating parent directories as
    /// needed. Uses exclusive creation (O_CREAT | O_EXCL), so a concurrent
    /// writer targeting the same path loses with `BlobExists` instead of
    /// silently overwriting.
    pub fn store(&self, relative_path: &str, content: &[u8]) -> Result<PathBuf, StorageError> {
        use std::io::Write;

        let full_path = self.resolve(relative_path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full_path)
        {
            Ok(mut file) => {
                file.write_all(content).map_err(|e| StorageError::WriteBlob {
                    path: full_path.clone(),
                    source: e,
                })?;
                Ok(full_path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StorageError::BlobExists(full_path))
            }
            Err(e) => Err(StorageError::WriteBlob {
                path: full_path,
                source: e,
            }),
        }
    }

    pub fn load(&self, relative_path: &str) -> Result<Vec<u8>, StorageError> {
        let full_path = self.resolve(relative_path);
        std::fs::read(&full_path).map_err(|e| StorageError::ReadBlob {
            path: full_path,
            source: e,
        })
    }

    /// Deletes a blob. Deleting a blob that is already gone is a no-op,
    /// so cleanup paths can run more than once.
    pub fn delete(&self, relative_path: &str) -> Result<(), StorageError> {
        let full_path = self.resolve(relative_path);
        match std::fs::remove_file(&full_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::DeleteBlob {
                path: full_path,
                source: e,
            }),
        }
    }

    pub fn exists(&self, relative_path: &str) -> bool {
        self.resolve(relative_path).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let storage = BlobStorage::new(temp_dir.path());

        let path = storage
            .store("certificates/c1.pfx", b"binary container")
            .unwrap();
        assert!(path.exists());
        assert_eq!(storage.load("certificates/c1.pfx").unwrap(), b"binary container");
    }

    #[test]
    fn test_store_refuses_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let storage = BlobStorage::new(temp_dir.path());

        storage.store("c1.pfx", b"first").unwrap();
        let second = storage.store("c1.pfx", b"second");
        assert!(matches!(second, Err(StorageError::BlobExists(_))));

        // Original content is untouched.
        assert_eq!(storage.load("c1.pfx").unwrap(), b"first");
    }

    #[test]
    fn test_delete_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let storage = BlobStorage::new(temp_dir.path());

        storage.store("c1.pfx", b"data").unwrap();
        storage.delete("c1.pfx").unwrap();
        assert!(!storage.exists("c1.pfx"));

        // Second delete succeeds too.
        storage.delete("c1.pfx").unwrap();
    }

    #[test]
    fn test_load_missing_blob() {
        let temp_dir = TempDir::new().unwrap();
        let storage = BlobStorage::new(temp_dir.path());

        let result = storage.load("ghost.pfx");
        assert!(matches!(result, Err(StorageError::ReadBlob { .. })));
    }

    #[test]
    fn test_nested_directories_created() {
        let temp_dir = TempDir::new().unwrap();
        let storage = BlobStorage::new(temp_dir.path());

        let path = storage.store("a/b/c/cert.p12", b"x").unwrap();
        assert!(path.starts_with(temp_dir.path().join("a/b/c")));
    }
}
