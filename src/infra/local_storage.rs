use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app::ports::{PutOutcome, StoragePort};
use crate::domain::Namespace;
use crate::error::StorageError;

/// Filesystem storage rooted at the data directory: `<root>/<namespace>/<name>`.
///
/// Writes land in a temporary sibling file and are renamed into place, so a
/// reader never observes a partially written object.
#[derive(Debug, Clone)]
pub struct LocalFsStorage {
    root: PathBuf,
}

impl LocalFsStorage {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn namespace_dir(&self, namespace: Namespace) -> PathBuf {
        self.root.join(namespace.as_str())
    }

    pub fn object_path(&self, namespace: Namespace, name: &str) -> Result<PathBuf, StorageError> {
        check_name(name)?;
        Ok(self.namespace_dir(namespace).join(name))
    }
}

fn check_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(StorageError::Backend {
            message: format!("invalid object name '{}'", name),
        });
    }
    Ok(())
}

/// Write `bytes` to `tmp` and rename it over `path`. `tmp` is removed if either step fails.
async fn write_then_rename(tmp: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let result = match tokio::fs::write(tmp, bytes).await {
        Ok(()) => tokio::fs::rename(tmp, path).await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(tmp).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), "failed to remove temporary file: {}", e);
            }
        }
    }
    result
}

#[async_trait]
impl StoragePort for LocalFsStorage {
    async fn put(&self, namespace: Namespace, name: &str, bytes: Vec<u8>) -> Result<PutOutcome, StorageError> {
        let path = self.object_path(namespace, name)?;
        let dir = self.namespace_dir(namespace);
        tokio::fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));
        write_then_rename(&tmp, &path, &bytes).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "stored object");
        Ok(PutOutcome::Stored)
    }

    async fn get(&self, namespace: Namespace, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(namespace, name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }
}
