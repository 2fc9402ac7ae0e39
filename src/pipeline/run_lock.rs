use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};

pub const LOCK_FILE: &str = ".esteira.lock";

/// Exclusive run marker under the data root.
///
/// The marker holds a token unique to this holder. Staleness is judged by the
/// marker's mtime, so long runs call [`RunLock::refresh`] between steps. Drop
/// removes the marker only while it still carries this holder's token.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    token: String,
}

impl RunLock {
    /// Take the lock, breaking it if the existing marker is older than `stale_after`.
    pub fn acquire(data_root: &Path, stale_after: Duration) -> Result<Self> {
        fs::create_dir_all(data_root)?;
        let path = data_root.join(LOCK_FILE);

        match Self::try_create(&path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        let holder = fs::read_to_string(&path).unwrap_or_default().trim().to_string();
        let age = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());

        match age {
            Some(age) if age > stale_after => {
                warn!(
                    "⚠️ Breaking stale run lock at {} (held by {}, {}s old)",
                    path.display(),
                    holder,
                    age.as_secs()
                );
                fs::remove_file(&path)?;
                Self::try_create(&path).map_err(|e| match e.kind() {
                    ErrorKind::AlreadyExists => Self::locked(&path, &path_holder(&path)),
                    _ => e.into(),
                })
            }
            _ => Err(Self::locked(&path, &holder)),
        }
    }

    fn try_create(path: &Path) -> std::io::Result<Self> {
        let token = format!(
            "pid {} holder {} since {}",
            std::process::id(),
            Uuid::new_v4().simple(),
            Utc::now().to_rfc3339()
        );
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", token)?;
        debug!("Acquired run lock {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            token,
        })
    }

    fn is_held(&self) -> bool {
        path_holder(&self.path) == self.token
    }

    /// Rewrite the marker so it is not considered stale. Fails with `RunLocked`
    /// when the marker was broken or taken over by another run.
    pub fn refresh(&self) -> Result<()> {
        if !self.is_held() {
            return Err(Self::locked(&self.path, &path_holder(&self.path)));
        }
        fs::write(&self.path, format!("{}\n", self.token))?;
        debug!("Refreshed run lock {}", self.path.display());
        Ok(())
    }

    fn locked(path: &Path, holder: &str) -> PipelineError {
        PipelineError::RunLocked {
            path: path.display().to_string(),
            holder: holder.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn path_holder(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default().trim().to_string()
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if !self.is_held() {
            warn!(
                "Run lock {} is no longer ours (held by '{}'), leaving it in place",
                self.path.display(),
                path_holder(&self.path)
            );
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release run lock {}: {}", self.path.display(), e);
        }
    }
}
