use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::app::ports::{PutOutcome, StoragePort};
use crate::config::RetryConfig;
use crate::domain::Namespace;
use crate::error::StorageError;
use crate::infra::retry::with_retry;
use crate::observability::metrics::StorageMetrics;

const MIRROR_DISABLED: &str = "mirror disabled after an earlier failure";

/// Mandatory local primary plus an optional best-effort remote mirror.
///
/// Once the mirror exhausts its retries the storage stays local-only for the
/// rest of its lifetime; later writes report `MirrorFailed` without contacting it.
pub struct MirroredStorage {
    primary: Arc<dyn StoragePort>,
    mirror: Option<Arc<dyn StoragePort>>,
    retry: RetryConfig,
    degraded: AtomicBool,
}

impl MirroredStorage {
    pub fn new(primary: Arc<dyn StoragePort>, mirror: Option<Arc<dyn StoragePort>>, retry: RetryConfig) -> Self {
        Self {
            primary,
            mirror,
            retry,
            degraded: AtomicBool::new(false),
        }
    }

    /// True after the mirror has failed once and been switched off.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn local_only(primary: Arc<dyn StoragePort>) -> Self {
        Self::new(primary, None, RetryConfig::default())
    }
}

#[async_trait]
impl StoragePort for MirroredStorage {
    /// A primary failure is an error; a mirror failure is reported in the outcome.
    async fn put(&self, namespace: Namespace, name: &str, bytes: Vec<u8>) -> Result<PutOutcome, StorageError> {
        let Some(mirror) = &self.mirror else {
            return self.primary.put(namespace, name, bytes).await;
        };
        self.primary.put(namespace, name, bytes.clone()).await?;

        if self.is_degraded() {
            debug!("Skipping mirror upload of {}/{}: {}", namespace, name, MIRROR_DISABLED);
            StorageMetrics::mirror_failed();
            return Ok(PutOutcome::MirrorFailed {
                error: MIRROR_DISABLED.to_string(),
            });
        }

        let what = format!("mirror upload of {}/{}", namespace, name);
        match with_retry(&self.retry, &what, |_| mirror.put(namespace, name, bytes.clone())).await {
            Ok(_) => {
                debug!("Mirrored {}/{} to {}", namespace, name, mirror.describe());
                Ok(PutOutcome::Mirrored)
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    warn!(
                        "⚠️ Stored {}/{} locally but mirroring to {} failed: {}; continuing local-only",
                        namespace,
                        name,
                        mirror.describe(),
                        e
                    );
                }
                StorageMetrics::mirror_failed();
                Ok(PutOutcome::MirrorFailed { error: e.to_string() })
            }
        }
    }

    async fn get(&self, namespace: Namespace, name: &str) -> Result<Vec<u8>, StorageError> {
        match self.primary.get(namespace, name).await {
            Err(e) if e.is_not_found() => match &self.mirror {
                Some(mirror) => {
                    debug!("{}/{} not found locally, reading from {}", namespace, name, mirror.describe());
                    mirror.get(namespace, name).await
                }
                None => Err(e),
            },
            other => other,
        }
    }

    fn describe(&self) -> String {
        match &self.mirror {
            Some(mirror) => format!("{} (mirror: {})", self.primary.describe(), mirror.describe()),
            None => self.primary.describe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::in_memory_storage::InMemoryStorage;
    use std::sync::atomic::AtomicU32;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_outcomes() {
        let primary = InMemoryStorage::new();
        let mirror = InMemoryStorage::new();

        let local = MirroredStorage::local_only(Arc::new(primary.clone()));
        assert_eq!(local.put(Namespace::Raw, "a", b"1".to_vec()).await.unwrap(), PutOutcome::Stored);

        let mirrored = MirroredStorage::new(Arc::new(primary.clone()), Some(Arc::new(mirror.clone())), fast_retry());
        assert_eq!(mirrored.put(Namespace::Raw, "b", b"2".to_vec()).await.unwrap(), PutOutcome::Mirrored);
        assert_eq!(mirror.get(Namespace::Raw, "b").await.unwrap(), b"2".to_vec());

        mirror.set_failing(true);
        let outcome = mirrored.put(Namespace::Raw, "c", b"3".to_vec()).await.unwrap();
        assert!(matches!(outcome, PutOutcome::MirrorFailed { .. }));
        assert_eq!(primary.get(Namespace::Raw, "c").await.unwrap(), b"3".to_vec());
    }

    /// Mirror that always fails and counts how often it was called.
    struct CountingMirror {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl StoragePort for CountingMirror {
        async fn put(&self, _namespace: Namespace, _name: &str, _bytes: Vec<u8>) -> Result<PutOutcome, StorageError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Backend {
                message: "connection refused".to_string(),
            })
        }

        async fn get(&self, namespace: Namespace, name: &str) -> Result<Vec<u8>, StorageError> {
            Err(StorageError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
        }

        fn describe(&self) -> String {
            "counting mirror".to_string()
        }
    }

    #[tokio::test]
    async fn test_mirror_is_switched_off_after_first_exhausted_failure() {
        let primary = InMemoryStorage::new();
        let mirror = Arc::new(CountingMirror {
            attempts: AtomicU32::new(0),
        });
        let retry = RetryConfig {
            max_attempts: 3,
            delay_ms: 1,
        };
        let storage = MirroredStorage::new(Arc::new(primary.clone()), Some(mirror.clone()), retry);
        assert!(!storage.is_degraded());

        for i in 0..5 {
            let name = format!("artifact_{}", i);
            let outcome = storage.put(Namespace::Validated, &name, b"{}".to_vec()).await.unwrap();
            assert!(matches!(outcome, PutOutcome::MirrorFailed { .. }));
        }

        assert!(storage.is_degraded());
        assert_eq!(mirror.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(primary.names(Namespace::Validated).len(), 5);
    }

    #[tokio::test]
    async fn test_primary_failure_is_an_error() {
        let primary = InMemoryStorage::new();
        primary.set_failing(true);
        let storage = MirroredStorage::new(Arc::new(primary), Some(Arc::new(InMemoryStorage::new())), fast_retry());
        assert!(storage.put(Namespace::Raw, "a", Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_reads_fall_back_to_mirror() {
        let mirror = InMemoryStorage::new();
        mirror.put(Namespace::Classified, "x", b"remote".to_vec()).await.unwrap();
        let storage = MirroredStorage::new(Arc::new(InMemoryStorage::new()), Some(Arc::new(mirror)), fast_retry());
        assert_eq!(storage.get(Namespace::Classified, "x").await.unwrap(), b"remote".to_vec());
        assert!(storage.get(Namespace::Classified, "y").await.unwrap_err().is_not_found());
    }
}
