use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::app::ports::{PutOutcome, StoragePort};
use crate::domain::Namespace;
use crate::error::StorageError;

/// In-memory storage for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    objects: Arc<Mutex<HashMap<(Namespace, String), Vec<u8>>>>,
    fail_puts: Arc<Mutex<bool>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail (simulates an unreachable backend).
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut flag) = self.fail_puts.lock() {
            *flag = failing;
        }
    }

    pub fn names(&self, namespace: Namespace) -> Vec<String> {
        let mut names: Vec<String> = self
            .objects
            .lock()
            .map(|objects| {
                objects
                    .keys()
                    .filter(|(ns, _)| *ns == namespace)
                    .map(|(_, name)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn poisoned() -> StorageError {
    StorageError::Backend {
        message: "in-memory storage lock poisoned".to_string(),
    }
}

#[async_trait]
impl StoragePort for InMemoryStorage {
    async fn put(&self, namespace: Namespace, name: &str, bytes: Vec<u8>) -> Result<PutOutcome, StorageError> {
        if *self.fail_puts.lock().map_err(|_| poisoned())? {
            return Err(StorageError::Backend {
                message: format!("refusing to store {}/{}", namespace, name),
            });
        }
        self.objects
            .lock()
            .map_err(|_| poisoned())?
            .insert((namespace, name.to_string()), bytes);
        Ok(PutOutcome::Stored)
    }

    async fn get(&self, namespace: Namespace, name: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .map_err(|_| poisoned())?
            .get(&(namespace, name.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
