//! Polls the raw directory and requests a pipeline run when its contents change.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::app::ports::{DatabasePort, StoragePort};
use crate::config::Config;
use crate::domain::Namespace;
use crate::error::{PipelineError, Result};
use crate::pipeline::cancel::CancellationFlag;
use crate::pipeline::orchestrator::run_once;

/// File name -> (modified time, size).
pub type Snapshot = BTreeMap<String, (SystemTime, u64)>;

/// Snapshot the visible files in `dir`; a missing directory is empty.
pub fn snapshot(dir: &Path) -> std::io::Result<Snapshot> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Snapshot::new()),
        Err(e) => return Err(e),
    };

    let mut snapshot = Snapshot::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        snapshot.insert(name, (metadata.modified()?, metadata.len()));
    }
    Ok(snapshot)
}

pub struct RawWatcher {
    dir: PathBuf,
    last: Option<Snapshot>,
}

impl RawWatcher {
    pub fn new(data_root: &Path) -> Self {
        Self {
            dir: data_root.join(Namespace::Raw.as_str()),
            last: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True when the directory differs from the previous poll. The first poll only records a baseline.
    pub fn poll(&mut self) -> std::io::Result<bool> {
        let current = snapshot(&self.dir)?;
        let changed = match &self.last {
            Some(previous) => *previous != current,
            None => false,
        };
        self.last = Some(current);
        Ok(changed)
    }
}

/// A request for one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRequest;

/// Outcome of offering a run request to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// A run is already pending; this change will be picked up by it.
    Coalesced,
    Closed,
}

pub fn offer(sender: &mpsc::Sender<RunRequest>) -> Offer {
    match sender.try_send(RunRequest) {
        Ok(()) => Offer::Queued,
        Err(TrySendError::Full(_)) => Offer::Coalesced,
        Err(TrySendError::Closed(_)) => Offer::Closed,
    }
}

/// Poll for changes until cancelled, running the pipeline once per burst of changes.
pub async fn watch(
    config: &Config,
    storage: Arc<dyn StoragePort>,
    database: Option<Arc<dyn DatabasePort>>,
    cancel: CancellationFlag,
) -> Result<()> {
    let mut watcher = RawWatcher::new(&config.storage.data_root);
    watcher.poll()?;
    info!(
        "👀 Watching {} every {}s",
        watcher.dir().display(),
        config.watch.poll_interval_secs
    );

    // Capacity one: a run in progress plus at most one pending.
    let (sender, mut receiver) = mpsc::channel::<RunRequest>(1);
    let worker_config = config.clone();
    let worker_cancel = cancel.clone();
    let worker = tokio::spawn(async move {
        while receiver.recv().await.is_some() {
            if worker_cancel.is_cancelled() {
                break;
            }
            match run_once(&worker_config, storage.clone(), database.clone(), worker_cancel.clone()).await {
                Ok(summary) => info!("✅ Triggered run {} complete", summary.run_id),
                Err(PipelineError::Cancelled { stage }) => {
                    info!("🛑 Triggered run cancelled before {}", stage);
                    break;
                }
                Err(e) => error!("❌ Triggered run failed: {}", e),
            }
        }
    });

    let mut interval = tokio::time::interval(config.watch.poll_interval());
    interval.tick().await;
    while !cancel.is_cancelled() {
        interval.tick().await;
        if cancel.is_cancelled() {
            break;
        }
        match watcher.poll() {
            Ok(true) => match offer(&sender) {
                Offer::Queued => info!("📁 Raw inputs changed, run queued"),
                Offer::Coalesced => debug!("Raw inputs changed, run already pending"),
                Offer::Closed => {
                    warn!("Run worker stopped, leaving watch loop");
                    break;
                }
            },
            Ok(false) => {}
            Err(e) => warn!("Failed to scan {}: {}", watcher.dir().display(), e),
        }
    }

    drop(sender);
    if let Err(e) = worker.await {
        error!("Run worker panicked: {}", e);
    }
    info!("Watcher stopped");
    Ok(())
}
