// Layered pipeline: artifacts, processing stages, orchestration and triggers

pub mod artifact;
pub mod cancel;
pub mod orchestrator;
pub mod processing;
pub mod run_lock;
pub mod seed;
pub mod watcher;

pub use cancel::CancellationFlag;
pub use orchestrator::{run_once, DatabaseStatus, Orchestrator, RunSummary};
