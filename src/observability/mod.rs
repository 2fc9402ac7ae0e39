//! Prometheus recorder installation and exposition output.

pub mod metrics;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Once, OnceLock};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};

use crate::config::MetricsConfig;

static INIT: Once = Once::new();
static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Idempotent.
///
/// With `listen_addr` set an HTTP exporter is spawned on the current tokio
/// runtime; otherwise the recorder only serves in-process rendering.
pub fn init_metrics(config: &MetricsConfig) {
    INIT.call_once(|| {
        let addr = config.listen_addr.as_deref().and_then(|raw| match raw.parse::<SocketAddr>() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!("Invalid metrics listen address '{}': {}", raw, e);
                None
            }
        });

        let handle = match addr {
            Some(addr) => install_with_listener(addr),
            None => PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| e.to_string()),
        };

        match handle {
            Ok(handle) => {
                if HANDLE.set(handle).is_err() {
                    warn!("Prometheus handle was already set");
                }
                self::metrics::describe_all();
                info!("📈 Prometheus recorder installed");
            }
            Err(e) => warn!("Failed to install Prometheus recorder: {}", e),
        }
    });
}

fn install_with_listener(addr: SocketAddr) -> Result<PrometheusHandle, String> {
    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(addr)
        .build()
        .map_err(|e| e.to_string())?;
    let handle = recorder.handle();
    ::metrics::set_global_recorder(recorder).map_err(|e| e.to_string())?;
    tokio::spawn(async move {
        // ExporterError implements neither Debug nor Display and is not publicly
        // exported, so its contents cannot be formatted.
        if exporter.await.is_err() {
            warn!("Prometheus exporter stopped with an error");
        }
    });
    info!("Prometheus HTTP exporter listening on http://{}/metrics", addr);
    Ok(handle)
}

/// Current exposition text, if a recorder is installed.
pub fn render() -> Option<String> {
    HANDLE.get().map(PrometheusHandle::render)
}

/// Write the exposition to `path` (temp file then rename) for textfile collectors.
pub fn write_textfile(path: &Path) -> std::io::Result<bool> {
    let Some(body) = render() else {
        return Ok(false);
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(true)
}
