//! Persisted layer artifacts and per-layer manifests.
//!
//! An artifact is a JSON envelope around one payload (a record set or a
//! partition view) carrying the format version, CRS metadata and the SHA-256
//! of the payload bytes. Each layer publishes its artifacts first and its
//! manifest last; readers only accept artifacts the manifest lists with a
//! matching checksum and run id.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::app::ports::{PutOutcome, StoragePort};
use crate::domain::{FeatureCollection, Layer, LayerRecordSet, RawFeature};
use crate::error::{PipelineError, Result};
use crate::pipeline::cancel::CancellationFlag;

pub const ARTIFACT_FORMAT: &str = "esteira-geo/layer-artifact";
pub const MANIFEST_FORMAT: &str = "esteira-geo/layer-manifest";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrsMetadata {
    pub name: String,
    pub axis_order: String,
}

impl CrsMetadata {
    pub fn wgs84() -> Self {
        Self {
            name: "EPSG:4326".to_string(),
            axis_order: "lon,lat".to_string(),
        }
    }

    pub fn is_wgs84(&self) -> bool {
        *self == Self::wgs84()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ArtifactEnvelope {
    pub format: String,
    pub format_version: u32,
    pub crs: CrsMetadata,
    pub layer: Layer,
    pub run_id: Uuid,
    pub entity: String,
    pub record_count: usize,
    /// SHA-256 (hex) of the exact `payload` bytes.
    pub checksum: String,
    pub payload: Box<RawValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerManifest {
    pub format: String,
    pub format_version: u32,
    pub layer: Layer,
    pub run_id: Uuid,
    pub published_at: DateTime<Utc>,
    /// Artifact name to checksum.
    pub artifacts: BTreeMap<String, String>,
}

pub fn manifest_name(layer: Layer) -> String {
    format!("_manifest.{}.json", layer)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn corrupt(layer: Layer, name: &str, reason: impl Into<String>) -> PipelineError {
    PipelineError::CorruptInput {
        layer,
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// An artifact encoded and ready to publish.
#[derive(Debug, Clone)]
pub struct EncodedArtifact {
    pub name: String,
    pub checksum: String,
    pub bytes: Vec<u8>,
}

pub fn encode_artifact<P: Serialize>(
    layer: Layer,
    run_id: Uuid,
    name: &str,
    entity: &str,
    record_count: usize,
    payload: &P,
) -> Result<EncodedArtifact> {
    let payload = serde_json::to_string(payload)?;
    let checksum = sha256_hex(payload.as_bytes());
    let envelope = ArtifactEnvelope {
        format: ARTIFACT_FORMAT.to_string(),
        format_version: FORMAT_VERSION,
        crs: CrsMetadata::wgs84(),
        layer,
        run_id,
        entity: entity.to_string(),
        record_count,
        checksum: checksum.clone(),
        payload: RawValue::from_string(payload)?,
    };
    Ok(EncodedArtifact {
        name: name.to_string(),
        checksum,
        bytes: serde_json::to_vec(&envelope)?,
    })
}

/// Decode and verify one artifact against the manifest that lists it.
pub fn decode_artifact<P: DeserializeOwned>(manifest: &LayerManifest, name: &str, bytes: &[u8]) -> Result<P> {
    let layer = manifest.layer;
    let envelope: ArtifactEnvelope =
        serde_json::from_slice(bytes).map_err(|e| corrupt(layer, name, format!("not a layer artifact: {}", e)))?;

    if envelope.format != ARTIFACT_FORMAT || envelope.format_version != FORMAT_VERSION {
        return Err(corrupt(
            layer,
            name,
            format!("unsupported format {} v{}", envelope.format, envelope.format_version),
        ));
    }
    if !envelope.crs.is_wgs84() {
        return Err(corrupt(
            layer,
            name,
            format!("CRS mismatch: {} ({})", envelope.crs.name, envelope.crs.axis_order),
        ));
    }
    if envelope.layer != layer {
        return Err(corrupt(layer, name, format!("artifact belongs to the {} layer", envelope.layer)));
    }
    if envelope.run_id != manifest.run_id {
        return Err(corrupt(
            layer,
            name,
            format!("artifact run {} does not match manifest run {}", envelope.run_id, manifest.run_id),
        ));
    }
    let actual = sha256_hex(envelope.payload.get().as_bytes());
    if actual != envelope.checksum {
        return Err(corrupt(layer, name, "checksum mismatch"));
    }
    match manifest.artifacts.get(name) {
        Some(expected) if *expected == actual => {}
        Some(_) => return Err(corrupt(layer, name, "checksum differs from manifest")),
        None => return Err(corrupt(layer, name, "artifact is not listed in the manifest")),
    }

    serde_json::from_str(envelope.payload.get()).map_err(|e| corrupt(layer, name, format!("payload: {}", e)))
}

async fn fetch(storage: &dyn StoragePort, layer: Layer, name: &str) -> Result<Vec<u8>> {
    match storage.get(layer.namespace(), name).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.is_not_found() => Err(PipelineError::MissingInput {
            layer,
            name: name.to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// What a layer publish did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub artifacts: Vec<String>,
    pub mirror_failures: usize,
}

/// Artifacts of one layer, published together with the manifest last.
pub struct LayerBatch {
    layer: Layer,
    run_id: Uuid,
    artifacts: Vec<EncodedArtifact>,
}

impl LayerBatch {
    pub fn new(layer: Layer, run_id: Uuid) -> Self {
        Self {
            layer,
            run_id,
            artifacts: Vec::new(),
        }
    }

    pub fn add_record_set<T: Serialize>(&mut self, name: &str, entity: &str, set: &LayerRecordSet<T>) -> Result<()> {
        if set.layer() != self.layer || set.run_id() != self.run_id {
            return Err(PipelineError::Stage {
                stage: self.layer,
                reason: format!("record set {} is from layer {} run {}", name, set.layer(), set.run_id()),
            });
        }
        self.add(name, entity, set.len(), set)
    }

    pub fn add<P: Serialize>(&mut self, name: &str, entity: &str, record_count: usize, payload: &P) -> Result<()> {
        let artifact = encode_artifact(self.layer, self.run_id, name, entity, record_count, payload)?;
        self.artifacts.push(artifact);
        Ok(())
    }

    pub fn manifest(&self) -> LayerManifest {
        LayerManifest {
            format: MANIFEST_FORMAT.to_string(),
            format_version: FORMAT_VERSION,
            layer: self.layer,
            run_id: self.run_id,
            published_at: Utc::now(),
            artifacts: self
                .artifacts
                .iter()
                .map(|a| (a.name.clone(), a.checksum.clone()))
                .collect(),
        }
    }

    /// Write every artifact, then the manifest. Cancellation is checked before each write.
    pub async fn publish(self, storage: &dyn StoragePort, cancel: &CancellationFlag) -> Result<PublishReport> {
        let namespace = self.layer.namespace();
        let manifest = self.manifest();
        let mut report = PublishReport::default();

        for artifact in self.artifacts {
            cancel.check(self.layer)?;
            let outcome = storage.put(namespace, &artifact.name, artifact.bytes).await?;
            if let PutOutcome::MirrorFailed { .. } = outcome {
                report.mirror_failures += 1;
            }
            debug!(layer = %self.layer, name = %artifact.name, checksum = %artifact.checksum, "published artifact");
            report.artifacts.push(artifact.name);
        }

        cancel.check(self.layer)?;
        let name = manifest_name(self.layer);
        let outcome = storage.put(namespace, &name, serde_json::to_vec_pretty(&manifest)?).await?;
        if let PutOutcome::MirrorFailed { .. } = outcome {
            report.mirror_failures += 1;
        }
        info!(
            "📦 Published {} layer: {} artifacts to {}/ ({})",
            self.layer,
            report.artifacts.len(),
            namespace,
            storage.describe()
        );
        Ok(report)
    }
}

/// Verified access to a published layer.
pub struct LayerReader<'a> {
    storage: &'a dyn StoragePort,
    manifest: LayerManifest,
}

impl<'a> LayerReader<'a> {
    /// Load the layer manifest; it must belong to `run_id`.
    pub async fn open(storage: &'a dyn StoragePort, layer: Layer, run_id: Uuid) -> Result<LayerReader<'a>> {
        let name = manifest_name(layer);
        let bytes = fetch(storage, layer, &name).await?;
        let manifest: LayerManifest =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(layer, &name, format!("manifest: {}", e)))?;
        if manifest.format != MANIFEST_FORMAT || manifest.layer != layer {
            return Err(corrupt(layer, &name, "not a manifest for this layer"));
        }
        if manifest.run_id != run_id {
            return Err(corrupt(
                layer,
                &name,
                format!("manifest belongs to run {}, expected {}", manifest.run_id, run_id),
            ));
        }
        Ok(Self { storage, manifest })
    }

    pub fn manifest(&self) -> &LayerManifest {
        &self.manifest
    }

    pub async fn read<P: DeserializeOwned>(&self, name: &str) -> Result<P> {
        let bytes = fetch(self.storage, self.manifest.layer, name).await?;
        decode_artifact(&self.manifest, name, &bytes)
    }

    pub async fn read_record_set<T: DeserializeOwned>(&self, name: &str) -> Result<LayerRecordSet<T>> {
        let set: LayerRecordSet<T> = self.read(name).await?;
        if set.layer() != self.manifest.layer || set.run_id() != self.manifest.run_id {
            return Err(corrupt(
                self.manifest.layer,
                name,
                format!("record set is from layer {} run {}", set.layer(), set.run_id()),
            ));
        }
        Ok(set)
    }
}

/// Read a raw GeoJSON FeatureCollection into a raw record set for `run_id`.
pub async fn read_raw_features(storage: &dyn StoragePort, name: &str, run_id: Uuid) -> Result<LayerRecordSet<RawFeature>> {
    let bytes = fetch(storage, Layer::Raw, name).await?;
    let collection: FeatureCollection =
        serde_json::from_slice(&bytes).map_err(|e| corrupt(Layer::Raw, name, format!("invalid GeoJSON: {}", e)))?;
    collection.ensure_wgs84().map_err(|reason| corrupt(Layer::Raw, name, reason))?;
    Ok(LayerRecordSet::new(Layer::Raw, run_id, collection.features))
}
