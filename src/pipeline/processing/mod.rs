// Pipeline processing: geometry validation, normalization, classification and partitioning

pub mod classify;
pub mod geometry;
pub mod normalize;
pub mod partition;

pub use classify::{ClassificationReport, SpatialClassifier};
pub use geometry::{GeometryValidator, TopologyIssue, ValidationOutcome, ValidationReport};
pub use normalize::{NormalizationReport, RecordNormalizer};
pub use partition::{OutputPartitioner, PartitionedOutputs};
