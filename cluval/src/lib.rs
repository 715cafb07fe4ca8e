//! Cluval - adaptive cluster validation.
//!
//! Turns a reference-space statistic map into labeled clusters, projects the
//! cluster index into each subject's native space, and counts segmented
//! objects inside every cluster:
//! - Significance thresholding (statistic or FDR) and connected-component labeling
//! - Affine projection with registration padding removal
//! - Cached per-cluster bounding boxes and crops
//! - Accelerated counting with slab subdivision and a CPU fallback
//! - Wide CSV tables of counts, volumes and densities
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cluval::{discover_subjects, ClusterSelection, Pipeline, PipelineConfig};
//!
//! let (config, _) = PipelineConfig::resolve(None)?;
//! let pipeline = Pipeline::new(config)?;
//! let index = pipeline.build_index("stats.nii.gz".as_ref(), None)?;
//! let subjects = discover_subjects(&["experiment".into()])?;
//! let summary = pipeline.run(&index, &subjects, &ClusterSelection::All)?;
//! println!("{} subjects processed", summary.processed());
//! ```

pub mod aggregate;
pub mod artifacts;
pub mod cluster_index;
pub mod config;
pub mod counting;
pub mod crop;
mod error;
pub mod pipeline;
pub mod projection;
pub mod volume;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};

// ============================================================================
// Volumes
// ============================================================================

pub use volume::io::{read_volume, write_volume};
pub use volume::{BitDepth, BoundingBox, Connectivity, Volume};

// ============================================================================
// Cluster index and projection
// ============================================================================

pub use cluster_index::{ClusterIndex, ClusterIndexBuilder, ClusterParams, Significance};
pub use projection::{
    AffineTransformProvider, Direction, RegistrationBundle, SpatialProjector, TransformProvider,
};

// ============================================================================
// Counting
// ============================================================================

pub use counting::{
    AdaptiveObjectCounter, CountMode, CountResult, Provenance, RegionWeighting, SubdivisionParams,
};
pub use crop::{BoundingBoxCropper, BoxOutcome};

// ============================================================================
// Batch driver
// ============================================================================

pub use aggregate::RegionFractionAggregator;
pub use artifacts::{ArtifactLayout, SubjectId};
pub use config::{AcceleratorKind, CountingMode, PipelineConfig};
pub use pipeline::{discover_subjects, BatchSummary, ClusterSelection, Pipeline, SubjectOutcome};
