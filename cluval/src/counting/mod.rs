//! Object counting inside cropped cluster volumes.
//!
//! Counting prefers an [`Accelerator`], a fast routine with a hard resource
//! ceiling that reports exhaustion through its log. The
//! [`AdaptiveObjectCounter`] recovers from exhaustion in stages:
//! 1. Count the whole crop
//! 2. Split the crop into fixed-size slabs along the slice axis
//! 3. Bisect any slab that still exhausts, down to a depth limit
//! 4. Hand whatever is left to the unaccelerated [`Counter`]
//!
//! Slab faces follow one convention at every cut: the slab below sees one
//! overlap slice and excludes objects touching its upper face, the slab
//! above includes objects touching its lower face. Each object is counted by
//! the slab holding its topmost voxel. In region mode the slab above only
//! sees part of such an object, so its region fractions are recomputed from
//! the whole object in the crop.
//!
//! The convention assumes an object is connected within the slab that counts
//! it. An object that only connects below the cut, such as a U whose legs
//! cross it, splits into several pieces above the cut and is counted once
//! per piece.

mod accelerator;
mod adaptive;
mod budgeted;
mod command;
mod cpu;
mod objects;
mod worker;


use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::volume::{BoundingBox, Connectivity, Volume};

pub use accelerator::{Accelerator, AcceleratorOutput, ExhaustionDetector, Outcome, DEFAULT_EXHAUSTION_MARKERS};
pub use adaptive::{AdaptiveObjectCounter, CountInput};
pub use budgeted::BudgetedAccelerator;
pub use command::{parse_output, CommandAccelerator};
pub use cpu::{Counter, CpuCounter};
pub use objects::{region_volumes_mm3, tally_objects};
pub use worker::{AcceleratorHandle, AcceleratorWorker};

/// Object count with optional per-region fractional counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    pub objects: u64,
    /// Region ID to fractional object count. Empty outside region mode.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub regions: BTreeMap<u32, f64>,
}

impl Tally {
    pub fn merge(&mut self, other: &Tally) {
        self.objects += other.objects;
        for (&region, &fraction) in &other.regions {
            *self.regions.entry(region).or_insert(0.0) += fraction;
        }
    }

    /// Sum of all region fractions.
    pub fn fraction_total(&self) -> f64 {
        self.regions.values().sum()
    }
}

/// How a count was obtained. Variants are ordered from shallowest to
/// deepest recovery stage.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Provenance {
    /// No cluster voxels contain any object; nothing was counted.
    EmptyInput,
    FullVolumeAccelerated,
    SubdividedAccelerated,
    UnacceleratedFallback,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RegionWeighting {
    /// Share of the object's voxels in each region.
    #[default]
    Voxels,
    /// Share of the object's summed intensity in each region.
    Intensity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CountMode {
    #[default]
    CountOnly,
    RegionFractions { weighting: RegionWeighting },
}

impl CountMode {
    pub fn is_region_mode(&self) -> bool {
        matches!(self, CountMode::RegionFractions { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EdgeRule {
    Include,
    Exclude,
}

/// Treatment of objects touching the two slice-axis faces of a slab. The
/// lateral faces are always inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgePolicy {
    pub lower: EdgeRule,
    pub upper: EdgeRule,
}

impl EdgePolicy {
    pub fn inclusive() -> Self {
        Self {
            lower: EdgeRule::Include,
            upper: EdgeRule::Include,
        }
    }

    /// Policy for a slab with another slab above it.
    pub fn below_cut() -> Self {
        Self {
            lower: EdgeRule::Include,
            upper: EdgeRule::Exclude,
        }
    }

    /// Whether an object with `bbox` is counted in a slab whose top slice is
    /// `last_slice`.
    pub fn keeps(&self, bbox: &BoundingBox, last_slice: usize) -> bool {
        let z_min = bbox.min()[2];
        let z_max = bbox.end()[2] - 1;
        !((self.lower == EdgeRule::Exclude && z_min == 0)
            || (self.upper == EdgeRule::Exclude && z_max == last_slice))
    }
}

/// One self-contained unit of counting work.
///
/// Jobs own their volumes so they can be sent to the accelerator thread.
#[derive(Debug, Clone)]
pub struct CountJob {
    /// Segmentation already masked to the cluster.
    pub segmentation: Volume<u32>,
    /// Region map co-cropped with the segmentation, in region mode.
    pub regions: Option<Volume<u32>>,
    /// Intensity for intensity weighting.
    pub intensity: Option<Volume<f32>>,
    pub policy: EdgePolicy,
    pub mode: CountMode,
    pub connectivity: Connectivity,
}

impl CountJob {
    pub fn slices(&self) -> usize {
        self.segmentation.depth()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountStats {
    pub accelerator_calls: usize,
    /// Units whose tally contributed to the result.
    pub leaves: usize,
    pub fallback_leaves: usize,
    pub max_depth_reached: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CountResult {
    pub tally: Tally,
    pub provenance: Provenance,
    pub stats: CountStats,
    /// Why the count failed, when it did.
    pub failure: Option<String>,
}

impl CountResult {
    pub fn is_complete(&self) -> bool {
        self.provenance != Provenance::Failed
    }
}

/// Limits for slab subdivision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubdivisionParams {
    /// Slab thickness after the whole crop exhausts.
    pub chunk_slices: usize,
    /// Deepest recursion level; chunk slabs are level 1.
    pub max_depth: usize,
    /// A slab thinner than twice this is not bisected.
    pub min_slab_slices: usize,
    pub allow_fallback: bool,
}

impl Default for SubdivisionParams {
    fn default() -> Self {
        Self {
            chunk_slices: 100,
            max_depth: 3,
            min_slab_slices: 2,
            allow_fallback: true,
        }
    }
}

impl SubdivisionParams {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_slices == 0 {
            return Err(Error::Config("chunk_slices must be at least 1".into()));
        }
        if self.max_depth == 0 {
            return Err(Error::Config("max_depth must be at least 1".into()));
        }
        if self.min_slab_slices == 0 {
            return Err(Error::Config("min_slab_slices must be at least 1".into()));
        }
        Ok(())
    }
}
