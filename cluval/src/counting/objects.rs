//! Reference object counting shared by in-process routines.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::volume::{label_components, ValueMode, Volume};

use super::{CountJob, CountMode, RegionWeighting, Tally};

/// Counts connected objects in `job`, honoring its edge policy and mode.
///
/// Touching voxels with different segmentation values are distinct objects,
/// so binary and labeled segmentations are both handled.
pub fn tally_objects(job: &CountJob) -> Result<Tally> {
    let labeled = label_components(&job.segmentation, job.connectivity, ValueMode::MatchValues);
    let last_slice = job.segmentation.depth().saturating_sub(1);

    // Index 0 is background.
    let mut counted = vec![false; labeled.num_labels() + 1];
    let mut objects = 0u64;
    for component in labeled.components() {
        if job.policy.keeps(&component.bbox, last_slice) {
            counted[component.label as usize] = true;
            objects += 1;
        }
    }

    let weighting = match job.mode {
        CountMode::CountOnly => {
            return Ok(Tally {
                objects,
                regions: BTreeMap::new(),
            })
        }
        CountMode::RegionFractions { weighting } => weighting,
    };

    let (regions, intensity) = region_inputs(job, weighting)?;
    let shares = object_shares(labeled.labels(), &counted, regions, intensity);
    let mut fractions = BTreeMap::new();
    for share in &shares {
        for (region, fraction) in share_fractions(share) {
            *fractions.entry(region).or_insert(0.0) += fraction;
        }
    }

    Ok(Tally {
        objects,
        regions: fractions,
    })
}

/// Region map and, for intensity weighting, the intensity volume of `job`.
pub(super) fn region_inputs(
    job: &CountJob,
    weighting: RegionWeighting,
) -> Result<(&Volume<u32>, Option<&Volume<f32>>)> {
    let regions = job
        .regions
        .as_ref()
        .ok_or_else(|| Error::Config("region fraction counting needs a region map".into()))?;
    job.segmentation.check_shape(regions.dims())?;
    let intensity = match weighting {
        RegionWeighting::Voxels => None,
        RegionWeighting::Intensity => {
            let intensity = job
                .intensity
                .as_ref()
                .ok_or_else(|| Error::Config("intensity weighting needs an intensity volume".into()))?;
            job.segmentation.check_shape(intensity.dims())?;
            Some(intensity)
        }
    };
    Ok((regions, intensity))
}

/// Region to (weight, voxels) of one object.
pub(super) type Share = BTreeMap<u32, (f64, usize)>;

/// Shares of every label flagged in `wanted`, indexed by label.
pub(super) fn object_shares(
    labels: &Volume<u32>,
    wanted: &[bool],
    regions: &Volume<u32>,
    intensity: Option<&Volume<f32>>,
) -> Vec<Share> {
    let mut shares: Vec<Share> = vec![BTreeMap::new(); wanted.len()];
    for (idx, &label) in labels.voxels().iter().enumerate() {
        if label == 0 || !wanted[label as usize] {
            continue;
        }
        let weight = intensity.map_or(1.0, |v| v.voxels()[idx].max(0.0) as f64);
        let entry = shares[label as usize]
            .entry(regions.voxels()[idx])
            .or_insert((0.0, 0));
        entry.0 += weight;
        entry.1 += 1;
    }
    shares
}

/// An object's fractional count per region; sums to one for a non-empty
/// share.
pub(super) fn share_fractions(share: &Share) -> impl Iterator<Item = (u32, f64)> + '_ {
    let total_weight: f64 = share.values().map(|(w, _)| w).sum();
    let total_voxels: usize = share.values().map(|(_, n)| n).sum();
    share.iter().map(move |(&region, &(weight, voxels))| {
        // A zero-intensity object falls back to voxel weights.
        let fraction = if total_weight > 0.0 {
            weight / total_weight
        } else {
            voxels as f64 / total_voxels as f64
        };
        (region, fraction)
    })
}

/// Physical volume of each region inside the cluster mask.
pub fn region_volumes_mm3(cluster_mask: &Volume<u8>, regions: &Volume<u32>) -> Result<BTreeMap<u32, f64>> {
    cluster_mask.check_shape(regions.dims())?;
    let voxel_volume = regions.voxel_volume_mm3();
    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    for (&m, &region) in cluster_mask.voxels().iter().zip(regions.voxels()) {
        if m != 0 {
            *counts.entry(region).or_insert(0) += 1;
        }
    }
    Ok(counts
        .into_iter()
        .map(|(region, n)| (region, n as f64 * voxel_volume))
        .collect())
}
