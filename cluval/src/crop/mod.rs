//! Per-cluster bounding boxes and sub-volume extraction in native space.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info};

use strum::IntoEnumIterator;

use crate::artifacts::{
    read_indexed_record, write_record, ArtifactLayout, BoxRecord, CropKey, RecordRead,
    SourceKind, SubjectId, UnitKey, UnitState,
};
use crate::error::{Error, Result};
use crate::volume::io::{write_volume, NiftiVoxel};
use crate::volume::{BoundingBox, Voxel, Volume};

pub const ABSENT_REASON: &str = "absent";

/// Bounding box lookup result for one (subject, cluster).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoxOutcome {
    Present { bbox: BoundingBox, volume_mm3: f64 },
    /// The label has no voxels in this subject's native index.
    Absent,
}

impl BoxOutcome {
    fn from_record(record: &BoxRecord) -> Option<Self> {
        match (record.state, record.bbox, record.volume_mm3) {
            (UnitState::Computed, Some(bbox), Some(volume_mm3)) => {
                Some(BoxOutcome::Present { bbox, volume_mm3 })
            }
            (UnitState::Failed, None, _) if record.reason.as_deref() == Some(ABSENT_REASON) => {
                Some(BoxOutcome::Absent)
            }
            _ => None,
        }
    }

    fn to_record(self, index: &str) -> BoxRecord {
        let index = Some(index.to_string());
        match self {
            BoxOutcome::Present { bbox, volume_mm3 } => BoxRecord {
                state: UnitState::Computed,
                bbox: Some(bbox),
                volume_mm3: Some(volume_mm3),
                reason: None,
                index,
            },
            BoxOutcome::Absent => BoxRecord {
                state: UnitState::Failed,
                bbox: None,
                volume_mm3: None,
                reason: Some(ABSENT_REASON.to_string()),
                index,
            },
        }
    }
}

/// Computes each (subject, cluster) box at most once and caches it on disk.
#[derive(Debug)]
pub struct BoundingBoxCropper {
    layout: ArtifactLayout,
    computations: AtomicUsize,
}

impl BoundingBoxCropper {
    pub fn new(layout: ArtifactLayout) -> Self {
        Self {
            layout,
            computations: AtomicUsize::new(0),
        }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Number of boxes computed (not read from cache) by this cropper.
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }

    /// Box and cluster volume for one label.
    pub fn bounding_box(&self, unit: &UnitKey, native_index: &Volume<u32>, index: &str) -> Result<BoxOutcome> {
        let outcomes = self.bounding_boxes(&unit.subject, native_index, &[unit.cluster], index)?;
        Ok(outcomes[&unit.cluster])
    }

    /// Boxes for several labels of one subject. Cached records stamped with
    /// `index` are reused; the rest are computed together in a single pass
    /// over the native index, and crops kept for them are dropped.
    pub fn bounding_boxes(
        &self,
        subject: &SubjectId,
        native_index: &Volume<u32>,
        labels: &[u32],
        index: &str,
    ) -> Result<BTreeMap<u32, BoxOutcome>> {
        let mut outcomes = BTreeMap::new();
        let mut missing = Vec::new();

        for &label in labels {
            let unit = UnitKey::new(subject.clone(), label);
            let path = self.layout.bbox_path(&unit);
            let cached = match read_indexed_record::<BoxRecord>(&path, index)? {
                RecordRead::Present(record) => BoxOutcome::from_record(&record),
                RecordRead::Missing | RecordRead::Purged => None,
            };
            match cached {
                Some(outcome) => {
                    debug!(unit = %unit, "Reusing cached bounding box");
                    outcomes.insert(label, outcome);
                }
                None => missing.push(label),
            }
        }

        if missing.is_empty() {
            return Ok(outcomes);
        }

        let boxes = native_index.label_bounding_boxes();
        let voxel_volume = native_index.voxel_volume_mm3();
        for label in missing {
            let unit = UnitKey::new(subject.clone(), label);
            let outcome = match boxes.get(&(label as u64)) {
                Some(bbox) => {
                    let voxels = cluster_mask(native_index, label, bbox)?.count_nonzero();
                    BoxOutcome::Present {
                        bbox: *bbox,
                        volume_mm3: voxels as f64 * voxel_volume,
                    }
                }
                None => BoxOutcome::Absent,
            };
            self.computations.fetch_add(1, Ordering::Relaxed);
            self.remove_crops(&unit)?;
            write_record(&self.layout.bbox_path(&unit), &outcome.to_record(index))?;
            info!(unit = %unit, outcome = ?outcome, "Computed bounding box");
            outcomes.insert(label, outcome);
        }

        Ok(outcomes)
    }

    fn remove_crops(&self, unit: &UnitKey) -> Result<()> {
        for kind in SourceKind::iter() {
            let path = self.layout.crop_path(&unit.crop(kind));
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed stale crop"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(&path, e)),
            }
        }
        Ok(())
    }

    /// Writes the crop for `key` unless it already exists. Returns the crop
    /// path.
    pub fn materialize<T: NiftiVoxel>(
        &self,
        key: &CropKey,
        volume: &Volume<T>,
        bbox: &BoundingBox,
    ) -> Result<std::path::PathBuf> {
        let path = self.layout.crop_path(key);
        common::file_utils::remove_if_empty(&path).map_err(|e| Error::io(&path, e))?;
        if !path.exists() {
            write_volume(&path, &extract(volume, bbox)?)?;
        }
        Ok(path)
    }
}

/// Cuts the sub-volume covered by `bbox` from any co-registered volume.
pub fn extract<T: Voxel>(volume: &Volume<T>, bbox: &BoundingBox) -> Result<Volume<T>> {
    volume.crop(bbox)
}

/// Binary mask of `label` inside `bbox`.
pub fn cluster_mask(native_index: &Volume<u32>, label: u32, bbox: &BoundingBox) -> Result<Volume<u8>> {
    Ok(native_index.crop(bbox)?.map(|&v| u8::from(v == label)))
}
