//! Typed unit keys, on-disk layout and per-unit state records.
//!
//! Every unit of work is identified by a [`UnitKey`]; file names are derived
//! from it and never built ad hoc. Records carry an explicit [`UnitState`]
//! and are written to a temporary name and renamed, so a file either holds a
//! complete record or does not exist. Zero-length files left by older tools
//! or interrupted copies are purged on read, and so are records stamped with
//! another cluster index's fingerprint.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use common::FileFormat;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::counting::{CountStats, Provenance};
use crate::error::{Error, Result};
use crate::volume::BoundingBox;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One (subject, cluster) unit of work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitKey {
    pub subject: SubjectId,
    pub cluster: u32,
}

impl UnitKey {
    pub fn new(subject: SubjectId, cluster: u32) -> Self {
        Self { subject, cluster }
    }

    pub fn crop(&self, kind: SourceKind) -> CropKey {
        CropKey {
            unit: self.clone(),
            kind,
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/cluster_{}", self.subject, self.cluster)
    }
}

/// Which native-space volume a crop was cut from.
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
    strum_macros::EnumString,
    strum_macros::EnumIter,
    strum_macros::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SourceKind {
    /// Binary mask of the cluster itself.
    Clusters,
    Segmentation,
    /// Consensus or atlas region map.
    Regions,
    /// Raw signal.
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CropKey {
    pub unit: UnitKey,
    pub kind: SourceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UnitState {
    Pending,
    Computed,
    Failed,
}

/// Bounding box record for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxRecord {
    pub state: UnitState,
    pub bbox: Option<BoundingBox>,
    /// Physical volume of the cluster mask inside the box.
    pub volume_mm3: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Fingerprint of the cluster index the box was computed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
}

/// Count record for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountRecord {
    pub state: UnitState,
    pub provenance: Option<Provenance>,
    pub objects: Option<u64>,
    /// Region ID to fractional object count, in region mode.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub regions: BTreeMap<u32, f64>,
    /// Region ID to physical volume inside the cluster, in region mode.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub region_volumes_mm3: BTreeMap<u32, f64>,
    #[serde(default)]
    pub stats: CountStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Fingerprint of the cluster index the count belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
}

impl CountRecord {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: UnitState::Failed,
            provenance: None,
            objects: None,
            regions: BTreeMap::new(),
            region_volumes_mm3: BTreeMap::new(),
            stats: CountStats::default(),
            reason: Some(reason.into()),
            index: None,
        }
    }

    pub fn for_index(mut self, fingerprint: &str) -> Self {
        self.index = Some(fingerprint.to_string());
        self
    }
}

/// A record derived from one cluster index.
pub trait IndexedRecord {
    fn index(&self) -> Option<&str>;

    /// Records without a fingerprint predate it and never match.
    fn matches_index(&self, fingerprint: &str) -> bool {
        self.index() == Some(fingerprint)
    }
}

impl IndexedRecord for BoxRecord {
    fn index(&self) -> Option<&str> {
        self.index.as_deref()
    }
}

impl IndexedRecord for CountRecord {
    fn index(&self) -> Option<&str> {
        self.index.as_deref()
    }
}

/// Result of reading a record file.
#[derive(Debug)]
pub enum RecordRead<T> {
    Missing,
    /// The file was empty or unreadable and has been deleted.
    Purged,
    Present(T),
}

/// Directory layout under the work directory.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    work_dir: PathBuf,
}

impl ArtifactLayout {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn subject_dir(&self, subject: &SubjectId) -> PathBuf {
        self.work_dir.join(subject.as_str())
    }

    /// Native-space projection of the index with `fingerprint` through one
    /// transform version.
    pub fn native_index_path(&self, subject: &SubjectId, transform_version: &str, fingerprint: &str) -> PathBuf {
        self.subject_dir(subject)
            .join(format!("native_cluster_index_{transform_version}_{fingerprint}.nii.gz"))
    }

    pub fn bbox_path(&self, unit: &UnitKey) -> PathBuf {
        self.subject_dir(&unit.subject)
            .join("bbox")
            .join(format!("cluster_{}.json", unit.cluster))
    }

    pub fn crop_path(&self, key: &CropKey) -> PathBuf {
        self.subject_dir(&key.unit.subject)
            .join("crops")
            .join(format!("cluster_{}_{}.nii.gz", key.unit.cluster, key.kind))
    }

    pub fn count_path(&self, unit: &UnitKey) -> PathBuf {
        self.subject_dir(&unit.subject)
            .join("counts")
            .join(format!("cluster_{}.json", unit.cluster))
    }

    pub fn density_csv_path(&self, subject: &SubjectId) -> PathBuf {
        self.subject_dir(subject)
            .join(format!("{subject}_densities.csv"))
    }
}

/// Writes a JSON record atomically.
pub fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let json = common::serialize(record, FileFormat::Json).map_err(|source| Error::Serde {
        path: path.to_path_buf(),
        source,
    })?;
    common::file_utils::write_atomic(path, json.as_bytes()).map_err(|e| Error::io(path, e))
}

/// Reads a JSON record. Empty or unparseable files are deleted and reported
/// as [`RecordRead::Purged`].
pub fn read_record<T: DeserializeOwned>(path: &Path) -> Result<RecordRead<T>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RecordRead::Missing),
        Err(e) => return Err(Error::io(path, e)),
    };

    let reason = if text.trim().is_empty() {
        "empty file".to_string()
    } else {
        match common::deserialize::<T>(&text, FileFormat::Json) {
            Ok(record) => return Ok(RecordRead::Present(record)),
            Err(e) => e.to_string(),
        }
    };

    warn!(path = %path.display(), reason = %reason, "Purging corrupt record");
    std::fs::remove_file(path).map_err(|e| Error::io(path, e))?;
    Ok(RecordRead::Purged)
}

/// Like [`read_record`], but a record stamped with another index (or with
/// none) is stale: it is deleted and reported as [`RecordRead::Purged`].
pub fn read_indexed_record<T>(path: &Path, fingerprint: &str) -> Result<RecordRead<T>>
where
    T: DeserializeOwned + IndexedRecord,
{
    match read_record::<T>(path)? {
        RecordRead::Present(record) if !record.matches_index(fingerprint) => {
            warn!(
                path = %path.display(),
                found = record.index().unwrap_or("none"),
                expected = fingerprint,
                "Purging record from another cluster index"
            );
            std::fs::remove_file(path).map_err(|e| Error::io(path, e))?;
            Ok(RecordRead::Purged)
        }
        other => Ok(other),
    }
}

/// Reads a JSON record and leaves the file alone. Empty or unparseable files
/// read as `None`.
pub fn peek_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(path, e)),
    };
    match common::deserialize::<T>(&text, FileFormat::Json) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable record");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    fn unit() -> UnitKey {
        UnitKey::new(SubjectId::new("mouse_07"), 3)
    }

    #[test]
    fn test_paths_encode_unit_and_kind() {
        let layout = ArtifactLayout::new("/work");
        let u = unit();
        assert_eq!(
            layout.bbox_path(&u),
            PathBuf::from("/work/mouse_07/bbox/cluster_3.json")
        );
        assert_eq!(
            layout.count_path(&u),
            PathBuf::from("/work/mouse_07/counts/cluster_3.json")
        );
        assert_eq!(
            layout.native_index_path(&u.subject, "v1", "0a1b2c3d4e5f6789"),
            PathBuf::from("/work/mouse_07/native_cluster_index_v1_0a1b2c3d4e5f6789.nii.gz")
        );
        assert_eq!(
            layout.density_csv_path(&u.subject),
            PathBuf::from("/work/mouse_07/mouse_07_densities.csv")
        );

        let crop_paths: Vec<PathBuf> = SourceKind::iter()
            .map(|k| layout.crop_path(&u.crop(k)))
            .collect();
        assert_eq!(
            crop_paths[0],
            PathBuf::from("/work/mouse_07/crops/cluster_3_clusters.nii.gz")
        );
        let mut unique = crop_paths.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), crop_paths.len());
    }

    #[test]
    fn test_source_kind_names() {
        assert_eq!(SourceKind::Segmentation.to_string(), "segmentation");
        assert_eq!(SourceKind::from_str("raw").unwrap(), SourceKind::Raw);
        assert!(SourceKind::from_str("labels").is_err());
    }

    #[test]
    fn test_unit_display() {
        assert_eq!(unit().to_string(), "mouse_07/cluster_3");
    }

    #[test]
    fn test_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bbox").join("cluster_1.json");
        let record = BoxRecord {
            state: UnitState::Computed,
            bbox: Some(BoundingBox::from_extents([1, 2, 3], [4, 5, 6])),
            volume_mm3: Some(0.06),
            reason: None,
            index: Some("abc".to_string()),
        };
        write_record(&path, &record).unwrap();
        match read_record::<BoxRecord>(&path).unwrap() {
            RecordRead::Present(r) => assert_eq!(r, record),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_record() {
        let dir = tempfile::tempdir().unwrap();
        let read = read_record::<BoxRecord>(&dir.path().join("nope.json")).unwrap();
        assert!(matches!(read, RecordRead::Missing));
    }

    #[test]
    fn test_empty_and_garbage_records_are_purged() {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in [("empty.json", ""), ("garbage.json", "{\"state\": 7")] {
            let path = dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            let read = read_record::<BoxRecord>(&path).unwrap();
            assert!(matches!(read, RecordRead::Purged));
            assert!(!path.exists());
        }
    }

    #[test]
    fn test_peek_leaves_corrupt_record_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster_2.json");
        std::fs::write(&path, "").unwrap();
        assert!(peek_record::<BoxRecord>(&path).unwrap().is_none());
        assert!(path.exists());
    }

    #[test]
    fn test_record_from_other_index_is_purged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts").join("cluster_1.json");
        write_record(&path, &CountRecord::failed("absent").for_index("old")).unwrap();

        match read_indexed_record::<CountRecord>(&path, "old").unwrap() {
            RecordRead::Present(r) => assert_eq!(r.index.as_deref(), Some("old")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            read_indexed_record::<CountRecord>(&path, "new").unwrap(),
            RecordRead::Purged
        ));
        assert!(!path.exists());

        // Unstamped records cannot be attributed to any index.
        write_record(&path, &CountRecord::failed("absent")).unwrap();
        assert!(matches!(
            read_indexed_record::<CountRecord>(&path, "new").unwrap(),
            RecordRead::Purged
        ));
    }

    #[test]
    fn test_failed_count_record_serializes_state() {
        let record = CountRecord::failed("absent");
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"state\":\"failed\""));
        assert!(json.contains("\"reason\":\"absent\""));
        assert!(!json.contains("regions"));
    }
}
