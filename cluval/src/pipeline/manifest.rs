//! Subject manifests and experiment directory discovery.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifacts::SubjectId;
use crate::error::{Error, Result};

pub const MANIFEST_FILE: &str = "subject.yml";

/// Contents of `subject.yml`. Relative paths are relative to the subject
/// directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectManifest {
    #[serde(default)]
    pub id: Option<String>,
    pub condition: String,
    #[serde(default)]
    pub segmentation: Option<PathBuf>,
    #[serde(default)]
    pub regions: Option<PathBuf>,
    #[serde(default)]
    pub raw: Option<PathBuf>,
    /// Registration bundle mapping the atlas onto this subject.
    #[serde(default)]
    pub registration: Option<PathBuf>,
    /// Precomputed native-space cluster index; skips projection.
    #[serde(default)]
    pub native_cluster_index: Option<PathBuf>,
}

/// A subject with its manifest paths resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub id: SubjectId,
    pub dir: PathBuf,
    pub condition: String,
    pub segmentation: Option<PathBuf>,
    pub regions: Option<PathBuf>,
    pub raw: Option<PathBuf>,
    pub registration: Option<PathBuf>,
    pub native_cluster_index: Option<PathBuf>,
}

impl Subject {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let manifest: SubjectManifest = common::deserialize(&text, common::FileFormat::Yaml)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Ok(Self::from_manifest(dir, manifest))
    }

    pub fn from_manifest(dir: &Path, manifest: SubjectManifest) -> Self {
        let resolve = |p: Option<PathBuf>| p.map(|p| if p.is_absolute() { p } else { dir.join(p) });
        let id = manifest.id.unwrap_or_else(|| {
            dir.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "subject".to_string())
        });
        Self {
            id: SubjectId::new(id),
            dir: dir.to_path_buf(),
            condition: manifest.condition,
            segmentation: resolve(manifest.segmentation),
            regions: resolve(manifest.regions),
            raw: resolve(manifest.raw),
            registration: resolve(manifest.registration),
            native_cluster_index: resolve(manifest.native_cluster_index),
        }
    }
}

/// Expands subject and experiment directories into subjects.
///
/// A directory holding `subject.yml` is a subject. Otherwise its immediate
/// sub-directories holding `subject.yml` are, in name order.
pub fn discover_subjects(paths: &[PathBuf]) -> Result<Vec<Subject>> {
    let mut subjects = Vec::new();
    for path in paths {
        if path.join(MANIFEST_FILE).is_file() {
            subjects.push(Subject::load(path)?);
            continue;
        }
        let children = common::file_utils::subdirectories(path).map_err(|e| Error::io(path, e))?;
        let before = subjects.len();
        for child in children {
            if child.join(MANIFEST_FILE).is_file() {
                subjects.push(Subject::load(&child)?);
            }
        }
        if subjects.len() == before {
            return Err(Error::Config(format!(
                "{} is neither a subject nor an experiment directory (no {MANIFEST_FILE} found)",
                path.display()
            )));
        }
        debug!(experiment = %path.display(), subjects = subjects.len() - before, "Expanded experiment");
    }

    let mut seen = BTreeSet::new();
    for s in &subjects {
        if !seen.insert(s.id.clone()) {
            return Err(Error::Config(format!("duplicate subject id {}", s.id)));
        }
    }
    Ok(subjects)
}
