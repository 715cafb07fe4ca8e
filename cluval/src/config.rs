//! Pipeline configuration loaded from YAML.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster_index::ClusterParams;
use crate::counting::{
    Accelerator, BudgetedAccelerator, CommandAccelerator, CountMode, ExhaustionDetector,
    RegionWeighting, SubdivisionParams, DEFAULT_EXHAUSTION_MARKERS,
};
use crate::error::{Error, Result};
use crate::volume::Connectivity;

pub const CONFIG_ENV_VAR: &str = "CLUVAL_CONFIG";

/// Locations searched, in order, after an explicit path and the environment
/// variable.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["cluval.yml", "config/cluval.yml"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub cluster: ClusterParams,
    pub counting: CountingConfig,
    pub accelerator: AcceleratorConfig,
    pub projection: ProjectionConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountingMode {
    #[default]
    CountOnly,
    RegionFractions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountingConfig {
    pub mode: CountingMode,
    pub weighting: RegionWeighting,
    pub chunk_slices: usize,
    pub max_depth: usize,
    pub min_slab_slices: usize,
    pub allow_fallback: bool,
    /// Connectivity of objects in the segmentation.
    pub connectivity: Connectivity,
    pub exhaustion_markers: Vec<String>,
}

impl Default for CountingConfig {
    fn default() -> Self {
        let subdivision = SubdivisionParams::default();
        Self {
            mode: CountingMode::default(),
            weighting: RegionWeighting::default(),
            chunk_slices: subdivision.chunk_slices,
            max_depth: subdivision.max_depth,
            min_slab_slices: subdivision.min_slab_slices,
            allow_fallback: subdivision.allow_fallback,
            connectivity: Connectivity::TwentySix,
            exhaustion_markers: DEFAULT_EXHAUSTION_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl CountingConfig {
    pub fn count_mode(&self) -> CountMode {
        match self.mode {
            CountingMode::CountOnly => CountMode::CountOnly,
            CountingMode::RegionFractions => CountMode::RegionFractions {
                weighting: self.weighting,
            },
        }
    }

    pub fn subdivision(&self) -> SubdivisionParams {
        SubdivisionParams {
            chunk_slices: self.chunk_slices,
            max_depth: self.max_depth,
            min_slab_slices: self.min_slab_slices,
            allow_fallback: self.allow_fallback,
        }
    }

    pub fn detector(&self) -> ExhaustionDetector {
        ExhaustionDetector::new(&self.exhaustion_markers)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AcceleratorKind {
    #[default]
    Budgeted,
    Command,
    /// Count everything with the unaccelerated counter.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    pub kind: AcceleratorKind,
    /// Largest job, in voxels, the budgeted accelerator accepts.
    pub voxel_budget: usize,
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            kind: AcceleratorKind::Budgeted,
            voxel_budget: 50_000_000,
            program: None,
            args: Vec::new(),
        }
    }
}

impl AcceleratorConfig {
    /// The configured accelerator, or `None` for [`AcceleratorKind::None`].
    pub fn build(&self) -> Result<Option<Box<dyn Accelerator>>> {
        Ok(match self.kind {
            AcceleratorKind::None => None,
            AcceleratorKind::Budgeted => Some(Box::new(BudgetedAccelerator::new(self.voxel_budget))),
            AcceleratorKind::Command => {
                let program = self.program.clone().ok_or_else(|| {
                    Error::Config("accelerator.program is required for the command accelerator".into())
                })?;
                Some(Box::new(CommandAccelerator::new(program, self.args.clone())))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Version used for registration bundles that do not name their own.
    pub transform_version: String,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            transform_version: "v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Per-subject artifacts.
    pub work_dir: PathBuf,
    /// Aggregated tables.
    pub output_dir: PathBuf,
    pub density_decimals: usize,
    /// Keep cropped volumes after a unit is counted.
    pub keep_crops: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("work"),
            output_dir: PathBuf::from("results"),
            density_decimals: 2,
            keep_crops: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_yaml(&text).map_err(|e| match e {
            Error::Config(reason) => Error::Config(format!("{}: {reason}", path.display())),
            other => other,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = common::serialize(self, common::FileFormat::Yaml).map_err(|source| Error::Serde {
            path: path.to_path_buf(),
            source,
        })?;
        common::file_utils::write_atomic(path, text.as_bytes()).map_err(|e| Error::io(path, e))
    }

    /// Loads the first configuration found, or defaults when none exists.
    /// Returns the config and notes about how it was resolved.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, Vec<String>)> {
        let mut notes = Vec::new();
        match find_config(explicit)? {
            Some(path) => {
                debug!(path = %path.display(), "Loading configuration");
                notes.push(format!("configuration loaded from {}", path.display()));
                Ok((Self::load(&path)?, notes))
            }
            None => {
                notes.push(format!(
                    "no configuration file found (searched {CONFIG_ENV_VAR} and {}), using defaults",
                    DEFAULT_CONFIG_PATHS.join(", ")
                ));
                let config = Self::default();
                config.validate()?;
                Ok((config, notes))
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        self.counting.subdivision().validate()?;
        if self.accelerator.kind == AcceleratorKind::Command && self.accelerator.program.is_none() {
            return Err(Error::Config(
                "accelerator.program is required for the command accelerator".into(),
            ));
        }
        if self.accelerator.kind == AcceleratorKind::None && !self.counting.allow_fallback {
            return Err(Error::Config(
                "counting.allow_fallback must be true when no accelerator is configured".into(),
            ));
        }
        if self.accelerator.kind != AcceleratorKind::None && self.counting.exhaustion_markers.is_empty() {
            return Err(Error::Config("counting.exhaustion_markers must not be empty".into()));
        }
        if self.output.density_decimals > 12 {
            return Err(Error::Config(format!(
                "output.density_decimals must be at most 12, got {}",
                self.output.density_decimals
            )));
        }
        Ok(())
    }
}

/// Explicit path, then `$CLUVAL_CONFIG`, then the default locations. An
/// explicit or environment path that does not exist is an error.
pub fn find_config(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    let named = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));
    if let Some(path) = named {
        if !path.is_file() {
            return Err(Error::Config(format!(
                "configuration file {} does not exist",
                path.display()
            )));
        }
        return Ok(Some(path));
    }
    Ok(DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file()))
}
