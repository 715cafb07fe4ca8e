//! Batch driver over subjects and clusters.
//!
//! Subjects are processed one after another. A subject that cannot be
//! processed is skipped or marked failed and the batch moves on; only
//! configuration errors stop a batch, and an artifact that cannot be read or
//! written fails only its own unit. Every per-unit result is persisted and
//! stamped with the cluster index fingerprint, so a rerun redoes only units
//! whose records are missing, not `Computed`, or from another index.

mod manifest;
mod selection;


use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::aggregate::{RegionFractionAggregator, SubjectRow};
use crate::artifacts::{
    read_indexed_record, write_record, ArtifactLayout, CountRecord, RecordRead, SourceKind,
    SubjectId, UnitKey, UnitState,
};
use crate::cluster_index::{ClusterIndex, ClusterIndexBuilder};
use crate::config::PipelineConfig;
use crate::counting::{
    region_volumes_mm3, Accelerator, AcceleratorWorker, AdaptiveObjectCounter, CountInput,
    CountMode, CpuCounter, Provenance, RegionWeighting,
};
use crate::crop::{cluster_mask, extract, BoundingBoxCropper, BoxOutcome, ABSENT_REASON};
use crate::error::{Error, Result};
use crate::projection::{AffineTransformProvider, GridSpec, RegistrationBundle, SpatialProjector};
use crate::volume::io::{read_volume, write_volume};
use crate::volume::{BoundingBox, Volume};

pub use manifest::{discover_subjects, Subject, SubjectManifest, MANIFEST_FILE};
pub use selection::ClusterSelection;

pub const CLUSTER_INDEX_FILE: &str = "cluster_index.nii.gz";

/// What happened to one subject in a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum SubjectOutcome {
    Processed {
        /// Units counted in this run.
        counted: usize,
        /// Units whose count record was already computed.
        reused: usize,
        /// Units recorded as failed (including absent clusters).
        failed: usize,
    },
    /// Inputs are missing; nothing was attempted.
    Skipped { reason: String },
    /// The subject could not be processed; its units are recorded as failed.
    Failed { reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub outcomes: Vec<(SubjectId, SubjectOutcome)>,
    pub clusters: Vec<u32>,
    pub tables: Vec<PathBuf>,
}

impl BatchSummary {
    pub fn processed(&self) -> usize {
        self.count(|o| matches!(o, SubjectOutcome::Processed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, SubjectOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, SubjectOutcome::Failed { .. }))
    }

    pub fn outcome(&self, subject: &str) -> Option<&SubjectOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id.as_str() == subject)
            .map(|(_, o)| o)
    }

    fn count(&self, pred: impl Fn(&SubjectOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

enum UnitOutcome {
    Counted,
    Reused,
    Failed,
}

/// Native-space inputs of one subject.
struct SubjectVolumes {
    native_index: Volume<u32>,
    segmentation: Volume<u32>,
    regions: Option<Volume<u32>>,
    raw: Option<Volume<f32>>,
}

pub struct Pipeline {
    config: PipelineConfig,
    layout: ArtifactLayout,
    cropper: BoundingBoxCropper,
    counter: AdaptiveObjectCounter,
    // Kept alive for the counter's handle; joined on drop.
    _worker: Option<AcceleratorWorker>,
}

impl Pipeline {
    /// Validates `config` and starts the configured accelerator.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let accelerator = config.accelerator.build()?;
        Self::with_accelerator(config, accelerator)
    }

    /// Like [`Pipeline::new`] with a caller-supplied accelerator.
    pub fn with_accelerator(
        config: PipelineConfig,
        accelerator: Option<Box<dyn Accelerator>>,
    ) -> Result<Self> {
        config.validate()?;
        let worker = accelerator.map(AcceleratorWorker::spawn);
        let counter = AdaptiveObjectCounter::new(
            worker.as_ref().map(AcceleratorWorker::handle),
            Box::new(CpuCounter),
        )
        .with_params(config.counting.subdivision())?
        .with_detector(config.counting.detector())
        .with_connectivity(config.counting.connectivity)
        .with_mode(config.counting.count_mode());

        let layout = ArtifactLayout::new(&config.output.work_dir);
        Ok(Self {
            cropper: BoundingBoxCropper::new(layout.clone()),
            layout,
            counter,
            config,
            _worker: worker,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn cropper(&self) -> &BoundingBoxCropper {
        &self.cropper
    }

    pub fn index_path(&self) -> PathBuf {
        self.config.output.output_dir.join(CLUSTER_INDEX_FILE)
    }

    /// Builds the reference-space cluster index from a statistic map and
    /// writes it with its summary into the output directory.
    pub fn build_index(&self, statistic: &Path, mask: Option<&Path>) -> Result<ClusterIndex> {
        let statistic: Volume<f32> = read_volume(statistic)?;
        let mask = mask.map(read_volume::<u8>).transpose()?;
        let index = ClusterIndexBuilder::new(self.config.cluster)?.build(&statistic, mask.as_ref())?;
        let path = self.index_path();
        index.save(&path)?;
        info!(path = %path.display(), clusters = index.num_clusters(), "Saved cluster index");
        Ok(index)
    }

    /// Processes every subject, then writes per-subject density files and
    /// the aggregated tables.
    pub fn run(
        &self,
        index: &ClusterIndex,
        subjects: &[Subject],
        selection: &ClusterSelection,
    ) -> Result<BatchSummary> {
        let clusters = selection.resolve(index.num_clusters());
        info!(
            subjects = subjects.len(),
            clusters = clusters.len(),
            selection = %selection,
            "Starting batch"
        );

        let mut summary = BatchSummary {
            clusters: clusters.clone(),
            ..BatchSummary::default()
        };
        for subject in subjects {
            let outcome = match self.process_subject(index, subject, &clusters)? {
                SubjectOutcome::Processed {
                    counted,
                    reused,
                    failed,
                } => {
                    info!(subject = %subject.id, counted, reused, failed, "Subject processed");
                    match self
                        .aggregator(index)
                        .write_subject_densities(&subject.id, &clusters)
                    {
                        Ok(_) => SubjectOutcome::Processed {
                            counted,
                            reused,
                            failed,
                        },
                        Err(e) => {
                            warn!(subject = %subject.id, error = %e, "Could not write subject densities");
                            SubjectOutcome::Failed {
                                reason: format!("writing densities: {e}"),
                            }
                        }
                    }
                }
                SubjectOutcome::Skipped { reason } => {
                    warn!(subject = %subject.id, reason = %reason, "Subject skipped");
                    SubjectOutcome::Skipped { reason }
                }
                SubjectOutcome::Failed { reason } => {
                    warn!(subject = %subject.id, reason = %reason, "Subject failed");
                    SubjectOutcome::Failed { reason }
                }
            };
            summary.outcomes.push((subject.id.clone(), outcome));
        }

        summary.tables = self.write_tables(index, subjects, &clusters)?;
        info!(
            processed = summary.processed(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            "Batch finished"
        );
        Ok(summary)
    }

    /// Rebuilds the wide tables from whatever records of `index` exist.
    pub fn write_tables(
        &self,
        index: &ClusterIndex,
        subjects: &[Subject],
        clusters: &[u32],
    ) -> Result<Vec<PathBuf>> {
        let rows: Vec<SubjectRow> = subjects
            .iter()
            .map(|s| SubjectRow::new(s.id.clone(), s.condition.clone()))
            .collect();
        self.aggregator(index)
            .write_tables(&rows, clusters, &self.config.output.output_dir)
    }

    fn aggregator(&self, index: &ClusterIndex) -> RegionFractionAggregator {
        RegionFractionAggregator::new(self.layout.clone(), self.counter.mode().is_region_mode())
            .with_decimals(self.config.output.density_decimals)
            .with_index(index.fingerprint())
    }

    /// Errors returned from here abort the batch; everything that concerns
    /// only this subject becomes its outcome.
    fn process_subject(
        &self,
        index: &ClusterIndex,
        subject: &Subject,
        clusters: &[u32],
    ) -> Result<SubjectOutcome> {
        if let Some(reason) = self.missing_inputs(subject) {
            return Ok(SubjectOutcome::Skipped { reason });
        }

        let fingerprint = index.fingerprint();
        let prepared = self.load_subject(index, subject).and_then(|volumes| {
            let boxes = self.cropper.bounding_boxes(
                &subject.id,
                &volumes.native_index,
                clusters,
                fingerprint,
            )?;
            Ok((volumes, boxes))
        });
        let (volumes, boxes) = match prepared {
            Ok(prepared) => prepared,
            Err(e) if e.is_config() => return Err(e),
            Err(e) => {
                let reason = e.to_string();
                for &cluster in clusters {
                    let unit = UnitKey::new(subject.id.clone(), cluster);
                    if !matches!(self.is_counted(&unit, fingerprint), Ok(true)) {
                        self.record_failure(&unit, fingerprint, &reason);
                    }
                }
                return Ok(SubjectOutcome::Failed { reason });
            }
        };

        let (mut counted, mut reused, mut failed) = (0, 0, 0);
        for &cluster in clusters {
            let unit = UnitKey::new(subject.id.clone(), cluster);
            match self.process_unit(&unit, fingerprint, &volumes, &boxes[&cluster]) {
                Ok(UnitOutcome::Counted) => counted += 1,
                Ok(UnitOutcome::Reused) => reused += 1,
                Ok(UnitOutcome::Failed) => failed += 1,
                Err(e) if e.is_config() => return Err(e),
                Err(e) => {
                    warn!(unit = %unit, error = %e, "Unit failed");
                    self.record_failure(&unit, fingerprint, &e.to_string());
                    failed += 1;
                }
            }
        }

        Ok(SubjectOutcome::Processed {
            counted,
            reused,
            failed,
        })
    }

    fn process_unit(
        &self,
        unit: &UnitKey,
        fingerprint: &str,
        volumes: &SubjectVolumes,
        bbox: &BoxOutcome,
    ) -> Result<UnitOutcome> {
        if self.is_counted(unit, fingerprint)? {
            return Ok(UnitOutcome::Reused);
        }

        let record = match *bbox {
            BoxOutcome::Absent => CountRecord::failed(ABSENT_REASON),
            BoxOutcome::Present { bbox, .. } => match self.count_unit(unit, volumes, &bbox) {
                Ok(record) => record,
                Err(e) if e.is_config() => return Err(e),
                Err(e) => {
                    warn!(unit = %unit, error = %e, "Counting failed");
                    CountRecord::failed(e.to_string())
                }
            },
        };

        let outcome = if record.state == UnitState::Computed {
            UnitOutcome::Counted
        } else {
            UnitOutcome::Failed
        };
        write_record(&self.layout.count_path(unit), &record.for_index(fingerprint))?;
        Ok(outcome)
    }

    /// The unit is failed either way; a record that cannot be written only
    /// means the tables show `NA` for it.
    fn record_failure(&self, unit: &UnitKey, fingerprint: &str, reason: &str) {
        let record = CountRecord::failed(reason).for_index(fingerprint);
        if let Err(e) = write_record(&self.layout.count_path(unit), &record) {
            warn!(unit = %unit, error = %e, "Could not record unit failure");
        }
    }

    fn missing_inputs(&self, subject: &Subject) -> Option<String> {
        let missing = |label: &str, path: &Option<PathBuf>| match path {
            None => Some(format!("no {label} in manifest")),
            Some(p) if !p.is_file() => Some(format!("{label} {} not found", p.display())),
            Some(_) => None,
        };

        if let Some(reason) = missing("segmentation", &subject.segmentation) {
            return Some(reason);
        }
        if subject.native_cluster_index.is_none() {
            if let Some(reason) = missing("registration", &subject.registration) {
                return Some(reason);
            }
        }
        if let CountMode::RegionFractions { weighting } = self.counter.mode() {
            if let Some(reason) = missing("regions", &subject.regions) {
                return Some(reason);
            }
            if weighting == RegionWeighting::Intensity {
                if let Some(reason) = missing("raw", &subject.raw) {
                    return Some(reason);
                }
            }
        }
        None
    }

    fn is_counted(&self, unit: &UnitKey, fingerprint: &str) -> Result<bool> {
        let path = self.layout.count_path(unit);
        Ok(match read_indexed_record::<CountRecord>(&path, fingerprint)? {
            RecordRead::Present(record) => record.state == UnitState::Computed,
            RecordRead::Missing | RecordRead::Purged => false,
        })
    }

    fn load_subject(&self, index: &ClusterIndex, subject: &Subject) -> Result<SubjectVolumes> {
        let segmentation_path = subject
            .segmentation
            .as_deref()
            .ok_or_else(|| Error::MissingArtifact {
                path: subject.dir.join("segmentation"),
            })?;
        let segmentation: Volume<u32> = read_volume(segmentation_path)?;
        let native_index = self.native_index(index, subject, &GridSpec::of(&segmentation))?;
        segmentation.check_shape(native_index.dims())?;

        let regions: Option<Volume<u32>> = subject.regions.as_deref().map(read_volume).transpose()?;
        if let Some(regions) = &regions {
            segmentation.check_shape(regions.dims())?;
        }
        let raw: Option<Volume<f32>> = subject.raw.as_deref().map(read_volume).transpose()?;
        if let Some(raw) = &raw {
            segmentation.check_shape(raw.dims())?;
        }

        Ok(SubjectVolumes {
            native_index,
            segmentation,
            regions,
            raw,
        })
    }

    /// The cluster index in the subject's native space, from the manifest,
    /// the work directory cache, or a fresh projection.
    fn native_index(&self, index: &ClusterIndex, subject: &Subject, native: &GridSpec) -> Result<Volume<u32>> {
        if let Some(path) = &subject.native_cluster_index {
            return read_volume(path);
        }

        let bundle_path = subject
            .registration
            .as_deref()
            .ok_or_else(|| Error::MissingArtifact {
                path: subject.dir.join("registration"),
            })?;
        let mut bundle = RegistrationBundle::load(bundle_path)?;
        if bundle.version.is_empty() {
            bundle.version = self.config.projection.transform_version.clone();
        }

        let cached = self
            .layout
            .native_index_path(&subject.id, &bundle.version, index.fingerprint());
        common::file_utils::remove_if_empty(&cached).map_err(|e| Error::io(&cached, e))?;
        if cached.is_file() {
            info!(subject = %subject.id, path = %cached.display(), "Reusing native cluster index");
            return read_volume(&cached);
        }

        let provider = AffineTransformProvider::new(&bundle);
        let projector = SpatialProjector::new(&provider, bundle.grid)?;
        let labels = projector.labels_to_native(index.labels(), native)?;
        labels.write(&cached)?;
        info!(
            subject = %subject.id,
            version = %bundle.version,
            bit_depth = %labels.bit_depth(),
            "Projected cluster index to native space"
        );
        Ok(labels.to_u32())
    }

    fn count_unit(&self, unit: &UnitKey, volumes: &SubjectVolumes, bbox: &BoundingBox) -> Result<CountRecord> {
        let mask = cluster_mask(&volumes.native_index, unit.cluster, bbox)?;
        let segmentation = extract(&volumes.segmentation, bbox)?;
        let regions = volumes.regions.as_ref().map(|r| extract(r, bbox)).transpose()?;
        let raw = volumes.raw.as_ref().map(|r| extract(r, bbox)).transpose()?;

        if self.config.output.keep_crops {
            let mask_path = self.layout.crop_path(&unit.crop(SourceKind::Clusters));
            common::file_utils::remove_if_empty(&mask_path).map_err(|e| Error::io(&mask_path, e))?;
            if !mask_path.exists() {
                write_volume(&mask_path, &mask)?;
            }
            self.cropper
                .materialize(&unit.crop(SourceKind::Segmentation), &volumes.segmentation, bbox)?;
            if let Some(r) = &volumes.regions {
                self.cropper.materialize(&unit.crop(SourceKind::Regions), r, bbox)?;
            }
            if let Some(r) = &volumes.raw {
                self.cropper.materialize(&unit.crop(SourceKind::Raw), r, bbox)?;
            }
        }

        let region_mode = self.counter.mode().is_region_mode();
        let intensity = match self.counter.mode() {
            CountMode::RegionFractions {
                weighting: RegionWeighting::Intensity,
            } => raw.as_ref(),
            _ => None,
        };
        let result = self.counter.count(&CountInput {
            cluster_mask: &mask,
            segmentation: &segmentation,
            regions: regions.as_ref().filter(|_| region_mode),
            intensity,
        })?;

        info!(
            subject = %unit.subject,
            cluster = unit.cluster,
            provenance = %result.provenance,
            objects = result.tally.objects,
            accelerator_calls = result.stats.accelerator_calls,
            leaves = result.stats.leaves,
            depth = result.stats.max_depth_reached,
            "Counted cluster"
        );

        let region_volumes_mm3 = match (&regions, region_mode) {
            (Some(r), true) => region_volumes_mm3(&mask, r)?,
            _ => BTreeMap::new(),
        };

        Ok(if result.is_complete() {
            CountRecord {
                state: UnitState::Computed,
                provenance: Some(result.provenance),
                objects: Some(result.tally.objects),
                regions: result.tally.regions,
                region_volumes_mm3,
                stats: result.stats,
                reason: None,
                index: None,
            }
        } else {
            CountRecord {
                provenance: Some(Provenance::Failed),
                stats: result.stats,
                ..CountRecord::failed(result.failure.unwrap_or_else(|| "count failed".to_string()))
            }
        })
    }
}
