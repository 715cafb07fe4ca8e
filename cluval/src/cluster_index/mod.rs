//! Statistic map to size-ordered cluster index.
//!
//! Larger statistic values are more significant. A voxel survives a direct
//! threshold when it is non-zero and `>= threshold`, so `1 - p`, t and z maps
//! all work; zero is background. FDR assumes a `1 - p` map.

mod fdr;


use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use common::FileFormat;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::volume::io::{read_volume, write_volume};
use crate::volume::{label_components, BoundingBox, Connectivity, ValueMode, Volume};

pub use fdr::fdr_threshold;

/// How the significance cut-off is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Significance {
    /// Keep voxels whose statistic is at least this value.
    Statistic(f32),
    /// Benjamini-Hochberg false discovery rate target.
    Fdr(f64),
}

impl Default for Significance {
    fn default() -> Self {
        Significance::Statistic(0.95)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterParams {
    pub significance: Significance,
    /// Components with fewer voxels are discarded.
    pub min_cluster_size: usize,
    pub connectivity: Connectivity,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            significance: Significance::default(),
            min_cluster_size: 100,
            connectivity: Connectivity::TwentySix,
        }
    }
}

impl ClusterParams {
    pub fn validate(&self) -> Result<()> {
        match self.significance {
            Significance::Statistic(t) => {
                if !t.is_finite() {
                    return Err(Error::Config(format!("statistic threshold must be finite, got {t}")));
                }
            }
            Significance::Fdr(q) => {
                if !q.is_finite() || q <= 0.0 || q >= 1.0 {
                    return Err(Error::Config(format!(
                        "FDR q must be in (0, 1), got {q}"
                    )));
                }
            }
        }
        if self.min_cluster_size == 0 {
            return Err(Error::Config("min_cluster_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// One surviving cluster in reference space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub label: u32,
    pub voxel_count: usize,
    pub volume_mm3: f64,
    pub bbox: BoundingBox,
    pub peak: Option<f32>,
    /// Mean voxel coordinate.
    pub centroid: [f64; 3],
}

#[derive(Debug, Clone)]
pub struct ClusterIndex {
    labels: Volume<u32>,
    clusters: Vec<ClusterSummary>,
    threshold: Option<f32>,
    fingerprint: String,
}

impl ClusterIndex {
    fn new(labels: Volume<u32>, clusters: Vec<ClusterSummary>, threshold: Option<f32>) -> Self {
        let fingerprint = fingerprint(&labels);
        Self {
            labels,
            clusters,
            threshold,
            fingerprint,
        }
    }

    /// Wraps an existing label volume, e.g. one read back without its
    /// sidecar. Peak values are unknown.
    pub fn from_labels(labels: Volume<u32>, threshold: Option<f32>) -> Self {
        let voxel_volume = labels.voxel_volume_mm3();
        let mut sums: BTreeMap<u32, (usize, [f64; 3])> = BTreeMap::new();
        for (idx, &label) in labels.voxels().iter().enumerate() {
            if label == 0 {
                continue;
            }
            let [x, y, z] = labels.coords_of(idx);
            let entry = sums.entry(label).or_insert((0, [0.0; 3]));
            entry.0 += 1;
            entry.1[0] += x as f64;
            entry.1[1] += y as f64;
            entry.1[2] += z as f64;
        }
        let boxes = labels.label_bounding_boxes();
        let clusters = sums
            .into_iter()
            .filter_map(|(label, (count, sum))| {
                let bbox = *boxes.get(&(label as u64))?;
                Some(ClusterSummary {
                    label,
                    voxel_count: count,
                    volume_mm3: count as f64 * voxel_volume,
                    bbox,
                    peak: None,
                    centroid: sum.map(|s| s / count as f64),
                })
            })
            .collect();
        Self::new(labels, clusters, threshold)
    }

    /// Writes the label volume, a JSON sidecar with the summaries and the
    /// summary CSV next to it.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_volume(path, &self.labels)?;
        let sidecar = IndexSidecar {
            threshold: self.threshold,
            clusters: self.clusters.clone(),
        };
        let json = common::serialize(&sidecar, FileFormat::Json).map_err(|source| Error::Serde {
            path: sidecar_path(path),
            source,
        })?;
        common::file_utils::write_atomic(&sidecar_path(path), json.as_bytes())
            .map_err(|e| Error::io(sidecar_path(path), e))?;
        self.write_summary(&summary_path(path))
    }

    /// Reads a label volume written by [`ClusterIndex::save`]. Without a
    /// sidecar, summaries are rebuilt from the labels.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::MissingArtifact {
                path: path.to_path_buf(),
            });
        }
        let labels: Volume<u32> = read_volume(path)?;
        let sidecar = sidecar_path(path);
        match std::fs::read_to_string(&sidecar) {
            Ok(text) => {
                let meta: IndexSidecar = common::deserialize(&text, FileFormat::Json).map_err(
                    |e| Error::CorruptArtifact {
                        path: sidecar.clone(),
                        reason: e.to_string(),
                    },
                )?;
                Ok(Self::new(labels, meta.clusters, meta.threshold))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %sidecar.display(), "Cluster index sidecar missing, rebuilding summaries");
                Ok(Self::from_labels(labels, None))
            }
            Err(e) => Err(Error::io(sidecar, e)),
        }
    }

    #[inline]
    pub fn labels(&self) -> &Volume<u32> {
        &self.labels
    }

    #[inline]
    pub fn clusters(&self) -> &[ClusterSummary] {
        &self.clusters
    }

    #[inline]
    pub fn num_clusters(&self) -> usize {
        self.clusters.len()
    }

    /// Content hash of the label volume. Artifacts derived from the index
    /// carry it so they can be told apart from those of a rebuilt index.
    #[inline]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Statistic value the map was cut at, when known.
    #[inline]
    pub fn threshold(&self) -> Option<f32> {
        self.threshold
    }

    /// Summary table with one row per cluster.
    pub fn summary_csv(&self) -> String {
        let mut out = String::from(
            "Cluster,Voxels,Volume_mm3,Peak,Centroid_x,Centroid_y,Centroid_z,Xmin,Xsize,Ymin,Ysize,Zmin,Zsize\n",
        );
        for c in &self.clusters {
            let [a, b, d, e, f, g] = c.bbox.to_array();
            let _ = writeln!(
                out,
                "{},{},{:.4},{},{:.2},{:.2},{:.2},{a},{b},{d},{e},{f},{g}",
                c.label,
                c.voxel_count,
                c.volume_mm3,
                c.peak
                    .map(|p| format!("{p:.4}"))
                    .unwrap_or_else(|| "NA".to_string()),
                c.centroid[0],
                c.centroid[1],
                c.centroid[2],
            );
        }
        out
    }

    pub fn write_summary(&self, path: &Path) -> Result<()> {
        common::file_utils::write_atomic(path, self.summary_csv().as_bytes())
            .map_err(|e| Error::io(path, e))
    }
}

/// First 16 hex digits of the SHA-256 over shape, spacing and labels.
/// Spacing is hashed at the precision NIfTI stores it.
fn fingerprint(labels: &Volume<u32>) -> String {
    let mut hasher = Sha256::new();
    for d in labels.dims() {
        hasher.update((d as u64).to_le_bytes());
    }
    for s in labels.spacing() {
        hasher.update((s as f32).to_le_bytes());
    }
    for &label in labels.voxels() {
        hasher.update(label.to_le_bytes());
    }
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(16);
    hex
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexSidecar {
    threshold: Option<f32>,
    clusters: Vec<ClusterSummary>,
}

/// `cluster_index.nii.gz` -> `cluster_index.json`.
fn sidecar_path(path: &Path) -> PathBuf {
    path.with_file_name(format!("{}.json", volume_stem(path)))
}

/// `cluster_index.nii.gz` -> `cluster_index_summary.csv`.
fn summary_path(path: &Path) -> PathBuf {
    path.with_file_name(format!("{}_summary.csv", volume_stem(path)))
}

fn volume_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("cluster_index");
    name.trim_end_matches(".gz")
        .trim_end_matches(".nii")
        .to_string()
}

#[derive(Debug, Clone)]
pub struct ClusterIndexBuilder {
    params: ClusterParams,
}

impl ClusterIndexBuilder {
    pub fn new(params: ClusterParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &ClusterParams {
        &self.params
    }

    /// Thresholds `statistic` (restricted to `mask` when given), labels the
    /// surviving voxels and relabels components by size, largest first.
    ///
    /// Ties in size go to the component whose first voxel comes earlier in
    /// raster order, so numbering is reproducible across runs and across
    /// different minimum-size cut-offs.
    pub fn build(&self, statistic: &Volume<f32>, mask: Option<&Volume<u8>>) -> Result<ClusterIndex> {
        let masked = match mask {
            Some(m) => statistic
                .mask(m)
                .map_err(|e| Error::Config(format!("statistic mask: {e}")))?,
            None => statistic.clone(),
        };

        let threshold = match self.params.significance {
            Significance::Statistic(t) => t,
            Significance::Fdr(q) => {
                fdr_threshold(masked.voxels(), q).ok_or_else(|| Error::InsufficientSignal {
                    reason: format!("no voxel passes FDR q={q}"),
                })?
            }
        };
        debug!(threshold, "Statistic threshold");

        let survivors = masked.map(|&v| u8::from(v != 0.0 && v >= threshold));
        let components = label_components(&survivors, self.params.connectivity, ValueMode::AnyNonZero);

        let mut kept: Vec<_> = components
            .components()
            .iter()
            .filter(|c| c.voxel_count >= self.params.min_cluster_size)
            .copied()
            .collect();
        kept.sort_by(|a, b| {
            b.voxel_count
                .cmp(&a.voxel_count)
                .then(a.first_voxel.cmp(&b.first_voxel))
        });

        if kept.is_empty() {
            return Err(Error::InsufficientSignal {
                reason: format!(
                    "no cluster of at least {} voxels at threshold {threshold}",
                    self.params.min_cluster_size
                ),
            });
        }

        let mut remap = vec![0u32; components.num_labels() + 1];
        for (new, c) in kept.iter().enumerate() {
            remap[c.label as usize] = new as u32 + 1;
        }

        let provisional = components.labels();
        let labels = provisional.map(|&l| remap[l as usize]);

        let mut peak = vec![f32::MIN; kept.len() + 1];
        let mut sums = vec![[0f64; 3]; kept.len() + 1];
        for (idx, &label) in labels.voxels().iter().enumerate() {
            if label == 0 {
                continue;
            }
            let l = label as usize;
            peak[l] = peak[l].max(masked.voxels()[idx]);
            let [x, y, z] = labels.coords_of(idx);
            sums[l][0] += x as f64;
            sums[l][1] += y as f64;
            sums[l][2] += z as f64;
        }

        let voxel_volume = statistic.voxel_volume_mm3();
        let clusters: Vec<ClusterSummary> = kept
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let l = i + 1;
                let n = c.voxel_count as f64;
                ClusterSummary {
                    label: l as u32,
                    voxel_count: c.voxel_count,
                    volume_mm3: n * voxel_volume,
                    bbox: c.bbox,
                    peak: Some(peak[l]),
                    centroid: sums[l].map(|s| s / n),
                }
            })
            .collect();

        info!(
            clusters = clusters.len(),
            discarded = components.num_labels() - clusters.len(),
            threshold,
            "Built cluster index"
        );

        Ok(ClusterIndex::new(labels, clusters, Some(threshold)))
    }
}
