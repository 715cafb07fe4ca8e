//! Wide per-cluster tables built from per-unit artifact records.
//!
//! Tables are a pure function of the records: nothing is mutated and any
//! unit without a usable record shows as `NA`, so tables can be rebuilt at
//! any time, including after partial failures upstream. Unreadable records
//! and records from another cluster index are not usable.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::artifacts::{
    peek_record, ArtifactLayout, BoxRecord, CountRecord, IndexedRecord, SubjectId, UnitKey,
    UnitState,
};
use crate::error::{Error, Result};

pub const NA: &str = "NA";

/// One subject's row identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRow {
    pub subject: SubjectId,
    pub condition: String,
}

impl SubjectRow {
    pub fn new(subject: SubjectId, condition: impl Into<String>) -> Self {
        Self {
            subject,
            condition: condition.into(),
        }
    }
}

/// Records available for one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitRecords {
    pub bbox: Option<BoxRecord>,
    pub count: Option<CountRecord>,
}

impl UnitRecords {
    fn count(&self) -> Option<&CountRecord> {
        self.count.as_ref().filter(|c| c.state == UnitState::Computed)
    }

    fn objects(&self) -> Option<f64> {
        self.count()?.objects.map(|n| n as f64)
    }

    fn volume_mm3(&self) -> Option<f64> {
        let bbox = self.bbox.as_ref().filter(|b| b.state == UnitState::Computed)?;
        bbox.volume_mm3
    }

    /// Fractional count in `region`. A computed record without the region
    /// holds no object there.
    fn region_objects(&self, region: u32) -> Option<f64> {
        Some(self.count()?.regions.get(&region).copied().unwrap_or(0.0))
    }

    fn region_volume_mm3(&self, region: u32) -> Option<f64> {
        Some(
            self.count()?
                .region_volumes_mm3
                .get(&region)
                .copied()
                .unwrap_or(0.0),
        )
    }
}

/// CSV table with a header row.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        write_csv_line(&mut out, &self.header);
        for row in &self.rows {
            write_csv_line(&mut out, row);
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        common::file_utils::write_atomic(path, self.to_csv().as_bytes()).map_err(|e| Error::io(path, e))
    }

    /// Cell under `column` in the row whose first cell is `sample`.
    pub fn cell(&self, sample: &str, column: &str) -> Option<&str> {
        let col = self.header.iter().position(|h| h == column)?;
        let row = self.rows.iter().find(|r| r[0] == sample)?;
        row.get(col).map(String::as_str)
    }
}

fn write_csv_line(out: &mut String, cells: &[String]) {
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if cell.contains([',', '"', '\n']) {
            let _ = write!(out, "\"{}\"", cell.replace('"', "\"\""));
        } else {
            out.push_str(cell);
        }
    }
    out.push('\n');
}

/// The three wide tables of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct WideTables {
    pub counts: Table,
    pub volumes: Table,
    pub densities: Table,
    pub region_mode: bool,
}

impl WideTables {
    /// Writes `cluster_*.csv` (or `region_*.csv` in region mode) into
    /// `output_dir`.
    pub fn write_all(&self, output_dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(output_dir).map_err(|e| Error::io(output_dir, e))?;
        let prefix = if self.region_mode { "region" } else { "cluster" };
        let mut written = Vec::with_capacity(3);
        for (name, table) in [
            ("counts", &self.counts),
            ("volumes", &self.volumes),
            ("densities", &self.densities),
        ] {
            let path = output_dir.join(format!("{prefix}_{name}.csv"));
            table.write(&path)?;
            written.push(path);
        }
        Ok(written)
    }
}

/// One line of a per-subject density file.
#[derive(Debug, Clone, PartialEq)]
pub struct DensityRow {
    pub subject: SubjectId,
    pub cluster: u32,
    pub count: Option<f64>,
    pub volume_mm3: Option<f64>,
}

impl DensityRow {
    pub fn density(&self) -> Option<f64> {
        density(self.count, self.volume_mm3)
    }
}

fn density(count: Option<f64>, volume: Option<f64>) -> Option<f64> {
    match (count, volume) {
        (Some(c), Some(v)) if v > 0.0 => Some(c / v),
        _ => None,
    }
}

fn format_count(value: Option<f64>) -> String {
    match value {
        Some(v) if v.fract() == 0.0 => format!("{}", v as u64),
        Some(v) => format!("{v:.4}"),
        None => NA.to_string(),
    }
}

fn format_volume(value: Option<f64>) -> String {
    value.map_or_else(|| NA.to_string(), |v| v.to_string())
}

fn format_density(value: Option<f64>, decimals: usize) -> String {
    value.map_or_else(|| NA.to_string(), |v| format!("{v:.decimals$}"))
}

/// Builds per-cluster tables from artifact records.
#[derive(Debug, Clone)]
pub struct RegionFractionAggregator {
    layout: ArtifactLayout,
    region_mode: bool,
    decimals: usize,
    index: Option<String>,
}

impl RegionFractionAggregator {
    pub fn new(layout: ArtifactLayout, region_mode: bool) -> Self {
        Self {
            layout,
            region_mode,
            decimals: 2,
            index: None,
        }
    }

    /// Only records stamped with this cluster index fingerprint are used.
    pub fn with_index(mut self, fingerprint: impl Into<String>) -> Self {
        self.index = Some(fingerprint.into());
        self
    }

    pub fn with_decimals(mut self, decimals: usize) -> Self {
        self.decimals = decimals;
        self
    }

    /// Reads whatever records exist for every (subject, cluster) pair. Files
    /// are never modified.
    pub fn collect(
        &self,
        subjects: &[SubjectRow],
        clusters: &[u32],
    ) -> Result<BTreeMap<UnitKey, UnitRecords>> {
        let mut records = BTreeMap::new();
        for row in subjects {
            for &cluster in clusters {
                let unit = UnitKey::new(row.subject.clone(), cluster);
                let found = UnitRecords {
                    bbox: self.usable(&self.layout.bbox_path(&unit)),
                    count: self.usable(&self.layout.count_path(&unit)),
                };
                records.insert(unit, found);
            }
        }
        Ok(records)
    }

    fn usable<T: DeserializeOwned + IndexedRecord>(&self, path: &Path) -> Option<T> {
        let record = match peek_record::<T>(path) {
            Ok(record) => record?,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable record, reporting NA");
                return None;
            }
        };
        match &self.index {
            Some(fingerprint) if !record.matches_index(fingerprint) => {
                warn!(path = %path.display(), "Record from another cluster index, reporting NA");
                None
            }
            _ => Some(record),
        }
    }

    /// Builds the wide tables. Rows are ordered by condition, keeping the
    /// given subject order within each condition.
    pub fn tables(
        &self,
        subjects: &[SubjectRow],
        clusters: &[u32],
        records: &BTreeMap<UnitKey, UnitRecords>,
    ) -> WideTables {
        let mut ordered: Vec<&SubjectRow> = subjects.iter().collect();
        ordered.sort_by(|a, b| a.condition.cmp(&b.condition));

        let missing = UnitRecords::default();
        let unit = |subject: &SubjectId, cluster: u32| {
            records
                .get(&UnitKey::new(subject.clone(), cluster))
                .unwrap_or(&missing)
        };

        let mut header = vec!["Samples".to_string(), "Conditions".to_string()];
        if self.region_mode {
            header.push("Regions".to_string());
        }
        header.extend(clusters.iter().map(|c| format!("Cluster_{c}")));

        let mut counts = Vec::new();
        let mut volumes = Vec::new();
        let mut densities = Vec::new();

        for row in ordered {
            let lead = vec![row.subject.to_string(), row.condition.clone()];

            if !self.region_mode {
                let cells: Vec<(Option<f64>, Option<f64>)> = clusters
                    .iter()
                    .map(|&c| {
                        let r = unit(&row.subject, c);
                        (r.objects(), r.volume_mm3())
                    })
                    .collect();
                self.push_rows(&lead, &cells, &mut counts, &mut volumes, &mut densities);
                continue;
            }

            let regions: BTreeSet<u32> = clusters
                .iter()
                .filter_map(|&c| unit(&row.subject, c).count())
                .flat_map(|c| c.regions.keys().chain(c.region_volumes_mm3.keys()).copied())
                .collect();

            if regions.is_empty() {
                let mut lead = lead.clone();
                lead.push(NA.to_string());
                let cells = vec![(None, None); clusters.len()];
                self.push_rows(&lead, &cells, &mut counts, &mut volumes, &mut densities);
                continue;
            }

            for region in regions {
                let mut lead = lead.clone();
                lead.push(region.to_string());
                let cells: Vec<(Option<f64>, Option<f64>)> = clusters
                    .iter()
                    .map(|&c| {
                        let r = unit(&row.subject, c);
                        (r.region_objects(region), r.region_volume_mm3(region))
                    })
                    .collect();
                self.push_rows(&lead, &cells, &mut counts, &mut volumes, &mut densities);
            }
        }

        WideTables {
            counts: Table {
                header: header.clone(),
                rows: counts,
            },
            volumes: Table {
                header: header.clone(),
                rows: volumes,
            },
            densities: Table {
                header,
                rows: densities,
            },
            region_mode: self.region_mode,
        }
    }

    fn push_rows(
        &self,
        lead: &[String],
        cells: &[(Option<f64>, Option<f64>)],
        counts: &mut Vec<Vec<String>>,
        volumes: &mut Vec<Vec<String>>,
        densities: &mut Vec<Vec<String>>,
    ) {
        let with_lead = |values: Vec<String>| lead.iter().cloned().chain(values).collect::<Vec<_>>();
        counts.push(with_lead(cells.iter().map(|&(c, _)| format_count(c)).collect()));
        volumes.push(with_lead(cells.iter().map(|&(_, v)| format_volume(v)).collect()));
        densities.push(with_lead(
            cells
                .iter()
                .map(|&(c, v)| format_density(density(c, v), self.decimals))
                .collect(),
        ));
    }

    /// Collects records and writes the wide tables into `output_dir`.
    pub fn write_tables(
        &self,
        subjects: &[SubjectRow],
        clusters: &[u32],
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let records = self.collect(subjects, clusters)?;
        let written = self.tables(subjects, clusters, &records).write_all(output_dir)?;
        info!(
            subjects = subjects.len(),
            clusters = clusters.len(),
            output_dir = %output_dir.display(),
            "Wrote cluster tables"
        );
        Ok(written)
    }

    pub fn density_rows(
        &self,
        subject: &SubjectId,
        clusters: &[u32],
        records: &BTreeMap<UnitKey, UnitRecords>,
    ) -> Vec<DensityRow> {
        clusters
            .iter()
            .map(|&cluster| {
                let unit = UnitKey::new(subject.clone(), cluster);
                let r = records.get(&unit);
                DensityRow {
                    subject: subject.clone(),
                    cluster,
                    count: r.and_then(UnitRecords::objects),
                    volume_mm3: r.and_then(UnitRecords::volume_mm3),
                }
            })
            .collect()
    }

    pub fn density_table(&self, rows: &[DensityRow]) -> Table {
        Table {
            header: ["subject", "cluster", "count", "volume", "density"]
                .map(String::from)
                .to_vec(),
            rows: rows
                .iter()
                .map(|r| {
                    vec![
                        r.subject.to_string(),
                        r.cluster.to_string(),
                        format_count(r.count),
                        format_volume(r.volume_mm3),
                        format_density(r.density(), self.decimals),
                    ]
                })
                .collect(),
        }
    }

    /// Writes `<subject>_densities.csv` into the subject's work directory.
    pub fn write_subject_densities(&self, subject: &SubjectId, clusters: &[u32]) -> Result<PathBuf> {
        let row = SubjectRow::new(subject.clone(), "");
        let records = self.collect(std::slice::from_ref(&row), clusters)?;
        let table = self.density_table(&self.density_rows(subject, clusters, &records));
        let path = self.layout.density_csv_path(subject);
        table.write(&path)?;
        Ok(path)
    }
}
