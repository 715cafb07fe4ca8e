//! 3D connected component labeling using union-find.
//!
//! Two-pass raster scan (x fastest, then y, then z):
//! - First pass assigns provisional labels and records equivalences with
//!   already-visited neighbors
//! - Second pass flattens equivalences to sequential labels
//!
//! Provisional labels are created in raster order and unions keep the smaller
//! root, so final labels are numbered by the raster index of each component's
//! first voxel. Downstream tie-breaking relies on this ordering.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::bbox::Extents;
use super::{BoundingBox, Voxel, Volume};

/// Neighborhood used to connect voxels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Connectivity {
    /// Face neighbors.
    Six,
    /// Face and edge neighbors.
    Eighteen,
    /// Face, edge and corner neighbors.
    #[default]
    TwentySix,
}

impl TryFrom<u8> for Connectivity {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            6 => Ok(Connectivity::Six),
            18 => Ok(Connectivity::Eighteen),
            26 => Ok(Connectivity::TwentySix),
            other => Err(format!("connectivity must be 6, 18 or 26, got {other}")),
        }
    }
}

impl From<Connectivity> for u8 {
    fn from(value: Connectivity) -> Self {
        match value {
            Connectivity::Six => 6,
            Connectivity::Eighteen => 18,
            Connectivity::TwentySix => 26,
        }
    }
}

impl Connectivity {
    /// Offsets to neighbors that precede a voxel in raster order.
    fn backward_offsets(self) -> Vec<[isize; 3]> {
        let max_manhattan = match self {
            Connectivity::Six => 1,
            Connectivity::Eighteen => 2,
            Connectivity::TwentySix => 3,
        };
        let mut offsets = Vec::with_capacity(13);
        for dz in -1isize..=0 {
            for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    let precedes = dz < 0 || (dz == 0 && (dy < 0 || (dy == 0 && dx < 0)));
                    let manhattan = dx.abs() + dy.abs() + dz.abs();
                    if precedes && manhattan <= max_manhattan {
                        offsets.push([dx, dy, dz]);
                    }
                }
            }
        }
        offsets
    }
}

/// Which neighboring voxels may join the same component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueMode {
    /// Any two non-zero neighbors connect (binary segmentation).
    #[default]
    AnyNonZero,
    /// Neighbors connect only when their values are equal (labeled
    /// segmentation, where touching objects carry distinct IDs).
    MatchValues,
}

/// Per-component statistics gathered during labeling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Component {
    pub label: u32,
    pub voxel_count: usize,
    /// Raster index of the first voxel encountered.
    pub first_voxel: usize,
    pub bbox: BoundingBox,
}

#[derive(Debug)]
pub struct ComponentLabels {
    labels: Volume<u32>,
    components: Vec<Component>,
}

impl ComponentLabels {
    /// Number of connected components (excluding background).
    #[inline]
    pub fn num_labels(&self) -> usize {
        self.components.len()
    }

    #[inline]
    pub fn labels(&self) -> &Volume<u32> {
        &self.labels
    }

    pub fn into_labels(self) -> Volume<u32> {
        self.labels
    }

    /// Components ordered by label (label `i` at index `i - 1`).
    #[inline]
    pub fn components(&self) -> &[Component] {
        &self.components
    }
}

/// Labels connected non-zero voxels of `volume`.
pub fn label_components<T: Voxel>(
    volume: &Volume<T>,
    connectivity: Connectivity,
    mode: ValueMode,
) -> ComponentLabels {
    let [w, h, d] = volume.dims();
    let mut labels: Volume<u32> = Volume::new_default(volume.dims(), volume.spacing());
    if volume.is_empty() {
        return ComponentLabels {
            labels,
            components: Vec::new(),
        };
    }

    let offsets = connectivity.backward_offsets();
    let values = volume.voxels();
    let mut uf = UnionFind::new();

    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                let idx = volume.index_of(x, y, z);
                let value = values[idx];
                if !value.is_nonzero() {
                    continue;
                }

                let mut assigned = 0u32;
                for &[dx, dy, dz] in &offsets {
                    let (nx, ny, nz) = (x as isize + dx, y as isize + dy, z as isize + dz);
                    if nx < 0 || ny < 0 || nz < 0 || nx >= w as isize || ny >= h as isize {
                        continue;
                    }
                    let nidx = volume.index_of(nx as usize, ny as usize, nz as usize);
                    let neighbor = labels.voxels()[nidx];
                    if neighbor == 0 {
                        continue;
                    }
                    if mode == ValueMode::MatchValues && values[nidx] != value {
                        continue;
                    }
                    if assigned == 0 {
                        assigned = neighbor;
                    } else if assigned != neighbor {
                        uf.union(assigned, neighbor);
                    }
                }

                if assigned == 0 {
                    assigned = uf.make_set();
                }
                labels.voxels_mut()[idx] = assigned;
            }
        }
    }

    let num_labels = uf.flatten_labels(labels.voxels_mut());
    let components = collect_components(&labels, num_labels);

    ComponentLabels { labels, components }
}

fn collect_components(labels: &Volume<u32>, num_labels: usize) -> Vec<Component> {
    let mut counts = vec![0usize; num_labels + 1];
    let mut first = vec![usize::MAX; num_labels + 1];
    let mut extents: Vec<Option<Extents>> = vec![None; num_labels + 1];

    for (idx, &label) in labels.voxels().iter().enumerate() {
        if label == 0 {
            continue;
        }
        let l = label as usize;
        let [x, y, z] = labels.coords_of(idx);
        counts[l] += 1;
        if first[l] == usize::MAX {
            first[l] = idx;
        }
        match extents[l].as_mut() {
            Some(e) => e.include(x, y, z),
            None => extents[l] = Some(Extents::new(x, y, z)),
        }
    }

    (1..=num_labels)
        .filter_map(|l| {
            extents[l].map(|e| Component {
                label: l as u32,
                voxel_count: counts[l],
                first_voxel: first[l],
                bbox: e.to_bbox(),
            })
        })
        .collect()
}

// ============================================================================
// Union-Find
// ============================================================================

#[derive(Debug)]
struct UnionFind {
    parent: Vec<u32>,
    next_label: u32,
}

impl UnionFind {
    fn new() -> Self {
        Self {
            parent: Vec::with_capacity(256),
            next_label: 1,
        }
    }

    #[inline]
    fn make_set(&mut self) -> u32 {
        let label = self.next_label;
        self.parent.push(label);
        self.next_label += 1;
        label
    }

    /// Find root with iterative path compression (two-pass).
    #[inline]
    fn find(&mut self, label: u32) -> u32 {
        let mut root = label;
        loop {
            let parent = self.parent[(root - 1) as usize];
            if parent == root {
                break;
            }
            root = parent;
        }

        let mut current = label;
        while current != root {
            let idx = (current - 1) as usize;
            let parent = self.parent[idx];
            self.parent[idx] = root;
            current = parent;
        }

        root
    }

    #[inline]
    fn union(&mut self, a: u32, b: u32) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a != root_b {
            let (smaller, larger) = if root_a < root_b {
                (root_a, root_b)
            } else {
                (root_b, root_a)
            };
            self.parent[(larger - 1) as usize] = smaller;
        }
    }

    /// Flatten labels to sequential 1..n, numbered in order of their roots.
    fn flatten_labels(&mut self, labels: &mut [u32]) -> usize {
        if self.parent.is_empty() {
            return 0;
        }

        let len = self.parent.len();
        let mut label_map = vec![0u32; len + 1];
        let mut num_labels = 0u32;

        for i in 1..=len as u32 {
            let root = self.find(i);
            if label_map[root as usize] == 0 {
                num_labels += 1;
                label_map[root as usize] = num_labels;
            }
            label_map[i as usize] = label_map[root as usize];
        }

        labels.par_iter_mut().for_each(|l| {
            if *l != 0 {
                *l = label_map[*l as usize];
            }
        });

        num_labels as usize
    }
}
