//! Primitive array operations on volumes.

use std::collections::BTreeMap;

use rayon::prelude::*;

use super::bbox::Extents;
use super::{BoundingBox, Voxel, Volume};
use crate::error::{Error, Result};

impl<T: Voxel> Volume<T> {
    /// Largest voxel value, clamped below at zero.
    pub fn max(&self) -> T {
        self.voxels()
            .par_iter()
            .copied()
            .reduce(T::default, |a, b| if b > a { b } else { a })
    }

    pub fn count_nonzero(&self) -> usize {
        self.voxels().par_iter().filter(|v| v.is_nonzero()).count()
    }

    /// Binary mask of voxels with value `>= threshold`.
    pub fn threshold(&self, threshold: T) -> Volume<u8> {
        self.map(|&v| u8::from(v >= threshold))
    }

    /// Binary mask of non-zero voxels.
    pub fn binarize(&self) -> Volume<u8> {
        self.map(|v| u8::from(v.is_nonzero()))
    }

    /// Voxel-wise product of two volumes of the same shape.
    pub fn multiply(&self, other: &Volume<T>) -> Result<Volume<T>> {
        self.check_shape(other.dims())?;
        let voxels = self
            .voxels()
            .par_iter()
            .zip(other.voxels().par_iter())
            .map(|(&a, &b)| {
                let product = a.to_f64().unwrap_or(0.0) * b.to_f64().unwrap_or(0.0);
                product.cast::<T>()
            })
            .collect();
        Ok(Volume::new(self.dims(), self.spacing(), voxels))
    }

    /// Zeroes every voxel outside `mask`.
    pub fn mask<M: Voxel>(&self, mask: &Volume<M>) -> Result<Volume<T>> {
        self.check_shape(mask.dims())?;
        let voxels = self
            .voxels()
            .par_iter()
            .zip(mask.voxels().par_iter())
            .map(|(&v, m)| if m.is_nonzero() { v } else { T::default() })
            .collect();
        Ok(Volume::new(self.dims(), self.spacing(), voxels))
    }

    pub fn convert<U: Voxel>(&self) -> Volume<U> {
        self.map(|&v| v.cast::<U>())
    }

    /// Voxel count per integer value, including zero. Slices are tallied in
    /// parallel and merged.
    pub fn histogram(&self) -> BTreeMap<u64, usize> {
        let slice_len = self.slice_len().max(1);
        self.voxels()
            .par_chunks(slice_len)
            .fold(BTreeMap::new, |mut hist, slice| {
                for v in slice {
                    *hist.entry(v.to_u64().unwrap_or(0)).or_insert(0) += 1;
                }
                hist
            })
            .reduce(BTreeMap::new, |mut a, b| {
                for (k, n) in b {
                    *a.entry(k).or_insert(0) += n;
                }
                a
            })
    }

    /// Minimal box enclosing all voxels matching `pred`, or `None` when no
    /// voxel matches.
    pub fn bounding_box_where<F>(&self, pred: F) -> Option<BoundingBox>
    where
        F: Fn(T) -> bool + Sync,
    {
        let [w, h, _] = self.dims();
        let slice_len = self.slice_len();
        if slice_len == 0 {
            return None;
        }
        self.voxels()
            .par_chunks(slice_len)
            .enumerate()
            .filter_map(|(z, slice)| {
                let mut extents: Option<Extents> = None;
                for y in 0..h {
                    for x in 0..w {
                        if pred(slice[y * w + x]) {
                            match extents.as_mut() {
                                Some(e) => e.include(x, y, z),
                                None => extents = Some(Extents::new(x, y, z)),
                            }
                        }
                    }
                }
                extents
            })
            .reduce_with(|mut a, b| {
                a.merge(&b);
                a
            })
            .map(Extents::to_bbox)
    }

    /// Bounding boxes of every non-zero integer value in one pass.
    pub fn label_bounding_boxes(&self) -> BTreeMap<u64, BoundingBox> {
        let mut extents: BTreeMap<u64, Extents> = BTreeMap::new();
        for (idx, v) in self.voxels().iter().enumerate() {
            if !v.is_nonzero() {
                continue;
            }
            let [x, y, z] = self.coords_of(idx);
            extents
                .entry(v.to_u64().unwrap_or(0))
                .and_modify(|e| e.include(x, y, z))
                .or_insert_with(|| Extents::new(x, y, z));
        }
        extents
            .into_iter()
            .map(|(label, e)| (label, e.to_bbox()))
            .collect()
    }

    /// Copies the sub-volume covered by `bbox`.
    pub fn crop(&self, bbox: &BoundingBox) -> Result<Volume<T>> {
        if !bbox.fits_within(self.dims()) {
            return Err(Error::BoxOutOfBounds {
                bbox: bbox.to_string(),
                dims: self.dims(),
            });
        }
        let [x0, y0, z0] = bbox.min();
        let [sx, sy, sz] = bbox.size();
        let mut voxels = Vec::with_capacity(sx * sy * sz);
        for z in z0..z0 + sz {
            for y in y0..y0 + sy {
                let row = self.index_of(0, y, z);
                voxels.extend_from_slice(&self.voxels()[row + x0..row + x0 + sx]);
            }
        }
        Ok(Volume::new(bbox.size(), self.spacing(), voxels))
    }

    /// Slices `[z_start, z_end)` along the slice axis.
    pub fn slab(&self, z_start: usize, z_end: usize) -> Volume<T> {
        assert!(
            z_start < z_end && z_end <= self.depth(),
            "slab [{z_start}, {z_end}) outside depth {}",
            self.depth()
        );
        let slice_len = self.slice_len();
        let voxels = self.voxels()[z_start * slice_len..z_end * slice_len].to_vec();
        Volume::new(
            [self.width(), self.height(), z_end - z_start],
            self.spacing(),
            voxels,
        )
    }

    pub(crate) fn check_shape(&self, other: [usize; 3]) -> Result<()> {
        if self.dims() != other {
            return Err(Error::ShapeMismatch {
                expected: self.dims(),
                actual: other,
            });
        }
        Ok(())
    }
}
