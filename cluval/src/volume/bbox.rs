use std::fmt;

use serde::{Deserialize, Serialize};

/// Axis-aligned box in voxel coordinates, stored as minimum corner plus size
/// per axis. Encloses its voxels with zero margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub xmin: usize,
    pub xsize: usize,
    pub ymin: usize,
    pub ysize: usize,
    pub zmin: usize,
    pub zsize: usize,
}

impl BoundingBox {
    /// Box spanning inclusive minimum and maximum corners.
    pub fn from_extents(min: [usize; 3], max: [usize; 3]) -> Self {
        debug_assert!(min[0] <= max[0] && min[1] <= max[1] && min[2] <= max[2]);
        Self {
            xmin: min[0],
            xsize: max[0] - min[0] + 1,
            ymin: min[1],
            ysize: max[1] - min[1] + 1,
            zmin: min[2],
            zsize: max[2] - min[2] + 1,
        }
    }

    pub fn min(&self) -> [usize; 3] {
        [self.xmin, self.ymin, self.zmin]
    }

    pub fn size(&self) -> [usize; 3] {
        [self.xsize, self.ysize, self.zsize]
    }

    /// Exclusive upper corner.
    pub fn end(&self) -> [usize; 3] {
        [
            self.xmin + self.xsize,
            self.ymin + self.ysize,
            self.zmin + self.zsize,
        ]
    }

    pub fn voxel_count(&self) -> usize {
        self.xsize * self.ysize * self.zsize
    }

    pub fn fits_within(&self, dims: [usize; 3]) -> bool {
        let end = self.end();
        self.voxel_count() > 0 && end[0] <= dims[0] && end[1] <= dims[1] && end[2] <= dims[2]
    }

    pub fn contains(&self, x: usize, y: usize, z: usize) -> bool {
        let end = self.end();
        (self.xmin..end[0]).contains(&x)
            && (self.ymin..end[1]).contains(&y)
            && (self.zmin..end[2]).contains(&z)
    }

    /// Grows the box to include a voxel.
    pub fn include(&mut self, x: usize, y: usize, z: usize) {
        let mut min = self.min();
        let mut max = self.end().map(|e| e - 1);
        for (axis, v) in [x, y, z].into_iter().enumerate() {
            min[axis] = min[axis].min(v);
            max[axis] = max[axis].max(v);
        }
        *self = Self::from_extents(min, max);
    }

    /// The six integers in (xmin, xsize, ymin, ysize, zmin, zsize) order.
    pub fn to_array(&self) -> [usize; 6] {
        [
            self.xmin, self.xsize, self.ymin, self.ysize, self.zmin, self.zsize,
        ]
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.to_array();
        write!(f, "{a} {b} {c} {d} {e} {g}")
    }
}

/// Running extents accumulator for building boxes in one pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Extents {
    min: [usize; 3],
    max: [usize; 3],
}

impl Extents {
    pub(crate) fn new(x: usize, y: usize, z: usize) -> Self {
        Self {
            min: [x, y, z],
            max: [x, y, z],
        }
    }

    #[inline]
    pub(crate) fn include(&mut self, x: usize, y: usize, z: usize) {
        let p = [x, y, z];
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(p[axis]);
            self.max[axis] = self.max[axis].max(p[axis]);
        }
    }

    pub(crate) fn merge(&mut self, other: &Extents) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(other.min[axis]);
            self.max[axis] = self.max[axis].max(other.max[axis]);
        }
    }

    pub(crate) fn min(&self) -> [usize; 3] {
        self.min
    }

    pub(crate) fn max(&self) -> [usize; 3] {
        self.max
    }

    pub(crate) fn to_bbox(self) -> BoundingBox {
        BoundingBox::from_extents(self.min, self.max)
    }
}
