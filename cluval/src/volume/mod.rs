//! Dense 3D voxel volumes with physical spacing.
//!
//! Voxels are stored x-fastest, then y, then z. The z axis is the slice axis
//! used for slab extraction and subdivision.

mod bbox;
pub mod io;
pub mod labeling;
mod ops;

#[cfg(test)]
mod tests;

use std::fmt::Debug;
use std::ops::{Index, IndexMut};

use num_traits::{NumCast, ToPrimitive};

pub use bbox::BoundingBox;
pub use labeling::{label_components, Component, ComponentLabels, Connectivity, ValueMode};

/// Numeric voxel type.
pub trait Voxel:
    Copy + Default + PartialOrd + PartialEq + Debug + Send + Sync + NumCast + ToPrimitive + 'static
{
    #[inline]
    fn is_nonzero(&self) -> bool {
        *self != Self::default()
    }

    /// Lossy conversion used when changing voxel types. Values the target
    /// type cannot represent become zero.
    #[inline]
    fn cast<U: Voxel>(self) -> U {
        <U as NumCast>::from(self).unwrap_or_default()
    }
}

impl Voxel for u8 {}
impl Voxel for u16 {}
impl Voxel for u32 {}
impl Voxel for i16 {}
impl Voxel for i32 {}
impl Voxel for f32 {}
impl Voxel for f64 {}

/// Smallest unsigned integer width able to hold a label range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BitDepth {
    U8,
    U16,
    U32,
}

impl BitDepth {
    pub fn for_max(max: u64) -> Self {
        if max < 256 {
            BitDepth::U8
        } else if max < 65_536 {
            BitDepth::U16
        } else {
            BitDepth::U32
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Volume<T> {
    voxels: Vec<T>,
    dims: [usize; 3],
    spacing: [f64; 3],
}

impl<T> Volume<T> {
    pub fn new(dims: [usize; 3], spacing: [f64; 3], voxels: Vec<T>) -> Self {
        assert_eq!(
            voxels.len(),
            dims[0] * dims[1] * dims[2],
            "voxels length must equal the product of dims"
        );
        Self {
            voxels,
            dims,
            spacing,
        }
    }

    #[inline]
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.dims[0]
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.dims[1]
    }

    /// Number of slices along the slice axis.
    #[inline]
    pub fn depth(&self) -> usize {
        self.dims[2]
    }

    #[inline]
    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    /// Physical volume of one voxel in mm³.
    #[inline]
    pub fn voxel_volume_mm3(&self) -> f64 {
        self.spacing[0] * self.spacing[1] * self.spacing[2]
    }

    #[inline]
    pub fn slice_len(&self) -> usize {
        self.dims[0] * self.dims[1]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    #[inline]
    pub fn index_of(&self, x: usize, y: usize, z: usize) -> usize {
        debug_assert!(x < self.dims[0] && y < self.dims[1] && z < self.dims[2]);
        (z * self.dims[1] + y) * self.dims[0] + x
    }

    #[inline]
    pub fn coords_of(&self, idx: usize) -> [usize; 3] {
        let slice = self.slice_len();
        let z = idx / slice;
        let rem = idx % slice;
        [rem % self.dims[0], rem / self.dims[0], z]
    }

    #[inline]
    pub fn voxels(&self) -> &[T] {
        &self.voxels
    }

    #[inline]
    pub fn voxels_mut(&mut self) -> &mut [T] {
        &mut self.voxels
    }

    #[inline]
    pub fn into_vec(self) -> Vec<T> {
        self.voxels
    }

    pub fn same_shape<U>(&self, other: &Volume<U>) -> bool {
        self.dims == other.dims
    }

    /// Applies `f` to every voxel, keeping shape and spacing.
    pub fn map<U, F>(&self, f: F) -> Volume<U>
    where
        F: Fn(&T) -> U,
    {
        Volume {
            voxels: self.voxels.iter().map(f).collect(),
            dims: self.dims,
            spacing: self.spacing,
        }
    }
}

impl<T: Copy> Volume<T> {
    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> T {
        self.voxels[self.index_of(x, y, z)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: T) {
        let idx = self.index_of(x, y, z);
        self.voxels[idx] = value;
    }
}

impl<T: Clone> Volume<T> {
    pub fn new_filled(dims: [usize; 3], spacing: [f64; 3], value: T) -> Self {
        Self {
            voxels: vec![value; dims[0] * dims[1] * dims[2]],
            dims,
            spacing,
        }
    }
}

impl<T: Default + Clone> Volume<T> {
    pub fn new_default(dims: [usize; 3], spacing: [f64; 3]) -> Self {
        Self::new_filled(dims, spacing, T::default())
    }
}

impl<T> Index<(usize, usize, usize)> for Volume<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y, z): (usize, usize, usize)) -> &Self::Output {
        &self.voxels[self.index_of(x, y, z)]
    }
}

impl<T> IndexMut<(usize, usize, usize)> for Volume<T> {
    #[inline]
    fn index_mut(&mut self, (x, y, z): (usize, usize, usize)) -> &mut Self::Output {
        let idx = self.index_of(x, y, z);
        &mut self.voxels[idx]
    }
}
