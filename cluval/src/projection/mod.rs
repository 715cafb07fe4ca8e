//! Projection of reference-space volumes into a subject's native space and
//! back.
//!
//! Warping itself belongs to a [`TransformProvider`]. The projector owns the
//! grid bookkeeping around it:
//! 1. Warp onto the padded registration grid
//! 2. Remove the padding the registration step added
//! 3. Rescale to the native full-resolution grid
//!
//! Label volumes are always resampled with nearest neighbour and stored at
//! the smallest bit depth their range allows.

mod affine;
mod resample;

#[cfg(test)]
mod tests;

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::volume::io::write_volume;
use crate::volume::{BitDepth, BoundingBox, Volume};

pub use affine::{AffineTransformProvider, RegistrationBundle};
pub use resample::resample;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Direction {
    AtlasToNative,
    NativeToAtlas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    Nearest,
    Linear,
}

/// Voxel grid description.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub dims: [usize; 3],
    pub spacing: [f64; 3],
}

impl GridSpec {
    pub fn of<T>(volume: &Volume<T>) -> Self {
        Self {
            dims: volume.dims(),
            spacing: volume.spacing(),
        }
    }
}

/// Registration grid sizes before and after the registration step padded its
/// input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegistrationGrid {
    pub pre_padding: [usize; 3],
    pub post_padding: [usize; 3],
    /// Spacing of the registration grid in mm.
    pub spacing: [f64; 3],
}

impl RegistrationGrid {
    pub fn validate(&self) -> Result<()> {
        for axis in 0..3 {
            if self.pre_padding[axis] == 0 || self.post_padding[axis] < self.pre_padding[axis] {
                return Err(Error::Config(format!(
                    "registration grid axis {axis}: pre-padding {} must be non-zero and not exceed post-padding {}",
                    self.pre_padding[axis], self.post_padding[axis]
                )));
            }
        }
        Ok(())
    }

    /// Region of the padded grid holding the unpadded data. Padding is split
    /// evenly with the odd voxel at the high end.
    pub fn unpadded_box(&self) -> BoundingBox {
        let min: [usize; 3] =
            std::array::from_fn(|axis| (self.post_padding[axis] - self.pre_padding[axis]) / 2);
        let max: [usize; 3] = std::array::from_fn(|axis| min[axis] + self.pre_padding[axis] - 1);
        BoundingBox::from_extents(min, max)
    }

    pub fn padded_spec(&self) -> GridSpec {
        GridSpec {
            dims: self.post_padding,
            spacing: self.spacing,
        }
    }
}

/// External registration collaborator.
pub trait TransformProvider: Send + Sync {
    /// Identifies the transform; part of the native index cache key.
    fn version(&self) -> &str;

    /// Warps `volume` in `direction` onto `target`. Fails with
    /// [`Error::TransformUnavailable`] when no path exists for the direction.
    fn project(
        &self,
        volume: &Volume<f32>,
        direction: Direction,
        interpolation: Interpolation,
        target: &GridSpec,
    ) -> Result<Volume<f32>>;
}

/// Label volume stored at its minimal bit depth.
#[derive(Debug, Clone, PartialEq)]
pub enum LabelVolume {
    U8(Volume<u8>),
    U16(Volume<u16>),
    U32(Volume<u32>),
}

impl LabelVolume {
    pub fn minimized(labels: Volume<u32>) -> Self {
        match BitDepth::for_max(labels.max() as u64) {
            BitDepth::U8 => LabelVolume::U8(labels.convert()),
            BitDepth::U16 => LabelVolume::U16(labels.convert()),
            BitDepth::U32 => LabelVolume::U32(labels),
        }
    }

    pub fn bit_depth(&self) -> BitDepth {
        match self {
            LabelVolume::U8(_) => BitDepth::U8,
            LabelVolume::U16(_) => BitDepth::U16,
            LabelVolume::U32(_) => BitDepth::U32,
        }
    }

    pub fn to_u32(&self) -> Volume<u32> {
        match self {
            LabelVolume::U8(v) => v.convert(),
            LabelVolume::U16(v) => v.convert(),
            LabelVolume::U32(v) => v.clone(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        match self {
            LabelVolume::U8(v) => write_volume(path, v),
            LabelVolume::U16(v) => write_volume(path, v),
            LabelVolume::U32(v) => write_volume(path, v),
        }
    }
}

pub struct SpatialProjector<'a> {
    provider: &'a dyn TransformProvider,
    grid: RegistrationGrid,
}

impl<'a> SpatialProjector<'a> {
    pub fn new(provider: &'a dyn TransformProvider, grid: RegistrationGrid) -> Result<Self> {
        grid.validate()?;
        Ok(Self { provider, grid })
    }

    pub fn version(&self) -> &str {
        self.provider.version()
    }

    /// Projects a reference-space label volume onto the native grid.
    pub fn labels_to_native(&self, labels: &Volume<u32>, native: &GridSpec) -> Result<LabelVolume> {
        let projected = self.to_native(&labels.convert::<f32>(), Interpolation::Nearest, native)?;
        Ok(LabelVolume::minimized(projected.map(|&v| v.round().max(0.0) as u32)))
    }

    /// Projects a reference-space intensity volume onto the native grid.
    pub fn intensity_to_native(&self, volume: &Volume<f32>, native: &GridSpec) -> Result<Volume<f32>> {
        self.to_native(volume, Interpolation::Linear, native)
    }

    /// Projects a native-space label volume into reference space.
    pub fn labels_to_atlas(&self, labels: &Volume<u32>, atlas: &GridSpec) -> Result<LabelVolume> {
        let projected = self.to_atlas(&labels.convert::<f32>(), Interpolation::Nearest, atlas)?;
        Ok(LabelVolume::minimized(projected.map(|&v| v.round().max(0.0) as u32)))
    }

    pub fn intensity_to_atlas(&self, volume: &Volume<f32>, atlas: &GridSpec) -> Result<Volume<f32>> {
        self.to_atlas(volume, Interpolation::Linear, atlas)
    }

    fn to_native(
        &self,
        volume: &Volume<f32>,
        interpolation: Interpolation,
        native: &GridSpec,
    ) -> Result<Volume<f32>> {
        let padded = self.provider.project(
            volume,
            Direction::AtlasToNative,
            interpolation,
            &self.grid.padded_spec(),
        )?;
        padded.check_shape(self.grid.post_padding)?;

        let unpadded = padded.crop(&self.grid.unpadded_box())?;
        debug!(
            padded = ?self.grid.post_padding,
            unpadded = ?unpadded.dims(),
            native = ?native.dims,
            "Removed registration padding"
        );
        Ok(resample(&unpadded, native, interpolation))
    }

    fn to_atlas(
        &self,
        volume: &Volume<f32>,
        interpolation: Interpolation,
        atlas: &GridSpec,
    ) -> Result<Volume<f32>> {
        let registration = GridSpec {
            dims: self.grid.pre_padding,
            spacing: self.grid.spacing,
        };
        let downsampled = resample(volume, &registration, interpolation);
        let padded = pad(&downsampled, &self.grid);
        self.provider
            .project(&padded, Direction::NativeToAtlas, interpolation, atlas)
    }
}

/// Inverse of padding removal: centers `volume` in the padded grid.
fn pad(volume: &Volume<f32>, grid: &RegistrationGrid) -> Volume<f32> {
    let mut padded = Volume::new_default(grid.post_padding, grid.spacing);
    let [ox, oy, oz] = grid.unpadded_box().min();
    let [w, h, d] = volume.dims();
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                padded.set(x + ox, y + oy, z + oz, volume.get(x, y, z));
            }
        }
    }
    padded
}
