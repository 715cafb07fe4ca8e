use std::path::Path;

use glam::{DMat4, DVec3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::resample::{sample_linear, sample_nearest};
use super::{Direction, GridSpec, Interpolation, RegistrationGrid, TransformProvider};
use crate::error::{Error, Result};
use crate::volume::Volume;

/// Registration output for one subject: a voxel-to-voxel affine from the
/// atlas grid to the padded registration grid, plus the grid sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationBundle {
    /// Empty when the bundle does not name its transform.
    #[serde(default)]
    pub version: String,
    /// Row-major 4x4 matrix mapping atlas voxel coordinates to padded
    /// registration voxel coordinates.
    pub atlas_to_registration: [[f64; 4]; 4],
    pub grid: RegistrationGrid,
}

impl RegistrationBundle {
    pub fn identity(version: &str, grid: RegistrationGrid) -> Self {
        Self {
            version: version.to_string(),
            atlas_to_registration: DMat4::IDENTITY.to_cols_array_2d(),
            grid,
        }
    }

    /// Loads a bundle from YAML or JSON, chosen by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let format = common::FileFormat::from_file_name(&path.to_string_lossy())
            .map_err(|e| Error::Config(e.to_string()))?;
        common::deserialize(&text, format).map_err(|source| Error::Serde {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let format = common::FileFormat::from_file_name(&path.to_string_lossy())
            .map_err(|e| Error::Config(e.to_string()))?;
        let text = common::serialize(self, format).map_err(|source| Error::Serde {
            path: path.to_path_buf(),
            source,
        })?;
        common::file_utils::write_atomic(path, text.as_bytes()).map_err(|e| Error::io(path, e))
    }
}

/// Affine-only transform provider built from a [`RegistrationBundle`].
#[derive(Debug, Clone)]
pub struct AffineTransformProvider {
    version: String,
    forward: DMat4,
    inverse: Option<DMat4>,
}

impl AffineTransformProvider {
    pub fn new(bundle: &RegistrationBundle) -> Self {
        // glam matrices are column-major.
        let forward = DMat4::from_cols_array_2d(&bundle.atlas_to_registration).transpose();
        let det = forward.determinant();
        let inverse = (det.is_finite() && det.abs() > 1e-12).then(|| forward.inverse());
        Self {
            version: bundle.version.clone(),
            forward,
            inverse,
        }
    }

    /// Matrix mapping target voxel coordinates back to source coordinates.
    fn pull_matrix(&self, direction: Direction) -> Result<DMat4> {
        match direction {
            Direction::AtlasToNative => self.inverse.ok_or(Error::TransformUnavailable {
                direction,
                reason: "atlas-to-registration affine is singular".into(),
            }),
            Direction::NativeToAtlas => Ok(self.forward),
        }
    }
}

impl TransformProvider for AffineTransformProvider {
    fn version(&self) -> &str {
        &self.version
    }

    fn project(
        &self,
        volume: &Volume<f32>,
        direction: Direction,
        interpolation: Interpolation,
        target: &GridSpec,
    ) -> Result<Volume<f32>> {
        let pull = self.pull_matrix(direction)?;
        let [w, h, _] = target.dims;
        let src = volume.dims();
        let mut out = Volume::new_default(target.dims, target.spacing);
        let slice_len = w * h;
        if slice_len == 0 || volume.is_empty() {
            return Ok(out);
        }

        out.voxels_mut()
            .par_chunks_mut(slice_len)
            .enumerate()
            .for_each(|(z, slice)| {
                for y in 0..h {
                    for x in 0..w {
                        let p = pull.transform_point3(DVec3::new(x as f64, y as f64, z as f64));
                        let p = [p.x, p.y, p.z];
                        let inside = (0..3).all(|axis| {
                            p[axis] >= -0.5 && p[axis] < src[axis] as f64 - 0.5
                        });
                        if !inside {
                            continue;
                        }
                        slice[y * w + x] = match interpolation {
                            Interpolation::Nearest => sample_nearest(volume, p),
                            Interpolation::Linear => sample_linear(volume, p),
                        };
                    }
                }
            });
        Ok(out)
    }
}
