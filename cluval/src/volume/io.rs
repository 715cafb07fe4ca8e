//! NIfTI-1 persistence for volumes.

use std::path::Path;

use ndarray::{Array3, Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use super::{Voxel, Volume};
use crate::error::{Error, Result};

/// Voxel types that can be written to NIfTI.
pub trait NiftiVoxel: Voxel {
    #[doc(hidden)]
    fn write_array(path: &Path, header: &NiftiHeader, array: &Array3<Self>) -> nifti::Result<()>;
}

macro_rules! impl_nifti_voxel {
    ($($t:ty),*) => {
        $(
            impl NiftiVoxel for $t {
                fn write_array(
                    path: &Path,
                    header: &NiftiHeader,
                    array: &Array3<Self>,
                ) -> nifti::Result<()> {
                    WriterOptions::new(path)
                        .reference_header(header)
                        .write_nifti(array)
                }
            }
        )*
    };
}

impl_nifti_voxel!(u8, u16, u32, i16, i32, f32, f64);

/// Reads a 3D volume, converting stored values to `T`. A 4D file with a
/// single volume along the fourth axis is accepted.
pub fn read_volume<T: Voxel>(path: &Path) -> Result<Volume<T>> {
    let obj = ReaderOptions::new()
        .read_file(path)
        .map_err(|source| Error::ReadNifti {
            path: path.to_path_buf(),
            source,
        })?;
    let pixdim = obj.header().pixdim;

    let array = obj
        .into_volume()
        .into_ndarray::<f64>()
        .map_err(|source| Error::ReadNifti {
            path: path.to_path_buf(),
            source,
        })?;

    let array = match array.ndim() {
        3 => array,
        4 if array.shape()[3] == 1 => array.index_axis_move(Axis(3), 0),
        n => {
            return Err(Error::InvalidVolume {
                path: path.to_path_buf(),
                reason: format!("expected a 3D volume, found {n} dimensions {:?}", array.shape()),
            })
        }
    };
    let array = array
        .into_dimensionality::<Ix3>()
        .map_err(|e| Error::InvalidVolume {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let (nx, ny, nz) = array.dim();
    let mut voxels = Vec::with_capacity(nx * ny * nz);
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                voxels.push(array[[x, y, z]].cast::<T>());
            }
        }
    }

    let spacing = [1, 2, 3].map(|axis| {
        let s = pixdim[axis].abs() as f64;
        if s > 0.0 {
            s
        } else {
            1.0
        }
    });

    Ok(Volume::new([nx, ny, nz], spacing, voxels))
}

/// Writes a volume atomically. The format is chosen by extension (`.nii` or
/// `.nii.gz`).
pub fn write_volume<T: NiftiVoxel>(path: &Path, volume: &Volume<T>) -> Result<()> {
    let [nx, ny, nz] = volume.dims();
    let array = Array3::from_shape_fn((nx, ny, nz), |(x, y, z)| volume.get(x, y, z));

    let [sx, sy, sz] = volume.spacing();
    let header = NiftiHeader {
        pixdim: [1.0, sx as f32, sy as f32, sz as f32, 1.0, 1.0, 1.0, 1.0],
        ..NiftiHeader::default()
    };

    common::file_utils::write_atomic_with(path, |tmp| {
        T::write_array(tmp, &header, &array).map_err(|source| {
            WriteError::Volume(Error::WriteNifti {
                path: path.to_path_buf(),
                source,
            })
        })
    })
    .map_err(|e| match e {
        WriteError::Io(source) => Error::io(path, source),
        WriteError::Volume(err) => err,
    })
}

/// Keeps the temp-file I/O failure apart from the NIfTI failure so the
/// reported path is always the destination.
enum WriteError {
    Io(std::io::Error),
    Volume(Error),
}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        WriteError::Io(e)
    }
}
