use rayon::prelude::*;

use super::{GridSpec, Interpolation};
use crate::volume::Volume;

/// Rescales `volume` onto `target` by matching voxel centers along each
/// axis. Output spacing is the target spacing.
pub fn resample(volume: &Volume<f32>, target: &GridSpec, interpolation: Interpolation) -> Volume<f32> {
    let src = volume.dims();
    let [w, h, d] = target.dims;
    if src == target.dims {
        return Volume::new(target.dims, target.spacing, volume.voxels().to_vec());
    }

    let scale: [f64; 3] = std::array::from_fn(|axis| src[axis] as f64 / target.dims[axis] as f64);
    let map_axis = |axis: usize, i: usize| (i as f64 + 0.5) * scale[axis] - 0.5;

    let mut out = Volume::new_default(target.dims, target.spacing);
    let slice_len = w * h;
    if slice_len == 0 || d == 0 || volume.is_empty() {
        return out;
    }

    out.voxels_mut()
        .par_chunks_mut(slice_len)
        .enumerate()
        .for_each(|(z, slice)| {
            let sz = map_axis(2, z);
            for y in 0..h {
                let sy = map_axis(1, y);
                for x in 0..w {
                    let sx = map_axis(0, x);
                    slice[y * w + x] = match interpolation {
                        Interpolation::Nearest => sample_nearest(volume, [sx, sy, sz]),
                        Interpolation::Linear => sample_linear(volume, [sx, sy, sz]),
                    };
                }
            }
        });
    out
}

#[inline]
fn clamp_index(v: f64, n: usize) -> usize {
    v.round().clamp(0.0, (n - 1) as f64) as usize
}

pub(super) fn sample_nearest(volume: &Volume<f32>, p: [f64; 3]) -> f32 {
    let [w, h, d] = volume.dims();
    volume.get(clamp_index(p[0], w), clamp_index(p[1], h), clamp_index(p[2], d))
}

pub(super) fn sample_linear(volume: &Volume<f32>, p: [f64; 3]) -> f32 {
    let dims = volume.dims();
    let mut lo = [0usize; 3];
    let mut hi = [0usize; 3];
    let mut t = [0f64; 3];
    for axis in 0..3 {
        let max = (dims[axis] - 1) as f64;
        let c = p[axis].clamp(0.0, max);
        let f = c.floor();
        lo[axis] = f as usize;
        hi[axis] = (lo[axis] + 1).min(dims[axis] - 1);
        t[axis] = c - f;
    }

    let v = |x: usize, y: usize, z: usize| volume.get(x, y, z) as f64;
    let lerp = |a: f64, b: f64, t: f64| a + (b - a) * t;

    let c00 = lerp(v(lo[0], lo[1], lo[2]), v(hi[0], lo[1], lo[2]), t[0]);
    let c10 = lerp(v(lo[0], hi[1], lo[2]), v(hi[0], hi[1], lo[2]), t[0]);
    let c01 = lerp(v(lo[0], lo[1], hi[2]), v(hi[0], lo[1], hi[2]), t[0]);
    let c11 = lerp(v(lo[0], hi[1], hi[2]), v(hi[0], hi[1], hi[2]), t[0]);
    let c0 = lerp(c00, c10, t[1]);
    let c1 = lerp(c01, c11, t[1]);
    lerp(c0, c1, t[2]) as f32
}
