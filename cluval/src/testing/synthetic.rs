//! Synthetic volumes for cluster and counting tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::volume::{BoundingBox, Volume};

pub const UNIT_SPACING: [f64; 3] = [1.0, 1.0, 1.0];

/// Statistic map with uniform `background` and a ball of `value` voxels.
pub fn statistic_with_sphere(
    dims: [usize; 3],
    center: [usize; 3],
    radius: f64,
    background: f32,
    value: f32,
) -> Volume<f32> {
    let mut v = Volume::new_filled(dims, UNIT_SPACING, background);
    paint_sphere(&mut v, center, radius, value);
    v
}

/// Sets every voxel within `radius` of `center` to `value`.
pub fn paint_sphere<T: Copy>(volume: &mut Volume<T>, center: [usize; 3], radius: f64, value: T) {
    let [w, h, d] = volume.dims();
    let r2 = radius * radius;
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                let dx = x as f64 - center[0] as f64;
                let dy = y as f64 - center[1] as f64;
                let dz = z as f64 - center[2] as f64;
                if dx * dx + dy * dy + dz * dz <= r2 {
                    volume.set(x, y, z, value);
                }
            }
        }
    }
}

/// Fills a box with `value`.
pub fn paint_box<T: Copy>(volume: &mut Volume<T>, bbox: &BoundingBox, value: T) {
    let [x0, y0, z0] = bbox.min();
    let [x1, y1, z1] = bbox.end();
    for z in z0..z1 {
        for y in y0..y1 {
            for x in x0..x1 {
                volume.set(x, y, z, value);
            }
        }
    }
}

/// Binary segmentation with `count` separated 3x3x3 cubes laid out along the
/// slice axis, leaving a two-slice gap between cubes and a one-voxel border.
/// Returns the volume and the cube boxes.
pub fn stacked_cubes(count: usize, width: usize) -> (Volume<u32>, Vec<BoundingBox>) {
    let side = 3;
    let depth = 1 + count * (side + 2) + 1;
    let mut v = Volume::new_default([width, width, depth], UNIT_SPACING);
    let mut boxes = Vec::with_capacity(count);
    for i in 0..count {
        let z0 = 1 + i * (side + 2);
        let b = BoundingBox::from_extents([1, 1, z0], [side, side, z0 + side - 1]);
        paint_box(&mut v, &b, 1u32);
        boxes.push(b);
    }
    (v, boxes)
}

/// Places `count` non-touching cubes of side `side` at random positions in a
/// volume of `dims`, labeled 1..=count. Cubes keep a one-voxel gap from each
/// other and from the volume faces.
pub fn random_cubes(dims: [usize; 3], count: usize, side: usize, seed: u64) -> (Volume<u32>, Vec<BoundingBox>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut v = Volume::new_default(dims, UNIT_SPACING);
    let mut boxes: Vec<BoundingBox> = Vec::with_capacity(count);

    let mut attempts = 0;
    while boxes.len() < count {
        attempts += 1;
        assert!(attempts < 100_000, "could not place {count} cubes in {dims:?}");

        let min = [0, 1, 2].map(|axis| rng.random_range(1..dims[axis] - side));
        let candidate = BoundingBox::from_extents(min, min.map(|m| m + side - 1));
        let padded = BoundingBox::from_extents(
            candidate.min().map(|m| m - 1),
            candidate.end(),
        );
        let clear = boxes.iter().all(|b| !overlaps(&padded, b));
        if clear {
            paint_box(&mut v, &candidate, boxes.len() as u32 + 1);
            boxes.push(candidate);
        }
    }
    (v, boxes)
}

fn overlaps(a: &BoundingBox, b: &BoundingBox) -> bool {
    let (a0, a1, b0, b1) = (a.min(), a.end(), b.min(), b.end());
    (0..3).all(|axis| a0[axis] < b1[axis] && b0[axis] < a1[axis])
}
