use super::*;
use crate::testing::synthetic::{paint_box, UNIT_SPACING};

fn grid(pre: [usize; 3], post: [usize; 3]) -> RegistrationGrid {
    RegistrationGrid {
        pre_padding: pre,
        post_padding: post,
        spacing: UNIT_SPACING,
    }
}

fn translation(v: [f64; 3]) -> [[f64; 4]; 4] {
    [
        [1.0, 0.0, 0.0, v[0]],
        [0.0, 1.0, 0.0, v[1]],
        [0.0, 0.0, 1.0, v[2]],
        [0.0, 0.0, 0.0, 1.0],
    ]
}

fn sample_labels() -> Volume<u32> {
    let mut labels: Volume<u32> = Volume::new_default([10, 10, 10], UNIT_SPACING);
    paint_box(&mut labels, &BoundingBox::from_extents([2, 2, 2], [4, 4, 4]), 1);
    paint_box(&mut labels, &BoundingBox::from_extents([6, 6, 6], [8, 8, 7]), 2);
    labels
}

#[test]
fn test_unpadded_box_splits_padding() {
    let g = grid([10, 10, 10], [13, 12, 10]);
    let b = g.unpadded_box();
    assert_eq!(b.min(), [1, 1, 0]);
    assert_eq!(b.size(), [10, 10, 10]);
}

#[test]
fn test_grid_validation() {
    assert!(grid([10, 10, 10], [9, 10, 10]).validate().is_err());
    assert!(grid([0, 10, 10], [10, 10, 10]).validate().is_err());
    assert!(grid([10, 10, 10], [10, 12, 14]).validate().is_ok());
}

#[test]
fn test_identity_projection_preserves_labels() {
    let labels = sample_labels();
    let g = grid([10, 10, 10], [10, 10, 10]);
    let provider = AffineTransformProvider::new(&RegistrationBundle::identity("v1", g));
    let projector = SpatialProjector::new(&provider, g).unwrap();

    let native = projector
        .labels_to_native(&labels, &GridSpec::of(&labels))
        .unwrap();
    assert_eq!(native.bit_depth(), BitDepth::U8);
    assert_eq!(native.to_u32().voxels(), labels.voxels());
    assert_eq!(projector.version(), "v1");
}

#[test]
fn test_padding_is_removed() {
    let labels = sample_labels();
    let g = grid([10, 10, 10], [12, 12, 10]);
    let bundle = RegistrationBundle {
        version: "pad".into(),
        atlas_to_registration: translation([1.0, 1.0, 0.0]),
        grid: g,
    };
    let provider = AffineTransformProvider::new(&bundle);
    let projector = SpatialProjector::new(&provider, g).unwrap();

    let native = projector
        .labels_to_native(&labels, &GridSpec::of(&labels))
        .unwrap();
    assert_eq!(native.to_u32().voxels(), labels.voxels());
}

#[test]
fn test_upsampling_never_interpolates_labels() {
    let labels = sample_labels();
    let g = grid([10, 10, 10], [10, 10, 10]);
    let provider = AffineTransformProvider::new(&RegistrationBundle::identity("v1", g));
    let projector = SpatialProjector::new(&provider, g).unwrap();

    let native_grid = GridSpec {
        dims: [20, 20, 20],
        spacing: [0.5, 0.5, 0.5],
    };
    let native = projector
        .labels_to_native(&labels, &native_grid)
        .unwrap()
        .to_u32();

    assert_eq!(native.dims(), [20, 20, 20]);
    let hist = native.histogram();
    assert_eq!(hist.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(hist[&1], 27 * 8);
    assert_eq!(hist[&2], 18 * 8);
    assert_eq!(native.get(4, 4, 4), 1);
    assert_eq!(native.get(3, 4, 4), 0);
    assert!((native.voxel_volume_mm3() * hist[&1] as f64 - 27.0).abs() < 1e-9);
}

#[test]
fn test_large_labels_keep_wider_depth() {
    let mut labels: Volume<u32> = Volume::new_default([4, 4, 4], UNIT_SPACING);
    labels.set(1, 1, 1, 300);
    assert_eq!(LabelVolume::minimized(labels.clone()).bit_depth(), BitDepth::U16);
    labels.set(2, 2, 2, 70_000);
    let wide = LabelVolume::minimized(labels.clone());
    assert_eq!(wide.bit_depth(), BitDepth::U32);
    assert_eq!(wide.to_u32(), labels);
}

#[test]
fn test_singular_affine_is_unavailable() {
    let g = grid([10, 10, 10], [10, 10, 10]);
    let bundle = RegistrationBundle {
        version: "bad".into(),
        atlas_to_registration: [[0.0; 4]; 4],
        grid: g,
    };
    let provider = AffineTransformProvider::new(&bundle);
    let projector = SpatialProjector::new(&provider, g).unwrap();
    let labels = sample_labels();
    let err = projector
        .labels_to_native(&labels, &GridSpec::of(&labels))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::TransformUnavailable {
            direction: Direction::AtlasToNative,
            ..
        }
    ));
}

#[test]
fn test_native_to_atlas_roundtrip() {
    let labels = sample_labels();
    let g = grid([10, 10, 10], [12, 12, 12]);
    let bundle = RegistrationBundle {
        version: "v2".into(),
        atlas_to_registration: translation([1.0, 1.0, 1.0]),
        grid: g,
    };
    let provider = AffineTransformProvider::new(&bundle);
    let projector = SpatialProjector::new(&provider, g).unwrap();

    let native_grid = GridSpec {
        dims: [20, 20, 20],
        spacing: [0.5, 0.5, 0.5],
    };
    let native = projector
        .labels_to_native(&labels, &native_grid)
        .unwrap()
        .to_u32();
    let back = projector
        .labels_to_atlas(&native, &GridSpec::of(&labels))
        .unwrap()
        .to_u32();
    assert_eq!(back.voxels(), labels.voxels());
}

#[test]
fn test_linear_resample_interpolates_intensity() {
    let line = Volume::new([2, 1, 1], UNIT_SPACING, vec![0.0f32, 10.0]);
    let target = GridSpec {
        dims: [4, 1, 1],
        spacing: [0.5, 1.0, 1.0],
    };
    let up = resample(&line, &target, Interpolation::Linear);
    let expected = [0.0, 2.5, 7.5, 10.0];
    for (got, want) in up.voxels().iter().zip(expected) {
        assert!((got - want).abs() < 1e-5, "{got} vs {want}");
    }
}

#[test]
fn test_bundle_yaml_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registration.yml");
    let bundle = RegistrationBundle {
        version: "v3".into(),
        atlas_to_registration: translation([2.0, 0.0, -1.0]),
        grid: grid([8, 8, 8], [10, 10, 8]),
    };
    bundle.save(&path).unwrap();
    assert_eq!(RegistrationBundle::load(&path).unwrap(), bundle);
}
