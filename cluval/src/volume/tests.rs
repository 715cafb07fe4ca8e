use super::io::{read_volume, write_volume};
use super::*;

fn vol_from(dims: [usize; 3], voxels: Vec<u32>) -> Volume<u32> {
    Volume::new(dims, [1.0, 1.0, 1.0], voxels)
}

#[test]
fn test_index_roundtrip() {
    let v: Volume<u8> = Volume::new_default([3, 4, 5], [1.0, 1.0, 1.0]);
    for idx in [0, 1, 11, 12, 59] {
        let [x, y, z] = v.coords_of(idx);
        assert_eq!(v.index_of(x, y, z), idx);
    }
    assert_eq!(v.coords_of(13), [1, 0, 1]);
}

#[test]
#[should_panic(expected = "voxels length")]
fn test_new_rejects_wrong_length() {
    let _ = Volume::new([2, 2, 2], [1.0; 3], vec![0u8; 7]);
}

#[test]
fn test_voxel_volume() {
    let v: Volume<u8> = Volume::new_default([1, 1, 1], [0.5, 0.2, 2.0]);
    assert!((v.voxel_volume_mm3() - 0.2).abs() < 1e-12);
}

#[test]
fn test_threshold_and_binarize() {
    let v = Volume::new([4, 1, 1], [1.0; 3], vec![0.1f32, 0.95, 0.96, 0.0]);
    assert_eq!(v.threshold(0.95).voxels(), &[0, 1, 1, 0]);
    assert_eq!(v.binarize().voxels(), &[1, 1, 1, 0]);
}

#[test]
fn test_multiply_and_mask() {
    let a = vol_from([3, 1, 1], vec![2, 3, 4]);
    let b = vol_from([3, 1, 1], vec![5, 0, 1]);
    assert_eq!(a.multiply(&b).unwrap().voxels(), &[10, 0, 4]);

    let mask = Volume::new([3, 1, 1], [1.0; 3], vec![1u8, 0, 1]);
    assert_eq!(a.mask(&mask).unwrap().voxels(), &[2, 0, 4]);
}

#[test]
fn test_shape_mismatch_is_error() {
    let a = vol_from([3, 1, 1], vec![1, 2, 3]);
    let b = vol_from([1, 3, 1], vec![1, 2, 3]);
    assert!(matches!(
        a.multiply(&b),
        Err(crate::Error::ShapeMismatch { .. })
    ));
}

#[test]
fn test_max_and_count_nonzero() {
    let v = vol_from([2, 2, 1], vec![0, 7, 3, 0]);
    assert_eq!(v.max(), 7);
    assert_eq!(v.count_nonzero(), 2);
    let empty: Volume<u32> = Volume::new_default([2, 2, 2], [1.0; 3]);
    assert_eq!(empty.max(), 0);
}

#[test]
fn test_histogram_counts_all_values() {
    let v = vol_from([2, 2, 2], vec![0, 1, 1, 2, 0, 2, 2, 5]);
    let hist = v.histogram();
    assert_eq!(hist.get(&0), Some(&2));
    assert_eq!(hist.get(&1), Some(&2));
    assert_eq!(hist.get(&2), Some(&3));
    assert_eq!(hist.get(&5), Some(&1));
    assert_eq!(hist.values().sum::<usize>(), 8);
}

#[test]
fn test_bounding_box_where() {
    let mut v: Volume<u32> = Volume::new_default([10, 8, 6], [1.0; 3]);
    v.set(2, 3, 1, 4);
    v.set(5, 1, 4, 4);
    v.set(9, 7, 5, 2);
    let bbox = v.bounding_box_where(|x| x == 4).unwrap();
    assert_eq!(bbox.to_array(), [2, 4, 1, 3, 1, 4]);
    assert!(v.bounding_box_where(|x| x == 3).is_none());

    let boxes = v.label_bounding_boxes();
    assert_eq!(boxes[&4], bbox);
    assert_eq!(boxes[&2].to_array(), [9, 1, 7, 1, 5, 1]);
}

#[test]
fn test_crop_and_slab() {
    let voxels: Vec<u32> = (0..60).collect();
    let v = vol_from([3, 4, 5], voxels);
    let bbox = BoundingBox::from_extents([1, 1, 2], [2, 2, 3]);
    let c = v.crop(&bbox).unwrap();
    assert_eq!(c.dims(), [2, 2, 2]);
    assert_eq!(c.get(0, 0, 0), v.get(1, 1, 2));
    assert_eq!(c.get(1, 1, 1), v.get(2, 2, 3));

    let s = v.slab(1, 3);
    assert_eq!(s.dims(), [3, 4, 2]);
    assert_eq!(s.get(2, 3, 1), v.get(2, 3, 2));
}

#[test]
fn test_crop_out_of_bounds() {
    let v = vol_from([2, 2, 2], vec![0; 8]);
    let bbox = BoundingBox::from_extents([1, 1, 1], [2, 1, 1]);
    assert!(matches!(
        v.crop(&bbox),
        Err(crate::Error::BoxOutOfBounds { .. })
    ));
}

#[test]
fn test_bit_depth_for_max() {
    assert_eq!(BitDepth::for_max(0), BitDepth::U8);
    assert_eq!(BitDepth::for_max(255), BitDepth::U8);
    assert_eq!(BitDepth::for_max(256), BitDepth::U16);
    assert_eq!(BitDepth::for_max(65_535), BitDepth::U16);
    assert_eq!(BitDepth::for_max(65_536), BitDepth::U32);
}

#[test]
fn test_convert_drops_unrepresentable() {
    let v = Volume::new([3, 1, 1], [1.0; 3], vec![-1.0f32, 2.6, 300.0]);
    let c: Volume<u8> = v.convert();
    assert_eq!(c.voxels(), &[0, 2, 0]);
}

#[test]
fn test_bbox_include_and_display() {
    let mut b = BoundingBox::from_extents([2, 2, 2], [2, 2, 2]);
    b.include(0, 5, 3);
    assert_eq!(b.to_array(), [0, 3, 2, 4, 2, 2]);
    assert_eq!(b.to_string(), "0 3 2 4 2 2");
    assert!(b.contains(1, 5, 3));
    assert!(!b.contains(3, 5, 3));
}

// ============================================================================
// Labeling
// ============================================================================

#[test]
fn test_labeling_diagonal_depends_on_connectivity() {
    let mut v: Volume<u8> = Volume::new_default([3, 3, 3], [1.0; 3]);
    v.set(0, 0, 0, 1);
    v.set(1, 1, 1, 1);
    v.set(2, 2, 1, 1);

    let six = label_components(&v, Connectivity::Six, ValueMode::AnyNonZero);
    assert_eq!(six.num_labels(), 3);
    let eighteen = label_components(&v, Connectivity::Eighteen, ValueMode::AnyNonZero);
    assert_eq!(eighteen.num_labels(), 2);
    let twenty_six = label_components(&v, Connectivity::TwentySix, ValueMode::AnyNonZero);
    assert_eq!(twenty_six.num_labels(), 1);
    assert_eq!(twenty_six.components()[0].voxel_count, 3);
}

#[test]
fn test_labeling_orders_by_first_voxel() {
    // A U-shape whose arms meet late must keep the label of its first voxel.
    let mut v: Volume<u8> = Volume::new_default([7, 3, 1], [1.0; 3]);
    for y in 0..3 {
        v.set(0, y, 0, 1);
        v.set(2, y, 0, 1);
    }
    v.set(1, 2, 0, 1);
    v.set(5, 0, 0, 1);

    let labels = label_components(&v, Connectivity::Six, ValueMode::AnyNonZero);
    assert_eq!(labels.num_labels(), 2);
    assert_eq!(labels.labels().get(0, 0, 0), 1);
    assert_eq!(labels.labels().get(2, 0, 0), 1);
    assert_eq!(labels.labels().get(5, 0, 0), 2);
    let c = &labels.components()[0];
    assert_eq!(c.first_voxel, 0);
    assert_eq!(c.voxel_count, 7);
    assert_eq!(c.bbox.to_array(), [0, 3, 0, 3, 0, 1]);
}

#[test]
fn test_labeling_match_values_splits_touching_objects() {
    let v = vol_from([4, 1, 1], vec![3, 3, 8, 8]);
    let any = label_components(&v, Connectivity::TwentySix, ValueMode::AnyNonZero);
    assert_eq!(any.num_labels(), 1);
    let matched = label_components(&v, Connectivity::TwentySix, ValueMode::MatchValues);
    assert_eq!(matched.num_labels(), 2);
}

#[test]
fn test_labeling_empty() {
    let v: Volume<u8> = Volume::new_default([4, 4, 4], [1.0; 3]);
    let labels = label_components(&v, Connectivity::TwentySix, ValueMode::AnyNonZero);
    assert_eq!(labels.num_labels(), 0);
    assert!(labels.labels().voxels().iter().all(|&l| l == 0));
}

#[test]
fn test_connectivity_serde() {
    let c: Connectivity = serde_json::from_str("18").unwrap();
    assert_eq!(c, Connectivity::Eighteen);
    assert_eq!(serde_json::to_string(&Connectivity::TwentySix).unwrap(), "26");
    assert!(serde_json::from_str::<Connectivity>("4").is_err());
}

// ============================================================================
// NIfTI
// ============================================================================

#[test]
fn test_nifti_preserves_layout_and_spacing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("labels.nii.gz");

    let voxels: Vec<u16> = (0..(3 * 4 * 5) as u16).collect();
    let v = Volume::new([3, 4, 5], [0.5, 0.25, 2.0], voxels);
    write_volume(&path, &v).unwrap();

    let back: Volume<u16> = read_volume(&path).unwrap();
    assert_eq!(back.dims(), [3, 4, 5]);
    assert_eq!(back.voxels(), v.voxels());
    assert!((back.spacing()[0] - 0.5).abs() < 1e-6);
    assert!((back.spacing()[2] - 2.0).abs() < 1e-6);

    let as_u32: Volume<u32> = read_volume(&path).unwrap();
    assert_eq!(as_u32.get(2, 3, 4), 59);
}

#[test]
fn test_nifti_missing_file_is_error() {
    let err = read_volume::<u8>(std::path::Path::new("/nonexistent/x.nii")).unwrap_err();
    assert!(matches!(err, crate::Error::ReadNifti { .. }));
}
