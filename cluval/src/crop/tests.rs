use super::*;
use crate::artifacts::SourceKind;
use crate::testing::synthetic::paint_box;
use crate::volume::io::read_volume;

fn native_index() -> Volume<u32> {
    let mut v: Volume<u32> = Volume::new_default([20, 20, 20], [0.5, 0.5, 0.4]);
    paint_box(&mut v, &BoundingBox::from_extents([2, 3, 4], [5, 6, 9]), 1);
    paint_box(&mut v, &BoundingBox::from_extents([10, 10, 10], [11, 11, 11]), 2);
    v
}

const INDEX: &str = "idx-a";

fn subject() -> SubjectId {
    SubjectId::new("s1")
}

#[test]
fn test_box_and_volume() {
    let dir = tempfile::tempdir().unwrap();
    let cropper = BoundingBoxCropper::new(ArtifactLayout::new(dir.path()));
    let unit = UnitKey::new(subject(), 1);

    match cropper.bounding_box(&unit, &native_index(), INDEX).unwrap() {
        BoxOutcome::Present { bbox, volume_mm3 } => {
            assert_eq!(bbox.to_array(), [2, 4, 3, 4, 4, 6]);
            // 96 voxels of 0.1 mm³.
            assert!((volume_mm3 - 9.6).abs() < 1e-9);
        }
        BoxOutcome::Absent => panic!("label 1 is present"),
    }
}

#[test]
fn test_second_call_reuses_cache() {
    let dir = tempfile::tempdir().unwrap();
    let index = native_index();
    let cropper = BoundingBoxCropper::new(ArtifactLayout::new(dir.path()));

    let first = cropper.bounding_boxes(&subject(), &index, &[1, 2], INDEX).unwrap();
    assert_eq!(cropper.computations(), 2);
    let second = cropper.bounding_boxes(&subject(), &index, &[1, 2], INDEX).unwrap();
    assert_eq!(cropper.computations(), 2);
    assert_eq!(first, second);

    // A fresh cropper over the same work dir reads the cache too.
    let other = BoundingBoxCropper::new(ArtifactLayout::new(dir.path()));
    other.bounding_box(&UnitKey::new(subject(), 2), &index, INDEX).unwrap();
    assert_eq!(other.computations(), 0);
}

#[test]
fn test_empty_cache_file_is_purged_and_recomputed() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ArtifactLayout::new(dir.path());
    let unit = UnitKey::new(subject(), 1);
    let path = layout.bbox_path(&unit);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "").unwrap();

    let cropper = BoundingBoxCropper::new(layout);
    let outcome = cropper.bounding_box(&unit, &native_index(), INDEX).unwrap();
    assert!(matches!(outcome, BoxOutcome::Present { .. }));
    assert_eq!(cropper.computations(), 1);
    assert!(std::fs::metadata(&path).unwrap().len() > 0);
}

#[test]
fn test_deleting_record_forces_recompute() {
    let dir = tempfile::tempdir().unwrap();
    let cropper = BoundingBoxCropper::new(ArtifactLayout::new(dir.path()));
    let unit = UnitKey::new(subject(), 1);
    cropper.bounding_box(&unit, &native_index(), INDEX).unwrap();
    std::fs::remove_file(cropper.layout().bbox_path(&unit)).unwrap();
    cropper.bounding_box(&unit, &native_index(), INDEX).unwrap();
    assert_eq!(cropper.computations(), 2);
}

#[test]
fn test_box_from_other_index_is_recomputed_and_crops_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let cropper = BoundingBoxCropper::new(ArtifactLayout::new(dir.path()));
    let unit = UnitKey::new(subject(), 1);
    let index = native_index();
    let bbox = match cropper.bounding_box(&unit, &index, INDEX).unwrap() {
        BoxOutcome::Present { bbox, .. } => bbox,
        BoxOutcome::Absent => panic!("label 1 is present"),
    };
    let crop = cropper
        .materialize(&unit.crop(SourceKind::Segmentation), &index, &bbox)
        .unwrap();
    assert!(crop.exists());

    // Label 1 now lives elsewhere under a rebuilt index.
    let mut rebuilt: Volume<u32> = Volume::new_default([20, 20, 20], [0.5, 0.5, 0.4]);
    paint_box(&mut rebuilt, &BoundingBox::from_extents([12, 12, 12], [13, 13, 13]), 1);
    let outcome = cropper.bounding_box(&unit, &rebuilt, "idx-b").unwrap();
    assert_eq!(cropper.computations(), 2);
    assert!(matches!(
        outcome,
        BoxOutcome::Present { bbox, .. } if bbox.min() == [12, 12, 12]
    ));
    assert!(!crop.exists());

    let record: BoxRecord = crate::artifacts::peek_record(&cropper.layout().bbox_path(&unit))
        .unwrap()
        .unwrap();
    assert_eq!(record.index.as_deref(), Some("idx-b"));
}

#[test]
fn test_absent_label() {
    let dir = tempfile::tempdir().unwrap();
    let cropper = BoundingBoxCropper::new(ArtifactLayout::new(dir.path()));
    let unit = UnitKey::new(subject(), 7);
    assert_eq!(
        cropper.bounding_box(&unit, &native_index(), INDEX).unwrap(),
        BoxOutcome::Absent
    );
    // Absence is cached as well.
    assert_eq!(
        cropper.bounding_box(&unit, &native_index(), INDEX).unwrap(),
        BoxOutcome::Absent
    );
    assert_eq!(cropper.computations(), 1);
}

#[test]
fn test_extract_any_source() {
    let index = native_index();
    let bbox = BoundingBox::from_extents([10, 10, 10], [11, 11, 11]);
    let mask = cluster_mask(&index, 2, &bbox).unwrap();
    assert_eq!(mask.count_nonzero(), 8);

    let raw = index.map(|&v| v as f32 * 10.0);
    let cut = extract(&raw, &bbox).unwrap();
    assert_eq!(cut.dims(), [2, 2, 2]);
    assert!(cut.voxels().iter().all(|&v| v == 20.0));
}

#[test]
fn test_materialize_writes_once() {
    let dir = tempfile::tempdir().unwrap();
    let cropper = BoundingBoxCropper::new(ArtifactLayout::new(dir.path()));
    let index = native_index();
    let bbox = BoundingBox::from_extents([2, 3, 4], [5, 6, 9]);
    let key = UnitKey::new(subject(), 1).crop(SourceKind::Clusters);

    let path = cropper.materialize(&key, &index, &bbox).unwrap();
    assert!(path.ends_with("s1/crops/cluster_1_clusters.nii.gz"));
    let modified = std::fs::metadata(&path).unwrap().modified().unwrap();

    cropper.materialize(&key, &index, &bbox).unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), modified);

    let back: Volume<u32> = read_volume(&path).unwrap();
    assert_eq!(back.dims(), [4, 4, 6]);
    assert_eq!(back.count_nonzero(), 96);
}
