use super::*;
use crate::artifacts::write_record;
use crate::counting::{CountStats, Provenance};
use crate::volume::BoundingBox;

fn computed_box(volume_mm3: f64) -> BoxRecord {
    BoxRecord {
        state: UnitState::Computed,
        bbox: Some(BoundingBox::from_extents([0, 0, 0], [3, 3, 3])),
        volume_mm3: Some(volume_mm3),
        reason: None,
        index: None,
    }
}

fn computed_count(objects: u64) -> CountRecord {
    CountRecord {
        state: UnitState::Computed,
        provenance: Some(Provenance::FullVolumeAccelerated),
        objects: Some(objects),
        regions: BTreeMap::new(),
        region_volumes_mm3: BTreeMap::new(),
        stats: CountStats::default(),
        reason: None,
        index: None,
    }
}

fn unit(subject: &str, cluster: u32) -> UnitKey {
    UnitKey::new(SubjectId::new(subject), cluster)
}

fn subjects() -> Vec<SubjectRow> {
    vec![
        SubjectRow::new(SubjectId::new("s3"), "treated"),
        SubjectRow::new(SubjectId::new("s1"), "control"),
        SubjectRow::new(SubjectId::new("s2"), "treated"),
        SubjectRow::new(SubjectId::new("s0"), "control"),
    ]
}

fn aggregator() -> RegionFractionAggregator {
    RegionFractionAggregator::new(ArtifactLayout::new("/unused"), false)
}

#[test]
fn test_density_two_decimals() {
    let mut records = BTreeMap::new();
    records.insert(
        unit("s1", 1),
        UnitRecords {
            bbox: Some(computed_box(0.06)),
            count: Some(computed_count(120)),
        },
    );
    let rows = [SubjectRow::new(SubjectId::new("s1"), "control")];
    let tables = aggregator().tables(&rows, &[1], &records);

    assert_eq!(tables.counts.cell("s1", "Cluster_1"), Some("120"));
    assert_eq!(tables.volumes.cell("s1", "Cluster_1"), Some("0.06"));
    assert_eq!(tables.densities.cell("s1", "Cluster_1"), Some("2000.00"));
}

#[test]
fn test_missing_and_failed_units_are_na() {
    let mut records = BTreeMap::new();
    records.insert(
        unit("s1", 1),
        UnitRecords {
            bbox: Some(computed_box(2.0)),
            count: Some(CountRecord::failed("transform unavailable")),
        },
    );
    records.insert(
        unit("s1", 2),
        UnitRecords {
            bbox: Some(computed_box(0.0)),
            count: Some(computed_count(0)),
        },
    );
    let rows = [SubjectRow::new(SubjectId::new("s1"), "control")];
    let tables = aggregator().tables(&rows, &[1, 2, 3], &records);

    assert_eq!(tables.counts.cell("s1", "Cluster_1"), Some(NA));
    assert_eq!(tables.volumes.cell("s1", "Cluster_1"), Some("2"));
    assert_eq!(tables.densities.cell("s1", "Cluster_1"), Some(NA));

    // Zero objects is a value; zero volume has no density.
    assert_eq!(tables.counts.cell("s1", "Cluster_2"), Some("0"));
    assert_eq!(tables.densities.cell("s1", "Cluster_2"), Some(NA));

    for table in [&tables.counts, &tables.volumes, &tables.densities] {
        assert_eq!(table.cell("s1", "Cluster_3"), Some(NA));
    }
}

#[test]
fn test_rows_sorted_by_condition_stably() {
    let tables = aggregator().tables(&subjects(), &[1, 2], &BTreeMap::new());

    assert_eq!(
        tables.counts.header,
        vec!["Samples", "Conditions", "Cluster_1", "Cluster_2"]
    );
    let order: Vec<&str> = tables.counts.rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(order, vec!["s1", "s0", "s3", "s2"]);
    assert!(tables.counts.rows.iter().all(|r| r[2] == NA && r[3] == NA));
}

#[test]
fn test_region_mode_rows() {
    let mut count = computed_count(3);
    count.regions = BTreeMap::from([(0, 0.5), (4, 2.5)]);
    count.region_volumes_mm3 = BTreeMap::from([(0, 0.25), (4, 1.0)]);
    let mut records = BTreeMap::new();
    records.insert(
        unit("s1", 1),
        UnitRecords {
            bbox: Some(computed_box(1.25)),
            count: Some(count),
        },
    );
    let rows = [
        SubjectRow::new(SubjectId::new("s1"), "control"),
        SubjectRow::new(SubjectId::new("s2"), "control"),
    ];
    let aggregator = RegionFractionAggregator::new(ArtifactLayout::new("/unused"), true);
    let tables = aggregator.tables(&rows, &[1, 2], &records);

    assert_eq!(
        tables.counts.header,
        vec!["Samples", "Conditions", "Regions", "Cluster_1", "Cluster_2"]
    );
    assert_eq!(
        tables.counts.rows,
        vec![
            vec!["s1", "control", "0", "0.5000", "NA"],
            vec!["s1", "control", "4", "2.5000", "NA"],
            vec!["s2", "control", "NA", "NA", "NA"],
        ]
    );
    assert_eq!(tables.densities.rows[0][3], "2.00");
    assert_eq!(tables.densities.rows[1][3], "2.50");
}

#[test]
fn test_csv_quoting() {
    let table = Table {
        header: vec!["Samples".into(), "Conditions".into()],
        rows: vec![vec!["s1".into(), "dose 1, \"high\"".into()]],
    };
    assert_eq!(
        table.to_csv(),
        "Samples,Conditions\ns1,\"dose 1, \"\"high\"\"\"\n"
    );
}

#[test]
fn test_collect_reads_without_mutating() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ArtifactLayout::new(dir.path());
    let u = unit("s1", 1);
    write_record(&layout.bbox_path(&u), &computed_box(0.5)).unwrap();
    write_record(&layout.count_path(&u), &computed_count(4)).unwrap();
    let corrupt = layout.count_path(&unit("s1", 2));
    std::fs::write(&corrupt, "").unwrap();

    let aggregator = RegionFractionAggregator::new(layout, false);
    let rows = [SubjectRow::new(SubjectId::new("s1"), "control")];
    let out = dir.path().join("results");
    let written = aggregator.write_tables(&rows, &[1, 2], &out).unwrap();

    assert_eq!(written.len(), 3);
    assert!(corrupt.exists());
    let densities = std::fs::read_to_string(out.join("cluster_densities.csv")).unwrap();
    assert_eq!(
        densities,
        "Samples,Conditions,Cluster_1,Cluster_2\ns1,control,8.00,NA\n"
    );
}

#[test]
fn test_subject_density_file() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ArtifactLayout::new(dir.path());
    let u = unit("s1", 1);
    write_record(&layout.bbox_path(&u), &computed_box(0.06)).unwrap();
    write_record(&layout.count_path(&u), &computed_count(120)).unwrap();

    let aggregator = RegionFractionAggregator::new(layout.clone(), false);
    let path = aggregator
        .write_subject_densities(&SubjectId::new("s1"), &[1, 2])
        .unwrap();
    assert_eq!(path, layout.density_csv_path(&SubjectId::new("s1")));
    assert_eq!(
        std::fs::read_to_string(path).unwrap(),
        "subject,cluster,count,volume,density\ns1,1,120,0.06,2000.00\ns1,2,NA,NA,NA\n"
    );
}

#[test]
fn test_records_from_other_index_read_as_na() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ArtifactLayout::new(dir.path());
    let current = unit("s1", 1);
    let stale = unit("s1", 2);
    for (u, index, objects) in [(&current, "new", 4), (&stale, "old", 9)] {
        let bbox = BoxRecord {
            index: Some(index.to_string()),
            ..computed_box(0.5)
        };
        write_record(&layout.bbox_path(u), &bbox).unwrap();
        write_record(&layout.count_path(u), &computed_count(objects).for_index(index)).unwrap();
    }

    let rows = [SubjectRow::new(SubjectId::new("s1"), "control")];
    let records = RegionFractionAggregator::new(layout.clone(), false)
        .with_index("new")
        .collect(&rows, &[1, 2])
        .unwrap();
    assert_eq!(records[&current].objects(), Some(4.0));
    assert!(records[&stale].count.is_none());
    assert!(records[&stale].bbox.is_none());
    // Filtering leaves the files alone.
    assert!(layout.count_path(&stale).exists());
}

#[test]
fn test_unreadable_record_reads_as_na() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ArtifactLayout::new(dir.path());
    let u = unit("s1", 1);
    write_record(&layout.bbox_path(&u), &computed_box(0.5)).unwrap();
    std::fs::create_dir_all(layout.count_path(&u)).unwrap();

    let rows = [SubjectRow::new(SubjectId::new("s1"), "control")];
    let out = dir.path().join("results");
    RegionFractionAggregator::new(layout, false)
        .write_tables(&rows, &[1], &out)
        .unwrap();
    let counts = std::fs::read_to_string(out.join("cluster_counts.csv")).unwrap();
    assert_eq!(counts, "Samples,Conditions,Cluster_1\ns1,control,NA\n");
}
