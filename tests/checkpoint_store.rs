use scada_prep::{
    CheckpointStore, ColumnKey, Detection, FeatureType, InterpolateConfig, InterpolationMode,
    NormalizationConstants, NormalizeConfig, NullifyConfig, Pipeline, PipelineConfig, RangeFlag,
    SegmentationConfig, SqliteCheckpointStore, Stage, StageDescriptor, TurbineId, WideTable,
};

const ROWS: usize = 480;

fn table() -> WideTable {
    let mut columns = Vec::new();
    for k in 0..2usize {
        let turbine = TurbineId::new(format!("wt{:03}", k + 1));
        let ws: Vec<Option<f64>> = (0..ROWS)
            .map(|i| match i {
                50 if k == 1 => None,
                90 if k == 0 => Some(-3.0),
                _ => Some(7.0 + (i as f64 * 0.04).sin() + 0.3 * k as f64),
            })
            .collect();
        let wd: Vec<Option<f64>> = (0..ROWS)
            .map(|i| Some((350.0 + 30.0 * (i as f64 * 0.02).sin()).rem_euclid(360.0)))
            .collect();
        let nd = wd.iter().map(|v| v.map(|x| (x + 4.0) % 360.0)).collect();
        columns.push((ColumnKey::new(FeatureType::WindSpeed, turbine.clone()), ws));
        columns.push((ColumnKey::new(FeatureType::WindDirection, turbine.clone()), wd));
        columns.push((ColumnKey::new(FeatureType::NacelleDirection, turbine), nd));
    }
    WideTable::new(
        5_000,
        (0..ROWS as i64).map(|i| i * 5_000).collect(),
        columns,
    )
    .expect("valid table")
}

fn config(lower: f64) -> PipelineConfig {
    PipelineConfig {
        dt_seconds: 5,
        chunk_rows: 64,
        stages: vec![
            StageDescriptor::enabled(Stage::RangeFlag(Detection::new(
                RangeFlag {
                    feature: FeatureType::WindSpeed,
                    lower,
                    upper: 70.0,
                },
                NullifyConfig::default(),
            ))),
            StageDescriptor::enabled(Stage::Interpolate(InterpolateConfig {
                features: vec![FeatureType::WindSpeed],
                mode: InterpolationMode::Linear,
                max_gap_duration_s: 60,
            })),
            StageDescriptor::enabled(Stage::Split(SegmentationConfig::default())),
            StageDescriptor::enabled(Stage::Normalize(NormalizeConfig::default())),
        ],
    }
}

#[test]
fn sqlite_checkpoints_survive_reopen_and_serve_every_stage() {
    let dir = tempfile::tempdir().expect("temp dir");
    let db_path = dir.path().join("checkpoints").join("stages.sqlite");
    let pipeline = Pipeline::new(config(0.0)).expect("valid config");

    let first = {
        let mut store = SqliteCheckpointStore::open(&db_path).expect("open store");
        pipeline.run(&table(), &mut store, None).expect("first run")
    };
    assert!(first.stage_reports.iter().all(|r| !r.cached));
    assert_eq!(first.stage_reports[0].cells_nullified, 1);
    assert_eq!(first.stage_reports[1].cells_repaired, 2);

    let mut reopened = SqliteCheckpointStore::open(&db_path).expect("reopen store");
    assert_eq!(
        reopened.stages().expect("list stages"),
        vec!["range_flag", "interpolate", "split", "normalize"]
    );
    let second = pipeline
        .run(&table(), &mut reopened, None)
        .expect("second run");
    assert!(second.stage_reports.iter().all(|r| r.cached));
    assert_eq!(second.table, first.table);
    assert_eq!(second.normalization, first.normalization);
}

#[test]
fn changed_threshold_recomputes_from_that_stage_on() {
    let dir = tempfile::tempdir().expect("temp dir");
    let db_path = dir.path().join("stages.sqlite");
    let mut store = SqliteCheckpointStore::open(&db_path).expect("open store");

    Pipeline::new(config(0.0))
        .expect("valid config")
        .run(&table(), &mut store, None)
        .expect("first run");
    let rerun = Pipeline::new(config(-5.0))
        .expect("valid config")
        .run(&table(), &mut store, None)
        .expect("rerun");

    assert!(rerun.stage_reports.iter().all(|r| !r.cached));
    assert_eq!(rerun.stage_reports[0].cells_nullified, 0);
    assert_eq!(rerun.stage_reports[1].cells_repaired, 1);
    assert_eq!(store.stages().expect("list stages").len(), 8);
}

#[test]
fn cached_stage_output_matches_direct_load() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = SqliteCheckpointStore::open(&dir.path().join("s.sqlite")).expect("open");
    let output = Pipeline::new(config(0.0))
        .expect("valid config")
        .run(&table(), &mut store, None)
        .expect("run");

    let last = output.stage_reports.last().expect("normalize report");
    let key = scada_prep::CheckpointKey {
        stage: last.stage.clone(),
        fingerprint: last.fingerprint.clone(),
    };
    let stored = store.load(&key).expect("load").expect("present");
    assert_eq!(stored.table, output.table);
    assert_eq!(stored.normalization, output.normalization);

    let constants = output.normalization.expect("constants");
    let mut csv_bytes = Vec::new();
    constants.to_csv_writer(&mut csv_bytes).expect("write constants");
    let back = NormalizationConstants::from_csv_reader(csv_bytes.as_slice()).expect("read");
    assert_eq!(back, constants);
}
