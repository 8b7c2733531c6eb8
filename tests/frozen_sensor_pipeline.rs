use scada_prep::{
    ColumnKey, Detection, FeatureType, ImputeConfig, InterpolateConfig, InterpolationMode,
    MemoryCheckpointStore, NullifyConfig, Pipeline, PipelineConfig, Stage, StageDescriptor,
    TurbineId, UnresponsiveSensor, WideTable,
};

const DT_MS: i64 = 5_000;
const ROWS: usize = 720;
const FROZEN_START: usize = 200;
const FROZEN_END: usize = 500;

fn assert_close(actual: f64, expected: f64, tol: f64) {
    assert!(
        (actual - expected).abs() <= tol,
        "actual={actual} expected={expected} tol={tol}"
    );
}

fn wt(n: usize) -> TurbineId {
    TurbineId::new(format!("wt{n:03}"))
}

fn reference_speed(row: usize) -> f64 {
    let t = row as f64;
    8.0 + 2.0 * (t * 0.05).sin() + 0.5 * (t * 0.013).cos()
}

fn follower_speed(row: usize) -> f64 {
    1.1 * reference_speed(row) + 0.2
}

/// One hour at 5 s of two correlated turbines; the second turbine's
/// anemometer sticks for 25 minutes.
fn frozen_table() -> WideTable {
    let ws1: Vec<Option<f64>> = (0..ROWS).map(|i| Some(reference_speed(i))).collect();
    let stuck = follower_speed(FROZEN_START);
    let ws2: Vec<Option<f64>> = (0..ROWS)
        .map(|i| {
            if (FROZEN_START..FROZEN_END).contains(&i) {
                Some(stuck)
            } else {
                Some(follower_speed(i))
            }
        })
        .collect();
    WideTable::new(
        DT_MS,
        (0..ROWS as i64).map(|i| 1_700_000_000_000 + i * DT_MS).collect(),
        vec![
            (ColumnKey::new(FeatureType::WindSpeed, wt(1)), ws1),
            (ColumnKey::new(FeatureType::WindSpeed, wt(2)), ws2),
        ],
    )
    .expect("valid table")
}

fn frozen_config() -> PipelineConfig {
    PipelineConfig {
        dt_seconds: 5,
        chunk_rows: 128,
        stages: vec![
            StageDescriptor::enabled(Stage::UnresponsiveSensor(Detection::new(
                UnresponsiveSensor {
                    features: vec![FeatureType::WindSpeed],
                    min_stuck_duration_s: 20 * 60,
                },
                NullifyConfig {
                    targets: None,
                    max_null_fraction: 0.5,
                },
            ))),
            StageDescriptor::enabled(Stage::Impute(ImputeConfig::new(vec![
                FeatureType::WindSpeed,
            ]))),
            StageDescriptor::enabled(Stage::Interpolate(InterpolateConfig {
                features: vec![FeatureType::WindSpeed],
                mode: InterpolationMode::Linear,
                max_gap_duration_s: 600,
            })),
        ],
    }
}

#[test]
fn frozen_anemometer_is_flagged_and_rebuilt_from_the_neighbour() {
    let input = frozen_table();
    let pipeline = Pipeline::new(frozen_config()).expect("valid config");
    let mut store = MemoryCheckpointStore::new();
    let output = pipeline.run(&input, &mut store, None).expect("pipeline run");

    let reports = &output.stage_reports;
    assert_eq!(reports.len(), 3);
    assert_eq!(reports[0].stage, "unresponsive_sensor");
    assert_eq!(reports[0].cells_nullified, FROZEN_END - FROZEN_START);
    assert_eq!(reports[1].stage, "impute");
    assert_eq!(reports[1].cells_repaired, FROZEN_END - FROZEN_START);
    assert_eq!(reports[2].cells_repaired, 0);
    assert!(reports.iter().all(|r| r.rows_in == ROWS && r.rows_out == ROWS));

    assert_eq!(output.table.null_count(FeatureType::WindSpeed), 0);
    let rebuilt = output
        .table
        .column(FeatureType::WindSpeed, &wt(2))
        .expect("wt002 wind speed");
    for row in FROZEN_START..FROZEN_END {
        let value = rebuilt[row].expect("filled");
        assert_close(value, follower_speed(row), 1e-6);
    }
    // untouched outside the frozen window
    assert_eq!(rebuilt[FROZEN_START - 1], Some(follower_speed(FROZEN_START - 1)));
    assert_eq!(rebuilt[FROZEN_END], Some(follower_speed(FROZEN_END)));
    assert_eq!(
        output.table.column(FeatureType::WindSpeed, &wt(1)),
        input.column(FeatureType::WindSpeed, &wt(1))
    );
}

#[test]
fn shorter_freeze_than_the_stuck_threshold_is_left_alone() {
    let mut config = frozen_config();
    if let Stage::UnresponsiveSensor(detection) = &mut config.stages[0].stage {
        detection.detector.min_stuck_duration_s = 30 * 60;
    }
    let output = Pipeline::new(config)
        .expect("valid config")
        .run(&frozen_table(), &mut MemoryCheckpointStore::new(), None)
        .expect("pipeline run");
    assert_eq!(output.stage_reports[0].cells_nullified, 0);
    assert_eq!(output.table, frozen_table());
}

#[test]
fn tight_null_budget_aborts_with_the_worst_turbine() {
    let mut config = frozen_config();
    if let Stage::UnresponsiveSensor(detection) = &mut config.stages[0].stage {
        detection.nullify.max_null_fraction = 0.01;
    }
    let err = Pipeline::new(config)
        .expect("valid config")
        .run(&frozen_table(), &mut MemoryCheckpointStore::new(), None)
        .expect_err("300 of 1440 cells exceeds a 1% budget");
    match err.stage_error() {
        Some(scada_prep::StageError::ThresholdExceeded {
            nullified,
            total,
            worst_turbine,
            worst_turbine_nullified,
            ..
        }) => {
            assert_eq!(*nullified, FROZEN_END - FROZEN_START);
            assert_eq!(*total, 2 * ROWS);
            assert_eq!(worst_turbine, "wt002");
            assert_eq!(*worst_turbine_nullified, FROZEN_END - FROZEN_START);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn csv_round_trip_feeds_the_same_pipeline_result() {
    let input = frozen_table();
    let mut csv_bytes = Vec::new();
    input.to_csv_writer(&mut csv_bytes).expect("write csv");
    let reloaded = WideTable::from_csv_reader(csv_bytes.as_slice(), DT_MS).expect("read csv");
    assert_eq!(reloaded.turbine_ids(), input.turbine_ids());
    assert_eq!(reloaded.len(), ROWS);

    let pipeline = Pipeline::new(frozen_config()).expect("valid config");
    let from_csv = pipeline
        .run(&reloaded, &mut MemoryCheckpointStore::new(), None)
        .expect("pipeline run");
    assert_eq!(
        from_csv.stage_reports[0].cells_nullified,
        FROZEN_END - FROZEN_START
    );
    assert_eq!(from_csv.table.null_count(FeatureType::WindSpeed), 0);
}
