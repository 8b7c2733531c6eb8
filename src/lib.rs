//! Wind-farm SCADA cleaning core crate.
//!
//! Current implemented scope:
//! - wide time-indexed table with CSV ingest and export
//! - nacelle northing calibration
//! - anomaly detectors with budgeted nullification
//! - correlated-turbine imputation and gap interpolation
//! - continuity segmentation and min-max normalization
//! - checkpointed stage pipeline driven by a JSON config

mod angular;
mod calibration;
mod checkpoint;
mod config;
mod continuity;
mod detectors;
mod error;
mod normalize;
mod nullify;
mod observability;
mod pipeline;
mod plan;
mod repair;
mod schema;
mod table;

pub use angular::{
    angular_difference, circular_mean, circular_median_across_columns, circular_std,
    interpolate_angle, resultant_length, wrap_to_signed_range, wrap_to_unsigned_range,
};
pub use calibration::{
    block_average, calibrate, CalibrationConfig, CalibrationReport, FixedOffsetEstimator,
    TurbineBias, WakeAlignmentEstimator,
};
pub use checkpoint::{
    load_or_compute, CheckpointError, CheckpointKey, CheckpointStore, MemoryCheckpointStore,
    SqliteCheckpointStore, StageOutput, CHECKPOINT_SCHEMA_VERSION,
};
pub use config::{ConfigError, Detection, Phase, PipelineConfig, Stage, StageDescriptor};
pub use continuity::{
    check_contiguity, classify_rows, eligible_spans, run_length_spans, segment,
    SegmentationConfig, SegmentationReport, Span, EXCLUDED_GROUP,
};
pub use detectors::{
    BinCenter, BinFilter, Detector, Direction, FlagMask, RangeFlag, StdRange, StdWindow,
    ThresholdType, TurbineStatusFlag, UnresponsiveSensor, WindowRange,
};
pub use error::{PipelineError, StageError};
pub use normalize::{
    engineer_features, normalize, FeatureRange, NormalizationConstants, NormalizeConfig,
    DIRECTION_SHIFT_DEG,
};
pub use nullify::{
    apply_masks, FamilyNullification, NullifyConfig, NullifySummary, DEFAULT_MAX_NULL_FRACTION,
};
pub use observability::{
    init_logging, log_app_start, logging_config_from_env, logging_config_from_lookup, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use pipeline::{Pipeline, PipelineOutput, StageReport};
pub use plan::{family_min_max, ColumnOp, DeriveExpr, LazyTable, DEFAULT_CHUNK_ROWS};
pub use repair::{
    impute, interpolate, ImputeConfig, InsufficientCorrelatedData, InterpolateConfig,
    InterpolationMode, RepairReport,
};
pub use schema::{ColumnKey, FeatureType, TurbineId, ALL_FEATURES};
pub use table::{
    format_timestamp, parse_timestamp, TableError, WideTable, CONTINUITY_GROUP_COLUMN,
    TIME_COLUMN,
};
