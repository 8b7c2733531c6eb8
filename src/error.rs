//! Error taxonomy shared by the pipeline stages.

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::schema::FeatureType;
use crate::table::TableError;

/// Failures raised by a single component. The driver attaches the stage name
/// through [`PipelineError::Stage`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StageError {
    #[error("{feature}: {nullified}/{total} nulled > {max_fraction:.4}, worst {worst_turbine}")]
    ThresholdExceeded {
        feature: FeatureType,
        nullified: usize,
        total: usize,
        fraction: f64,
        max_fraction: f64,
        worst_turbine: String,
        worst_turbine_nullified: usize,
    },
    #[error("no span survived: {candidate_spans} candidates, min {minimum_span_duration_s}s")]
    NoEligibleSpans {
        candidate_spans: usize,
        missing_col_threshold: usize,
        missing_duration_threshold_s: i64,
        minimum_span_duration_s: i64,
    },
    #[error("degenerate normalization range for {feature}: min {min}, max {max}")]
    DegenerateNormalization {
        feature: FeatureType,
        min: f64,
        max: f64,
    },
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("invalid stage parameter: {0}")]
    InvalidParameter(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage `{stage}` failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },
    #[error("invalid pipeline config: {0}")]
    InvalidConfig(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("table error: {0}")]
    Table(#[from] TableError),
}

impl PipelineError {
    pub fn stage(stage: impl Into<String>, source: StageError) -> Self {
        Self::Stage {
            stage: stage.into(),
            source,
        }
    }

    pub fn stage_error(&self) -> Option<&StageError> {
        match self {
            Self::Stage { source, .. } => Some(source),
            _ => None,
        }
    }
}
