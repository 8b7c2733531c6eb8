//! Pipeline driver: runs the enabled stages in order through the checkpoint
//! layer and collects per-stage reports.

use serde::{Deserialize, Serialize};

use crate::calibration::{calibrate, CalibrationReport, WakeAlignmentEstimator};
use crate::checkpoint::{load_or_compute, CheckpointKey, CheckpointStore, StageOutput};
use crate::config::{PipelineConfig, Stage};
use crate::continuity::segment;
use crate::error::{PipelineError, StageError};
use crate::normalize::{normalize, NormalizationConstants};
use crate::nullify::apply_masks;
use crate::observability::{
    log_detect_finish, log_pipeline_finish, log_pipeline_start, log_stage_cached,
    log_stage_finish, log_stage_skipped, log_stage_start,
};
use crate::repair::{impute, interpolate};
use crate::table::WideTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub fingerprint: String,
    pub cached: bool,
    pub rows_in: usize,
    pub rows_out: usize,
    pub cells_nullified: usize,
    pub cells_repaired: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub table: WideTable,
    pub normalization: Option<NormalizationConstants>,
    pub calibration: Option<CalibrationReport>,
    pub stage_reports: Vec<StageReport>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|err| PipelineError::InvalidConfig(err.to_string()))?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Checks every enabled stage's input columns against `input` so that a
    /// missing column fails the run before any stage has executed.
    pub fn check_inputs(&self, input: &WideTable) -> Result<(), PipelineError> {
        if input.dt_ms() != self.config.dt_ms() {
            return Err(PipelineError::InvalidConfig(format!(
                "table dt is {} ms but config dt_seconds is {}",
                input.dt_ms(),
                self.config.dt_seconds
            )));
        }
        for stage in self.config.enabled_stages() {
            input
                .require(&stage.required_features(), input.turbine_ids())
                .map_err(|err| PipelineError::stage(stage.name(), err))?;
        }
        Ok(())
    }

    pub fn run(
        &self,
        input: &WideTable,
        store: &mut dyn CheckpointStore,
        estimator: Option<&dyn WakeAlignmentEstimator>,
    ) -> Result<PipelineOutput, PipelineError> {
        self.check_inputs(input)?;
        let enabled = self.config.enabled_stages().count();
        log_pipeline_start(input.len(), input.turbine_ids().len(), enabled, input.dt_ms());

        let mut current = input.clone();
        let mut upstream = input.content_fingerprint();
        let mut normalization = None;
        let mut calibration = None;
        let mut stage_reports = Vec::with_capacity(enabled);

        for descriptor in &self.config.stages {
            let stage = &descriptor.stage;
            let name = stage.name();
            if !descriptor.enabled {
                log_stage_skipped(name);
                continue;
            }

            let estimator_tag = match stage {
                Stage::NacelleCalibration(_) => estimator.map(|e| e.cache_tag()),
                _ => None,
            };
            let key = CheckpointKey::derive(&upstream, name, &(stage, estimator_tag))?;
            let rows_in = current.len();
            log_stage_start(name, rows_in);

            let (output, cached) = load_or_compute(store, &key, || {
                run_stage(stage, &current, estimator, self.config.chunk_rows)
                    .map_err(|err| PipelineError::stage(name, err))
            })?;
            if cached {
                log_stage_cached(name, &key.fingerprint);
            }
            log_stage_finish(
                name,
                rows_in,
                output.table.len(),
                output.cells_nullified,
                output.cells_repaired,
            );

            stage_reports.push(StageReport {
                stage: name.to_string(),
                fingerprint: key.fingerprint.clone(),
                cached,
                rows_in,
                rows_out: output.table.len(),
                cells_nullified: output.cells_nullified,
                cells_repaired: output.cells_repaired,
            });
            if output.normalization.is_some() {
                normalization = output.normalization;
            }
            if output.calibration.is_some() {
                calibration = output.calibration;
            }
            current = output.table;
            upstream = key.fingerprint;
        }

        log_pipeline_finish(
            current.len(),
            stage_reports.len(),
            stage_reports.iter().filter(|r| r.cached).count(),
        );
        Ok(PipelineOutput {
            table: current,
            normalization,
            calibration,
            stage_reports,
        })
    }
}

fn run_stage(
    stage: &Stage,
    table: &WideTable,
    estimator: Option<&dyn WakeAlignmentEstimator>,
    chunk_rows: usize,
) -> Result<StageOutput, StageError> {
    if let Some((detector, nullify)) = stage.detection() {
        let masks = detector.detect(table, table.turbine_ids())?;
        log_detect_finish(
            detector.name(),
            masks.len(),
            masks.iter().map(|m| m.count()).sum(),
        );
        let (out, summary) = apply_masks(table, &masks, nullify)?;
        let mut output = StageOutput::from_table(out);
        output.cells_nullified = summary.total_nullified();
        return Ok(output);
    }

    match stage {
        Stage::NacelleCalibration(config) => {
            let (out, report) = calibrate(table, config, estimator, chunk_rows)?;
            let mut output = StageOutput::from_table(out);
            output.calibration = Some(report);
            Ok(output)
        }
        Stage::Impute(config) => {
            let (out, report) = impute(table, config)?;
            let mut output = StageOutput::from_table(out);
            output.cells_repaired = report.filled;
            Ok(output)
        }
        Stage::Interpolate(config) => {
            let (out, report) = interpolate(table, config)?;
            let mut output = StageOutput::from_table(out);
            output.cells_repaired = report.filled;
            Ok(output)
        }
        Stage::Split(config) => {
            let (out, _) = segment(table, config)?;
            Ok(StageOutput::from_table(out))
        }
        Stage::Normalize(config) => {
            let (out, constants) = normalize(table, config, chunk_rows)?;
            let mut output = StageOutput::from_table(out);
            output.normalization = Some(constants);
            Ok(output)
        }
        other => Err(StageError::InvalidParameter(format!(
            "stage `{}` has no runner",
            other.name()
        ))),
    }
}
