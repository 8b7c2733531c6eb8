//! Nacelle and Northing calibration of wind and nacelle directions.
//!
//! Each turbine's constant bias is estimated against the farm-wide circular
//! median on block-averaged data and subtracted at full resolution. A global
//! Northing offset can then be supplied by a [`WakeAlignmentEstimator`].

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::angular::{
    angular_difference, circular_mean, circular_median_across_columns, wrap_to_signed_range,
};
use crate::error::StageError;
use crate::plan::LazyTable;
use crate::schema::{ColumnKey, FeatureType, TurbineId};
use crate::table::WideTable;

/// Estimates angular offsets between turbine-pair alignment and the direction
/// of peak wake loss, one value per pair, in degrees.
pub trait WakeAlignmentEstimator: Send + Sync {
    fn estimate_turbine_pair_offsets(
        &self,
        table: &WideTable,
        pairs: &[(TurbineId, TurbineId)],
    ) -> Vec<f64>;

    /// Identifies the estimator's inputs in checkpoint keys; estimators whose
    /// output can change between runs must return a distinct tag per setup.
    fn cache_tag(&self) -> String {
        String::new()
    }
}

/// Returns a fixed list of offsets regardless of the data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixedOffsetEstimator {
    offsets: Vec<f64>,
}

impl FixedOffsetEstimator {
    pub fn new(offsets: Vec<f64>) -> Self {
        Self { offsets }
    }
}

impl WakeAlignmentEstimator for FixedOffsetEstimator {
    fn estimate_turbine_pair_offsets(
        &self,
        _table: &WideTable,
        _pairs: &[(TurbineId, TurbineId)],
    ) -> Vec<f64> {
        self.offsets.clone()
    }

    fn cache_tag(&self) -> String {
        format!("fixed:{:?}", self.offsets)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Added to every wind direction before estimation.
    #[serde(default)]
    pub wind_direction_offset_deg: f64,
    #[serde(default = "default_block_duration_s")]
    pub block_duration_s: i64,
    /// Pairs handed to the Northing estimator. Empty uses consecutive
    /// turbines in id order.
    #[serde(default)]
    pub turbine_pairs: Vec<(TurbineId, TurbineId)>,
}

fn default_block_duration_s() -> i64 {
    600
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            wind_direction_offset_deg: 0.0,
            block_duration_s: default_block_duration_s(),
            turbine_pairs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurbineBias {
    pub turbine_id: TurbineId,
    /// Total correction subtracted from this turbine, Northing included,
    /// rounded to two decimals.
    pub northing_bias: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub turbines: Vec<TurbineBias>,
    pub northing_offset_deg: Option<f64>,
    /// Mean over turbines of the circular mean of `wd - nd` after correction.
    pub mean_residual_bias_deg: Option<f64>,
}

impl CalibrationReport {
    pub fn bias_for(&self, turbine: &TurbineId) -> Option<f64> {
        self.turbines
            .iter()
            .find(|b| &b.turbine_id == turbine)
            .map(|b| b.northing_bias)
    }
}

pub const REQUIRED_FEATURES: [FeatureType; 3] = [
    FeatureType::WindDirection,
    FeatureType::NacelleDirection,
    FeatureType::PowerOutput,
];

pub fn calibrate(
    table: &WideTable,
    config: &CalibrationConfig,
    estimator: Option<&dyn WakeAlignmentEstimator>,
    chunk_rows: usize,
) -> Result<(WideTable, CalibrationReport), StageError> {
    if config.block_duration_s <= 0 {
        return Err(StageError::InvalidParameter(format!(
            "block_duration_s must be > 0, got {}",
            config.block_duration_s
        )));
    }
    let turbines = table.turbine_ids().to_vec();
    table.require(&REQUIRED_FEATURES, &turbines)?;
    let block_ms = config.block_duration_s * 1_000;

    let shifted = if config.wind_direction_offset_deg != 0.0 {
        rotate_all(
            table.clone(),
            &turbines,
            &[FeatureType::WindDirection],
            -config.wind_direction_offset_deg,
            chunk_rows,
        )?
    } else {
        table.clone()
    };

    let blocks = block_average(&shifted, block_ms)?;
    let biases = estimate_biases(&blocks, &turbines)?;
    for (turbine, bias) in turbines.iter().zip(&biases) {
        info!(
            component = "calibration",
            event = "calibration.turbine_bias",
            turbine = %turbine,
            bias_deg = *bias
        );
    }

    let mut lazy = LazyTable::new(shifted).with_chunk_rows(chunk_rows);
    for (turbine, bias) in turbines.iter().zip(&biases) {
        for feature in [FeatureType::WindDirection, FeatureType::NacelleDirection] {
            lazy = lazy.rotate(ColumnKey::new(feature, turbine.clone()), *bias);
        }
    }
    let mut corrected = lazy.collect()?;

    let mut northing_offset_deg = None;
    if let Some(estimator) = estimator {
        let pairs: Vec<(TurbineId, TurbineId)> = if config.turbine_pairs.is_empty() {
            turbines
                .windows(2)
                .map(|w| (w[0].clone(), w[1].clone()))
                .collect()
        } else {
            config.turbine_pairs.clone()
        };
        let corrected_blocks = block_average(&corrected, block_ms)?;
        let offsets = estimator.estimate_turbine_pair_offsets(&corrected_blocks, &pairs);
        if offsets.is_empty() {
            warn!(
                component = "calibration",
                event = "calibration.northing",
                pairs = pairs.len(),
                outcome = "skipped_no_offsets"
            );
        } else {
            let northing = offsets.iter().map(|o| wrap_to_signed_range(*o)).sum::<f64>()
                / offsets.len() as f64;
            info!(
                component = "calibration",
                event = "calibration.northing",
                pairs = pairs.len(),
                offsets = offsets.len(),
                northing_deg = northing
            );
            corrected = rotate_all(
                corrected,
                &turbines,
                &[FeatureType::WindDirection, FeatureType::NacelleDirection],
                northing,
                chunk_rows,
            )?;
            northing_offset_deg = Some(northing);
        }
    }

    let report = CalibrationReport {
        turbines: turbines
            .iter()
            .zip(&biases)
            .map(|(turbine, bias)| TurbineBias {
                turbine_id: turbine.clone(),
                northing_bias: round2(wrap_to_signed_range(
                    bias + northing_offset_deg.unwrap_or(0.0),
                )),
            })
            .collect(),
        northing_offset_deg,
        mean_residual_bias_deg: mean_residual_bias(
            &block_average(&corrected, block_ms)?,
            &turbines,
        ),
    };
    Ok((corrected, report))
}

fn rotate_all(
    table: WideTable,
    turbines: &[TurbineId],
    features: &[FeatureType],
    degrees: f64,
    chunk_rows: usize,
) -> Result<WideTable, StageError> {
    let mut lazy = LazyTable::new(table).with_chunk_rows(chunk_rows);
    for turbine in turbines {
        for feature in features {
            lazy = lazy.rotate(ColumnKey::new(*feature, turbine.clone()), degrees);
        }
    }
    lazy.collect()
}

/// Averages rows into fixed blocks keyed by block start. Angular features use
/// the circular mean; an all-null block yields null.
pub fn block_average(table: &WideTable, block_ms: i64) -> Result<WideTable, StageError> {
    let mut starts: Vec<i64> = Vec::new();
    let mut bounds: Vec<(usize, usize)> = Vec::new();
    for (row, ts) in table.time().iter().enumerate() {
        let start = ts.div_euclid(block_ms) * block_ms;
        match starts.last() {
            Some(last) if *last == start => {
                if let Some(bound) = bounds.last_mut() {
                    bound.1 = row + 1;
                }
            }
            _ => {
                starts.push(start);
                bounds.push((row, row + 1));
            }
        }
    }

    let keys: Vec<&ColumnKey> = table.keys().collect();
    let columns: Vec<(ColumnKey, Vec<Option<f64>>)> = keys
        .par_iter()
        .map(|key| {
            let values = table.column_by_key(key).unwrap_or_default();
            let averaged = bounds
                .iter()
                .map(|(from, to)| {
                    let block = &values[*from..*to];
                    if key.feature.is_angular() {
                        circular_mean(block.iter().copied())
                    } else {
                        let observed: Vec<f64> = block.iter().flatten().copied().collect();
                        (!observed.is_empty())
                            .then(|| observed.iter().sum::<f64>() / observed.len() as f64)
                    }
                })
                .collect();
            ((*key).clone(), averaged)
        })
        .collect();

    WideTable::new(block_ms, starts, columns)
        .map_err(|err| StageError::MalformedInput(err.to_string()))
}

/// Per-turbine signed bias: half the circular-mean deviation of wind direction
/// from the farm median plus half that of nacelle direction from the farm
/// median yaw, over operating rows (`power >= 0`).
fn estimate_biases(blocks: &WideTable, turbines: &[TurbineId]) -> Result<Vec<f64>, StageError> {
    let wd_median =
        circular_median_across_columns(&family_columns(blocks, FeatureType::WindDirection));
    let yaw_median =
        circular_median_across_columns(&family_columns(blocks, FeatureType::NacelleDirection));

    turbines
        .par_iter()
        .map(|turbine| {
            let column = |feature| {
                blocks.column(feature, turbine).ok_or_else(|| {
                    StageError::MalformedInput(format!("missing column {feature}_{turbine}"))
                })
            };
            let wd = column(FeatureType::WindDirection)?;
            let nd = column(FeatureType::NacelleDirection)?;
            let power = column(FeatureType::PowerOutput)?;

            let operating = |row: usize| power[row].map_or(false, |p| p >= 0.0);
            let deviation = |values: &[Option<f64>], median: &[Option<f64>]| {
                circular_mean((0..values.len()).map(|row| {
                    if !operating(row) {
                        return None;
                    }
                    Some(angular_difference(values[row]?, median[row]?))
                }))
                .map(wrap_to_signed_range)
            };

            let wd_bias = deviation(wd, wd_median.as_slice());
            let yaw_bias = deviation(nd, yaw_median.as_slice());
            let bias = match (wd_bias, yaw_bias) {
                (Some(wd_bias), Some(yaw_bias)) => 0.5 * (wd_bias + yaw_bias),
                (Some(one), None) | (None, Some(one)) => 0.5 * one,
                (None, None) => 0.0,
            };
            Ok(wrap_to_signed_range(bias))
        })
        .collect()
}

fn family_columns(table: &WideTable, feature: FeatureType) -> Vec<&[Option<f64>]> {
    table.family(feature).into_iter().map(|(_, v)| v).collect()
}

fn mean_residual_bias(blocks: &WideTable, turbines: &[TurbineId]) -> Option<f64> {
    let residuals: Vec<f64> = turbines
        .iter()
        .filter_map(|turbine| {
            let wd = blocks.column(FeatureType::WindDirection, turbine)?;
            let nd = blocks.column(FeatureType::NacelleDirection, turbine)?;
            let power = blocks.column(FeatureType::PowerOutput, turbine)?;
            circular_mean(wd.iter().zip(nd).zip(power).map(|((w, n), p)| {
                if p.map_or(true, |p| p < 0.0) {
                    return None;
                }
                Some(angular_difference((*w)?, (*n)?))
            }))
            .map(wrap_to_signed_range)
        })
        .collect();
    (!residuals.is_empty()).then(|| residuals.iter().sum::<f64>() / residuals.len() as f64)
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
