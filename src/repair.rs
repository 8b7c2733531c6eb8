//! Gap repair: cross-turbine imputation, then bounded interpolation in time.
//!
//! Imputation only reads contemporaneous values of other turbines; reaching
//! across time within one turbine is left to [`interpolate`].

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::angular::{
    angular_difference, circular_mean, interpolate_angle, resultant_length, wrap_to_unsigned_range,
};
use crate::error::StageError;
use crate::schema::{ColumnKey, FeatureType, TurbineId};
use crate::table::WideTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputeConfig {
    pub features: Vec<FeatureType>,
    /// Minimum r² (linear) or resultant length of differences (angular) for a
    /// turbine to serve as a donor.
    #[serde(default = "default_min_correlation")]
    pub min_correlation: f64,
    /// Minimum number of jointly observed rows needed to fit a donor.
    #[serde(default = "default_min_overlap")]
    pub min_overlap: usize,
}

fn default_min_correlation() -> f64 {
    0.7
}

fn default_min_overlap() -> usize {
    12
}

impl ImputeConfig {
    pub fn new(features: Vec<FeatureType>) -> Self {
        Self {
            features,
            min_correlation: default_min_correlation(),
            min_overlap: default_min_overlap(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpolationMode {
    /// Time-weighted linear bridge; angular features follow the shortest arc.
    Linear,
    /// Carry the last observation forward.
    ForwardFill,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpolateConfig {
    pub features: Vec<FeatureType>,
    pub mode: InterpolationMode,
    pub max_gap_duration_s: i64,
}

impl InterpolateConfig {
    /// Maximum number of consecutive missing grid steps that may be filled.
    pub fn fill_limit(&self, dt_ms: i64) -> usize {
        ((self.max_gap_duration_s * 1_000) / dt_ms.max(1)).max(0) as usize
    }
}

/// Non-fatal: cells that no correlated donor could fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsufficientCorrelatedData {
    pub feature: FeatureType,
    pub turbine: TurbineId,
    pub cells: usize,
    pub first_ts_ms_utc: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairReport {
    pub filled: usize,
    pub remaining_nulls: usize,
    pub insufficient: Vec<InsufficientCorrelatedData>,
}

/// A fitted mapping from a donor turbine's value to the target's.
#[derive(Debug, Clone, Copy)]
enum Donor {
    Linear { idx: usize, intercept: f64, slope: f64 },
    Angular { idx: usize, offset_deg: f64 },
}

impl Donor {
    fn idx(&self) -> usize {
        match self {
            Self::Linear { idx, .. } | Self::Angular { idx, .. } => *idx,
        }
    }

    fn estimate(&self, x: f64) -> f64 {
        match self {
            Self::Linear {
                intercept, slope, ..
            } => intercept + slope * x,
            Self::Angular { offset_deg, .. } => wrap_to_unsigned_range(x + offset_deg),
        }
    }
}

struct ColumnRepair {
    values: Vec<Option<f64>>,
    filled: usize,
    unfilled: usize,
    first_unfilled: Option<usize>,
}

pub fn impute(
    table: &WideTable,
    config: &ImputeConfig,
) -> Result<(WideTable, RepairReport), StageError> {
    if config.features.is_empty() {
        return Err(StageError::InvalidParameter(
            "impute needs at least one feature".to_string(),
        ));
    }
    let turbines = table.turbine_ids();
    table.require(&config.features, turbines)?;

    let mut out = table.clone();
    let mut report = RepairReport::default();
    for feature in &config.features {
        let family: Vec<&[Option<f64>]> = turbines
            .iter()
            .filter_map(|t| table.column(*feature, t))
            .collect();
        let repaired: Vec<ColumnRepair> = (0..family.len())
            .into_par_iter()
            .map(|target| impute_column(&family, target, feature.is_angular(), config))
            .collect();

        for (turbine, repair) in turbines.iter().zip(repaired) {
            report.filled += repair.filled;
            report.remaining_nulls += repair.unfilled;
            if let Some(row) = repair.first_unfilled {
                let entry = InsufficientCorrelatedData {
                    feature: *feature,
                    turbine: turbine.clone(),
                    cells: repair.unfilled,
                    first_ts_ms_utc: table.time()[row],
                };
                debug!(
                    component = "repair",
                    event = "repair.insufficient_correlated_data",
                    feature = %entry.feature,
                    turbine = %entry.turbine,
                    cells = entry.cells,
                    first_ts_ms_utc = entry.first_ts_ms_utc
                );
                report.insufficient.push(entry);
            }
            out.set_column(ColumnKey::new(*feature, turbine.clone()), repair.values)
                .map_err(|err| StageError::MalformedInput(err.to_string()))?;
        }
    }

    info!(
        component = "repair",
        event = "repair.finish",
        strategy = "impute",
        filled = report.filled,
        remaining_nulls = report.remaining_nulls,
        insufficient_columns = report.insufficient.len()
    );
    Ok((out, report))
}

fn impute_column(
    family: &[&[Option<f64>]],
    target: usize,
    angular: bool,
    config: &ImputeConfig,
) -> ColumnRepair {
    let own = family[target];
    let mut repair = ColumnRepair {
        values: own.to_vec(),
        filled: 0,
        unfilled: 0,
        first_unfilled: None,
    };
    if own.iter().all(Option::is_some) {
        return repair;
    }

    let mut donors: Vec<(f64, Donor)> = (0..family.len())
        .filter(|idx| *idx != target)
        .filter_map(|idx| fit_donor(own, family[idx], idx, angular, config))
        .collect();
    donors.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.idx().cmp(&b.1.idx())));

    for (row, cell) in repair.values.iter_mut().enumerate() {
        if cell.is_some() {
            continue;
        }
        let estimate = donors
            .iter()
            .find_map(|(_, donor)| family[donor.idx()][row].map(|x| donor.estimate(x)));
        match estimate {
            Some(value) => {
                *cell = Some(value);
                repair.filled += 1;
            }
            None => {
                repair.unfilled += 1;
                repair.first_unfilled.get_or_insert(row);
            }
        }
    }
    repair
}

/// Fits `own ~ other` over rows where both are observed and returns the
/// donor with its ranking score, or `None` when it is not correlated enough.
fn fit_donor(
    own: &[Option<f64>],
    other: &[Option<f64>],
    idx: usize,
    angular: bool,
    config: &ImputeConfig,
) -> Option<(f64, Donor)> {
    let pairs: Vec<(f64, f64)> = own
        .iter()
        .zip(other)
        .filter_map(|(y, x)| Some(((*x)?, (*y)?)))
        .collect();
    if pairs.len() < config.min_overlap.max(2) {
        return None;
    }

    if angular {
        let diffs: Vec<Option<f64>> = pairs
            .iter()
            .map(|(x, y)| Some(angular_difference(*y, *x)))
            .collect();
        let score = resultant_length(diffs.iter().copied())?;
        let offset_deg = circular_mean(diffs)?;
        return (score >= config.min_correlation)
            .then_some((score, Donor::Angular { idx, offset_deg }));
    }

    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        sxx += (x - mean_x).powi(2);
        syy += (y - mean_y).powi(2);
        sxy += (x - mean_x) * (y - mean_y);
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return None;
    }
    let r2 = (sxy * sxy) / (sxx * syy);
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    (r2 >= config.min_correlation).then_some((
        r2,
        Donor::Linear {
            idx,
            intercept,
            slope,
        },
    ))
}

pub fn interpolate(
    table: &WideTable,
    config: &InterpolateConfig,
) -> Result<(WideTable, RepairReport), StageError> {
    if config.features.is_empty() {
        return Err(StageError::InvalidParameter(
            "interpolate needs at least one feature".to_string(),
        ));
    }
    if config.max_gap_duration_s < 0 {
        return Err(StageError::InvalidParameter(format!(
            "max_gap_duration_s must be >= 0, got {}",
            config.max_gap_duration_s
        )));
    }
    let turbines = table.turbine_ids();
    table.require(&config.features, turbines)?;
    let limit = config.fill_limit(table.dt_ms());

    let mut out = table.clone();
    let mut report = RepairReport::default();
    for feature in &config.features {
        let filled: Vec<(TurbineId, Vec<Option<f64>>, usize)> = turbines
            .par_iter()
            .filter_map(|t| table.column(*feature, t).map(|values| (t, values)))
            .map(|(turbine, values)| {
                let (repaired, count) = fill_gaps(
                    values,
                    table.time(),
                    table.dt_ms(),
                    limit,
                    config.mode,
                    feature.is_angular(),
                );
                (turbine.clone(), repaired, count)
            })
            .collect();
        for (turbine, values, count) in filled {
            report.filled += count;
            report.remaining_nulls += values.iter().filter(|v| v.is_none()).count();
            out.set_column(ColumnKey::new(*feature, turbine), values)
                .map_err(|err| StageError::MalformedInput(err.to_string()))?;
        }
    }

    info!(
        component = "repair",
        event = "repair.finish",
        strategy = "interpolate",
        mode = ?config.mode,
        fill_limit = limit,
        filled = report.filled,
        remaining_nulls = report.remaining_nulls
    );
    Ok((out, report))
}

/// Fills null runs bounded by `limit` missing grid steps. Rows absent from the
/// table count towards the gap length. Leading nulls stay null; trailing nulls
/// are carried forward up to the limit.
fn fill_gaps(
    values: &[Option<f64>],
    time: &[i64],
    dt_ms: i64,
    limit: usize,
    mode: InterpolationMode,
    angular: bool,
) -> (Vec<Option<f64>>, usize) {
    let mut out = values.to_vec();
    let mut filled = 0usize;
    let steps = |from: usize, to: usize| ((time[to] - time[from]) / dt_ms) as usize;

    let mut prev: Option<usize> = None;
    let mut row = 0usize;
    while row < values.len() {
        if values[row].is_some() {
            prev = Some(row);
            row += 1;
            continue;
        }
        let gap_start = row;
        while row < values.len() && values[row].is_none() {
            row += 1;
        }
        let Some(p) = prev else {
            continue;
        };
        let Some(left) = values[p] else {
            continue;
        };
        let next = (row < values.len()).then_some(row);

        match (mode, next) {
            (InterpolationMode::Linear, Some(n)) => {
                let Some(right) = values[n] else {
                    continue;
                };
                if steps(p, n).saturating_sub(1) > limit {
                    continue;
                }
                let span = (time[n] - time[p]) as f64;
                for idx in gap_start..n {
                    let frac = (time[idx] - time[p]) as f64 / span;
                    out[idx] = Some(if angular {
                        interpolate_angle(left, right, frac)
                    } else {
                        left + frac * (right - left)
                    });
                    filled += 1;
                }
            }
            _ => {
                for idx in gap_start..row {
                    if steps(p, idx) > limit {
                        break;
                    }
                    out[idx] = Some(left);
                    filled += 1;
                }
            }
        }
    }
    (out, filled)
}
