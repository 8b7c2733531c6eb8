//! Anomaly detectors producing per-(timestamp, turbine) flag masks.
//!
//! Detectors read a table and return masks; they never mutate the table and
//! never flag a cell that is already null.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::angular::{
    angular_difference, circular_std_from_resultant, median, wrap_to_unsigned_range,
};
use crate::error::StageError;
use crate::schema::{FeatureType, TurbineId};
use crate::table::WideTable;

/// Boolean mask over `turbines × rows` for one feature; `true` means suspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagMask {
    feature: FeatureType,
    turbines: Vec<TurbineId>,
    flags: Vec<Vec<bool>>,
}

impl FlagMask {
    pub fn new(feature: FeatureType, turbines: Vec<TurbineId>, flags: Vec<Vec<bool>>) -> Self {
        Self {
            feature,
            turbines,
            flags,
        }
    }

    pub fn feature(&self) -> FeatureType {
        self.feature
    }

    pub fn turbines(&self) -> &[TurbineId] {
        &self.turbines
    }

    pub fn flags_for(&self, turbine: &TurbineId) -> Option<&[bool]> {
        self.turbines
            .iter()
            .position(|t| t == turbine)
            .map(|idx| self.flags[idx].as_slice())
    }

    pub fn count(&self) -> usize {
        self.flags
            .iter()
            .map(|column| column.iter().filter(|f| **f).count())
            .sum()
    }
}

pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    fn required_features(&self) -> Vec<FeatureType>;

    fn detect(&self, table: &WideTable, turbines: &[TurbineId])
        -> Result<Vec<FlagMask>, StageError>;
}

fn column<'a>(
    table: &'a WideTable,
    feature: FeatureType,
    turbine: &TurbineId,
) -> Result<&'a [Option<f64>], StageError> {
    table.column(feature, turbine).ok_or_else(|| {
        StageError::MalformedInput(format!("missing column {}_{}", feature, turbine))
    })
}

/// Runs `f` for every turbine in parallel and gathers results in turbine order.
fn per_turbine<F>(
    table: &WideTable,
    turbines: &[TurbineId],
    feature: FeatureType,
    f: F,
) -> Result<FlagMask, StageError>
where
    F: Fn(&TurbineId) -> Result<Vec<bool>, StageError> + Sync,
{
    table.require(&[feature], turbines)?;
    let flags = turbines
        .par_iter()
        .map(|turbine| f(turbine))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FlagMask::new(feature, turbines.to_vec(), flags))
}

/// Flags runs of at least `min_stuck_duration_s / dt` identical consecutive
/// values. A null or a missing row ends the run. Must run before any other
/// nullification so that nulls cannot split a stuck run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresponsiveSensor {
    pub features: Vec<FeatureType>,
    pub min_stuck_duration_s: i64,
}

impl UnresponsiveSensor {
    pub fn min_run_len(&self, dt_ms: i64) -> usize {
        let n = (self.min_stuck_duration_s * 1_000) / dt_ms.max(1);
        n.max(2) as usize
    }
}

impl Detector for UnresponsiveSensor {
    fn name(&self) -> &'static str {
        "unresponsive_sensor"
    }

    fn required_features(&self) -> Vec<FeatureType> {
        self.features.clone()
    }

    fn detect(
        &self,
        table: &WideTable,
        turbines: &[TurbineId],
    ) -> Result<Vec<FlagMask>, StageError> {
        let min_run = self.min_run_len(table.dt_ms());
        self.features
            .iter()
            .map(|feature| {
                per_turbine(table, turbines, *feature, |turbine| {
                    let values = column(table, *feature, turbine)?;
                    Ok(stuck_runs(values, table.time(), table.dt_ms(), min_run))
                })
            })
            .collect()
    }
}

fn stuck_runs(values: &[Option<f64>], time: &[i64], dt_ms: i64, min_run: usize) -> Vec<bool> {
    let mut flags = vec![false; values.len()];
    let mut start = 0usize;
    for idx in 1..=values.len() {
        let continues = idx < values.len()
            && time[idx] - time[idx - 1] == dt_ms
            && matches!((values[idx - 1], values[idx]), (Some(a), Some(b)) if a == b);
        if !continues {
            if values[start].is_some() && idx - start >= min_run {
                flags[start..idx].iter_mut().for_each(|f| *f = true);
            }
            start = idx;
        }
    }
    flags
}

/// Flags values outside the closed interval `[lower, upper]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeFlag {
    pub feature: FeatureType,
    pub lower: f64,
    pub upper: f64,
}

impl Detector for RangeFlag {
    fn name(&self) -> &'static str {
        "range_flag"
    }

    fn required_features(&self) -> Vec<FeatureType> {
        vec![self.feature]
    }

    fn detect(
        &self,
        table: &WideTable,
        turbines: &[TurbineId],
    ) -> Result<Vec<FlagMask>, StageError> {
        let mask = per_turbine(table, turbines, self.feature, |turbine| {
            let values = column(table, self.feature, turbine)?;
            Ok(values
                .iter()
                .map(|v| v.map_or(false, |x| x < self.lower || x > self.upper))
                .collect())
        })?;
        Ok(vec![mask])
    }
}

/// Flags samples whose `window_feature` lies inside `[window_start, window_end]`
/// while `value_feature` lies outside `[value_min, value_max]`: the turbine is
/// in its operating window yet not producing, i.e. shut down or curtailed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRange {
    pub window_feature: FeatureType,
    pub window_start: f64,
    pub window_end: f64,
    pub value_feature: FeatureType,
    pub value_min: f64,
    pub value_max: f64,
    pub flag_feature: FeatureType,
}

impl Default for WindowRange {
    fn default() -> Self {
        Self {
            window_feature: FeatureType::WindSpeed,
            window_start: 5.0,
            window_end: 40.0,
            value_feature: FeatureType::PowerOutput,
            value_min: 20.0,
            value_max: 3_000.0,
            flag_feature: FeatureType::WindSpeed,
        }
    }
}

impl Detector for WindowRange {
    fn name(&self) -> &'static str {
        "window_range_flag"
    }

    fn required_features(&self) -> Vec<FeatureType> {
        vec![self.window_feature, self.value_feature, self.flag_feature]
    }

    fn detect(
        &self,
        table: &WideTable,
        turbines: &[TurbineId],
    ) -> Result<Vec<FlagMask>, StageError> {
        table.require(&self.required_features(), turbines)?;
        let mask = per_turbine(table, turbines, self.flag_feature, |turbine| {
            let window = column(table, self.window_feature, turbine)?;
            let value = column(table, self.value_feature, turbine)?;
            let flagged = column(table, self.flag_feature, turbine)?;
            Ok(window
                .iter()
                .zip(value)
                .zip(flagged)
                .map(|((w, v), target)| match (w, v, target) {
                    (Some(w), Some(v), Some(_)) => {
                        (self.window_start..=self.window_end).contains(w)
                            && !(self.value_min..=self.value_max).contains(v)
                    }
                    _ => false,
                })
                .collect())
        })?;
        Ok(vec![mask])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinCenter {
    Median,
    Mean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdType {
    /// Threshold in the value's own units.
    Scalar,
    /// Multiple of the bin's standard deviation.
    Std,
    /// Multiple of the bin's scaled median absolute deviation.
    Mad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Below,
    Above,
    All,
}

/// Power-curve envelope filter: samples are bucketed by `bin_feature` into
/// fixed-width bins, each bin gets a robust center of `value_feature`, and
/// samples deviating from it beyond the threshold are flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinFilter {
    pub bin_feature: FeatureType,
    pub value_feature: FeatureType,
    pub flag_feature: FeatureType,
    pub bin_width: f64,
    pub bin_min: f64,
    /// `None` uses 90% of the farm-wide maximum of `bin_feature`.
    pub bin_max: Option<f64>,
    pub threshold: f64,
    pub threshold_type: ThresholdType,
    pub center: BinCenter,
    pub direction: Direction,
}

const MAD_SCALE: f64 = 1.4826;

impl BinFilter {
    fn resolve_bin_max(&self, table: &WideTable) -> Option<f64> {
        if let Some(max) = self.bin_max {
            return Some(max);
        }
        table
            .family(self.bin_feature)
            .iter()
            .flat_map(|(_, values)| values.iter().flatten())
            .copied()
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
            .map(|max| 0.9 * max)
    }

    fn flag_turbine(
        &self,
        bins: &[Option<f64>],
        values: &[Option<f64>],
        targets: &[Option<f64>],
        bin_max: f64,
    ) -> Vec<bool> {
        let n_bins = ((bin_max - self.bin_min) / self.bin_width).ceil().max(0.0) as usize;
        // farm never reaches bin_min
        if n_bins == 0 {
            return vec![false; values.len()];
        }
        let bin_of = |b: f64| -> Option<usize> {
            if b < self.bin_min || b > bin_max {
                return None;
            }
            let idx = ((b - self.bin_min) / self.bin_width).floor() as usize;
            Some(idx.min(n_bins - 1))
        };

        // only populated bins are materialized
        let mut members: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
        let assignment: Vec<Option<usize>> = bins
            .iter()
            .zip(values)
            .zip(targets)
            .map(|((b, v), t)| match (b, v, t) {
                (Some(b), Some(v), Some(_)) => {
                    let idx = bin_of(*b)?;
                    members.entry(idx).or_default().push(*v);
                    Some(idx)
                }
                _ => None,
            })
            .collect();

        let envelopes: BTreeMap<usize, (f64, f64)> = members
            .into_iter()
            .filter_map(|(idx, mut m)| Some((idx, self.envelope(&mut m)?)))
            .collect();

        assignment
            .iter()
            .zip(values)
            .map(|(bin, v)| match (bin, v) {
                (Some(idx), Some(v)) => match envelopes.get(idx) {
                    Some((center, limit)) => {
                        let d = v - center;
                        match self.direction {
                            Direction::Below => d < -limit,
                            Direction::Above => d > *limit,
                            Direction::All => d.abs() > *limit,
                        }
                    }
                    None => false,
                },
                _ => false,
            })
            .collect()
    }

    /// `(center, allowed deviation)` for one bin.
    fn envelope(&self, members: &mut [f64]) -> Option<(f64, f64)> {
        if members.is_empty() {
            return None;
        }
        let n = members.len() as f64;
        let mean = members.iter().sum::<f64>() / n;
        let center = match self.center {
            BinCenter::Mean => mean,
            BinCenter::Median => median(members)?,
        };
        let limit = match self.threshold_type {
            ThresholdType::Scalar => self.threshold,
            ThresholdType::Std => {
                let var = members.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                self.threshold * var.sqrt()
            }
            ThresholdType::Mad => {
                let mut dev: Vec<f64> = members.iter().map(|v| (v - center).abs()).collect();
                self.threshold * MAD_SCALE * median(&mut dev)?
            }
        };
        Some((center, limit))
    }
}

impl Detector for BinFilter {
    fn name(&self) -> &'static str {
        "bin_filter"
    }

    fn required_features(&self) -> Vec<FeatureType> {
        vec![self.bin_feature, self.value_feature, self.flag_feature]
    }

    fn detect(
        &self,
        table: &WideTable,
        turbines: &[TurbineId],
    ) -> Result<Vec<FlagMask>, StageError> {
        if self.bin_width <= 0.0 {
            return Err(StageError::InvalidParameter(format!(
                "bin_width must be > 0, got {}",
                self.bin_width
            )));
        }
        if let Some(max) = self.bin_max {
            if !max.is_finite() || max <= self.bin_min {
                return Err(StageError::InvalidParameter(format!(
                    "bin_max must be finite and > bin_min {}, got {max}",
                    self.bin_min
                )));
            }
        }
        table.require(&self.required_features(), turbines)?;
        let bin_max = self.resolve_bin_max(table);
        if let Some(max) = bin_max.filter(|m| !m.is_finite()) {
            return Err(StageError::InvalidParameter(format!(
                "resolved bin_max {max} is not finite"
            )));
        }
        let mask = per_turbine(table, turbines, self.flag_feature, |turbine| {
            let Some(bin_max) = bin_max else {
                return Ok(vec![false; table.len()]);
            };
            Ok(self.flag_turbine(
                column(table, self.bin_feature, turbine)?,
                column(table, self.value_feature, turbine)?,
                column(table, self.flag_feature, turbine)?,
                bin_max,
            ))
        })?;
        Ok(vec![mask])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum StdWindow {
    WholeSeries,
    /// Trailing window of `samples` rows, current row included.
    Rolling { samples: usize },
}

/// Flags samples more than `threshold` standard deviations from the mean,
/// per turbine and feature; angular features use circular mean and std.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdRange {
    pub features: Vec<FeatureType>,
    pub threshold: f64,
    pub window: StdWindow,
}

impl Detector for StdRange {
    fn name(&self) -> &'static str {
        "std_range_flag"
    }

    fn required_features(&self) -> Vec<FeatureType> {
        self.features.clone()
    }

    fn detect(
        &self,
        table: &WideTable,
        turbines: &[TurbineId],
    ) -> Result<Vec<FlagMask>, StageError> {
        self.features
            .iter()
            .map(|feature| {
                per_turbine(table, turbines, *feature, |turbine| {
                    let values = column(table, *feature, turbine)?;
                    Ok(self.flag_series(values, feature.is_angular()))
                })
            })
            .collect()
    }
}

/// Running moments for linear or circular data.
#[derive(Default)]
struct Moments {
    a: f64,
    b: f64,
    n: usize,
}

impl Moments {
    fn push(&mut self, x: f64, angular: bool) {
        let (a, b) = Self::terms(x, angular);
        self.a += a;
        self.b += b;
        self.n += 1;
    }

    fn pop(&mut self, x: f64, angular: bool) {
        let (a, b) = Self::terms(x, angular);
        self.a -= a;
        self.b -= b;
        self.n -= 1;
    }

    fn terms(x: f64, angular: bool) -> (f64, f64) {
        if angular {
            let rad = x.to_radians();
            (rad.sin(), rad.cos())
        } else {
            (x, x * x)
        }
    }

    /// `(center, std)`; needs at least two samples.
    fn center_and_std(&self, angular: bool) -> Option<(f64, f64)> {
        if self.n < 2 {
            return None;
        }
        let n = self.n as f64;
        if angular {
            let (s, c) = (self.a / n, self.b / n);
            let r = (s * s + c * c).sqrt().min(1.0);
            Some((
                wrap_to_unsigned_range(s.atan2(c).to_degrees()),
                circular_std_from_resultant(r),
            ))
        } else {
            let mean = self.a / n;
            let var = (self.b / n - mean * mean).max(0.0);
            Some((mean, var.sqrt()))
        }
    }
}

impl StdRange {
    fn flag_series(&self, values: &[Option<f64>], angular: bool) -> Vec<bool> {
        let deviation = |x: f64, center: f64| -> f64 {
            if angular {
                angular_difference(x, center).abs()
            } else {
                (x - center).abs()
            }
        };

        match self.window {
            StdWindow::WholeSeries => {
                let mut moments = Moments::default();
                values.iter().flatten().for_each(|x| moments.push(*x, angular));
                let Some((center, std)) = moments.center_and_std(angular) else {
                    return vec![false; values.len()];
                };
                values
                    .iter()
                    .map(|v| v.map_or(false, |x| deviation(x, center) > self.threshold * std))
                    .collect()
            }
            StdWindow::Rolling { samples } => {
                let samples = samples.max(2);
                let mut moments = Moments::default();
                let mut flags = Vec::with_capacity(values.len());
                for (idx, v) in values.iter().enumerate() {
                    if let Some(x) = v {
                        moments.push(*x, angular);
                    }
                    if idx >= samples {
                        if let Some(old) = values[idx - samples] {
                            moments.pop(old, angular);
                        }
                    }
                    let flagged = match (v, moments.center_and_std(angular)) {
                        (Some(x), Some((center, std))) => {
                            deviation(*x, center) > self.threshold * std
                        }
                        _ => false,
                    };
                    flags.push(flagged);
                }
                flags
            }
        }
    }
}

/// Flags samples whose turbine status is reported and not an operating code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurbineStatusFlag {
    pub operating_codes: Vec<i64>,
}

impl Default for TurbineStatusFlag {
    fn default() -> Self {
        Self {
            operating_codes: vec![1],
        }
    }
}

impl Detector for TurbineStatusFlag {
    fn name(&self) -> &'static str {
        "inoperational"
    }

    fn required_features(&self) -> Vec<FeatureType> {
        vec![FeatureType::TurbineStatus]
    }

    fn detect(
        &self,
        table: &WideTable,
        turbines: &[TurbineId],
    ) -> Result<Vec<FlagMask>, StageError> {
        let mask = per_turbine(table, turbines, FeatureType::TurbineStatus, |turbine| {
            let status = column(table, FeatureType::TurbineStatus, turbine)?;
            Ok(status
                .iter()
                .map(|s| {
                    s.map_or(false, |code| {
                        !self.operating_codes.contains(&(code.round() as i64))
                    })
                })
                .collect())
        })?;
        Ok(vec![mask])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnKey;

    fn single(feature: FeatureType, values: Vec<Option<f64>>) -> WideTable {
        let time = (0..values.len() as i64).map(|i| i * 1_000).collect();
        WideTable::new(
            1_000,
            time,
            vec![(ColumnKey::new(feature, TurbineId::new("wt001")), values)],
        )
        .expect("valid table")
    }

    fn paired(
        a: (FeatureType, Vec<Option<f64>>),
        b: (FeatureType, Vec<Option<f64>>),
    ) -> WideTable {
        let time = (0..a.1.len() as i64).map(|i| i * 1_000).collect();
        let t = TurbineId::new("wt001");
        WideTable::new(
            1_000,
            time,
            vec![
                (ColumnKey::new(a.0, t.clone()), a.1),
                (ColumnKey::new(b.0, t), b.1),
            ],
        )
        .expect("valid table")
    }

    fn flags(masks: &[FlagMask]) -> Vec<bool> {
        masks[0]
            .flags_for(&TurbineId::new("wt001"))
            .expect("turbine")
            .to_vec()
    }

    #[test]
    fn unresponsive_flags_only_long_runs() {
        let table = single(
            FeatureType::WindSpeed,
            vec![
                Some(1.0),
                Some(2.0),
                Some(2.0),
                Some(2.0),
                Some(3.0),
                Some(3.0),
                Some(4.0),
            ],
        );
        let det = UnresponsiveSensor {
            features: vec![FeatureType::WindSpeed],
            min_stuck_duration_s: 3,
        };
        let masks = det.detect(&table, table.turbine_ids()).expect("detect");
        assert_eq!(
            flags(&masks),
            vec![false, true, true, true, false, false, false]
        );
    }

    #[test]
    fn unresponsive_runs_are_broken_by_nulls() {
        let table = single(
            FeatureType::WindSpeed,
            vec![Some(2.0), Some(2.0), None, Some(2.0), Some(2.0), None, None, None],
        );
        let det = UnresponsiveSensor {
            features: vec![FeatureType::WindSpeed],
            min_stuck_duration_s: 3,
        };
        let masks = det.detect(&table, table.turbine_ids()).expect("detect");
        assert_eq!(masks[0].count(), 0);
    }

    #[test]
    fn range_flag_ignores_nulls_and_is_closed() {
        let table = single(
            FeatureType::WindSpeed,
            vec![Some(-1.0), Some(0.0), None, Some(70.0), Some(70.5)],
        );
        let det = RangeFlag {
            feature: FeatureType::WindSpeed,
            lower: 0.0,
            upper: 70.0,
        };
        let first = det.detect(&table, table.turbine_ids()).expect("detect");
        let second = det.detect(&table, table.turbine_ids()).expect("detect");
        assert_eq!(first, second);
        assert_eq!(flags(&first), vec![true, false, false, false, true]);
    }

    #[test]
    fn window_range_flags_shutdown_in_operating_window() {
        let table = paired(
            (
                FeatureType::WindSpeed,
                vec![Some(3.0), Some(8.0), Some(8.0), Some(12.0), None],
            ),
            (
                FeatureType::PowerOutput,
                vec![Some(0.0), Some(0.0), Some(900.0), Some(-5.0), Some(0.0)],
            ),
        );
        let det = WindowRange::default();
        let masks = det.detect(&table, table.turbine_ids()).expect("detect");
        assert_eq!(masks[0].feature(), FeatureType::WindSpeed);
        assert_eq!(flags(&masks), vec![false, true, false, true, false]);
    }

    #[test]
    fn bin_filter_flags_underperformance_below_median() {
        let ws: Vec<Option<f64>> = (0..20).map(|i| Some(5.0 + (i % 2) as f64 * 0.1)).collect();
        let mut power: Vec<Option<f64>> = vec![Some(1_000.0); 20];
        power[7] = Some(400.0);
        power[9] = Some(1_600.0);
        let table = paired((FeatureType::WindSpeed, ws), (FeatureType::PowerOutput, power));
        let det = BinFilter {
            bin_feature: FeatureType::WindSpeed,
            value_feature: FeatureType::PowerOutput,
            flag_feature: FeatureType::WindSpeed,
            bin_width: 1.0,
            bin_min: 0.0,
            bin_max: Some(25.0),
            threshold: 200.0,
            threshold_type: ThresholdType::Scalar,
            center: BinCenter::Median,
            direction: Direction::Below,
        };
        let masks = det.detect(&table, table.turbine_ids()).expect("detect");
        let out = flags(&masks);
        assert!(out[7]);
        assert!(!out[9]);
        assert_eq!(masks[0].count(), 1);

        let both = BinFilter {
            direction: Direction::All,
            ..det
        };
        let masks = both.detect(&table, table.turbine_ids()).expect("detect");
        assert_eq!(masks[0].count(), 2);
    }

    #[test]
    fn bin_filter_rejects_non_positive_width() {
        let table = paired(
            (FeatureType::WindSpeed, vec![Some(1.0)]),
            (FeatureType::PowerOutput, vec![Some(1.0)]),
        );
        let det = BinFilter {
            bin_feature: FeatureType::WindSpeed,
            value_feature: FeatureType::PowerOutput,
            flag_feature: FeatureType::WindSpeed,
            bin_width: 0.0,
            bin_min: 0.0,
            bin_max: None,
            threshold: 1.0,
            threshold_type: ThresholdType::Std,
            center: BinCenter::Mean,
            direction: Direction::All,
        };
        assert!(matches!(
            det.detect(&table, table.turbine_ids()),
            Err(StageError::InvalidParameter(_))
        ));
    }

    /// One wind-speed bin; `power[low]` and `power[high]` are the outliers.
    fn power_curve(base: impl Fn(usize) -> f64, low: usize, high: usize) -> WideTable {
        let ws = vec![Some(5.0); 20];
        let power = (0..20)
            .map(|i| match i {
                i if i == low => Some(400.0),
                i if i == high => Some(1_200.0),
                i => Some(base(i)),
            })
            .collect();
        paired((FeatureType::WindSpeed, ws), (FeatureType::PowerOutput, power))
    }

    fn power_bins(
        threshold_type: ThresholdType,
        threshold: f64,
        center: BinCenter,
        direction: Direction,
    ) -> BinFilter {
        BinFilter {
            bin_feature: FeatureType::WindSpeed,
            value_feature: FeatureType::PowerOutput,
            flag_feature: FeatureType::WindSpeed,
            bin_width: 1.0,
            bin_min: 0.0,
            bin_max: Some(25.0),
            threshold,
            threshold_type,
            center,
            direction,
        }
    }

    fn flagged_rows(det: &BinFilter, table: &WideTable) -> Vec<usize> {
        let masks = det.detect(table, table.turbine_ids()).expect("detect");
        flags(&masks)
            .iter()
            .enumerate()
            .filter_map(|(row, f)| f.then_some(row))
            .collect()
    }

    #[test]
    fn bin_filter_std_envelope_scales_with_the_bin_spread() {
        // mean 980, population std 140, median 1000
        let table = power_curve(|_| 1_000.0, 7, 12);
        let wide = power_bins(ThresholdType::Std, 2.0, BinCenter::Median, Direction::All);
        assert_eq!(flagged_rows(&wide, &table), vec![7]);

        let above = power_bins(ThresholdType::Std, 1.5, BinCenter::Median, Direction::Above);
        assert!(flagged_rows(&above, &table).is_empty());

        let around_mean = BinFilter {
            center: BinCenter::Mean,
            ..above
        };
        assert_eq!(flagged_rows(&around_mean, &table), vec![12]);
    }

    #[test]
    fn bin_filter_mad_envelope_uses_scaled_median_deviation() {
        // median 1000, MAD 10, so the limit at k = 3 is 44.478
        let table = power_curve(|i| if i % 2 == 0 { 990.0 } else { 1_010.0 }, 7, 12);
        let above = power_bins(ThresholdType::Mad, 3.0, BinCenter::Median, Direction::Above);
        assert_eq!(flagged_rows(&above, &table), vec![12]);

        let below = BinFilter {
            direction: Direction::Below,
            ..above.clone()
        };
        assert_eq!(flagged_rows(&below, &table), vec![7]);

        let both = BinFilter {
            direction: Direction::All,
            ..above
        };
        assert_eq!(flagged_rows(&both, &table), vec![7, 12]);
    }

    #[test]
    fn bin_filter_rejects_an_empty_bin_range() {
        let table = power_curve(|_| 1_000.0, 7, 12);
        let det = BinFilter {
            bin_min: 20.0,
            bin_max: Some(20.0),
            ..power_bins(ThresholdType::Scalar, 200.0, BinCenter::Median, Direction::Below)
        };
        assert!(matches!(
            det.detect(&table, table.turbine_ids()),
            Err(StageError::InvalidParameter(_))
        ));
    }

    #[test]
    fn bin_filter_below_the_first_bin_flags_nothing() {
        // resolved bin_max is 0.9 * 5.0, under bin_min
        let table = power_curve(|_| 1_000.0, 7, 12);
        let det = BinFilter {
            bin_min: 20.0,
            bin_max: None,
            ..power_bins(ThresholdType::Scalar, 200.0, BinCenter::Median, Direction::All)
        };
        assert!(flagged_rows(&det, &table).is_empty());
    }

    #[test]
    fn bin_filter_handles_a_huge_finite_bin_range() {
        let table = power_curve(|_| 1_000.0, 7, 12);
        let det = BinFilter {
            bin_max: Some(1e300),
            ..power_bins(ThresholdType::Scalar, 200.0, BinCenter::Median, Direction::Below)
        };
        assert_eq!(flagged_rows(&det, &table), vec![7]);
    }

    #[test]
    fn std_range_uses_circular_statistics_for_directions() {
        let mut wd: Vec<Option<f64>> = (0..40)
            .map(|i| Some(if i % 2 == 0 { 358.0 } else { 2.0 }))
            .collect();
        wd[10] = Some(180.0);
        wd[11] = None;
        let table = single(FeatureType::WindDirection, wd);
        let det = StdRange {
            features: vec![FeatureType::WindDirection],
            threshold: 2.0,
            window: StdWindow::WholeSeries,
        };
        let masks = det.detect(&table, table.turbine_ids()).expect("detect");
        let out = flags(&masks);
        assert!(out[10]);
        assert!(!out[11]);
        assert_eq!(masks[0].count(), 1);
    }

    #[test]
    fn std_range_rolling_window_flags_spike() {
        let mut ws: Vec<Option<f64>> = (0..30).map(|i| Some(8.0 + 0.1 * (i % 3) as f64)).collect();
        ws[20] = Some(30.0);
        let table = single(FeatureType::WindSpeed, ws);
        let det = StdRange {
            features: vec![FeatureType::WindSpeed],
            threshold: 2.0,
            window: StdWindow::Rolling { samples: 10 },
        };
        let masks = det.detect(&table, table.turbine_ids()).expect("detect");
        let out = flags(&masks);
        assert!(out[20]);
        assert!(!out[19]);
    }

    #[test]
    fn turbine_status_skips_null_status() {
        let table = single(
            FeatureType::TurbineStatus,
            vec![Some(1.0), Some(3.0), None, Some(1.0)],
        );
        let masks = TurbineStatusFlag::default()
            .detect(&table, table.turbine_ids())
            .expect("detect");
        assert_eq!(flags(&masks), vec![false, true, false, false]);
    }

    #[test]
    fn missing_feature_is_malformed_input() {
        let table = single(FeatureType::WindSpeed, vec![Some(1.0)]);
        let det = RangeFlag {
            feature: FeatureType::WindDirection,
            lower: 0.0,
            upper: 360.0,
        };
        assert!(matches!(
            det.detect(&table, table.turbine_ids()),
            Err(StageError::MalformedInput(_))
        ));
    }
}
