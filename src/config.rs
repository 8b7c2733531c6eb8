//! Ordered, explicitly parameterized pipeline configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calibration::{self, CalibrationConfig};
use crate::continuity::SegmentationConfig;
use crate::detectors::{
    BinCenter, BinFilter, Detector, Direction, RangeFlag, StdRange, StdWindow, ThresholdType,
    TurbineStatusFlag, UnresponsiveSensor, WindowRange,
};
use crate::normalize::NormalizeConfig;
use crate::nullify::NullifyConfig;
use crate::plan::DEFAULT_CHUNK_ROWS;
use crate::repair::{ImputeConfig, InterpolateConfig, InterpolationMode};
use crate::schema::FeatureType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid pipeline config: {0}")]
    Invalid(String),
}

/// Canonical execution order; stages must appear in non-decreasing phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Calibration,
    Detection,
    Imputation,
    Interpolation,
    Segmentation,
    Normalization,
}

/// A detector paired with how its masks are applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection<D> {
    pub detector: D,
    #[serde(default)]
    pub nullify: NullifyConfig,
}

impl<D> Detection<D> {
    pub fn new(detector: D, nullify: NullifyConfig) -> Self {
        Self { detector, nullify }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Stage {
    NacelleCalibration(CalibrationConfig),
    UnresponsiveSensor(Detection<UnresponsiveSensor>),
    Inoperational(Detection<TurbineStatusFlag>),
    RangeFlag(Detection<RangeFlag>),
    WindowRangeFlag(Detection<WindowRange>),
    BinFilter(Detection<BinFilter>),
    StdRangeFlag(Detection<StdRange>),
    Impute(ImputeConfig),
    Interpolate(InterpolateConfig),
    Split(SegmentationConfig),
    Normalize(NormalizeConfig),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NacelleCalibration(_) => "nacelle_calibration",
            Self::UnresponsiveSensor(_) => "unresponsive_sensor",
            Self::Inoperational(_) => "inoperational",
            Self::RangeFlag(_) => "range_flag",
            Self::WindowRangeFlag(_) => "window_range_flag",
            Self::BinFilter(_) => "bin_filter",
            Self::StdRangeFlag(_) => "std_range_flag",
            Self::Impute(_) => "impute",
            Self::Interpolate(_) => "interpolate",
            Self::Split(_) => "split",
            Self::Normalize(_) => "normalize",
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::NacelleCalibration(_) => Phase::Calibration,
            Self::Impute(_) => Phase::Imputation,
            Self::Interpolate(_) => Phase::Interpolation,
            Self::Split(_) => Phase::Segmentation,
            Self::Normalize(_) => Phase::Normalization,
            _ => Phase::Detection,
        }
    }

    /// The detector and nullification policy of a detection stage.
    pub fn detection(&self) -> Option<(&dyn Detector, &NullifyConfig)> {
        match self {
            Self::UnresponsiveSensor(d) => Some((&d.detector as &dyn Detector, &d.nullify)),
            Self::Inoperational(d) => Some((&d.detector as &dyn Detector, &d.nullify)),
            Self::RangeFlag(d) => Some((&d.detector as &dyn Detector, &d.nullify)),
            Self::WindowRangeFlag(d) => Some((&d.detector as &dyn Detector, &d.nullify)),
            Self::BinFilter(d) => Some((&d.detector as &dyn Detector, &d.nullify)),
            Self::StdRangeFlag(d) => Some((&d.detector as &dyn Detector, &d.nullify)),
            _ => None,
        }
    }

    /// Raw feature families that must be present when this stage runs.
    pub fn required_features(&self) -> Vec<FeatureType> {
        if let Some((detector, nullify)) = self.detection() {
            let mut features = detector.required_features();
            if let Some(targets) = &nullify.targets {
                features.extend(targets.iter().copied());
            }
            features.sort();
            features.dedup();
            return features;
        }
        match self {
            Self::NacelleCalibration(_) => calibration::REQUIRED_FEATURES.to_vec(),
            Self::Impute(c) => c.features.clone(),
            Self::Interpolate(c) => c.features.clone(),
            Self::Split(c) => c.tracked_features.clone(),
            Self::Normalize(c) => c.source_features(),
            _ => Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        let name = self.name();
        if let Some((_, nullify)) = self.detection() {
            if !(0.0..=1.0).contains(&nullify.max_null_fraction) {
                return Err(format!(
                    "{name}: max_null_fraction must be within [0, 1], got {}",
                    nullify.max_null_fraction
                ));
            }
            if nullify.targets.as_ref().is_some_and(|t| t.is_empty()) {
                return Err(format!("{name}: nullify targets must not be empty"));
            }
        }
        match self {
            Self::NacelleCalibration(c) if c.block_duration_s <= 0 => {
                Err(format!("{name}: block_duration_s must be > 0"))
            }
            Self::UnresponsiveSensor(d) if d.detector.features.is_empty() => {
                Err(format!("{name}: features must not be empty"))
            }
            Self::UnresponsiveSensor(d) if d.detector.min_stuck_duration_s <= 0 => {
                Err(format!("{name}: min_stuck_duration_s must be > 0"))
            }
            Self::RangeFlag(d) if d.detector.lower > d.detector.upper => {
                Err(format!("{name}: lower bound exceeds upper bound"))
            }
            Self::WindowRangeFlag(d)
                if d.detector.window_start > d.detector.window_end
                    || d.detector.value_min > d.detector.value_max =>
            {
                Err(format!("{name}: window or value bounds are inverted"))
            }
            Self::BinFilter(d) if d.detector.bin_width <= 0.0 => {
                Err(format!("{name}: bin_width must be > 0"))
            }
            Self::BinFilter(d)
                if d
                    .detector
                    .bin_max
                    .is_some_and(|max| !max.is_finite() || max <= d.detector.bin_min) =>
            {
                Err(format!("{name}: bin_max must be finite and above bin_min"))
            }
            Self::StdRangeFlag(d) if d.detector.features.is_empty() => {
                Err(format!("{name}: features must not be empty"))
            }
            Self::StdRangeFlag(d) if d.detector.threshold <= 0.0 => {
                Err(format!("{name}: threshold must be > 0"))
            }
            Self::Impute(c) if c.features.is_empty() => {
                Err(format!("{name}: features must not be empty"))
            }
            Self::Interpolate(c) if c.features.is_empty() => {
                Err(format!("{name}: features must not be empty"))
            }
            Self::Interpolate(c) if c.max_gap_duration_s <= 0 => {
                Err(format!("{name}: max_gap_duration_s must be > 0"))
            }
            Self::Split(c) if c.tracked_features.is_empty() => {
                Err(format!("{name}: tracked_features must not be empty"))
            }
            Self::Split(c) if c.missing_duration_s < 0 || c.minimum_span_duration_s <= 0 => {
                Err(format!("{name}: durations must be positive"))
            }
            Self::Normalize(c) if c.features.iter().any(|f| !f.is_engineered()) => {
                Err(format!("{name}: only engineered features can be normalized"))
            }
            Self::Normalize(c) if c.features.is_empty() => {
                Err(format!("{name}: features must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub stage: Stage,
}

fn enabled_by_default() -> bool {
    true
}

impl StageDescriptor {
    pub fn enabled(stage: Stage) -> Self {
        Self {
            enabled: true,
            stage,
        }
    }

    pub fn disabled(stage: Stage) -> Self {
        Self {
            enabled: false,
            stage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub dt_seconds: i64,
    #[serde(default = "default_chunk_rows")]
    pub chunk_rows: usize,
    pub stages: Vec<StageDescriptor>,
}

fn default_chunk_rows() -> usize {
    DEFAULT_CHUNK_ROWS
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let dt_seconds = 5;
        let ws_only = NullifyConfig {
            targets: Some(vec![FeatureType::WindSpeed]),
            ..NullifyConfig::default()
        };
        Self {
            dt_seconds,
            chunk_rows: DEFAULT_CHUNK_ROWS,
            stages: vec![
                StageDescriptor::disabled(Stage::NacelleCalibration(CalibrationConfig::default())),
                StageDescriptor::enabled(Stage::UnresponsiveSensor(Detection::new(
                    UnresponsiveSensor {
                        features: vec![FeatureType::WindSpeed, FeatureType::WindDirection],
                        min_stuck_duration_s: 20 * 60,
                    },
                    NullifyConfig::default(),
                ))),
                StageDescriptor::disabled(Stage::Inoperational(Detection::new(
                    TurbineStatusFlag::default(),
                    NullifyConfig {
                        targets: Some(vec![FeatureType::WindSpeed, FeatureType::WindDirection]),
                        ..NullifyConfig::default()
                    },
                ))),
                StageDescriptor::enabled(Stage::RangeFlag(Detection::new(
                    RangeFlag {
                        feature: FeatureType::WindSpeed,
                        lower: 0.0,
                        upper: 70.0,
                    },
                    NullifyConfig::default(),
                ))),
                StageDescriptor::disabled(Stage::WindowRangeFlag(Detection::new(
                    WindowRange::default(),
                    ws_only.clone(),
                ))),
                StageDescriptor::enabled(Stage::BinFilter(Detection::new(
                    BinFilter {
                        bin_feature: FeatureType::PowerOutput,
                        value_feature: FeatureType::WindSpeed,
                        flag_feature: FeatureType::WindSpeed,
                        bin_width: 50.0,
                        bin_min: 20.0,
                        bin_max: None,
                        threshold: 3.0,
                        threshold_type: ThresholdType::Scalar,
                        center: BinCenter::Median,
                        direction: Direction::Below,
                    },
                    ws_only,
                ))),
                StageDescriptor::enabled(Stage::StdRangeFlag(Detection::new(
                    StdRange {
                        features: vec![FeatureType::WindSpeed, FeatureType::WindDirection],
                        threshold: 2.0,
                        window: StdWindow::WholeSeries,
                    },
                    NullifyConfig::default(),
                ))),
                StageDescriptor::enabled(Stage::Impute(ImputeConfig::new(vec![
                    FeatureType::WindSpeed,
                    FeatureType::WindDirection,
                ]))),
                StageDescriptor::enabled(Stage::Interpolate(InterpolateConfig {
                    features: vec![
                        FeatureType::WindDirection,
                        FeatureType::WindSpeed,
                        FeatureType::NacelleDirection,
                    ],
                    mode: InterpolationMode::Linear,
                    max_gap_duration_s: 10 * 60 * 60,
                })),
                StageDescriptor::enabled(Stage::Split(SegmentationConfig::default())),
                StageDescriptor::enabled(Stage::Normalize(NormalizeConfig::default())),
            ],
        }
    }
}

impl PipelineConfig {
    pub fn dt_ms(&self) -> i64 {
        self.dt_seconds * 1_000
    }

    pub fn enabled_stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter().filter(|d| d.enabled).map(|d| &d.stage)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dt_seconds <= 0 {
            return Err(ConfigError::Invalid(format!(
                "dt_seconds must be > 0, got {}",
                self.dt_seconds
            )));
        }
        if self.chunk_rows == 0 {
            return Err(ConfigError::Invalid("chunk_rows must be > 0".to_string()));
        }

        let mut last_phase = Phase::Calibration;
        let mut seen_other_detector = false;
        for stage in self.enabled_stages() {
            stage.validate().map_err(ConfigError::Invalid)?;
            let phase = stage.phase();
            if phase < last_phase {
                return Err(ConfigError::Invalid(format!(
                    "stage `{}` ({phase:?}) is out of order after {last_phase:?}",
                    stage.name()
                )));
            }
            last_phase = phase;

            match stage {
                Stage::UnresponsiveSensor(_) if seen_other_detector => {
                    return Err(ConfigError::Invalid(
                        "unresponsive_sensor must run before any other detection stage"
                            .to_string(),
                    ));
                }
                Stage::UnresponsiveSensor(_) => {}
                _ if phase == Phase::Detection => seen_other_detector = true,
                _ => {}
            }
        }
        Ok(())
    }
}
