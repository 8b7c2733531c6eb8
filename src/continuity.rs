//! Splits the timeline into continuity groups: maximal runs of grid-contiguous
//! rows with few enough missing turbines.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StageError;
use crate::schema::FeatureType;
use crate::table::WideTable;

pub const EXCLUDED_GROUP: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationConfig {
    pub tracked_features: Vec<FeatureType>,
    /// Highest per-family count of missing turbines a row may have and still
    /// count as present. `None` uses `max(1, 10% of turbines)`.
    #[serde(default)]
    pub missing_col_threshold: Option<usize>,
    pub missing_duration_s: i64,
    pub minimum_span_duration_s: i64,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            tracked_features: vec![
                FeatureType::WindSpeed,
                FeatureType::WindDirection,
                FeatureType::NacelleDirection,
            ],
            missing_col_threshold: None,
            missing_duration_s: 600,
            minimum_span_duration_s: 1_200,
        }
    }
}

impl SegmentationConfig {
    pub fn resolve_missing_col_threshold(&self, turbine_count: usize) -> usize {
        self.missing_col_threshold
            .unwrap_or_else(|| (turbine_count / 10).max(1))
    }
}

/// Inclusive row range with a constant classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub first_row: usize,
    pub last_row: usize,
    pub start_ms: i64,
    pub end_ms: i64,
    pub missing: bool,
}

impl Span {
    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentationReport {
    pub missing_col_threshold: usize,
    pub candidate_spans: usize,
    pub groups: usize,
    pub rows_in: usize,
    pub rows_out: usize,
}

/// `true` where some tracked family has more than `threshold` missing turbines.
pub fn classify_rows(table: &WideTable, features: &[FeatureType], threshold: usize) -> Vec<bool> {
    let mut missing = vec![false; table.len()];
    for feature in features {
        for (flag, count) in missing.iter_mut().zip(table.missing_per_row(*feature)) {
            *flag |= count > threshold;
        }
    }
    missing
}

/// Run-length encodes `missing`, also breaking wherever rows are absent.
pub fn run_length_spans(time: &[i64], dt_ms: i64, missing: &[bool]) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut first = 0usize;
    for row in 1..=time.len() {
        let breaks = row == time.len()
            || missing[row] != missing[first]
            || time[row] - time[row - 1] != dt_ms;
        if breaks {
            spans.push(Span {
                first_row: first,
                last_row: row - 1,
                start_ms: time[first],
                end_ms: time[row - 1],
                missing: missing[first],
            });
            first = row;
        }
    }
    spans
}

/// Tolerates short missing spans, merges grid-contiguous present spans and
/// drops those shorter than the minimum.
pub fn eligible_spans(
    spans: &[Span],
    dt_ms: i64,
    missing_duration_ms: i64,
    minimum_span_duration_ms: i64,
) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for span in spans {
        let mut span = *span;
        if span.missing && span.duration_ms() <= missing_duration_ms {
            span.missing = false;
        }
        if span.missing {
            continue;
        }
        match merged.last_mut() {
            Some(last) if last.end_ms + dt_ms == span.start_ms => {
                last.last_row = span.last_row;
                last.end_ms = span.end_ms;
            }
            _ => merged.push(span),
        }
    }
    merged.retain(|span| span.duration_ms() >= minimum_span_duration_ms);
    merged
}

pub fn segment(
    table: &WideTable,
    config: &SegmentationConfig,
) -> Result<(WideTable, SegmentationReport), StageError> {
    if config.tracked_features.is_empty() {
        return Err(StageError::InvalidParameter(
            "segmentation needs at least one tracked feature".to_string(),
        ));
    }
    if config.missing_duration_s < 0 || config.minimum_span_duration_s < 0 {
        return Err(StageError::InvalidParameter(
            "segmentation durations must be >= 0".to_string(),
        ));
    }
    table.require(&config.tracked_features, table.turbine_ids())?;

    let threshold = config.resolve_missing_col_threshold(table.turbine_ids().len());
    let missing = classify_rows(table, &config.tracked_features, threshold);
    let spans = run_length_spans(table.time(), table.dt_ms(), &missing);
    let eligible = eligible_spans(
        &spans,
        table.dt_ms(),
        config.missing_duration_s * 1_000,
        config.minimum_span_duration_s * 1_000,
    );

    info!(
        component = "continuity",
        event = "continuity.spans",
        missing_col_threshold = threshold,
        candidate_spans = spans.len(),
        missing_rows = missing.iter().filter(|m| **m).count(),
        groups = eligible.len()
    );

    if eligible.is_empty() {
        return Err(StageError::NoEligibleSpans {
            candidate_spans: spans.len(),
            missing_col_threshold: threshold,
            missing_duration_threshold_s: config.missing_duration_s,
            minimum_span_duration_s: config.minimum_span_duration_s,
        });
    }

    let mut groups = vec![EXCLUDED_GROUP; table.len()];
    for (id, span) in eligible.iter().enumerate() {
        for group in &mut groups[span.first_row..=span.last_row] {
            *group = id as i64;
        }
    }
    let keep: Vec<bool> = groups.iter().map(|g| *g != EXCLUDED_GROUP).collect();
    let kept_groups: Vec<i64> = groups.into_iter().filter(|g| *g != EXCLUDED_GROUP).collect();
    let out = table
        .filter_rows(&keep)
        .with_continuity_groups(kept_groups)
        .map_err(|err| StageError::MalformedInput(err.to_string()))?;

    let report = SegmentationReport {
        missing_col_threshold: threshold,
        candidate_spans: spans.len(),
        groups: eligible.len(),
        rows_in: table.len(),
        rows_out: out.len(),
    };
    Ok((out, report))
}

/// Checks that every group is grid-contiguous, groups never interleave and
/// ids increase with time.
pub fn check_contiguity(table: &WideTable) -> Result<(), StageError> {
    let Some(groups) = table.continuity_groups() else {
        return Err(StageError::MalformedInput(
            "table carries no continuity_group column".to_string(),
        ));
    };
    let time = table.time();
    for row in 1..time.len() {
        let (prev, cur) = (groups[row - 1], groups[row]);
        if cur < prev {
            return Err(StageError::MalformedInput(format!(
                "continuity group {cur} follows {prev} at row {row}"
            )));
        }
        if cur == prev && time[row] - time[row - 1] != table.dt_ms() {
            return Err(StageError::MalformedInput(format!(
                "continuity group {cur} has a {} ms step at row {row}",
                time[row] - time[row - 1]
            )));
        }
    }
    if groups.contains(&EXCLUDED_GROUP) {
        return Err(StageError::MalformedInput(
            "excluded rows left in segmented table".to_string(),
        ));
    }
    Ok(())
}
