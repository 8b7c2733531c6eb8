//! Applies detector flag masks to a table, guarded by a per-family budget on
//! how many cells may be destroyed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::detectors::FlagMask;
use crate::error::StageError;
use crate::schema::{ColumnKey, FeatureType, TurbineId};
use crate::table::WideTable;

pub const DEFAULT_MAX_NULL_FRACTION: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullifyConfig {
    /// Families a mask is applied to. `None` applies every mask to its own
    /// feature family.
    #[serde(default)]
    pub targets: Option<Vec<FeatureType>>,
    #[serde(default = "default_max_null_fraction")]
    pub max_null_fraction: f64,
}

fn default_max_null_fraction() -> f64 {
    DEFAULT_MAX_NULL_FRACTION
}

impl Default for NullifyConfig {
    fn default() -> Self {
        Self {
            targets: None,
            max_null_fraction: DEFAULT_MAX_NULL_FRACTION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyNullification {
    pub feature: FeatureType,
    pub nullified: usize,
    pub total: usize,
    pub fraction: f64,
    pub per_turbine: Vec<(TurbineId, usize)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NullifySummary {
    pub families: Vec<FamilyNullification>,
}

impl NullifySummary {
    pub fn total_nullified(&self) -> usize {
        self.families.iter().map(|f| f.nullified).sum()
    }
}

/// Nulls every non-null cell flagged by any mask targeting its family.
///
/// The fraction of newly-nulled cells is checked per family against
/// `max_null_fraction` before anything is written; on failure the input is
/// untouched and no table is returned.
pub fn apply_masks(
    table: &WideTable,
    masks: &[FlagMask],
    config: &NullifyConfig,
) -> Result<(WideTable, NullifySummary), StageError> {
    if !(0.0..=1.0).contains(&config.max_null_fraction) {
        return Err(StageError::InvalidParameter(format!(
            "max_null_fraction must be within [0, 1], got {}",
            config.max_null_fraction
        )));
    }

    let mut by_family: BTreeMap<FeatureType, Vec<&FlagMask>> = BTreeMap::new();
    for mask in masks {
        let targets = match &config.targets {
            Some(targets) => targets.clone(),
            None => vec![mask.feature()],
        };
        for feature in targets {
            by_family.entry(feature).or_default().push(mask);
        }
    }

    let turbines = table.turbine_ids();
    let features: Vec<FeatureType> = by_family.keys().copied().collect();
    table.require(&features, turbines)?;

    // Plan every family first so that a failing budget leaves nothing mutated.
    let mut plan: Vec<(ColumnKey, Vec<usize>)> = Vec::new();
    let mut summary = NullifySummary::default();
    for (feature, family_masks) in &by_family {
        let mut per_turbine = Vec::with_capacity(turbines.len());
        let mut nullified = 0usize;
        for turbine in turbines {
            let values = table.column(*feature, turbine).unwrap_or_default();
            let rows: Vec<usize> = values
                .iter()
                .enumerate()
                .filter(|(row, value)| {
                    value.is_some()
                        && family_masks.iter().any(|mask| {
                            mask.flags_for(turbine)
                                .and_then(|flags| flags.get(*row).copied())
                                .unwrap_or(false)
                        })
                })
                .map(|(row, _)| row)
                .collect();
            nullified += rows.len();
            per_turbine.push((turbine.clone(), rows.len()));
            plan.push((ColumnKey::new(*feature, turbine.clone()), rows));
        }

        let total = table.len() * turbines.len();
        let fraction = if total == 0 {
            0.0
        } else {
            nullified as f64 / total as f64
        };
        if fraction > config.max_null_fraction {
            let (worst_turbine, worst_turbine_nullified) = per_turbine
                .iter()
                .max_by_key(|(_, count)| *count)
                .map(|(t, count)| (t.to_string(), *count))
                .unwrap_or_default();
            return Err(StageError::ThresholdExceeded {
                feature: *feature,
                nullified,
                total,
                fraction,
                max_fraction: config.max_null_fraction,
                worst_turbine,
                worst_turbine_nullified,
            });
        }
        summary.families.push(FamilyNullification {
            feature: *feature,
            nullified,
            total,
            fraction,
            per_turbine,
        });
    }

    let mut out = table.clone();
    for (key, rows) in plan {
        if let Some(values) = out.column_mut(&key) {
            for row in rows {
                values[row] = None;
            }
        }
    }

    for family in &summary.families {
        info!(
            component = "nullify",
            event = "nullify.applied",
            feature = %family.feature,
            nullified = family.nullified,
            total = family.total,
            fraction = family.fraction,
            max_null_fraction = config.max_null_fraction
        );
    }

    Ok((out, summary))
}
