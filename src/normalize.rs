//! Engineered direction features and their scaling to `[-1, 1]`.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StageError;
use crate::plan::{family_min_max, DeriveExpr, LazyTable};
use crate::schema::{ColumnKey, FeatureType};
use crate::table::{TableError, WideTable};

/// Direction features are rotated so that a southerly reading maps to zero.
pub const DIRECTION_SHIFT_DEG: f64 = 180.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizeConfig {
    pub features: Vec<FeatureType>,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            features: vec![
                FeatureType::NdCos,
                FeatureType::NdSin,
                FeatureType::WsHorz,
                FeatureType::WsVert,
            ],
        }
    }
}

impl NormalizeConfig {
    /// Raw families the engineered features are derived from.
    pub fn source_features(&self) -> Vec<FeatureType> {
        let mut sources = Vec::new();
        for feature in &self.features {
            let needs: &[FeatureType] = match feature {
                FeatureType::WdSin | FeatureType::WdCos => &[FeatureType::WindDirection],
                FeatureType::WsHorz | FeatureType::WsVert => {
                    &[FeatureType::WindSpeed, FeatureType::WindDirection]
                }
                FeatureType::NdSin | FeatureType::NdCos => &[FeatureType::NacelleDirection],
                other => std::slice::from_ref(other),
            };
            for need in needs {
                if !sources.contains(need) {
                    sources.push(*need);
                }
            }
        }
        sources
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureRange {
    pub min: f64,
    pub max: f64,
}

/// Per-family `(min, max)` with two-decimal precision, persisted next to the
/// output so inference-time data can be scaled identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationConstants {
    ranges: BTreeMap<FeatureType, FeatureRange>,
}

impl NormalizationConstants {
    pub fn get(&self, feature: FeatureType) -> Option<FeatureRange> {
        self.ranges.get(&feature).copied()
    }

    pub fn features(&self) -> impl Iterator<Item = FeatureType> + '_ {
        self.ranges.keys().copied()
    }

    pub fn insert(&mut self, feature: FeatureType, range: FeatureRange) {
        self.ranges.insert(feature, range);
    }

    /// Global min/max per family across every turbine. The min is rounded
    /// down and the max up, so scaled values stay inside `[-1, 1]`.
    pub fn compute(table: &WideTable, features: &[FeatureType]) -> Result<Self, StageError> {
        let mut constants = Self::default();
        for feature in features {
            let (min, max) =
                family_min_max(table, *feature).unwrap_or((f64::NAN, f64::NAN));
            if !min.is_finite() || !max.is_finite() || max <= min {
                return Err(StageError::DegenerateNormalization {
                    feature: *feature,
                    min,
                    max,
                });
            }
            constants.insert(
                *feature,
                FeatureRange {
                    min: (min * 100.0).floor() / 100.0,
                    max: (max * 100.0).ceil() / 100.0,
                },
            );
        }
        Ok(constants)
    }

    /// Maps every family in `table` that has constants back to raw units.
    pub fn inverse(&self, table: WideTable, chunk_rows: usize) -> Result<WideTable, StageError> {
        let present = table.features();
        let mut lazy = LazyTable::new(table).with_chunk_rows(chunk_rows);
        for (feature, range) in &self.ranges {
            if present.contains(feature) {
                lazy = lazy.unscale(*feature, range.min, range.max);
            }
        }
        lazy.collect()
    }

    /// One-row CSV with `{feature}_max` and `{feature}_min` columns.
    pub fn to_csv_writer<W: Write>(&self, writer: W) -> Result<(), TableError> {
        let mut wtr = csv::Writer::from_writer(writer);
        let mut header = Vec::with_capacity(self.ranges.len() * 2);
        let mut record = Vec::with_capacity(self.ranges.len() * 2);
        for (feature, range) in &self.ranges {
            header.push(format!("{feature}_max"));
            header.push(format!("{feature}_min"));
            record.push(format!("{:.2}", range.max));
            record.push(format!("{:.2}", range.min));
        }
        wtr.write_record(&header)?;
        wtr.write_record(&record)?;
        wtr.flush()?;
        Ok(())
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, TableError> {
        let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers = rdr.headers()?.clone();
        let Some(record) = rdr.records().next().transpose()? else {
            return Ok(Self::default());
        };

        let mut mins: BTreeMap<FeatureType, f64> = BTreeMap::new();
        let mut maxs: BTreeMap<FeatureType, f64> = BTreeMap::new();
        for (name, raw) in headers.iter().zip(record.iter()) {
            let name = name.trim();
            let (feature, slot) = if let Some(f) = name.strip_suffix("_max") {
                (FeatureType::parse(f), &mut maxs)
            } else if let Some(f) = name.strip_suffix("_min") {
                (FeatureType::parse(f), &mut mins)
            } else {
                (None, &mut maxs)
            };
            let feature = feature.ok_or_else(|| TableError::UnknownColumn(name.to_string()))?;
            let value = raw.trim().parse::<f64>().map_err(|_| TableError::InvalidValue {
                row: 0,
                column: name.to_string(),
                value: raw.to_string(),
            })?;
            slot.insert(feature, value);
        }

        let mut constants = Self::default();
        for (feature, max) in maxs {
            let min = mins
                .remove(&feature)
                .ok_or_else(|| TableError::UnknownColumn(format!("{feature}_min")))?;
            constants.insert(feature, FeatureRange { min, max });
        }
        if let Some(feature) = mins.keys().next() {
            return Err(TableError::UnknownColumn(format!("{feature}_max")));
        }
        Ok(constants)
    }
}

/// Adds the engineered families named in `features` for every turbine.
pub fn engineer_features(
    table: WideTable,
    features: &[FeatureType],
    chunk_rows: usize,
) -> Result<WideTable, StageError> {
    let turbines = table.turbine_ids().to_vec();
    let wants = |f: FeatureType| features.contains(&f);
    let need_wd_trig = wants(FeatureType::WdSin)
        || wants(FeatureType::WdCos)
        || wants(FeatureType::WsHorz)
        || wants(FeatureType::WsVert);

    let mut lazy = LazyTable::new(table).with_chunk_rows(chunk_rows);
    for turbine in &turbines {
        let key = |feature| ColumnKey::new(feature, turbine.clone());
        if need_wd_trig {
            lazy = lazy
                .derive(
                    key(FeatureType::WdSin),
                    DeriveExpr::ShiftedSin {
                        source: key(FeatureType::WindDirection),
                        shift_deg: DIRECTION_SHIFT_DEG,
                    },
                )
                .derive(
                    key(FeatureType::WdCos),
                    DeriveExpr::ShiftedCos {
                        source: key(FeatureType::WindDirection),
                        shift_deg: DIRECTION_SHIFT_DEG,
                    },
                );
        }
        if wants(FeatureType::WsHorz) {
            lazy = lazy.derive(
                key(FeatureType::WsHorz),
                DeriveExpr::Product {
                    left: key(FeatureType::WindSpeed),
                    right: key(FeatureType::WdSin),
                },
            );
        }
        if wants(FeatureType::WsVert) {
            lazy = lazy.derive(
                key(FeatureType::WsVert),
                DeriveExpr::Product {
                    left: key(FeatureType::WindSpeed),
                    right: key(FeatureType::WdCos),
                },
            );
        }
        if wants(FeatureType::NdSin) {
            lazy = lazy.derive(
                key(FeatureType::NdSin),
                DeriveExpr::ShiftedSin {
                    source: key(FeatureType::NacelleDirection),
                    shift_deg: DIRECTION_SHIFT_DEG,
                },
            );
        }
        if wants(FeatureType::NdCos) {
            lazy = lazy.derive(
                key(FeatureType::NdCos),
                DeriveExpr::ShiftedCos {
                    source: key(FeatureType::NacelleDirection),
                    shift_deg: DIRECTION_SHIFT_DEG,
                },
            );
        }
    }
    lazy.collect()
}

/// Derives the configured features, keeps only them (plus `time` and any
/// continuity groups) and scales each family onto `[-1, 1]`.
pub fn normalize(
    table: &WideTable,
    config: &NormalizeConfig,
    chunk_rows: usize,
) -> Result<(WideTable, NormalizationConstants), StageError> {
    if config.features.is_empty() {
        return Err(StageError::InvalidParameter(
            "normalize needs at least one feature".to_string(),
        ));
    }
    table.require(&config.source_features(), table.turbine_ids())?;

    let engineered = LazyTable::new(engineer_features(table.clone(), &config.features, chunk_rows)?)
        .with_chunk_rows(chunk_rows)
        .select(config.features.clone())
        .collect()?;

    // global reduction: needs the materialized engineered columns
    let constants = NormalizationConstants::compute(&engineered, &config.features)?;
    for feature in &config.features {
        if let Some(range) = constants.get(*feature) {
            info!(
                component = "normalize",
                event = "normalize.constants",
                feature = %feature,
                min = range.min,
                max = range.max
            );
        }
    }

    let mut lazy = LazyTable::new(engineered).with_chunk_rows(chunk_rows);
    for feature in &config.features {
        if let Some(range) = constants.get(*feature) {
            lazy = lazy.scale(*feature, range.min, range.max);
        }
    }
    Ok((lazy.collect()?, constants))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TurbineId;

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() < tol,
            "actual={actual} expected={expected}"
        );
    }

    fn table() -> WideTable {
        let mut columns = Vec::new();
        for (idx, offset) in [0.0, 15.0].iter().enumerate() {
            let turbine = TurbineId::new(format!("wt{:03}", idx + 1));
            columns.push((
                ColumnKey::new(FeatureType::WindSpeed, turbine.clone()),
                (0..6).map(|i| Some(3.0 + i as f64 + offset / 10.0)).collect(),
            ));
            columns.push((
                ColumnKey::new(FeatureType::WindDirection, turbine.clone()),
                (0..6).map(|i| Some((i as f64 * 70.0 + offset) % 360.0)).collect(),
            ));
            columns.push((
                ColumnKey::new(FeatureType::NacelleDirection, turbine),
                (0..6).map(|i| Some((i as f64 * 65.0 + offset) % 360.0)).collect(),
            ));
        }
        WideTable::new(1_000, (0..6).map(|i| i * 1_000).collect(), columns)
            .expect("valid table")
            .with_continuity_groups(vec![0, 0, 0, 1, 1, 1])
            .expect("groups")
    }

    #[test]
    fn engineered_features_follow_the_shifted_definitions() {
        let turbine = TurbineId::new("wt001");
        let out = engineer_features(
            table(),
            &[FeatureType::WsHorz, FeatureType::WsVert, FeatureType::NdCos],
            4,
        )
        .expect("engineer");
        let ws = out.column(FeatureType::WindSpeed, &turbine).expect("ws")[2].expect("value");
        let wd = out.column(FeatureType::WindDirection, &turbine).expect("wd")[2].expect("value");
        let nd = out
            .column(FeatureType::NacelleDirection, &turbine)
            .expect("nd")[2]
            .expect("value");
        let horz = out.column(FeatureType::WsHorz, &turbine).expect("horz")[2].expect("value");
        let vert = out.column(FeatureType::WsVert, &turbine).expect("vert")[2].expect("value");
        let nd_cos = out.column(FeatureType::NdCos, &turbine).expect("nd_cos")[2].expect("value");
        assert_close(horz, ws * (wd - 180.0).to_radians().sin(), 1e-12);
        assert_close(vert, ws * (wd - 180.0).to_radians().cos(), 1e-12);
        assert_close(nd_cos, (nd - 180.0).to_radians().cos(), 1e-12);
    }

    #[test]
    fn normalized_output_is_bounded_and_keeps_groups() {
        let (out, constants) =
            normalize(&table(), &NormalizeConfig::default(), 4).expect("normalize");
        assert_eq!(
            out.features().into_iter().collect::<Vec<_>>(),
            vec![
                FeatureType::WsHorz,
                FeatureType::WsVert,
                FeatureType::NdSin,
                FeatureType::NdCos
            ]
        );
        assert_eq!(out.continuity_groups(), Some(&[0, 0, 0, 1, 1, 1][..]));
        for feature in out.features() {
            for (_, values) in out.family(feature) {
                for v in values.iter().flatten() {
                    assert!((-1.0 - 1e-12..=1.0 + 1e-12).contains(v), "{feature}: {v}");
                }
            }
            let range = constants.get(feature).expect("constants");
            assert_close((range.min * 100.0).round(), range.min * 100.0, 1e-6);
            assert_close((range.max * 100.0).round(), range.max * 100.0, 1e-6);
        }
    }

    #[test]
    fn inverse_recovers_engineered_values() {
        let config = NormalizeConfig {
            features: vec![FeatureType::WsHorz],
        };
        let (scaled, constants) = normalize(&table(), &config, 4).expect("normalize");
        let raw = engineer_features(table(), &config.features, 4).expect("engineer");
        let restored = constants.inverse(scaled, 4).expect("inverse");
        for (turbine, values) in restored.family(FeatureType::WsHorz) {
            let expected = raw.column(FeatureType::WsHorz, turbine).expect("column");
            for (a, b) in values.iter().zip(expected) {
                assert_close(a.expect("value"), b.expect("value"), 1e-9);
            }
        }
    }

    #[test]
    fn constant_feature_is_degenerate() {
        let turbine = TurbineId::new("wt001");
        let flat = WideTable::new(
            1_000,
            vec![0, 1_000],
            vec![(
                ColumnKey::new(FeatureType::NacelleDirection, turbine),
                vec![Some(90.0), Some(90.0)],
            )],
        )
        .expect("valid table");
        let config = NormalizeConfig {
            features: vec![FeatureType::NdCos],
        };
        let err = normalize(&flat, &config, 4).expect_err("degenerate");
        assert!(matches!(
            err,
            StageError::DegenerateNormalization {
                feature: FeatureType::NdCos,
                ..
            }
        ));
    }

    #[test]
    fn constants_csv_round_trips() {
        let (_, constants) =
            normalize(&table(), &NormalizeConfig::default(), 4).expect("normalize");
        let mut out = Vec::new();
        constants.to_csv_writer(&mut out).expect("write");
        let text = String::from_utf8(out.clone()).expect("utf8");
        assert!(text.starts_with("ws_horz_max,ws_horz_min,"));
        let back = NormalizationConstants::from_csv_reader(out.as_slice()).expect("read");
        assert_eq!(back, constants);
    }

    #[test]
    fn source_features_cover_derivations() {
        let config = NormalizeConfig::default();
        assert_eq!(
            config.source_features(),
            vec![
                FeatureType::NacelleDirection,
                FeatureType::WindSpeed,
                FeatureType::WindDirection
            ]
        );
    }
}
