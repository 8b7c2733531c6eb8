//! Time-indexed wide table: one nullable `f64` column per (feature, turbine).

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::StageError;
use crate::schema::{ColumnKey, FeatureType, TurbineId};

pub const TIME_COLUMN: &str = "time";
pub const CONTINUITY_GROUP_COLUMN: &str = "continuity_group";

#[derive(Debug, Error)]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("sampling interval must be > 0 ms, got {0}")]
    InvalidDt(i64),
    #[error("header is missing the `time` column")]
    MissingTimeColumn,
    #[error("unrecognised column `{0}`; expected `{{feature}}_{{turbine_id}}`")]
    UnknownColumn(String),
    #[error("column `{0}` appears more than once")]
    DuplicateColumn(String),
    #[error("row {row}: cannot parse timestamp '{value}'")]
    InvalidTimestamp { row: usize, value: String },
    #[error("row {row}: cannot parse `{column}` value '{value}'")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
    },
    #[error("row {row}: duplicate timestamp {ts_ms_utc}")]
    DuplicateTimestamp { row: usize, ts_ms_utc: i64 },
    #[error("row {row}: time goes backwards ({previous_ms} -> {current_ms})")]
    NonMonotonicTime {
        row: usize,
        previous_ms: i64,
        current_ms: i64,
    },
    #[error("row {row}: step of {step_ms} ms is not a multiple of dt {dt_ms} ms")]
    OffGrid { row: usize, step_ms: i64, dt_ms: i64 },
    #[error("column `{column}` has {found} rows, expected {expected}")]
    LengthMismatch {
        column: String,
        found: usize,
        expected: usize,
    },
    #[error("turbine {turbine} is missing feature families {missing:?} carried by other turbines")]
    RaggedTurbine {
        turbine: String,
        missing: Vec<String>,
    },
    #[error("turbine {0} is not part of this table")]
    UnknownTurbine(String),
    #[error("column `{column}` row {row}: non-finite value {value}")]
    NonFiniteValue {
        column: String,
        row: usize,
        value: f64,
    },
}

/// Owned wide table. `time` holds UTC epoch milliseconds and is strictly
/// increasing on a `dt_ms` grid; rows may be absent but never duplicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TableSnapshot", into = "TableSnapshot")]
pub struct WideTable {
    dt_ms: i64,
    time: Vec<i64>,
    turbines: Vec<TurbineId>,
    columns: BTreeMap<ColumnKey, Vec<Option<f64>>>,
    continuity_group: Option<Vec<i64>>,
}

impl WideTable {
    pub fn new(
        dt_ms: i64,
        time: Vec<i64>,
        columns: Vec<(ColumnKey, Vec<Option<f64>>)>,
    ) -> Result<Self, TableError> {
        if dt_ms <= 0 {
            return Err(TableError::InvalidDt(dt_ms));
        }
        validate_time_axis(&time, dt_ms)?;

        let mut map = BTreeMap::new();
        for (key, values) in columns {
            if values.len() != time.len() {
                return Err(TableError::LengthMismatch {
                    column: key.column_name(),
                    found: values.len(),
                    expected: time.len(),
                });
            }
            check_finite(&key, &values)?;
            let name = key.column_name();
            if map.insert(key, values).is_some() {
                return Err(TableError::DuplicateColumn(name));
            }
        }

        let turbines: Vec<TurbineId> = map
            .keys()
            .map(|key| key.turbine.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        validate_rectangular(&map, &turbines)?;

        Ok(Self {
            dt_ms,
            time,
            turbines,
            columns: map,
            continuity_group: None,
        })
    }

    pub fn dt_ms(&self) -> i64 {
        self.dt_ms
    }

    pub fn time(&self) -> &[i64] {
        &self.time
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn turbine_ids(&self) -> &[TurbineId] {
        &self.turbines
    }

    pub fn features(&self) -> BTreeSet<FeatureType> {
        self.columns.keys().map(|key| key.feature).collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ColumnKey> {
        self.columns.keys()
    }

    pub fn column(&self, feature: FeatureType, turbine: &TurbineId) -> Option<&[Option<f64>]> {
        self.columns
            .get(&ColumnKey::new(feature, turbine.clone()))
            .map(Vec::as_slice)
    }

    pub fn column_by_key(&self, key: &ColumnKey) -> Option<&[Option<f64>]> {
        self.columns.get(key).map(Vec::as_slice)
    }

    /// Columns of one feature family, in turbine order.
    pub fn family(&self, feature: FeatureType) -> Vec<(&TurbineId, &[Option<f64>])> {
        self.columns
            .iter()
            .filter(|(key, _)| key.feature == feature)
            .map(|(key, values)| (&key.turbine, values.as_slice()))
            .collect()
    }

    pub fn continuity_groups(&self) -> Option<&[i64]> {
        self.continuity_group.as_deref()
    }

    /// Fails with `MalformedInput` naming every absent `(feature, turbine)` column.
    pub fn require(
        &self,
        features: &[FeatureType],
        turbines: &[TurbineId],
    ) -> Result<(), StageError> {
        let mut missing = Vec::new();
        for feature in features {
            for turbine in turbines {
                let key = ColumnKey::new(*feature, turbine.clone());
                if !self.columns.contains_key(&key) {
                    missing.push(key.column_name());
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StageError::MalformedInput(format!(
                "missing columns: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn set_column(
        &mut self,
        key: ColumnKey,
        values: Vec<Option<f64>>,
    ) -> Result<(), TableError> {
        if values.len() != self.time.len() {
            return Err(TableError::LengthMismatch {
                column: key.column_name(),
                found: values.len(),
                expected: self.time.len(),
            });
        }
        if !self.turbines.contains(&key.turbine) {
            return Err(TableError::UnknownTurbine(key.turbine.to_string()));
        }
        check_finite(&key, &values)?;
        self.columns.insert(key, values);
        Ok(())
    }

    pub(crate) fn columns_mut(&mut self) -> &mut BTreeMap<ColumnKey, Vec<Option<f64>>> {
        &mut self.columns
    }

    pub(crate) fn column_mut(&mut self, key: &ColumnKey) -> Option<&mut Vec<Option<f64>>> {
        self.columns.get_mut(key)
    }

    /// Keeps only the listed feature families; the turbine set is unchanged.
    pub fn retain_features(&mut self, features: &[FeatureType]) {
        self.columns.retain(|key, _| features.contains(&key.feature));
    }

    /// Returns a new table holding the rows where `keep` is true.
    pub fn filter_rows(&self, keep: &[bool]) -> WideTable {
        let pick = |values: &[Option<f64>]| -> Vec<Option<f64>> {
            values
                .iter()
                .zip(keep)
                .filter(|(_, k)| **k)
                .map(|(v, _)| *v)
                .collect()
        };
        let time = self
            .time
            .iter()
            .zip(keep)
            .filter(|(_, k)| **k)
            .map(|(t, _)| *t)
            .collect();
        let columns = self
            .columns
            .iter()
            .map(|(key, values)| (key.clone(), pick(values.as_slice())))
            .collect();
        let continuity_group = self.continuity_group.as_ref().map(|groups| {
            groups
                .iter()
                .zip(keep)
                .filter(|(_, k)| **k)
                .map(|(g, _)| *g)
                .collect()
        });
        WideTable {
            dt_ms: self.dt_ms,
            time,
            turbines: self.turbines.clone(),
            columns,
            continuity_group,
        }
    }

    pub fn with_continuity_groups(mut self, groups: Vec<i64>) -> Result<Self, TableError> {
        if groups.len() != self.time.len() {
            return Err(TableError::LengthMismatch {
                column: CONTINUITY_GROUP_COLUMN.to_string(),
                found: groups.len(),
                expected: self.time.len(),
            });
        }
        self.continuity_group = Some(groups);
        Ok(self)
    }

    pub fn null_count(&self, feature: FeatureType) -> usize {
        self.columns
            .iter()
            .filter(|(key, _)| key.feature == feature)
            .map(|(_, values)| values.iter().filter(|v| v.is_none()).count())
            .sum()
    }

    /// Number of turbines with a null in `feature` at each row.
    pub fn missing_per_row(&self, feature: FeatureType) -> Vec<usize> {
        let mut counts = vec![0usize; self.time.len()];
        for (_, values) in self.family(feature) {
            for (count, value) in counts.iter_mut().zip(values) {
                if value.is_none() {
                    *count += 1;
                }
            }
        }
        counts
    }

    /// SHA-256 over the full table content, used to seed checkpoint keys.
    pub fn content_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("dt_ms:{};rows:{};", self.dt_ms, self.time.len()));
        for ts in &self.time {
            hasher.update(ts.to_le_bytes());
        }
        for (key, values) in &self.columns {
            hasher.update(key.column_name().as_bytes());
            hasher.update(b":");
            for value in values {
                match value {
                    Some(v) => hasher.update(v.to_bits().to_le_bytes()),
                    None => hasher.update(b"null"),
                }
            }
            hasher.update(b";");
        }
        if let Some(groups) = &self.continuity_group {
            hasher.update(b"groups:");
            for group in groups {
                hasher.update(group.to_le_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    pub fn from_csv_reader<R: Read>(reader: R, dt_ms: i64) -> Result<Self, TableError> {
        let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers = rdr.headers()?.clone();

        let mut time_idx = None;
        let mut group_idx = None;
        let mut keys: Vec<(usize, ColumnKey)> = Vec::new();
        for (idx, name) in headers.iter().enumerate() {
            let name = name.trim();
            if name == TIME_COLUMN {
                time_idx = Some(idx);
            } else if name == CONTINUITY_GROUP_COLUMN {
                group_idx = Some(idx);
            } else {
                let key = ColumnKey::parse(name)
                    .ok_or_else(|| TableError::UnknownColumn(name.to_string()))?;
                keys.push((idx, key));
            }
        }
        let time_idx = time_idx.ok_or(TableError::MissingTimeColumn)?;

        let mut time = Vec::new();
        let mut values: Vec<Vec<Option<f64>>> = vec![Vec::new(); keys.len()];
        let mut groups = Vec::new();
        for (row, record) in rdr.records().enumerate() {
            let record = record?;
            let raw_ts = record.get(time_idx).unwrap_or_default();
            time.push(parse_timestamp(raw_ts).ok_or_else(|| TableError::InvalidTimestamp {
                row,
                value: raw_ts.to_string(),
            })?);

            for (slot, (idx, key)) in values.iter_mut().zip(&keys) {
                let raw = record.get(*idx).unwrap_or_default().trim();
                slot.push(parse_cell(raw).ok_or_else(|| TableError::InvalidValue {
                    row,
                    column: key.column_name(),
                    value: raw.to_string(),
                })?);
            }

            if let Some(idx) = group_idx {
                let raw = record.get(idx).unwrap_or_default().trim();
                groups.push(raw.parse::<i64>().map_err(|_| TableError::InvalidValue {
                    row,
                    column: CONTINUITY_GROUP_COLUMN.to_string(),
                    value: raw.to_string(),
                })?);
            }
        }

        let columns = keys.into_iter().map(|(_, key)| key).zip(values).collect();
        let table = Self::new(dt_ms, time, columns)?;
        match group_idx {
            Some(_) => table.with_continuity_groups(groups),
            None => Ok(table),
        }
    }

    pub fn to_csv_writer<W: Write>(&self, writer: W) -> Result<(), TableError> {
        let mut wtr = csv::Writer::from_writer(writer);

        let mut header = vec![TIME_COLUMN.to_string()];
        if self.continuity_group.is_some() {
            header.push(CONTINUITY_GROUP_COLUMN.to_string());
        }
        header.extend(self.columns.keys().map(ColumnKey::column_name));
        wtr.write_record(&header)?;

        for row in 0..self.time.len() {
            let mut record = Vec::with_capacity(header.len());
            record.push(format_timestamp(self.time[row]));
            if let Some(groups) = &self.continuity_group {
                record.push(groups[row].to_string());
            }
            for values in self.columns.values() {
                record.push(values[row].map(|v| v.to_string()).unwrap_or_default());
            }
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Accepts RFC 3339 or a naive `YYYY-MM-DD HH:MM:SS[.fff]` read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

pub fn format_timestamp(ts_ms_utc: i64) -> String {
    match Utc.timestamp_millis_opt(ts_ms_utc).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => ts_ms_utc.to_string(),
    }
}

/// Empty, `null` and `NaN` cells are nulls. `None` rejects the cell;
/// infinities are never readings.
fn parse_cell(raw: &str) -> Option<Option<f64>> {
    if raw.is_empty() || raw.eq_ignore_ascii_case("null") || raw.eq_ignore_ascii_case("nan") {
        return Some(None);
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite()).map(Some)
}

fn check_finite(key: &ColumnKey, values: &[Option<f64>]) -> Result<(), TableError> {
    match values.iter().enumerate().find(|(_, v)| v.is_some_and(|x| !x.is_finite())) {
        Some((row, Some(value))) => Err(TableError::NonFiniteValue {
            column: key.column_name(),
            row,
            value: *value,
        }),
        _ => Ok(()),
    }
}

fn validate_time_axis(time: &[i64], dt_ms: i64) -> Result<(), TableError> {
    for (row, pair) in time.windows(2).enumerate() {
        let (previous_ms, current_ms) = (pair[0], pair[1]);
        let step_ms = current_ms - previous_ms;
        if step_ms == 0 {
            return Err(TableError::DuplicateTimestamp {
                row: row + 1,
                ts_ms_utc: current_ms,
            });
        }
        if step_ms < 0 {
            return Err(TableError::NonMonotonicTime {
                row: row + 1,
                previous_ms,
                current_ms,
            });
        }
        if step_ms % dt_ms != 0 {
            return Err(TableError::OffGrid {
                row: row + 1,
                step_ms,
                dt_ms,
            });
        }
    }
    Ok(())
}

fn validate_rectangular(
    columns: &BTreeMap<ColumnKey, Vec<Option<f64>>>,
    turbines: &[TurbineId],
) -> Result<(), TableError> {
    let families: BTreeSet<FeatureType> = columns.keys().map(|key| key.feature).collect();
    for turbine in turbines {
        let missing: Vec<String> = families
            .iter()
            .filter(|feature| !columns.contains_key(&ColumnKey::new(**feature, turbine.clone())))
            .map(|feature| feature.as_str().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(TableError::RaggedTurbine {
                turbine: turbine.to_string(),
                missing,
            });
        }
    }
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct TableSnapshot {
    dt_ms: i64,
    time: Vec<i64>,
    columns: Vec<ColumnSnapshot>,
    continuity_group: Option<Vec<i64>>,
}

#[derive(Serialize, Deserialize)]
struct ColumnSnapshot {
    feature: FeatureType,
    turbine: TurbineId,
    values: Vec<Option<f64>>,
}

impl From<WideTable> for TableSnapshot {
    fn from(table: WideTable) -> Self {
        Self {
            dt_ms: table.dt_ms,
            time: table.time,
            columns: table
                .columns
                .into_iter()
                .map(|(key, values)| ColumnSnapshot {
                    feature: key.feature,
                    turbine: key.turbine,
                    values,
                })
                .collect(),
            continuity_group: table.continuity_group,
        }
    }
}

impl TryFrom<TableSnapshot> for WideTable {
    type Error = TableError;

    fn try_from(snapshot: TableSnapshot) -> Result<Self, Self::Error> {
        let columns = snapshot
            .columns
            .into_iter()
            .map(|c| (ColumnKey::new(c.feature, c.turbine), c.values))
            .collect();
        let table = WideTable::new(snapshot.dt_ms, snapshot.time, columns)?;
        match snapshot.continuity_group {
            Some(groups) => table.with_continuity_groups(groups),
            None => Ok(table),
        }
    }
}
