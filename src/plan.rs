//! Deferred column transformations over a [`WideTable`].
//!
//! A [`LazyTable`] records operations and runs none of them until
//! [`LazyTable::collect`]. Collection walks the plan in order; each operation
//! touches only the columns it names, split into `chunk_rows` slices that are
//! processed in parallel.

use rayon::prelude::*;

use crate::angular::wrap_to_unsigned_range;
use crate::error::StageError;
use crate::schema::{ColumnKey, FeatureType};
use crate::table::WideTable;

pub const DEFAULT_CHUNK_ROWS: usize = 65_536;

#[derive(Debug, Clone, PartialEq)]
pub enum DeriveExpr {
    /// `sin(rad(source - shift_deg))`
    ShiftedSin { source: ColumnKey, shift_deg: f64 },
    /// `cos(rad(source - shift_deg))`
    ShiftedCos { source: ColumnKey, shift_deg: f64 },
    Product { left: ColumnKey, right: ColumnKey },
}

impl DeriveExpr {
    fn sources(&self) -> Vec<&ColumnKey> {
        match self {
            Self::ShiftedSin { source, .. } | Self::ShiftedCos { source, .. } => vec![source],
            Self::Product { left, right } => vec![left, right],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnOp {
    /// Subtracts `degrees` from an angular column, wrapping to `[0, 360)`.
    Rotate { key: ColumnKey, degrees: f64 },
    Derive { target: ColumnKey, expr: DeriveExpr },
    /// Affine map of a whole family from `[min, max]` onto `[-1, 1]`.
    Scale {
        feature: FeatureType,
        min: f64,
        max: f64,
    },
    /// Inverse of `Scale`.
    Unscale {
        feature: FeatureType,
        min: f64,
        max: f64,
    },
    Select { features: Vec<FeatureType> },
}

#[derive(Debug, Clone)]
pub struct LazyTable {
    base: WideTable,
    ops: Vec<ColumnOp>,
    chunk_rows: usize,
}

impl LazyTable {
    pub fn new(base: WideTable) -> Self {
        Self {
            base,
            ops: Vec::new(),
            chunk_rows: DEFAULT_CHUNK_ROWS,
        }
    }

    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows.max(1);
        self
    }

    pub fn ops(&self) -> &[ColumnOp] {
        &self.ops
    }

    pub fn base(&self) -> &WideTable {
        &self.base
    }

    pub fn push(mut self, op: ColumnOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn rotate(self, key: ColumnKey, degrees: f64) -> Self {
        self.push(ColumnOp::Rotate { key, degrees })
    }

    pub fn derive(self, target: ColumnKey, expr: DeriveExpr) -> Self {
        self.push(ColumnOp::Derive { target, expr })
    }

    pub fn scale(self, feature: FeatureType, min: f64, max: f64) -> Self {
        self.push(ColumnOp::Scale { feature, min, max })
    }

    pub fn unscale(self, feature: FeatureType, min: f64, max: f64) -> Self {
        self.push(ColumnOp::Unscale { feature, min, max })
    }

    pub fn select(self, features: Vec<FeatureType>) -> Self {
        self.push(ColumnOp::Select { features })
    }

    /// Materializes the plan.
    pub fn collect(self) -> Result<WideTable, StageError> {
        let chunk_rows = self.chunk_rows;
        let mut table = self.base;
        for op in self.ops {
            apply_op(&mut table, op, chunk_rows)?;
        }
        Ok(table)
    }

    /// Global `(min, max)` of a family. Reductions need every row, so the
    /// pending plan is collected first and the materialized table is returned.
    pub fn min_max(
        self,
        feature: FeatureType,
    ) -> Result<(WideTable, Option<(f64, f64)>), StageError> {
        let table = self.collect()?;
        let range = family_min_max(&table, feature);
        Ok((table, range))
    }
}

/// Non-null extremes of a family across all turbines; `None` when every cell is null.
pub fn family_min_max(table: &WideTable, feature: FeatureType) -> Option<(f64, f64)> {
    let (lo, hi) = table
        .family(feature)
        .par_iter()
        .map(|(_, values)| {
            values
                .iter()
                .flatten()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(*v), hi.max(*v))
                })
        })
        .reduce(
            || (f64::INFINITY, f64::NEG_INFINITY),
            |a, b| (a.0.min(b.0), a.1.max(b.1)),
        );
    (lo <= hi).then_some((lo, hi))
}

fn apply_op(table: &mut WideTable, op: ColumnOp, chunk_rows: usize) -> Result<(), StageError> {
    match op {
        ColumnOp::Rotate { key, degrees } => {
            let values = table.column_mut(&key).ok_or_else(|| missing(&key))?;
            map_chunked(values, chunk_rows, |x| wrap_to_unsigned_range(x - degrees));
        }
        ColumnOp::Scale { feature, min, max } => {
            let span = max - min;
            if span <= 0.0 || !span.is_finite() {
                return Err(StageError::DegenerateNormalization { feature, min, max });
            }
            map_family(table, feature, chunk_rows, move |x| 2.0 * (x - min) / span - 1.0);
        }
        ColumnOp::Unscale { feature, min, max } => {
            let span = max - min;
            if span <= 0.0 || !span.is_finite() {
                return Err(StageError::DegenerateNormalization { feature, min, max });
            }
            map_family(table, feature, chunk_rows, move |y| (y + 1.0) * span / 2.0 + min);
        }
        ColumnOp::Derive { target, expr } => {
            for source in expr.sources() {
                if table.column_by_key(source).is_none() {
                    return Err(missing(source));
                }
            }
            let values = evaluate_derive(table, &expr, chunk_rows);
            table
                .set_column(target, values)
                .map_err(|err| StageError::MalformedInput(err.to_string()))?;
        }
        ColumnOp::Select { features } => table.retain_features(&features),
    }
    Ok(())
}

fn missing(key: &ColumnKey) -> StageError {
    StageError::MalformedInput(format!("missing column {key}"))
}

fn map_chunked<F>(values: &mut [Option<f64>], chunk_rows: usize, f: F)
where
    F: Fn(f64) -> f64 + Sync,
{
    values.par_chunks_mut(chunk_rows).for_each(|chunk| {
        for cell in chunk.iter_mut() {
            if let Some(x) = *cell {
                *cell = Some(f(x));
            }
        }
    });
}

fn map_family<F>(table: &mut WideTable, feature: FeatureType, chunk_rows: usize, f: F)
where
    F: Fn(f64) -> f64 + Sync,
{
    table
        .columns_mut()
        .par_iter_mut()
        .filter(|(key, _)| key.feature == feature)
        .for_each(|(_, values)| map_chunked(values, chunk_rows, &f));
}

fn evaluate_derive(table: &WideTable, expr: &DeriveExpr, chunk_rows: usize) -> Vec<Option<f64>> {
    let empty: &[Option<f64>] = &[];
    match expr {
        DeriveExpr::ShiftedSin { source, shift_deg } => {
            let src = table.column_by_key(source).unwrap_or(empty);
            unary(src, chunk_rows, |x| (x - shift_deg).to_radians().sin())
        }
        DeriveExpr::ShiftedCos { source, shift_deg } => {
            let src = table.column_by_key(source).unwrap_or(empty);
            unary(src, chunk_rows, |x| (x - shift_deg).to_radians().cos())
        }
        DeriveExpr::Product { left, right } => {
            let l = table.column_by_key(left).unwrap_or(empty);
            let r = table.column_by_key(right).unwrap_or(empty);
            l.par_chunks(chunk_rows)
                .zip(r.par_chunks(chunk_rows))
                .flat_map_iter(|(lc, rc)| {
                    lc.iter().zip(rc).map(|(a, b)| match (a, b) {
                        (Some(a), Some(b)) => Some(a * b),
                        _ => None,
                    })
                })
                .collect()
        }
    }
}

fn unary<F>(src: &[Option<f64>], chunk_rows: usize, f: F) -> Vec<Option<f64>>
where
    F: Fn(f64) -> f64 + Sync,
{
    src.par_chunks(chunk_rows)
        .flat_map_iter(|chunk| chunk.iter().map(|v| v.map(&f)))
        .collect()
}
