//! Circular statistics for direction-like features (degrees).

/// Maps any angle to `(-180, 180]`.
pub fn wrap_to_signed_range(x: f64) -> f64 {
    let r = wrap_to_unsigned_range(x);
    if r > 180.0 {
        r - 360.0
    } else {
        r
    }
}

/// Maps any angle to `[0, 360)`.
pub fn wrap_to_unsigned_range(x: f64) -> f64 {
    let r = x.rem_euclid(360.0);
    // rem_euclid rounds tiny negatives up to exactly 360.0
    if r >= 360.0 {
        0.0
    } else {
        r
    }
}

/// Signed shortest-arc difference `a - b` in `(-180, 180]`.
pub fn angular_difference(a: f64, b: f64) -> f64 {
    wrap_to_signed_range(a - b)
}

/// Point at fraction `frac` along the shortest arc from `a` to `b`.
pub fn interpolate_angle(a: f64, b: f64, frac: f64) -> f64 {
    wrap_to_unsigned_range(a + frac * angular_difference(b, a))
}

fn sin_cos_sums<I>(values: I) -> Option<(f64, f64, usize)>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let mut sin_sum = 0.0;
    let mut cos_sum = 0.0;
    let mut n = 0usize;
    for v in values.into_iter().flatten() {
        let rad = v.to_radians();
        sin_sum += rad.sin();
        cos_sum += rad.cos();
        n += 1;
    }
    (n > 0).then_some((sin_sum, cos_sum, n))
}

/// Mean direction in `[0, 360)`; nulls are skipped, all-null input yields `None`.
pub fn circular_mean<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let (s, c, n) = sin_cos_sums(values)?;
    let n = n as f64;
    Some(wrap_to_unsigned_range((s / n).atan2(c / n).to_degrees()))
}

/// Mean resultant length in `[0, 1]`; 1 means every angle agrees.
pub fn resultant_length<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let (s, c, n) = sin_cos_sums(values)?;
    let n = n as f64;
    Some(((s / n).powi(2) + (c / n).powi(2)).sqrt().min(1.0))
}

/// Circular standard deviation in degrees, `sqrt(-2 ln R)`.
pub fn circular_std<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let r = resultant_length(values)?;
    Some(circular_std_from_resultant(r))
}

pub(crate) fn circular_std_from_resultant(r: f64) -> f64 {
    if r <= 0.0 {
        return f64::INFINITY;
    }
    (-2.0 * r.ln()).max(0.0).sqrt().to_degrees()
}

/// Per-row direction across `columns`: the median of the sine projections and
/// the median of the cosine projections, recombined with `atan2`. A median of
/// raw angles would break at the 0/360 seam.
pub fn circular_median_across_columns(columns: &[&[Option<f64>]]) -> Vec<Option<f64>> {
    let rows = columns.first().map_or(0, |c| c.len());
    let mut sines = Vec::with_capacity(columns.len());
    let mut cosines = Vec::with_capacity(columns.len());
    (0..rows)
        .map(|row| {
            sines.clear();
            cosines.clear();
            for column in columns {
                if let Some(v) = column.get(row).copied().flatten() {
                    let rad = v.to_radians();
                    sines.push(rad.sin());
                    cosines.push(rad.cos());
                }
            }
            let s = median(&mut sines)?;
            let c = median(&mut cosines)?;
            Some(wrap_to_unsigned_range(s.atan2(c).to_degrees()))
        })
        .collect()
}

/// Median of finite values; sorts in place.
pub(crate) fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some(0.5 * (values[mid - 1] + values[mid]))
    } else {
        Some(values[mid])
    }
}
