use super::error::{SeriesError, SeriesResult};

pub const DEFAULT_CORRELATION_WINDOW: usize = 20;
pub const DEFAULT_AVERAGING_WINDOW: usize = 50;

/// Bounds of the centred window labelled `index`, or `None` when the window
/// does not fit in `len` positions. Even windows lean towards the past.
fn centred_bounds(index: usize, window: usize, len: usize) -> Option<(usize, usize)> {
    let end = index + (window - 1) / 2;
    if end >= len || end + 1 < window {
        return None;
    }
    Some((end + 1 - window, end))
}

/// Pearson correlation over a centred rolling window. Positions whose window
/// is incomplete, or where either side has zero variance, are `None`.
pub fn rolling_correlation(
    left: &[f64],
    right: &[f64],
    window: usize,
) -> SeriesResult<Vec<Option<f64>>> {
    if left.len() != right.len() {
        return Err(SeriesError::LengthMismatch {
            left: left.len(),
            right: right.len(),
        });
    }
    if window < 2 {
        return Err(SeriesError::InvalidWindow { window, min: 2 });
    }

    Ok((0..left.len())
        .map(|idx| {
            centred_bounds(idx, window, left.len())
                .and_then(|(start, end)| pearson(&left[start..=end], &right[start..=end]))
        })
        .collect())
}

/// Centred rolling mean; any missing value inside the window yields `None`.
pub fn rolling_mean(values: &[Option<f64>], window: usize) -> SeriesResult<Vec<Option<f64>>> {
    if window < 1 {
        return Err(SeriesError::InvalidWindow { window, min: 1 });
    }

    Ok((0..values.len())
        .map(|idx| {
            let (start, end) = centred_bounds(idx, window, values.len())?;
            let mut sum = 0.0;
            for value in &values[start..=end] {
                sum += (*value)?;
            }
            Some(sum / window as f64)
        })
        .collect())
}

/// Splits a signed series into its non-negative and negative parts so each
/// can be drawn in its own colour.
pub fn split_by_sign(values: &[Option<f64>]) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    values
        .iter()
        .map(|value| match *value {
            Some(v) if v >= 0.0 => (Some(v), None),
            Some(v) => (None, Some(v)),
            None => (None, None),
        })
        .unzip()
}

fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (a, b) in x.iter().zip(y) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x <= 1e-300 || var_y <= 1e-300 {
        return None;
    }
    Some((cov / (var_x * var_y).sqrt()).clamp(-1.0, 1.0))
}
