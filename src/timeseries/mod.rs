//! Growth and rolling-correlation analysis of two price histories.
//!
//! Independent of the saving-factor model: everything here works on ordered,
//! date-indexed numeric series obtained through a [`PriceSource`].

mod error;
mod rolling;
mod series;
mod source;

use chrono::NaiveDate;
use serde::Serialize;

pub use error::{SeriesError, SeriesResult};
pub use rolling::{
    DEFAULT_AVERAGING_WINDOW, DEFAULT_CORRELATION_WINDOW, rolling_correlation, rolling_mean,
    split_by_sign,
};
pub use series::{AlignedPair, Observation, TimeSeries, align, normalized_growth, read_price_csv};
pub use source::{CacheConfig, CachedSource, CsvDirectorySource, DEFAULT_EXPIRE_AFTER, PriceSource};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationRow {
    pub date: NaiveDate,
    pub growth_left: f64,
    pub growth_right: f64,
    pub correlation: Option<f64>,
    pub correlation_avg: Option<f64>,
    /// `correlation_avg` where it is non-negative.
    pub correlation_avg_pos: Option<f64>,
    /// `correlation_avg` where it is negative.
    pub correlation_avg_neg: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationReport {
    pub left_symbol: String,
    pub right_symbol: String,
    pub rows: Vec<CorrelationRow>,
}

impl CorrelationReport {
    /// Writes `date,growth_<left>,growth_<right>,correlation,correlation_avg`
    /// followed by the sign-split average, with empty cells where a window
    /// was incomplete.
    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> SeriesResult<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record([
            "date".to_string(),
            format!("growth_{}", self.left_symbol),
            format!("growth_{}", self.right_symbol),
            "correlation".to_string(),
            "correlation_avg".to_string(),
            "correlation_avg_pos".to_string(),
            "correlation_avg_neg".to_string(),
        ])?;
        let cell = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
        for row in &self.rows {
            wtr.write_record([
                row.date.format("%Y-%m-%d").to_string(),
                row.growth_left.to_string(),
                row.growth_right.to_string(),
                cell(row.correlation),
                cell(row.correlation_avg),
                cell(row.correlation_avg_pos),
                cell(row.correlation_avg_neg),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Fetches both symbols from `start`, normalizes them to growth since their
/// first common date, and correlates them over `window` observations. The
/// correlation is then smoothed over `averaging_window` and split by sign.
pub fn correlate_symbols<S: PriceSource>(
    source: &S,
    left_symbol: &str,
    right_symbol: &str,
    start: NaiveDate,
    window: usize,
    averaging_window: usize,
) -> SeriesResult<CorrelationReport> {
    let left = source.history(left_symbol, start)?;
    let right = source.history(right_symbol, start)?;
    let aligned = align(&left, &right);

    let left_growth = growth_from_first(left_symbol, &aligned.dates, &aligned.left)?;
    let right_growth = growth_from_first(right_symbol, &aligned.dates, &aligned.right)?;
    let correlation = rolling_correlation(&left_growth, &right_growth, window)?;
    let correlation_avg = rolling_mean(&correlation, averaging_window)?;
    let (avg_pos, avg_neg) = split_by_sign(&correlation_avg);

    let rows = aligned
        .dates
        .iter()
        .enumerate()
        .map(|(idx, date)| CorrelationRow {
            date: *date,
            growth_left: left_growth[idx],
            growth_right: right_growth[idx],
            correlation: correlation[idx],
            correlation_avg: correlation_avg[idx],
            correlation_avg_pos: avg_pos[idx],
            correlation_avg_neg: avg_neg[idx],
        })
        .collect();

    Ok(CorrelationReport {
        left_symbol: left_symbol.to_string(),
        right_symbol: right_symbol.to_string(),
        rows,
    })
}

fn growth_from_first(name: &str, dates: &[NaiveDate], values: &[f64]) -> SeriesResult<Vec<f64>> {
    let series = TimeSeries::new(
        name,
        dates
            .iter()
            .zip(values)
            .map(|(&date, &value)| Observation { date, value })
            .collect(),
    )?;
    Ok(normalized_growth(&series)?
        .observations()
        .iter()
        .map(|obs| obs.value)
        .collect())
}
