use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::NaiveDate;

use super::error::SeriesResult;
use super::series::{TimeSeries, read_price_csv};

pub const DEFAULT_EXPIRE_AFTER: Duration = Duration::from_secs(3 * 60 * 60);

/// Provider of daily price history for a ticker symbol.
pub trait PriceSource {
    fn history(&self, symbol: &str, start: NaiveDate) -> SeriesResult<TimeSeries>;
}

/// Reads `<dir>/<SYMBOL>.csv` price exports.
#[derive(Debug, Clone)]
pub struct CsvDirectorySource {
    dir: PathBuf,
    value_column: String,
}

impl CsvDirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            value_column: "Close".to_string(),
        }
    }

    pub fn with_value_column(mut self, column: impl Into<String>) -> Self {
        self.value_column = column.into();
        self
    }
}

impl PriceSource for CsvDirectorySource {
    fn history(&self, symbol: &str, start: NaiveDate) -> SeriesResult<TimeSeries> {
        let path = self.dir.join(format!("{symbol}.csv"));
        let file = File::open(path)?;
        Ok(read_price_csv(symbol, file, &self.value_column)?.since(start))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub expire_after: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expire_after: DEFAULT_EXPIRE_AFTER,
        }
    }
}

struct CacheEntry {
    fetched_at: Instant,
    series: TimeSeries,
}

/// Memoizes the full history of each symbol until it expires and trims it
/// to the requested start date on every read. The cache lives as long as
/// the handle the caller passes around.
pub struct CachedSource<S> {
    inner: S,
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl<S: PriceSource> CachedSource<S> {
    pub fn new(inner: S, config: CacheConfig) -> Self {
        Self {
            inner,
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.fetched_at) < self.config.expire_after
    }

    fn history_at(&self, symbol: &str, start: NaiveDate, now: Instant) -> SeriesResult<TimeSeries> {
        {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get(symbol) {
                if self.is_fresh(entry, now) {
                    return Ok(entry.series.since(start));
                }
            }
        }

        let series = self.inner.history(symbol, NaiveDate::MIN)?;
        let trimmed = series.since(start);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, entry| self.is_fresh(entry, now));
        entries.insert(
            symbol.to_string(),
            CacheEntry {
                fetched_at: now,
                series,
            },
        );
        Ok(trimmed)
    }
}

impl<S: PriceSource> PriceSource for CachedSource<S> {
    fn history(&self, symbol: &str, start: NaiveDate) -> SeriesResult<TimeSeries> {
        self.history_at(symbol, start, Instant::now())
    }
}
