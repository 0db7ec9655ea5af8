use std::io::Read;

use chrono::NaiveDate;

use super::error::{SeriesError, SeriesResult};

const DATE_COLUMN: &str = "Date";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub date: NaiveDate,
    pub value: f64,
}

/// Named series of observations with strictly ascending dates.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    name: String,
    observations: Vec<Observation>,
}

impl TimeSeries {
    pub fn new(name: impl Into<String>, observations: Vec<Observation>) -> SeriesResult<Self> {
        let name = name.into();
        for pair in observations.windows(2) {
            if pair[1].date <= pair[0].date {
                return Err(SeriesError::OutOfOrder {
                    name,
                    date: pair[1].date,
                });
            }
        }
        Ok(Self { name, observations })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn since(&self, start: NaiveDate) -> Self {
        Self {
            name: self.name.clone(),
            observations: self
                .observations
                .iter()
                .copied()
                .filter(|obs| obs.date >= start)
                .collect(),
        }
    }
}

/// Reads a `Date,...` price history and keeps `value_column`. Rows whose
/// value is empty or `null` are skipped as missing quotes.
pub fn read_price_csv<R: Read>(
    name: &str,
    reader: R,
    value_column: &str,
) -> SeriesResult<TimeSeries> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr.headers()?.clone();
    let column_index = |column: &str| {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(column))
            .ok_or_else(|| SeriesError::MissingColumn {
                column: column.to_string(),
            })
    };
    let date_idx = column_index(DATE_COLUMN)?;
    let value_idx = column_index(value_column)?;

    let mut observations = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let raw_date = record.get(date_idx).unwrap_or_default().trim();
        let date = NaiveDate::parse_from_str(raw_date, DATE_FORMAT).map_err(|source| {
            SeriesError::Date {
                value: raw_date.to_string(),
                source,
            }
        })?;

        let raw_value = record.get(value_idx).unwrap_or_default().trim();
        if raw_value.is_empty() || raw_value.eq_ignore_ascii_case("null") {
            continue;
        }
        let value = raw_value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| SeriesError::InvalidValue {
                date,
                value: raw_value.to_string(),
            })?;
        observations.push(Observation { date, value });
    }

    TimeSeries::new(name, observations)
}

/// Growth relative to the first observation: `value / first - 1`.
pub fn normalized_growth(series: &TimeSeries) -> SeriesResult<TimeSeries> {
    let Some(first) = series.observations.first() else {
        return Err(SeriesError::Empty {
            name: series.name.clone(),
        });
    };
    if first.value == 0.0 {
        return Err(SeriesError::ZeroBase {
            name: series.name.clone(),
        });
    }

    let base = first.value;
    Ok(TimeSeries {
        name: series.name.clone(),
        observations: series
            .observations
            .iter()
            .map(|obs| Observation {
                date: obs.date,
                value: obs.value / base - 1.0,
            })
            .collect(),
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignedPair {
    pub dates: Vec<NaiveDate>,
    pub left: Vec<f64>,
    pub right: Vec<f64>,
}

/// Keeps only the dates present in both series.
pub fn align(left: &TimeSeries, right: &TimeSeries) -> AlignedPair {
    let mut aligned = AlignedPair::default();
    let (mut i, mut j) = (0, 0);
    let (l, r) = (&left.observations, &right.observations);

    while i < l.len() && j < r.len() {
        match l[i].date.cmp(&r[j].date) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                aligned.dates.push(l[i].date);
                aligned.left.push(l[i].value);
                aligned.right.push(r[j].value);
                i += 1;
                j += 1;
            }
        }
    }
    aligned
}
