use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SeriesError {
    #[error("CSV processing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid date '{value}': {source}")]
    Date {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("Missing column '{column}' in price history")]
    MissingColumn { column: String },

    #[error("Invalid value '{value}' on {date}")]
    InvalidValue { date: NaiveDate, value: String },

    #[error("Observations of '{name}' are not strictly ascending at {date}")]
    OutOfOrder { name: String, date: NaiveDate },

    #[error("Series '{name}' has no observations")]
    Empty { name: String },

    #[error("Series '{name}' starts at zero; growth is undefined")]
    ZeroBase { name: String },

    #[error("Series lengths differ: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },

    #[error("Rolling window must be at least {min}, got {window}")]
    InvalidWindow { window: usize, min: usize },
}

pub type SeriesResult<T> = Result<T, SeriesError>;
