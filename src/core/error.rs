use thiserror::Error;

pub type RsfResult<T> = Result<T, RsfError>;

/// Failures of the return-sequence and saving-factor computations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RsfError {
    /// Rejected before any computation starts.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The cumulative growth product collapsed to zero; `year` is the first
    /// retirement year with a growth factor of exactly zero.
    #[error("Division by zero: growth factor is zero in retirement year {year}")]
    DivisionByZero { year: usize },

    #[error("Undefined result: {reason}")]
    UndefinedResult { reason: String },
}

impl RsfError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        RsfError::InvalidArgument {
            reason: reason.into(),
        }
    }
}
