use serde::Serialize;

/// Net annual growth rates, one per retirement year, first year at index 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ReturnSequence(Vec<f64>);

impl ReturnSequence {
    pub fn new(rates: Vec<f64>) -> Self {
        Self(rates)
    }

    pub fn rates(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Gross growth factors `1 + r` in year order.
    pub fn growth_factors(
        &self,
    ) -> impl DoubleEndedIterator<Item = f64> + ExactSizeIterator + '_ {
        self.0.iter().map(|rate| 1.0 + rate)
    }
}

impl From<Vec<f64>> for ReturnSequence {
    fn from(rates: Vec<f64>) -> Self {
        Self(rates)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ReturnPolicy {
    Constant {
        rate: f64,
    },
    /// Bond share starts at `initial_bond_percentage` and gains one
    /// percentage point per retirement year, saturating at 100.
    GlidePathByIncrement {
        initial_bond_percentage: f64,
        bond_aar: f64,
        stock_aar: f64,
    },
    /// Legacy parameterization: the stock share is `full_bond_age - age`
    /// percent, so the portfolio is all bonds from `full_bond_age` onwards.
    GlidePathByAge {
        start_age: u32,
        full_bond_age: f64,
        bond_aar: f64,
        stock_aar: f64,
    },
}

/// When each year's income is drawn relative to that year's growth.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum WithdrawalTiming {
    #[default]
    StartOfYear,
    EndOfYear,
}

#[derive(Debug, Clone)]
pub struct PlanInputs {
    pub policy: ReturnPolicy,
    pub inflation_rate: f64,
    pub retirement_years: u32,
    pub years_before_retirement: f64,
    pub yearly_income: f64,
    pub timing: WithdrawalTiming,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResult {
    pub retirement_years: u32,
    pub retirement_saving_factor: f64,
    pub inflation_factor: f64,
    pub inflated_yearly_income: f64,
    pub required_savings: f64,
    pub annual_returns: ReturnSequence,
}
