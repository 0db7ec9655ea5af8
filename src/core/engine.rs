use super::error::{RsfError, RsfResult};
use super::types::{PlanInputs, PlanResult, ReturnSequence, WithdrawalTiming};

/// Savings multiplier for a first-year income, drawn at the start of each
/// retirement year and escalating with `inflation`.
pub fn compute_rsf(returns: &ReturnSequence, inflation: f64) -> RsfResult<f64> {
    compute_rsf_with_timing(returns, inflation, WithdrawalTiming::StartOfYear)
}

/// `RSF = S / P` where `P` is the product of all growth factors and `S`
/// sums, for every year, the inflated income times the growth still ahead
/// of it. Suffix products are accumulated right to left in one pass.
pub fn compute_rsf_with_timing(
    returns: &ReturnSequence,
    inflation: f64,
    timing: WithdrawalTiming,
) -> RsfResult<f64> {
    if !inflation.is_finite() {
        return Err(RsfError::invalid(format!(
            "inflation rate must be finite, got {inflation}"
        )));
    }
    if let Some(year) = returns.rates().iter().position(|r| !r.is_finite()) {
        return Err(RsfError::invalid(format!(
            "annual return for retirement year {year} must be finite"
        )));
    }

    let inflation_factor = 1.0 + inflation;
    let mut suffix_product = 1.0;
    let mut inflated_sum = 0.0;

    for (year, growth) in returns.growth_factors().enumerate().rev() {
        match timing {
            WithdrawalTiming::StartOfYear => {
                suffix_product *= growth;
                inflated_sum += suffix_product * inflation_factor.powf(year as f64);
            }
            WithdrawalTiming::EndOfYear => {
                inflated_sum += suffix_product * inflation_factor.powf(year as f64 + 1.0);
                suffix_product *= growth;
            }
        }
    }

    let terminal_product = suffix_product;
    if terminal_product == 0.0 {
        return match returns.growth_factors().position(|g| g == 0.0) {
            Some(year) => Err(RsfError::DivisionByZero { year }),
            None => Err(RsfError::UndefinedResult {
                reason: "cumulative growth underflowed to zero".to_string(),
            }),
        };
    }

    let rsf = inflated_sum / terminal_product;
    if !rsf.is_finite() {
        return Err(RsfError::UndefinedResult {
            reason: format!("saving factor is not finite ({rsf})"),
        });
    }
    Ok(rsf)
}

/// Compound inflation after `num_years`; fractional years are allowed.
pub fn compute_inflation_factor(inflation_rate: f64, num_years: f64) -> f64 {
    (1.0 + inflation_rate).powf(num_years)
}

pub fn run_plan(inputs: &PlanInputs) -> RsfResult<PlanResult> {
    validate_plan_inputs(inputs)?;

    let inflation_factor =
        compute_inflation_factor(inputs.inflation_rate, inputs.years_before_retirement);
    let inflated_yearly_income = inputs.yearly_income * inflation_factor;
    let annual_returns = inputs.policy.generate(inputs.retirement_years)?;
    let rsf = compute_rsf_with_timing(&annual_returns, inputs.inflation_rate, inputs.timing)?;

    Ok(PlanResult {
        retirement_years: inputs.retirement_years,
        retirement_saving_factor: rsf,
        inflation_factor,
        inflated_yearly_income,
        required_savings: inflated_yearly_income * rsf,
        annual_returns,
    })
}

/// Evaluates the plan for every retirement horizon from one year up to
/// `max_years`.
pub fn run_horizon_sweep(inputs: &PlanInputs, max_years: u32) -> RsfResult<Vec<PlanResult>> {
    let mut results = Vec::with_capacity(max_years as usize);
    for retirement_years in 1..=max_years {
        let candidate = PlanInputs {
            retirement_years,
            ..inputs.clone()
        };
        results.push(run_plan(&candidate)?);
    }
    Ok(results)
}

fn validate_plan_inputs(inputs: &PlanInputs) -> RsfResult<()> {
    if !inputs.years_before_retirement.is_finite() || inputs.years_before_retirement < 0.0 {
        return Err(RsfError::invalid(
            "years before retirement must be a non-negative number",
        ));
    }
    if !inputs.yearly_income.is_finite() {
        return Err(RsfError::invalid("yearly income must be finite"));
    }
    Ok(())
}
