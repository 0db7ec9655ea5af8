use super::error::{RsfError, RsfResult};
use super::types::{ReturnPolicy, ReturnSequence};

impl ReturnPolicy {
    pub fn generate(&self, years: u32) -> RsfResult<ReturnSequence> {
        match *self {
            ReturnPolicy::Constant { rate } => generate_constant(rate, years),
            ReturnPolicy::GlidePathByIncrement {
                initial_bond_percentage,
                bond_aar,
                stock_aar,
            } => generate_glide_path(initial_bond_percentage, years, bond_aar, stock_aar),
            ReturnPolicy::GlidePathByAge {
                start_age,
                full_bond_age,
                bond_aar,
                stock_aar,
            } => generate_glide_path_by_age(start_age, years, full_bond_age, bond_aar, stock_aar),
        }
    }
}

pub fn generate_constant(rate: f64, years: u32) -> RsfResult<ReturnSequence> {
    ensure_finite("rate", rate)?;
    Ok(ReturnSequence::new(vec![rate; years as usize]))
}

/// Bond weight in `[0, 1]` for retirement year `year`. Percentages outside
/// `[0, 100]` are accepted and clamped per year.
pub fn bond_weight(initial_bond_percentage: f64, year: u32) -> f64 {
    (initial_bond_percentage + year as f64).clamp(0.0, 100.0) / 100.0
}

/// Blends bond and stock returns along the increment glide path. The result
/// holds net rates: weighting the gross factors `1 + aar` and subtracting one
/// gives the same value since the two weights sum to one.
pub fn generate_glide_path(
    initial_bond_percentage: f64,
    years: u32,
    bond_aar: f64,
    stock_aar: f64,
) -> RsfResult<ReturnSequence> {
    ensure_finite("initial bond percentage", initial_bond_percentage)?;
    ensure_finite("bond AAR", bond_aar)?;
    ensure_finite("stock AAR", stock_aar)?;

    let rates = (0..years)
        .map(|year| blend(bond_weight(initial_bond_percentage, year), bond_aar, stock_aar))
        .collect();
    Ok(ReturnSequence::new(rates))
}

pub fn bond_weight_by_age(start_age: u32, full_bond_age: f64, year: u32) -> f64 {
    let age = start_age as f64 + year as f64;
    let stock_percentage = (full_bond_age - age).clamp(0.0, 100.0);
    1.0 - stock_percentage / 100.0
}

pub fn generate_glide_path_by_age(
    start_age: u32,
    years: u32,
    full_bond_age: f64,
    bond_aar: f64,
    stock_aar: f64,
) -> RsfResult<ReturnSequence> {
    ensure_finite("full bond age", full_bond_age)?;
    ensure_finite("bond AAR", bond_aar)?;
    ensure_finite("stock AAR", stock_aar)?;

    let rates = (0..years)
        .map(|year| {
            blend(
                bond_weight_by_age(start_age, full_bond_age, year),
                bond_aar,
                stock_aar,
            )
        })
        .collect();
    Ok(ReturnSequence::new(rates))
}

fn blend(bond_weight: f64, bond_aar: f64, stock_aar: f64) -> f64 {
    bond_weight * bond_aar + (1.0 - bond_weight) * stock_aar
}

fn ensure_finite(name: &str, value: f64) -> RsfResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(RsfError::invalid(format!("{name} must be finite, got {value}")))
    }
}
