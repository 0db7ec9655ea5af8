mod engine;
mod error;
mod returns;
mod types;

pub use engine::{
    compute_inflation_factor, compute_rsf, compute_rsf_with_timing, run_horizon_sweep, run_plan,
};
pub use error::{RsfError, RsfResult};
pub use returns::{
    bond_weight, bond_weight_by_age, generate_constant, generate_glide_path,
    generate_glide_path_by_age,
};
pub use types::{PlanInputs, PlanResult, ReturnPolicy, ReturnSequence, WithdrawalTiming};
