mod engine;
mod monte_carlo;
mod plan;
mod types;

pub use engine::{depletion_age, inflate, net_cash_flow, project_accumulation, project_decumulation};
pub use monte_carlo::{
    BoxMullerSampler, ReturnSampler, estimate_survival_probability,
    estimate_survival_probability_with, simulate_trial,
};
pub use plan::{FIRE_MULTIPLE, PlanInputs, PlanReport, run_plan};
pub use types::{
    AccumulationParams, AccumulationResult, DecumulationParams, ExtraEvent, MonteCarloParams,
    ProjectionDataPoint,
};
