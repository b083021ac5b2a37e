use serde::Serialize;
use tracing::debug;

use super::engine::{depletion_age, inflate, project_accumulation, project_decumulation};
use super::monte_carlo::estimate_survival_probability;
use super::types::{
    AccumulationParams, DecumulationParams, ExtraEvent, MonteCarloParams, ProjectionDataPoint,
};

/// Multiple of the first retirement year's net spending treated as "enough".
pub const FIRE_MULTIPLE: f64 = 25.0;

/// A full household plan. Rates are decimal fractions; money is in today's
/// currency unless noted.
#[derive(Debug, Clone)]
pub struct PlanInputs {
    pub current_age: u32,
    pub current_savings: f64,
    pub monthly_contribution: f64,
    pub years_to_retirement: u32,
    pub general_annual_expenses: f64,
    pub monthly_mortgage_payment: f64,
    pub remaining_mortgage_years: u32,
    pub pension_start_age: u32,
    /// Annual pension as first paid at `pension_start_age`.
    pub annual_pension_income: f64,
    pub gross_annual_return: f64,
    pub annual_inflation: f64,
    pub capital_gains_tax_rate: f64,
    pub pension_revaluation_rate: f64,
    pub sim_gross_mean_return: f64,
    pub sim_std_dev: f64,
    pub horizon_age: u32,
    pub simulations: u32,
    pub seed: Option<u64>,
    pub extra_incomes: Vec<ExtraEvent>,
    pub extra_expenses: Vec<ExtraEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanReport {
    pub retirement_age: u32,
    pub decumulation_years: u32,
    pub projected_value: f64,
    pub inflated_expenses: f64,
    pub fire_target: f64,
    pub success_probability: f64,
    pub depletion_age: Option<u32>,
    pub projection: Vec<ProjectionDataPoint>,
}

impl PlanInputs {
    pub fn retirement_age(&self) -> u32 {
        self.current_age + self.years_to_retirement
    }

    pub fn decumulation_years(&self) -> u32 {
        self.horizon_age.saturating_sub(self.retirement_age())
    }

    pub fn annual_mortgage(&self) -> f64 {
        self.monthly_mortgage_payment * 12.0
    }

    pub fn mortgage_end_age(&self) -> u32 {
        self.current_age + self.remaining_mortgage_years
    }

    pub fn net_annual_return(&self) -> f64 {
        self.gross_annual_return * (1.0 - self.capital_gains_tax_rate)
    }

    pub fn sim_net_mean_return(&self) -> f64 {
        self.sim_gross_mean_return * (1.0 - self.capital_gains_tax_rate)
    }

    /// General expenses carried to the retirement year.
    pub fn inflated_general_expenses(&self) -> f64 {
        inflate(
            self.general_annual_expenses,
            self.annual_inflation,
            self.years_to_retirement as i32,
        )
    }

    /// Spending need in the retirement year, mortgage included while it is
    /// still running.
    pub fn inflated_expenses(&self) -> f64 {
        let mortgage = if self.retirement_age() < self.mortgage_end_age() {
            self.annual_mortgage()
        } else {
            0.0
        };
        self.inflated_general_expenses() + mortgage
    }

    /// Pension already in payment at retirement, revalued since it started.
    pub fn pension_at_retirement(&self) -> f64 {
        let retirement_age = self.retirement_age();
        if self.pension_start_age > retirement_age {
            return 0.0;
        }
        inflate(
            self.annual_pension_income,
            self.pension_revaluation_rate,
            (retirement_age - self.pension_start_age) as i32,
        )
    }

    pub fn fire_target(&self) -> f64 {
        (self.inflated_expenses() - self.pension_at_retirement()).max(0.0) * FIRE_MULTIPLE
    }
}

pub fn run_plan(inputs: &PlanInputs) -> PlanReport {
    let retirement_age = inputs.retirement_age();
    let decumulation_years = inputs.decumulation_years();
    let annual_mortgage = inputs.annual_mortgage();
    let mortgage_end_age = inputs.mortgage_end_age();
    let net_return = inputs.net_annual_return();
    let initial_withdrawal = inputs.inflated_general_expenses();

    let accumulation = project_accumulation(&AccumulationParams {
        initial_value: inputs.current_savings,
        initial_monthly_contribution: inputs.monthly_contribution,
        annual_return: net_return,
        annual_inflation: inputs.annual_inflation,
        years: inputs.years_to_retirement,
        start_age: inputs.current_age,
        initial_general_expenses: inputs.general_annual_expenses,
        fixed_annual_mortgage: annual_mortgage,
        mortgage_end_age,
        extra_incomes: &inputs.extra_incomes,
        extra_expenses: &inputs.extra_expenses,
    });

    let decumulation = project_decumulation(&DecumulationParams {
        start_value: accumulation.final_value,
        initial_annual_general_withdrawal: initial_withdrawal,
        fixed_annual_mortgage: annual_mortgage,
        annual_return: net_return,
        annual_inflation: inputs.annual_inflation,
        duration: decumulation_years,
        retirement_age,
        mortgage_end_age,
        pension_at_start_age: inputs.annual_pension_income,
        pension_start_age: inputs.pension_start_age,
        pension_revaluation_rate: inputs.pension_revaluation_rate,
        extra_incomes: &inputs.extra_incomes,
        extra_expenses: &inputs.extra_expenses,
    });

    let success_probability = estimate_survival_probability(&MonteCarloParams {
        initial_portfolio: accumulation.final_value,
        retirement_duration_years: decumulation_years,
        mean_return: inputs.sim_net_mean_return(),
        std_dev: inputs.sim_std_dev,
        simulations: inputs.simulations,
        seed: inputs.seed,
        initial_annual_general_withdrawal: initial_withdrawal,
        fixed_annual_mortgage: annual_mortgage,
        retirement_age,
        mortgage_end_age,
        annual_inflation: inputs.annual_inflation,
        pension_at_start_age: inputs.annual_pension_income,
        pension_start_age: inputs.pension_start_age,
        pension_revaluation_rate: inputs.pension_revaluation_rate,
        extra_incomes: &inputs.extra_incomes,
        extra_expenses: &inputs.extra_expenses,
    });

    let depletion_age = depletion_age(&decumulation);
    debug!(
        retirement_age,
        projected_value = accumulation.final_value,
        success_probability,
        ?depletion_age,
        "plan evaluated"
    );

    let mut projection = accumulation.yearly_points;
    projection.extend(decumulation);

    PlanReport {
        retirement_age,
        decumulation_years,
        projected_value: accumulation.final_value,
        inflated_expenses: inputs.inflated_expenses(),
        fire_target: inputs.fire_target(),
        success_probability,
        depletion_age,
        projection,
    }
}
