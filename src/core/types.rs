use serde::{Deserialize, Serialize};

/// One-time, non-inflated cash flow that lands in the single year whose age
/// equals `age`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraEvent {
    pub id: u32,
    pub amount: f64,
    pub age: u32,
    #[serde(default)]
    pub description: String,
}

impl ExtraEvent {
    pub fn new(id: u32, amount: f64, age: u32, description: impl Into<String>) -> Self {
        Self {
            id,
            amount,
            age,
            description: description.into(),
        }
    }
}

/// End-of-year snapshot of a projected trajectory. Currency fields are rounded
/// to whole units.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionDataPoint {
    pub age: u32,
    pub value: f64,
    pub general_expenses: f64,
    pub total_expenses: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pension_income: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct AccumulationParams<'a> {
    pub initial_value: f64,
    pub initial_monthly_contribution: f64,
    pub annual_return: f64,
    pub annual_inflation: f64,
    pub years: u32,
    pub start_age: u32,
    pub initial_general_expenses: f64,
    pub fixed_annual_mortgage: f64,
    pub mortgage_end_age: u32,
    pub extra_incomes: &'a [ExtraEvent],
    pub extra_expenses: &'a [ExtraEvent],
}

#[derive(Debug, Clone)]
pub struct AccumulationResult {
    /// Unrounded portfolio value after the last simulated year.
    pub final_value: f64,
    pub yearly_points: Vec<ProjectionDataPoint>,
}

#[derive(Debug, Clone, Copy)]
pub struct DecumulationParams<'a> {
    pub start_value: f64,
    pub initial_annual_general_withdrawal: f64,
    pub fixed_annual_mortgage: f64,
    pub annual_return: f64,
    pub annual_inflation: f64,
    pub duration: u32,
    pub retirement_age: u32,
    pub mortgage_end_age: u32,
    /// Annual pension at `pension_start_age`, before any revaluation.
    pub pension_at_start_age: f64,
    pub pension_start_age: u32,
    pub pension_revaluation_rate: f64,
    pub extra_incomes: &'a [ExtraEvent],
    pub extra_expenses: &'a [ExtraEvent],
}

#[derive(Debug, Clone, Copy)]
pub struct MonteCarloParams<'a> {
    pub initial_portfolio: f64,
    pub retirement_duration_years: u32,
    pub mean_return: f64,
    pub std_dev: f64,
    pub simulations: u32,
    pub seed: Option<u64>,
    pub initial_annual_general_withdrawal: f64,
    pub fixed_annual_mortgage: f64,
    pub retirement_age: u32,
    pub mortgage_end_age: u32,
    pub annual_inflation: f64,
    pub pension_at_start_age: f64,
    pub pension_start_age: u32,
    pub pension_revaluation_rate: f64,
    pub extra_incomes: &'a [ExtraEvent],
    pub extra_expenses: &'a [ExtraEvent],
}
