use tracing::debug;

use super::types::{
    AccumulationParams, AccumulationResult, DecumulationParams, ExtraEvent, MonteCarloParams,
    ProjectionDataPoint,
};

pub(crate) const MONTHS_PER_YEAR: u32 = 12;

/// Compounds `base_value` forward by `annual_rate` over `years` whole years.
pub fn inflate(base_value: f64, annual_rate: f64, years: i32) -> f64 {
    base_value * (1.0 + annual_rate).powi(years)
}

/// Net one-time cash landing at `age`: matching incomes minus matching
/// expenses. Events with a non-positive amount are ignored.
pub fn net_cash_flow(incomes: &[ExtraEvent], expenses: &[ExtraEvent], age: u32) -> f64 {
    sum_at_age(incomes, age) - sum_at_age(expenses, age)
}

fn sum_at_age(events: &[ExtraEvent], age: u32) -> f64 {
    events
        .iter()
        .filter(|event| event.age == age && event.amount > 0.0)
        .map(|event| event.amount)
        .sum()
}

pub fn project_accumulation(params: &AccumulationParams<'_>) -> AccumulationResult {
    let monthly_rate = params.annual_return / MONTHS_PER_YEAR as f64;
    let mut portfolio = params.initial_value;
    let mut monthly_contribution = params.initial_monthly_contribution;
    let mut general_expenses = params.initial_general_expenses;

    // The starting point reports the inputs as given: unrounded, mortgage included.
    let mut yearly_points = Vec::with_capacity(params.years as usize + 1);
    yearly_points.push(ProjectionDataPoint {
        age: params.start_age,
        value: portfolio,
        general_expenses,
        total_expenses: general_expenses + params.fixed_annual_mortgage,
        pension_income: None,
    });

    for year in 1..=params.years {
        let age = params.start_age + year;

        portfolio += net_cash_flow(params.extra_incomes, params.extra_expenses, age);

        general_expenses = inflate(general_expenses, params.annual_inflation, 1);
        let total_expenses = general_expenses
            + mortgage_payment(params.fixed_annual_mortgage, params.mortgage_end_age, age);

        for _ in 0..MONTHS_PER_YEAR {
            portfolio = portfolio * (1.0 + monthly_rate) + monthly_contribution;
        }

        monthly_contribution = inflate(monthly_contribution, params.annual_inflation, 1);

        yearly_points.push(ProjectionDataPoint {
            age,
            value: round_currency(portfolio),
            general_expenses: round_currency(general_expenses),
            total_expenses: round_currency(total_expenses),
            pension_income: None,
        });
    }

    AccumulationResult {
        final_value: portfolio,
        yearly_points,
    }
}

/// Projects the withdrawal phase year by year. The trajectory ends with the
/// first year whose closing value is zero.
pub fn project_decumulation(params: &DecumulationParams<'_>) -> Vec<ProjectionDataPoint> {
    let terms = RetirementTerms::from(params);
    let monthly_rate = params.annual_return / MONTHS_PER_YEAR as f64;
    let mut portfolio = params.start_value;
    let mut schedule = WithdrawalSchedule::new(
        params.initial_annual_general_withdrawal,
        params.pension_at_start_age,
    );
    let mut points = Vec::with_capacity(params.duration as usize);

    for year in 1..=params.duration {
        let age = params.retirement_age + year;
        let need = schedule.need_at(age, &terms);

        withdraw_for_year(&mut portfolio, monthly_rate, need.monthly_net_withdrawal);

        // Lump sums arrive after the year's withdrawals, even on a depleted pot.
        portfolio += net_cash_flow(params.extra_incomes, params.extra_expenses, age);
        if portfolio < 0.0 {
            portfolio = 0.0;
        }

        schedule.advance(age, &terms);

        points.push(ProjectionDataPoint {
            age,
            value: round_currency(portfolio),
            general_expenses: round_currency(need.general_expenses),
            total_expenses: round_currency(need.total_expenses),
            pension_income: Some(round_currency(need.pension_contribution)),
        });

        if portfolio == 0.0 {
            debug!(age, "portfolio depleted");
            break;
        }
    }

    points
}

/// Age of the first recorded point whose value is zero.
pub fn depletion_age(points: &[ProjectionDataPoint]) -> Option<u32> {
    points
        .iter()
        .find(|point| point.value == 0.0)
        .map(|point| point.age)
}

fn round_currency(value: f64) -> f64 {
    value.round()
}

fn mortgage_payment(fixed_annual_mortgage: f64, mortgage_end_age: u32, age: u32) -> f64 {
    if age <= mortgage_end_age {
        fixed_annual_mortgage
    } else {
        0.0
    }
}

/// Inputs that shape each retirement year's cash need, shared by the
/// deterministic projector and the Monte Carlo trials.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetirementTerms {
    fixed_annual_mortgage: f64,
    mortgage_end_age: u32,
    annual_inflation: f64,
    pension_start_age: u32,
    pension_revaluation_rate: f64,
}

impl From<&DecumulationParams<'_>> for RetirementTerms {
    fn from(params: &DecumulationParams<'_>) -> Self {
        Self {
            fixed_annual_mortgage: params.fixed_annual_mortgage,
            mortgage_end_age: params.mortgage_end_age,
            annual_inflation: params.annual_inflation,
            pension_start_age: params.pension_start_age,
            pension_revaluation_rate: params.pension_revaluation_rate,
        }
    }
}

impl From<&MonteCarloParams<'_>> for RetirementTerms {
    fn from(params: &MonteCarloParams<'_>) -> Self {
        Self {
            fixed_annual_mortgage: params.fixed_annual_mortgage,
            mortgage_end_age: params.mortgage_end_age,
            annual_inflation: params.annual_inflation,
            pension_start_age: params.pension_start_age,
            pension_revaluation_rate: params.pension_revaluation_rate,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct YearNeed {
    pub(crate) general_expenses: f64,
    pub(crate) total_expenses: f64,
    pub(crate) pension_contribution: f64,
    pub(crate) monthly_net_withdrawal: f64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct WithdrawalSchedule {
    general_withdrawal: f64,
    pension: f64,
}

impl WithdrawalSchedule {
    pub(crate) fn new(initial_general_withdrawal: f64, pension_at_start_age: f64) -> Self {
        Self {
            general_withdrawal: initial_general_withdrawal,
            pension: pension_at_start_age,
        }
    }

    pub(crate) fn need_at(&self, age: u32, terms: &RetirementTerms) -> YearNeed {
        let total_expenses = self.general_withdrawal
            + mortgage_payment(terms.fixed_annual_mortgage, terms.mortgage_end_age, age);
        let pension_contribution = if age >= terms.pension_start_age {
            self.pension
        } else {
            0.0
        };
        let annual_net_withdrawal = (total_expenses - pension_contribution).max(0.0);

        YearNeed {
            general_expenses: self.general_withdrawal,
            total_expenses,
            pension_contribution,
            monthly_net_withdrawal: annual_net_withdrawal / MONTHS_PER_YEAR as f64,
        }
    }

    /// Rolls the schedule into the next year. The pension only revalues once
    /// it is being paid.
    pub(crate) fn advance(&mut self, age: u32, terms: &RetirementTerms) {
        self.general_withdrawal = inflate(self.general_withdrawal, terms.annual_inflation, 1);
        if age >= terms.pension_start_age {
            self.pension = inflate(self.pension, terms.pension_revaluation_rate, 1);
        }
    }
}

/// Runs twelve months of growth followed by withdrawal. Returns `true` when the
/// portfolio hit zero, in which case it is clamped and the remaining months are
/// skipped.
pub(crate) fn withdraw_for_year(
    portfolio: &mut f64,
    monthly_rate: f64,
    monthly_withdrawal: f64,
) -> bool {
    for _ in 0..MONTHS_PER_YEAR {
        *portfolio *= 1.0 + monthly_rate;
        *portfolio -= monthly_withdrawal;
        if *portfolio <= 0.0 {
            *portfolio = 0.0;
            return true;
        }
    }
    false
}
