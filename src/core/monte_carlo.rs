use std::f64::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use tracing::debug;

use super::engine::{
    MONTHS_PER_YEAR, RetirementTerms, WithdrawalSchedule, net_cash_flow, withdraw_for_year,
};
use super::types::MonteCarloParams;

/// Source of normally distributed annual returns.
pub trait ReturnSampler {
    fn sample_normal(&mut self, mean: f64, std_dev: f64) -> f64;
}

/// Box-Muller transform over a uniform generator.
#[derive(Debug, Clone)]
pub struct BoxMullerSampler<R> {
    rng: R,
}

impl<R: Rng> BoxMullerSampler<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    fn nonzero_uniform(&mut self) -> f64 {
        loop {
            let u: f64 = self.rng.random();
            if u != 0.0 {
                return u;
            }
        }
    }
}

impl<R: Rng> ReturnSampler for BoxMullerSampler<R> {
    fn sample_normal(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u = self.nonzero_uniform();
        let v = self.nonzero_uniform();
        let z = (-2.0 * u.ln()).sqrt() * (2.0 * PI * v).cos();
        mean + z * std_dev
    }
}

/// Fraction of trials whose portfolio lasts the whole horizon. Trials run in
/// parallel, each with its own generator derived from `params.seed`, so a fixed
/// seed gives the same answer regardless of thread count.
pub fn estimate_survival_probability(params: &MonteCarloParams<'_>) -> f64 {
    if params.simulations == 0 {
        return 0.0;
    }

    let base_seed = params.seed.unwrap_or_else(rand::random::<u64>);
    let successes = (0..params.simulations)
        .into_par_iter()
        .filter(|&trial| {
            let rng = StdRng::seed_from_u64(derive_seed(base_seed, trial));
            simulate_trial(params, &mut BoxMullerSampler::new(rng))
        })
        .count();

    let probability = successes as f64 / params.simulations as f64;
    debug!(
        simulations = params.simulations,
        successes, probability, "monte carlo run complete"
    );
    probability
}

/// Sequential variant drawing every trial's returns from one sampler.
pub fn estimate_survival_probability_with<S: ReturnSampler + ?Sized>(
    params: &MonteCarloParams<'_>,
    sampler: &mut S,
) -> f64 {
    if params.simulations == 0 {
        return 0.0;
    }

    let successes = (0..params.simulations)
        .filter(|_| simulate_trial(params, &mut *sampler))
        .count();
    successes as f64 / params.simulations as f64
}

/// Runs one retirement path with a freshly drawn return each year. Returns
/// `false` as soon as the portfolio reaches zero.
///
/// Extra incomes and expenses land after the year's twelve monthly
/// withdrawals, in the same order as [`project_decumulation`]. An income due
/// in a year that already ran dry does not rescue the trial.
///
/// [`project_decumulation`]: super::engine::project_decumulation
pub fn simulate_trial<S: ReturnSampler + ?Sized>(
    params: &MonteCarloParams<'_>,
    sampler: &mut S,
) -> bool {
    let terms = RetirementTerms::from(params);
    let mut portfolio = params.initial_portfolio;
    let mut schedule = WithdrawalSchedule::new(
        params.initial_annual_general_withdrawal,
        params.pension_at_start_age,
    );

    for year in 1..=params.retirement_duration_years {
        let age = params.retirement_age + year;
        let annual_return = sampler.sample_normal(params.mean_return, params.std_dev);
        let need = schedule.need_at(age, &terms);

        if withdraw_for_year(
            &mut portfolio,
            annual_return / MONTHS_PER_YEAR as f64,
            need.monthly_net_withdrawal,
        ) {
            return false;
        }

        portfolio += net_cash_flow(params.extra_incomes, params.extra_expenses, age);
        if portfolio <= 0.0 {
            return false;
        }

        schedule.advance(age, &terms);
    }

    true
}

fn derive_seed(base_seed: u64, trial: u32) -> u64 {
    splitmix64(base_seed ^ ((trial as u64) << 17) ^ trial as u64)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::{depletion_age, project_decumulation};
    use crate::core::types::{DecumulationParams, ExtraEvent};
    use proptest::prelude::{any, prop_assert, prop_assert_eq, prop_assume, proptest};
    use std::collections::VecDeque;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    /// Hands out a fixed list of annual returns, ignoring the distribution.
    struct ScriptedReturns {
        returns: VecDeque<f64>,
    }

    impl ScriptedReturns {
        fn new(returns: &[f64]) -> Self {
            Self {
                returns: returns.iter().copied().collect(),
            }
        }
    }

    impl ReturnSampler for ScriptedReturns {
        fn sample_normal(&mut self, _mean: f64, _std_dev: f64) -> f64 {
            self.returns.pop_front().expect("scripted return exhausted")
        }
    }

    /// Replays raw `u64` words as the uniform source.
    struct ReplayRng {
        words: VecDeque<u64>,
    }

    impl rand::RngCore for ReplayRng {
        fn next_u32(&mut self) -> u32 {
            (self.next_u64() >> 32) as u32
        }

        fn next_u64(&mut self) -> u64 {
            self.words.pop_front().expect("replay words exhausted")
        }

        fn fill_bytes(&mut self, dst: &mut [u8]) {
            for chunk in dst.chunks_mut(8) {
                let bytes = self.next_u64().to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }
    }

    fn sample_params<'a>() -> MonteCarloParams<'a> {
        MonteCarloParams {
            initial_portfolio: 600_000.0,
            retirement_duration_years: 30,
            mean_return: 0.08 * (1.0 - 0.26),
            std_dev: 0.12,
            simulations: 400,
            seed: Some(42),
            initial_annual_general_withdrawal: 27_000.0,
            fixed_annual_mortgage: 0.0,
            retirement_age: 59,
            mortgage_end_age: 0,
            annual_inflation: 0.02,
            pension_at_start_age: 12_000.0,
            pension_start_age: 67,
            pension_revaluation_rate: 0.015,
            extra_incomes: &[],
            extra_expenses: &[],
        }
    }

    fn one_year_params<'a>() -> MonteCarloParams<'a> {
        MonteCarloParams {
            initial_portfolio: 10_000.0,
            retirement_duration_years: 1,
            mean_return: 0.0,
            std_dev: 0.0,
            simulations: 4,
            seed: None,
            initial_annual_general_withdrawal: 12_000.0,
            fixed_annual_mortgage: 0.0,
            retirement_age: 64,
            mortgage_end_age: 0,
            annual_inflation: 0.0,
            pension_at_start_age: 0.0,
            pension_start_age: 200,
            pension_revaluation_rate: 0.0,
            extra_incomes: &[],
            extra_expenses: &[],
        }
    }

    fn events_after(retirement_age: u32, raw: &[(u32, u32)], label: &str) -> Vec<ExtraEvent> {
        raw.iter()
            .enumerate()
            .map(|(idx, &(offset, amount))| {
                ExtraEvent::new(idx as u32 + 1, amount as f64, retirement_age + offset, label)
            })
            .collect()
    }

    /// Whether an extra income lifts a year back above zero after its monthly
    /// withdrawals ran the pot dry. The deterministic projector carries on from
    /// such a year while a trial has already failed.
    fn revives_after_depletion(params: &MonteCarloParams<'_>) -> bool {
        let terms = RetirementTerms::from(params);
        let monthly_rate = params.mean_return / MONTHS_PER_YEAR as f64;
        let mut portfolio = params.initial_portfolio;
        let mut schedule = WithdrawalSchedule::new(
            params.initial_annual_general_withdrawal,
            params.pension_at_start_age,
        );

        for year in 1..=params.retirement_duration_years {
            let age = params.retirement_age + year;
            let need = schedule.need_at(age, &terms);
            let depleted =
                withdraw_for_year(&mut portfolio, monthly_rate, need.monthly_net_withdrawal);
            portfolio += net_cash_flow(params.extra_incomes, params.extra_expenses, age);
            if portfolio <= 0.0 {
                return false;
            }
            if depleted {
                return true;
            }
            schedule.advance(age, &terms);
        }
        false
    }

    #[test]
    fn box_muller_rejects_zero_uniform_draws() {
        let half = 1_u64 << 63;
        let rng = ReplayRng {
            words: VecDeque::from(vec![0, half, 0, half]),
        };
        let mut sampler = BoxMullerSampler::new(rng);

        let z = -(2.0 * 2.0_f64.ln()).sqrt();
        assert_approx(sampler.sample_normal(0.05, 0.1), 0.05 + z * 0.1);
        assert!(sampler.rng.words.is_empty());
    }

    #[test]
    fn box_muller_with_zero_std_dev_returns_the_mean() {
        let mut sampler = BoxMullerSampler::new(StdRng::seed_from_u64(3));
        for _ in 0..1_000 {
            assert_eq!(sampler.sample_normal(0.0592, 0.0), 0.0592);
        }
    }

    #[test]
    fn box_muller_matches_requested_moments() {
        let mut sampler = BoxMullerSampler::new(StdRng::seed_from_u64(11));
        let n = 200_000;
        let draws: Vec<f64> = (0..n).map(|_| sampler.sample_normal(0.06, 0.12)).collect();
        let mean = draws.iter().sum::<f64>() / n as f64;
        let var = draws.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
        assert!((mean - 0.06).abs() < 0.002, "mean {mean}");
        assert!((var.sqrt() - 0.12).abs() < 0.002, "std dev {}", var.sqrt());
    }

    #[test]
    fn scripted_returns_give_exact_success_ratio() {
        let params = one_year_params();
        let mut sampler = ScriptedReturns::new(&[0.0, 1.0, 0.0, 1.0]);
        assert_approx(estimate_survival_probability_with(&params, &mut sampler), 0.5);
        assert!(sampler.returns.is_empty());
    }

    #[test]
    fn zero_simulations_reports_zero_probability() {
        let mut params = sample_params();
        params.simulations = 0;
        assert_eq!(estimate_survival_probability(&params), 0.0);
        let mut sampler = ScriptedReturns::new(&[]);
        assert_eq!(estimate_survival_probability_with(&params, &mut sampler), 0.0);
    }

    #[test]
    fn zero_duration_always_survives() {
        let mut params = sample_params();
        params.retirement_duration_years = 0;
        params.initial_portfolio = 0.0;
        assert_eq!(estimate_survival_probability(&params), 1.0);
    }

    #[test]
    fn fixed_seed_is_reproducible() {
        let params = sample_params();
        let first = estimate_survival_probability(&params);
        let second = estimate_survival_probability(&params);
        assert_eq!(first, second);
        assert!((0.0..=1.0).contains(&first));
    }

    #[test]
    fn parallel_estimate_matches_sequential_trials_with_same_seeds() {
        let params = sample_params();
        let base_seed = params.seed.expect("seed set");
        let sequential = (0..params.simulations)
            .filter(|&trial| {
                let rng = StdRng::seed_from_u64(derive_seed(base_seed, trial));
                simulate_trial(&params, &mut BoxMullerSampler::new(rng))
            })
            .count() as f64
            / params.simulations as f64;
        assert_eq!(estimate_survival_probability(&params), sequential);
    }

    #[test]
    fn pension_counts_from_its_start_age() {
        let mut params = one_year_params();
        params.initial_portfolio = 13_000.0;
        params.retirement_duration_years = 2;
        params.simulations = 1;
        params.pension_at_start_age = 12_000.0;

        params.pension_start_age = 66;
        let mut sampler = ScriptedReturns::new(&[0.0, 0.0]);
        assert_eq!(estimate_survival_probability_with(&params, &mut sampler), 1.0);

        params.pension_start_age = 67;
        let mut sampler = ScriptedReturns::new(&[0.0, 0.0]);
        assert_eq!(estimate_survival_probability_with(&params, &mut sampler), 0.0);
    }

    #[test]
    fn mortgage_stops_after_its_end_age() {
        let mut params = one_year_params();
        params.initial_portfolio = 13_000.0;
        params.retirement_duration_years = 2;
        params.simulations = 1;
        params.initial_annual_general_withdrawal = 0.0;
        params.fixed_annual_mortgage = 12_000.0;

        params.mortgage_end_age = 65;
        let mut sampler = ScriptedReturns::new(&[0.0, 0.0]);
        assert_eq!(estimate_survival_probability_with(&params, &mut sampler), 1.0);

        params.mortgage_end_age = 66;
        let mut sampler = ScriptedReturns::new(&[0.0, 0.0]);
        assert_eq!(estimate_survival_probability_with(&params, &mut sampler), 0.0);
    }

    #[test]
    fn extra_events_apply_after_the_year_and_can_end_a_trial() {
        let mut params = one_year_params();
        params.initial_portfolio = 100_000.0;
        params.initial_annual_general_withdrawal = 0.0;
        params.simulations = 1;

        let expenses = vec![ExtraEvent::new(1, 200_000.0, 65, "house")];
        params.extra_expenses = &expenses;
        let mut sampler = ScriptedReturns::new(&[0.0]);
        assert_eq!(estimate_survival_probability_with(&params, &mut sampler), 0.0);

        let incomes = vec![ExtraEvent::new(1, 150_000.0, 65, "inheritance")];
        params.extra_incomes = &incomes;
        let mut sampler = ScriptedReturns::new(&[0.0]);
        assert_eq!(estimate_survival_probability_with(&params, &mut sampler), 1.0);
    }

    #[test]
    fn late_extra_income_does_not_rescue_a_depleted_trial() {
        let incomes = vec![ExtraEvent::new(1, 50_000.0, 65, "inheritance")];
        let mut params = one_year_params();
        params.initial_portfolio = 1_000.0;
        params.simulations = 1;
        params.extra_incomes = &incomes;
        let mut sampler = ScriptedReturns::new(&[0.0]);
        assert_eq!(estimate_survival_probability_with(&params, &mut sampler), 0.0);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(48))]

        #[test]
        fn prop_zero_volatility_matches_deterministic_projection(
            seed in any::<u64>(),
            start_value in 0u32..1_500_000,
            withdrawal in 0u32..120_000,
            mortgage in 0u32..20_000,
            mean_bp in -800i32..1_200,
            inflation_bp in 0i32..600,
            duration in 0u32..50,
            pension in 0u32..30_000,
            pension_start_offset in 0u32..20,
            income_events in proptest::collection::vec((1u32..50, 0u32..200_000), 0..3),
            expense_events in proptest::collection::vec((1u32..50, 0u32..300_000), 0..3)
        ) {
            let incomes = events_after(55, &income_events, "income");
            let expenses = events_after(55, &expense_events, "expense");
            let params = MonteCarloParams {
                initial_portfolio: start_value as f64,
                retirement_duration_years: duration,
                mean_return: mean_bp as f64 / 10_000.0,
                std_dev: 0.0,
                simulations: 8,
                seed: Some(seed),
                initial_annual_general_withdrawal: withdrawal as f64,
                fixed_annual_mortgage: mortgage as f64,
                retirement_age: 55,
                mortgage_end_age: 62,
                annual_inflation: inflation_bp as f64 / 10_000.0,
                pension_at_start_age: pension as f64,
                pension_start_age: 55 + pension_start_offset,
                pension_revaluation_rate: 0.01,
                extra_incomes: &incomes,
                extra_expenses: &expenses,
            };
            prop_assume!(!revives_after_depletion(&params));

            let points = project_decumulation(&DecumulationParams {
                start_value: params.initial_portfolio,
                initial_annual_general_withdrawal: params.initial_annual_general_withdrawal,
                fixed_annual_mortgage: params.fixed_annual_mortgage,
                annual_return: params.mean_return,
                annual_inflation: params.annual_inflation,
                duration,
                retirement_age: params.retirement_age,
                mortgage_end_age: params.mortgage_end_age,
                pension_at_start_age: params.pension_at_start_age,
                pension_start_age: params.pension_start_age,
                pension_revaluation_rate: params.pension_revaluation_rate,
                extra_incomes: &incomes,
                extra_expenses: &expenses,
            });
            let survived = points.len() == duration as usize && depletion_age(&points).is_none();
            let expected = if survived { 1.0 } else { 0.0 };

            prop_assert_eq!(estimate_survival_probability(&params), expected);
        }
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(16))]

        #[test]
        fn prop_higher_mean_return_does_not_reduce_success(
            seed in any::<u64>(),
            low_bp in -400i32..800,
            step_bp in 1i32..400,
            withdrawal in 10_000u32..60_000
        ) {
            let mut params = sample_params();
            params.seed = Some(seed);
            params.simulations = 200;
            params.initial_annual_general_withdrawal = withdrawal as f64;

            params.mean_return = low_bp as f64 / 10_000.0;
            let low = estimate_survival_probability(&params);
            params.mean_return = (low_bp + step_bp) as f64 / 10_000.0;
            let high = estimate_survival_probability(&params);

            prop_assert!((0.0..=1.0).contains(&low));
            prop_assert!(high + 1e-12 >= low, "low {low}, high {high}");
        }
    }
}
