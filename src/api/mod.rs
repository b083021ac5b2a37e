use axum::{
    Router,
    extract::{Json, Query},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::{ExtraEvent, PlanInputs, PlanReport, run_plan};

#[derive(Debug, Error, PartialEq)]
pub enum InputError {
    #[error("{flag} {reason}")]
    Invalid { flag: &'static str, reason: String },
    #[error("invalid extra event `{0}`: expected AGE:AMOUNT[:DESCRIPTION]")]
    MalformedEvent(String),
    #[error("invalid request payload: {0}")]
    Payload(String),
}

fn invalid(flag: &'static str, reason: &str) -> InputError {
    InputError::Invalid {
        flag,
        reason: reason.to_string(),
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "fire-planner",
    about = "FIRE projection: accumulation, drawdown and Monte Carlo survival probability",
    after_help = "Run `fire-planner serve [port]` to start the HTTP API instead."
)]
pub struct Cli {
    #[arg(long, default_value_t = 44)]
    current_age: u32,
    #[arg(long, default_value_t = 250_000.0)]
    current_savings: f64,
    #[arg(long, default_value_t = 1_000.0)]
    monthly_contribution: f64,
    #[arg(long, default_value_t = 15)]
    years_to_retirement: u32,
    #[arg(
        long,
        default_value_t = 20_200.0,
        help = "Annual living costs in today's money, mortgage excluded"
    )]
    general_annual_expenses: f64,
    #[arg(long, default_value_t = 550.0)]
    monthly_mortgage_payment: f64,
    #[arg(long, default_value_t = 15)]
    remaining_mortgage_years: u32,
    #[arg(long, default_value_t = 67)]
    pension_start_age: u32,
    #[arg(
        long,
        default_value_t = 12_000.0,
        help = "Annual pension as first paid at --pension-start-age"
    )]
    annual_pension_income: f64,
    #[arg(long, default_value_t = 7.0, help = "Gross annual return in percent")]
    gross_annual_return: f64,
    #[arg(long, default_value_t = 2.0, help = "Annual inflation in percent")]
    inflation_rate: f64,
    #[arg(
        long,
        default_value_t = 26.0,
        help = "Flat tax on investment returns in percent"
    )]
    capital_gains_tax_rate: f64,
    #[arg(
        long,
        default_value_t = 1.5,
        help = "Annual pension growth once in payment, in percent"
    )]
    pension_revaluation_rate: f64,
    #[arg(
        long,
        default_value_t = 8.0,
        help = "Monte Carlo gross mean annual return in percent"
    )]
    sim_mean_return: f64,
    #[arg(
        long,
        default_value_t = 12.0,
        help = "Monte Carlo annual return volatility in percent"
    )]
    sim_volatility: f64,
    #[arg(long, default_value_t = 100)]
    horizon_age: u32,
    #[arg(long, default_value_t = 5_000)]
    simulations: u32,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(
        long = "extra-income",
        value_name = "AGE:AMOUNT[:DESCRIPTION]",
        value_parser = parse_extra_event
    )]
    extra_incomes: Vec<ExtraEvent>,
    #[arg(
        long = "extra-expense",
        value_name = "AGE:AMOUNT[:DESCRIPTION]",
        value_parser = parse_extra_event
    )]
    extra_expenses: Vec<ExtraEvent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtraEventPayload {
    id: Option<u32>,
    amount: f64,
    age: u32,
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    current_age: Option<u32>,
    current_savings: Option<f64>,
    monthly_contribution: Option<f64>,
    years_to_retirement: Option<u32>,
    general_annual_expenses: Option<f64>,
    monthly_mortgage_payment: Option<f64>,
    remaining_mortgage_years: Option<u32>,
    pension_start_age: Option<u32>,
    annual_pension_income: Option<f64>,
    gross_annual_return: Option<f64>,
    inflation: Option<f64>,
    capital_gains_tax_rate: Option<f64>,
    pension_revaluation_rate: Option<f64>,
    sim_mean_return: Option<f64>,
    sim_volatility: Option<f64>,
    horizon_age: Option<u32>,
    simulations: Option<u32>,
    seed: Option<u64>,
    extra_incomes: Option<Vec<ExtraEventPayload>>,
    extra_expenses: Option<Vec<ExtraEventPayload>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse {
    simulations: u32,
    seed: Option<u64>,
    horizon_age: u32,
    fire_reached: bool,
    #[serde(flatten)]
    report: PlanReport,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn parse_extra_event(raw: &str) -> Result<ExtraEvent, InputError> {
    let malformed = || InputError::MalformedEvent(raw.to_string());
    let mut parts = raw.splitn(3, ':');
    let age = parts
        .next()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .ok_or_else(malformed)?;
    let amount = parts
        .next()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .ok_or_else(malformed)?;
    let description = parts.next().unwrap_or_default().trim();
    Ok(ExtraEvent::new(0, amount, age, description))
}

fn renumber(events: Vec<ExtraEvent>) -> Vec<ExtraEvent> {
    events
        .into_iter()
        .enumerate()
        .map(|(idx, event)| ExtraEvent {
            id: idx as u32 + 1,
            ..event
        })
        .collect()
}

fn validate_events(flag: &'static str, events: &[ExtraEvent]) -> Result<(), InputError> {
    if events
        .iter()
        .any(|event| !event.amount.is_finite() || event.amount < 0.0)
    {
        return Err(invalid(flag, "amounts must be finite and >= 0"));
    }
    Ok(())
}

/// Oldest age any projection may reach.
pub const MAX_AGE: u32 = 120;
pub const MAX_SIMULATIONS: u32 = 100_000;

fn age_after(current_age: u32, years: u32) -> Option<u32> {
    current_age
        .checked_add(years)
        .filter(|&age| age <= MAX_AGE)
}

pub fn build_inputs(cli: Cli) -> Result<PlanInputs, InputError> {
    if cli.horizon_age <= cli.current_age {
        return Err(invalid("--horizon-age", "must be > --current-age"));
    }

    if cli.horizon_age > MAX_AGE {
        return Err(invalid("--horizon-age", "must be <= 120"));
    }

    if age_after(cli.current_age, cli.years_to_retirement).is_none() {
        return Err(invalid(
            "--years-to-retirement",
            "must keep the retirement age <= 120",
        ));
    }

    if age_after(cli.current_age, cli.remaining_mortgage_years).is_none() {
        return Err(invalid(
            "--remaining-mortgage-years",
            "must keep the mortgage end age <= 120",
        ));
    }

    if cli.simulations == 0 || cli.simulations > MAX_SIMULATIONS {
        return Err(invalid("--simulations", "must be between 1 and 100000"));
    }

    for (flag, amount) in [
        ("--current-savings", cli.current_savings),
        ("--monthly-contribution", cli.monthly_contribution),
        ("--general-annual-expenses", cli.general_annual_expenses),
        ("--monthly-mortgage-payment", cli.monthly_mortgage_payment),
        ("--annual-pension-income", cli.annual_pension_income),
    ] {
        if !amount.is_finite() || amount < 0.0 {
            return Err(invalid(flag, "must be finite and >= 0"));
        }
    }

    for (flag, rate) in [
        ("--gross-annual-return", cli.gross_annual_return),
        ("--inflation-rate", cli.inflation_rate),
        ("--pension-revaluation-rate", cli.pension_revaluation_rate),
        ("--sim-mean-return", cli.sim_mean_return),
    ] {
        if !rate.is_finite() || rate <= -100.0 {
            return Err(invalid(flag, "must be > -100"));
        }
    }

    if !(0.0..=100.0).contains(&cli.capital_gains_tax_rate) {
        return Err(invalid("--capital-gains-tax-rate", "must be between 0 and 100"));
    }

    if !cli.sim_volatility.is_finite() || cli.sim_volatility < 0.0 {
        return Err(invalid("--sim-volatility", "must be >= 0"));
    }

    validate_events("--extra-income", &cli.extra_incomes)?;
    validate_events("--extra-expense", &cli.extra_expenses)?;

    Ok(PlanInputs {
        current_age: cli.current_age,
        current_savings: cli.current_savings,
        monthly_contribution: cli.monthly_contribution,
        years_to_retirement: cli.years_to_retirement,
        general_annual_expenses: cli.general_annual_expenses,
        monthly_mortgage_payment: cli.monthly_mortgage_payment,
        remaining_mortgage_years: cli.remaining_mortgage_years,
        pension_start_age: cli.pension_start_age,
        annual_pension_income: cli.annual_pension_income,
        gross_annual_return: cli.gross_annual_return / 100.0,
        annual_inflation: cli.inflation_rate / 100.0,
        capital_gains_tax_rate: cli.capital_gains_tax_rate / 100.0,
        pension_revaluation_rate: cli.pension_revaluation_rate / 100.0,
        sim_gross_mean_return: cli.sim_mean_return / 100.0,
        sim_std_dev: cli.sim_volatility / 100.0,
        horizon_age: cli.horizon_age,
        simulations: cli.simulations,
        seed: cli.seed,
        extra_incomes: renumber(cli.extra_incomes),
        extra_expenses: renumber(cli.extra_expenses),
    })
}

/// Validates command-line inputs and evaluates the plan.
pub fn run_cli(cli: Cli) -> Result<PlanReport, InputError> {
    let inputs = build_inputs(cli)?;
    info!(
        retirement_age = inputs.retirement_age(),
        simulations = inputs.simulations,
        "running plan"
    );
    Ok(run_plan(&inputs))
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    info!("FIRE planner HTTP API listening on http://{addr}");
    info!("Local access: http://127.0.0.1:{port}/api/simulate");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_handler_impl(payload: SimulatePayload) -> Response {
    let inputs = match inputs_from_payload(payload) {
        Ok(inputs) => inputs,
        Err(err) => {
            warn!(%err, "rejected simulate request");
            return error_response(StatusCode::BAD_REQUEST, &err.to_string());
        }
    };

    let simulations = inputs.simulations;
    let seed = inputs.seed;
    let horizon_age = inputs.horizon_age;
    let report = match tokio::task::spawn_blocking(move || run_plan(&inputs)).await {
        Ok(report) => report,
        Err(err) => {
            warn!(%err, "simulation task failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Simulation failed");
        }
    };

    json_response(
        StatusCode::OK,
        SimulateResponse {
            simulations,
            seed,
            horizon_age,
            fire_reached: report.projected_value >= report.fire_target,
            report,
        },
    )
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn inputs_from_json(json: &str) -> Result<PlanInputs, InputError> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| InputError::Payload(e.to_string()))?;
    inputs_from_payload(payload)
}

fn events_from_payload(events: Vec<ExtraEventPayload>) -> Vec<ExtraEvent> {
    events
        .into_iter()
        .enumerate()
        .map(|(idx, event)| ExtraEvent {
            id: event.id.unwrap_or(idx as u32 + 1),
            amount: event.amount,
            age: event.age,
            description: event.description.unwrap_or_default(),
        })
        .collect()
}

fn inputs_from_payload(payload: SimulatePayload) -> Result<PlanInputs, InputError> {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.current_age {
        cli.current_age = v;
    }
    if let Some(v) = payload.current_savings {
        cli.current_savings = v;
    }
    if let Some(v) = payload.monthly_contribution {
        cli.monthly_contribution = v;
    }
    if let Some(v) = payload.years_to_retirement {
        cli.years_to_retirement = v;
    }
    if let Some(v) = payload.general_annual_expenses {
        cli.general_annual_expenses = v;
    }
    if let Some(v) = payload.monthly_mortgage_payment {
        cli.monthly_mortgage_payment = v;
    }
    if let Some(v) = payload.remaining_mortgage_years {
        cli.remaining_mortgage_years = v;
    }
    if let Some(v) = payload.pension_start_age {
        cli.pension_start_age = v;
    }
    if let Some(v) = payload.annual_pension_income {
        cli.annual_pension_income = v;
    }
    if let Some(v) = payload.gross_annual_return {
        cli.gross_annual_return = v;
    }
    if let Some(v) = payload.inflation {
        cli.inflation_rate = v;
    }
    if let Some(v) = payload.capital_gains_tax_rate {
        cli.capital_gains_tax_rate = v;
    }
    if let Some(v) = payload.pension_revaluation_rate {
        cli.pension_revaluation_rate = v;
    }
    if let Some(v) = payload.sim_mean_return {
        cli.sim_mean_return = v;
    }
    if let Some(v) = payload.sim_volatility {
        cli.sim_volatility = v;
    }
    if let Some(v) = payload.horizon_age {
        cli.horizon_age = v;
    }
    if let Some(v) = payload.simulations {
        cli.simulations = v;
    }
    if let Some(v) = payload.seed {
        cli.seed = Some(v);
    }
    if let Some(v) = payload.extra_incomes {
        cli.extra_incomes = events_from_payload(v);
    }
    if let Some(v) = payload.extra_expenses {
        cli.extra_expenses = events_from_payload(v);
    }

    // Payload ids are kept as sent, so skip the CLI renumbering.
    let incomes = std::mem::take(&mut cli.extra_incomes);
    let expenses = std::mem::take(&mut cli.extra_expenses);
    validate_events("extraIncomes", &incomes)?;
    validate_events("extraExpenses", &expenses)?;

    let mut inputs = build_inputs(cli)?;
    inputs.extra_incomes = incomes;
    inputs.extra_expenses = expenses;
    Ok(inputs)
}

fn default_cli_for_api() -> Cli {
    Cli {
        current_age: 44,
        current_savings: 250_000.0,
        monthly_contribution: 1_000.0,
        years_to_retirement: 15,
        general_annual_expenses: 20_200.0,
        monthly_mortgage_payment: 550.0,
        remaining_mortgage_years: 15,
        pension_start_age: 67,
        annual_pension_income: 12_000.0,
        gross_annual_return: 7.0,
        inflation_rate: 2.0,
        capital_gains_tax_rate: 26.0,
        pension_revaluation_rate: 1.5,
        sim_mean_return: 8.0,
        sim_volatility: 12.0,
        horizon_age: 100,
        simulations: 5_000,
        seed: None,
        extra_incomes: Vec::new(),
        extra_expenses: Vec::new(),
    }
}
