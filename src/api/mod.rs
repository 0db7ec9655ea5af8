use axum::{
    Router,
    extract::{Json, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::core::{
    PlanInputs, PlanResult, ReturnPolicy, RsfResult, WithdrawalTiming, run_horizon_sweep,
    run_plan,
};
use crate::timeseries::{
    CacheConfig, CachedSource, CorrelationReport, CsvDirectorySource, DEFAULT_AVERAGING_WINDOW,
    DEFAULT_CORRELATION_WINDOW, PriceSource, correlate_symbols,
};

const DEFAULT_START_DATE: &str = "1990-01-01";
/// Upper bound for retirement horizons and sweeps accepted from callers.
const MAX_HORIZON_YEARS: u32 = 1000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliReturnPolicy {
    Constant,
    GlidePath,
    GlidePathByAge,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliWithdrawalTiming {
    StartOfYear,
    EndOfYear,
}

impl From<CliWithdrawalTiming> for WithdrawalTiming {
    fn from(value: CliWithdrawalTiming) -> Self {
        match value {
            CliWithdrawalTiming::StartOfYear => WithdrawalTiming::StartOfYear,
            CliWithdrawalTiming::EndOfYear => WithdrawalTiming::EndOfYear,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiReturnPolicy {
    Constant,
    #[serde(alias = "glidePath", alias = "glide_path", alias = "mixed")]
    GlidePath,
    #[serde(alias = "glidePathByAge", alias = "glide_path_by_age")]
    GlidePathByAge,
}

impl From<ApiReturnPolicy> for CliReturnPolicy {
    fn from(value: ApiReturnPolicy) -> Self {
        match value {
            ApiReturnPolicy::Constant => CliReturnPolicy::Constant,
            ApiReturnPolicy::GlidePath => CliReturnPolicy::GlidePath,
            ApiReturnPolicy::GlidePathByAge => CliReturnPolicy::GlidePathByAge,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
enum ApiWithdrawalTiming {
    #[serde(alias = "startOfYear", alias = "start_of_year", alias = "start")]
    StartOfYear,
    #[serde(alias = "endOfYear", alias = "end_of_year", alias = "end")]
    EndOfYear,
}

impl From<ApiWithdrawalTiming> for CliWithdrawalTiming {
    fn from(value: ApiWithdrawalTiming) -> Self {
        match value {
            ApiWithdrawalTiming::StartOfYear => CliWithdrawalTiming::StartOfYear,
            ApiWithdrawalTiming::EndOfYear => CliWithdrawalTiming::EndOfYear,
        }
    }
}

impl From<WithdrawalTiming> for ApiWithdrawalTiming {
    fn from(value: WithdrawalTiming) -> Self {
        match value {
            WithdrawalTiming::StartOfYear => ApiWithdrawalTiming::StartOfYear,
            WithdrawalTiming::EndOfYear => ApiWithdrawalTiming::EndOfYear,
        }
    }
}

/// Plan parameters as accepted by the HTTP API and by scenario files. Every
/// field is optional and overrides the API defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PlanPayload {
    policy: Option<ApiReturnPolicy>,
    aar: Option<f64>,
    bonds_aar: Option<f64>,
    stocks_aar: Option<f64>,
    initial_bond_percentage: Option<f64>,
    retirement_age: Option<u32>,
    bond_portfolio_age: Option<f64>,

    inflation_rate: Option<f64>,
    num_retirement_years: Option<i64>,
    num_years_before: Option<f64>,
    yearly_salary: Option<f64>,
    timing: Option<ApiWithdrawalTiming>,
    sweep_max_years: Option<i64>,
}

#[derive(Parser, Debug)]
#[command(
    name = "retinvest",
    about = "Retirement saving factor calculator (constant returns and bonds/stocks glide paths)"
)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable debug logging")]
    pub verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Estimate the savings needed for a retirement plan
    Plan(PlanArgs),
    /// Run a plan described in a TOML scenario file
    Scenario(ScenarioArgs),
    /// Correlate the growth of two price histories and write a CSV report
    Correlate(CorrelateArgs),
    /// Serve the JSON API
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
struct PlanArgs {
    #[arg(long, value_enum, default_value_t = CliReturnPolicy::Constant)]
    policy: CliReturnPolicy,
    #[arg(
        short = 'p',
        long,
        allow_negative_numbers = true,
        help = "Average annual return in percent (constant policy)"
    )]
    aar: Option<f64>,
    #[arg(
        short = 'B',
        long,
        allow_negative_numbers = true,
        help = "Bonds average annual return in percent (glide-path policies)"
    )]
    bonds_aar: Option<f64>,
    #[arg(
        short = 'S',
        long,
        allow_negative_numbers = true,
        help = "Stocks average annual return in percent (glide-path policies)"
    )]
    stocks_aar: Option<f64>,
    #[arg(
        long,
        default_value_t = 40.0,
        allow_negative_numbers = true,
        help = "Bond share of the portfolio in the first retirement year, in percent"
    )]
    initial_bond_percentage: f64,
    #[arg(short = 'a', long, help = "Age at retirement (glide-path-by-age policy)")]
    retirement_age: Option<u32>,
    #[arg(
        long,
        default_value_t = 100.0,
        help = "Age from which the portfolio is entirely bonds (glide-path-by-age policy)"
    )]
    bond_portfolio_age: f64,

    #[arg(
        short = 'i',
        long,
        allow_negative_numbers = true,
        help = "Yearly inflation rate in percent"
    )]
    inflation_rate: f64,
    #[arg(
        short = 'N',
        long,
        allow_negative_numbers = true,
        help = "Years of retirement income to fund, at most 1000"
    )]
    num_retirement_years: i64,
    #[arg(
        short = 'n',
        long,
        allow_negative_numbers = true,
        help = "Years left before retirement, used to inflate the income"
    )]
    num_years_before: f64,
    #[arg(
        short = 'Y',
        long,
        help = "Yearly income wanted in retirement, in current currency"
    )]
    yearly_salary: f64,
    #[arg(long, value_enum, default_value_t = CliWithdrawalTiming::StartOfYear)]
    timing: CliWithdrawalTiming,
    #[arg(
        long,
        allow_negative_numbers = true,
        help = "Also report every retirement horizon from 1 to this many years, at most 1000"
    )]
    sweep_max_years: Option<i64>,
}

#[derive(Args, Debug, Clone)]
struct ScenarioArgs {
    /// TOML file with camelCase plan keys
    file: PathBuf,
}

#[derive(Args, Debug, Clone)]
struct CorrelateArgs {
    #[arg(long)]
    symbol1: String,
    #[arg(long)]
    symbol2: String,
    #[arg(long, help = "Directory holding <SYMBOL>.csv price histories")]
    data_dir: PathBuf,
    #[arg(short = 's', long, default_value = DEFAULT_START_DATE, value_parser = parse_start_date)]
    start_date: NaiveDate,
    #[arg(long, default_value_t = DEFAULT_CORRELATION_WINDOW)]
    window: usize,
    #[arg(long, default_value_t = DEFAULT_AVERAGING_WINDOW)]
    averaging_window: usize,
    #[arg(long, default_value = "Close")]
    value_column: String,
    #[arg(short = 'o', long, help = "CSV output path; stdout when omitted")]
    output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    #[arg(long, default_value_t = 8080)]
    port: u16,
    #[arg(long, help = "Directory holding <SYMBOL>.csv price histories for /api/correlation")]
    data_dir: Option<PathBuf>,
    #[arg(long, default_value = "Close")]
    value_column: String,
    #[arg(long, default_value_t = 180, help = "Minutes a loaded price history stays cached")]
    cache_expire_minutes: u64,
}

#[derive(Debug)]
struct PlanRequest {
    inputs: PlanInputs,
    sweep_max_years: Option<u32>,
}

#[derive(Debug)]
struct PlanOutcome {
    result: PlanResult,
    horizon_sweep: Vec<PlanResult>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanResponse {
    policy: String,
    inflation_rate: f64,
    years_before_retirement: f64,
    yearly_income: f64,
    timing: ApiWithdrawalTiming,
    #[serde(flatten)]
    result: PlanResult,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    horizon_sweep: Vec<PlanResult>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CorrelationQuery {
    symbol1: Option<String>,
    symbol2: Option<String>,
    start_date: Option<String>,
    window: Option<usize>,
    averaging_window: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
struct CorrelationRequest {
    left: String,
    right: String,
    start: NaiveDate,
    window: usize,
    averaging_window: usize,
}

/// Shared handles for the HTTP handlers. The price cache lives here for the
/// lifetime of the server.
#[derive(Clone, Default)]
pub struct AppState {
    prices: Option<Arc<CachedSource<CsvDirectorySource>>>,
}

impl AppState {
    pub fn with_price_directory(
        dir: impl Into<PathBuf>,
        value_column: &str,
        cache: CacheConfig,
    ) -> Self {
        let source = CsvDirectorySource::new(dir).with_value_column(value_column);
        Self {
            prices: Some(Arc::new(CachedSource::new(source, cache))),
        }
    }
}

pub async fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Plan(args) => {
            let request = plan_request_from_args(args)?;
            print!("{}", render_plan(&request)?);
            Ok(())
        }
        Command::Scenario(args) => {
            let request = load_scenario(&args.file)?;
            info!(file = %args.file.display(), "running scenario");
            print!("{}", render_plan(&request)?);
            Ok(())
        }
        Command::Correlate(args) => run_correlate(args),
        Command::Serve(args) => {
            let state = match &args.data_dir {
                Some(dir) => AppState::with_price_directory(
                    dir,
                    &args.value_column,
                    CacheConfig {
                        expire_after: Duration::from_secs(args.cache_expire_minutes * 60),
                    },
                ),
                None => AppState::default(),
            };
            run_http_server(args.port, state)
                .await
                .map_err(|e| format!("Server error: {e}"))
        }
    }
}

fn build_inputs(args: PlanArgs) -> Result<PlanInputs, String> {
    if args.num_retirement_years < 0 {
        return Err("--num-retirement-years must be >= 0".to_string());
    }
    let retirement_years = horizon_years("--num-retirement-years", args.num_retirement_years)?;

    if !args.num_years_before.is_finite() || args.num_years_before < 0.0 {
        return Err("--num-years-before must be >= 0".to_string());
    }

    if !args.yearly_salary.is_finite() || args.yearly_salary < 0.0 {
        return Err("--yearly-salary must be >= 0".to_string());
    }

    let inflation_rate = percent("--inflation-rate", args.inflation_rate)?;

    let policy = match args.policy {
        CliReturnPolicy::Constant => ReturnPolicy::Constant {
            rate: required_percent("--aar", args.aar, "constant")?,
        },
        CliReturnPolicy::GlidePath => {
            if !args.initial_bond_percentage.is_finite() {
                return Err("--initial-bond-percentage must be a finite percentage".to_string());
            }
            ReturnPolicy::GlidePathByIncrement {
                initial_bond_percentage: args.initial_bond_percentage,
                bond_aar: required_percent("--bonds-aar", args.bonds_aar, "glide-path")?,
                stock_aar: required_percent("--stocks-aar", args.stocks_aar, "glide-path")?,
            }
        }
        CliReturnPolicy::GlidePathByAge => {
            let Some(start_age) = args.retirement_age else {
                return Err(
                    "--retirement-age is required with --policy glide-path-by-age".to_string(),
                );
            };
            if !args.bond_portfolio_age.is_finite() {
                return Err("--bond-portfolio-age must be finite".to_string());
            }
            ReturnPolicy::GlidePathByAge {
                start_age,
                full_bond_age: args.bond_portfolio_age,
                bond_aar: required_percent("--bonds-aar", args.bonds_aar, "glide-path-by-age")?,
                stock_aar: required_percent(
                    "--stocks-aar",
                    args.stocks_aar,
                    "glide-path-by-age",
                )?,
            }
        }
    };

    Ok(PlanInputs {
        policy,
        inflation_rate,
        retirement_years,
        years_before_retirement: args.num_years_before,
        yearly_income: args.yearly_salary,
        timing: args.timing.into(),
    })
}

fn horizon_years(flag: &str, value: i64) -> Result<u32, String> {
    u32::try_from(value)
        .ok()
        .filter(|years| *years <= MAX_HORIZON_YEARS)
        .ok_or_else(|| format!("{flag} must be <= {MAX_HORIZON_YEARS}"))
}

fn percent(flag: &str, value: f64) -> Result<f64, String> {
    if !value.is_finite() {
        return Err(format!("{flag} must be a finite percentage"));
    }
    Ok(value / 100.0)
}

fn required_percent(flag: &str, value: Option<f64>, policy: &str) -> Result<f64, String> {
    match value {
        Some(v) => percent(flag, v),
        None => Err(format!("{flag} is required with --policy {policy}")),
    }
}

fn plan_request_from_args(args: PlanArgs) -> Result<PlanRequest, String> {
    let sweep_max_years = match args.sweep_max_years {
        None => None,
        Some(v) if v < 1 => return Err("--sweep-max-years must be >= 1".to_string()),
        Some(v) => Some(horizon_years("--sweep-max-years", v)?),
    };
    let inputs = build_inputs(args)?;
    Ok(PlanRequest {
        inputs,
        sweep_max_years,
    })
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<PlanRequest, String> {
    let payload = serde_json::from_str::<PlanPayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload)
}

fn load_scenario(path: &Path) -> Result<PlanRequest, String> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("Unable to read scenario {}: {e}", path.display()))?;
    let payload = toml::from_str::<PlanPayload>(&text)
        .map_err(|e| format!("Invalid scenario file {}: {e}", path.display()))?;
    api_request_from_payload(payload)
}

fn api_request_from_payload(payload: PlanPayload) -> Result<PlanRequest, String> {
    let mut args = default_args_for_api();

    if let Some(v) = payload.policy {
        args.policy = v.into();
    }
    if let Some(v) = payload.aar {
        args.aar = Some(v);
    }
    if let Some(v) = payload.bonds_aar {
        args.bonds_aar = Some(v);
    }
    if let Some(v) = payload.stocks_aar {
        args.stocks_aar = Some(v);
    }
    if let Some(v) = payload.initial_bond_percentage {
        args.initial_bond_percentage = v;
    }
    if let Some(v) = payload.retirement_age {
        args.retirement_age = Some(v);
    }
    if let Some(v) = payload.bond_portfolio_age {
        args.bond_portfolio_age = v;
    }
    if let Some(v) = payload.inflation_rate {
        args.inflation_rate = v;
    }
    if let Some(v) = payload.num_retirement_years {
        args.num_retirement_years = v;
    }
    if let Some(v) = payload.num_years_before {
        args.num_years_before = v;
    }
    if let Some(v) = payload.yearly_salary {
        args.yearly_salary = v;
    }
    if let Some(v) = payload.timing {
        args.timing = v.into();
    }
    if payload.sweep_max_years.is_some() {
        args.sweep_max_years = payload.sweep_max_years;
    }

    plan_request_from_args(args)
        .map_err(|msg| msg.replace("--policy", "policy").replace("--", ""))
}

fn default_args_for_api() -> PlanArgs {
    PlanArgs {
        policy: CliReturnPolicy::Constant,
        aar: Some(5.0),
        bonds_aar: Some(3.0),
        stocks_aar: Some(7.0),
        initial_bond_percentage: 40.0,
        retirement_age: Some(65),
        bond_portfolio_age: 100.0,
        inflation_rate: 2.5,
        num_retirement_years: 30,
        num_years_before: 0.0,
        yearly_salary: 50_000.0,
        timing: CliWithdrawalTiming::StartOfYear,
        sweep_max_years: None,
    }
}

fn execute_plan(request: &PlanRequest) -> RsfResult<PlanOutcome> {
    let inputs = &request.inputs;
    debug!(
        policy = ?inputs.policy,
        inflation_rate = inputs.inflation_rate,
        retirement_years = inputs.retirement_years,
        timing = ?inputs.timing,
        "computing retirement saving factor"
    );
    if let ReturnPolicy::GlidePathByIncrement {
        initial_bond_percentage,
        ..
    } = inputs.policy
    {
        if !(0.0..=100.0).contains(&initial_bond_percentage) {
            warn!(
                initial_bond_percentage,
                "initial bond percentage outside 0..=100, clamping each year's weight"
            );
        }
    }

    let result = run_plan(inputs)?;
    let horizon_sweep = match request.sweep_max_years {
        Some(max_years) => run_horizon_sweep(inputs, max_years)?,
        None => Vec::new(),
    };
    Ok(PlanOutcome {
        result,
        horizon_sweep,
    })
}

fn render_plan(request: &PlanRequest) -> Result<String, String> {
    let outcome = execute_plan(request).map_err(|e| e.to_string())?;
    let mut report = format_plan_report(&request.inputs, &outcome.result);
    if !outcome.horizon_sweep.is_empty() {
        report.push('\n');
        report.push_str(&format_sweep_table(&outcome.horizon_sweep));
    }
    Ok(report)
}

fn describe_policy(policy: &ReturnPolicy) -> String {
    match *policy {
        ReturnPolicy::Constant { rate } => {
            format!("constant {:.2}% average annual return", rate * 100.0)
        }
        ReturnPolicy::GlidePathByIncrement {
            initial_bond_percentage,
            bond_aar,
            stock_aar,
        } => format!(
            "glide path from {initial_bond_percentage:.1}% bonds, one point more each year (bonds {:.2}%, stocks {:.2}%)",
            bond_aar * 100.0,
            stock_aar * 100.0
        ),
        ReturnPolicy::GlidePathByAge {
            start_age,
            full_bond_age,
            bond_aar,
            stock_aar,
        } => format!(
            "age-based glide path from age {start_age}, all bonds at {full_bond_age} (bonds {:.2}%, stocks {:.2}%)",
            bond_aar * 100.0,
            stock_aar * 100.0
        ),
    }
}

fn format_plan_report(inputs: &PlanInputs, result: &PlanResult) -> String {
    let timing = match inputs.timing {
        WithdrawalTiming::StartOfYear => "start",
        WithdrawalTiming::EndOfYear => "end",
    };
    let lines = [
        "Amount needed to be saved for retirement with:".to_string(),
        format!("    * return policy: {}", describe_policy(&inputs.policy)),
        format!(
            "    * yearly inflation rate: {:.2}%",
            inputs.inflation_rate * 100.0
        ),
        format!("    * {} years of pension", inputs.retirement_years),
        format!("    * {} years before pension", inputs.years_before_retirement),
        format!(
            "    * {} yearly income in current currency ({} at retirement time)",
            format_currency(inputs.yearly_income),
            format_currency(result.inflated_yearly_income)
        ),
        format!("    * income withdrawn at the {timing} of each year"),
        format!(
            "    * retirement saving factor: {:.4}",
            result.retirement_saving_factor
        ),
        "------------------".to_string(),
        format_currency(result.required_savings),
        "------------------".to_string(),
    ];
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn format_sweep_table(results: &[PlanResult]) -> String {
    let mut out = format!("{:>6}  {:>10}  {:>18}\n", "years", "factor", "required savings");
    for result in results {
        out.push_str(&format!(
            "{:>6}  {:>10.4}  {:>18}\n",
            result.retirement_years,
            result.retirement_saving_factor,
            format_currency(result.required_savings)
        ));
    }
    out
}

/// `$1,234.56`; negative amounts get a leading minus.
fn format_currency(amount: f64) -> String {
    if !amount.is_finite() {
        return amount.to_string();
    }
    let fixed = format!("{:.2}", amount.abs());
    let (whole, cents) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (idx, digit) in whole.chars().enumerate() {
        if idx > 0 && (whole.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    let sign = if amount < 0.0 && fixed != "0.00" {
        "-"
    } else {
        ""
    };
    format!("{sign}${grouped}.{cents}")
}

fn parse_start_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| format!("invalid start date {raw:?} (expected YYYY-MM-DD): {e}"))
}

fn validate_symbol(flag: &str, symbol: &str) -> Result<String, String> {
    let symbol = symbol.trim();
    let valid = !symbol.is_empty()
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '_'));
    if !valid {
        return Err(format!(
            "{flag} must be a ticker symbol (letters, digits, '.', '-', '^' or '_')"
        ));
    }
    Ok(symbol.to_string())
}

fn build_correlation_request(
    symbol1: &str,
    symbol2: &str,
    start: NaiveDate,
    window: usize,
    averaging_window: usize,
) -> Result<CorrelationRequest, String> {
    if window < 2 {
        return Err("--window must be >= 2".to_string());
    }
    if averaging_window < 1 {
        return Err("--averaging-window must be >= 1".to_string());
    }
    Ok(CorrelationRequest {
        left: validate_symbol("--symbol1", symbol1)?,
        right: validate_symbol("--symbol2", symbol2)?,
        start,
        window,
        averaging_window,
    })
}

fn correlation_request_from_query(query: CorrelationQuery) -> Result<CorrelationRequest, String> {
    let (Some(symbol1), Some(symbol2)) = (query.symbol1, query.symbol2) else {
        return Err("symbol1 and symbol2 are required".to_string());
    };
    let start = match query.start_date {
        Some(raw) => parse_start_date(&raw)?,
        None => parse_start_date(DEFAULT_START_DATE)?,
    };
    build_correlation_request(
        &symbol1,
        &symbol2,
        start,
        query.window.unwrap_or(DEFAULT_CORRELATION_WINDOW),
        query.averaging_window.unwrap_or(DEFAULT_AVERAGING_WINDOW),
    )
    .map_err(|msg| msg.replace("--", ""))
}

fn correlate<S: PriceSource>(
    source: &S,
    request: &CorrelationRequest,
) -> Result<CorrelationReport, String> {
    debug!(
        left = %request.left,
        right = %request.right,
        start = %request.start,
        window = request.window,
        averaging_window = request.averaging_window,
        "correlating price histories"
    );
    correlate_symbols(
        source,
        &request.left,
        &request.right,
        request.start,
        request.window,
        request.averaging_window,
    )
    .map_err(|e| e.to_string())
}

fn run_correlate(args: CorrelateArgs) -> Result<(), String> {
    let request = build_correlation_request(
        &args.symbol1,
        &args.symbol2,
        args.start_date,
        args.window,
        args.averaging_window,
    )?;
    let source = CsvDirectorySource::new(&args.data_dir).with_value_column(&args.value_column);
    let report = correlate(&source, &request)?;

    match &args.output {
        Some(path) => {
            let file = fs::File::create(path)
                .map_err(|e| format!("Unable to create {}: {e}", path.display()))?;
            report.write_csv(file).map_err(|e| e.to_string())?;
            info!(rows = report.rows.len(), output = %path.display(), "correlation report written");
        }
        None => report
            .write_csv(std::io::stdout().lock())
            .map_err(|e| e.to_string())?,
    }
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/plan", get(plan_get_handler).post(plan_post_handler))
        .route("/api/correlation", get(correlation_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

pub async fn run_http_server(port: u16, state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let correlation_enabled = state.prices.is_some();
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, correlation_enabled, "retinvest HTTP API listening");
    info!("local access: http://127.0.0.1:{port}/api/health");

    axum::serve(listener, app).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, serde_json::json!({ "status": "ok" }))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn plan_get_handler(Query(payload): Query<PlanPayload>) -> Response {
    plan_handler_impl(payload)
}

async fn plan_post_handler(Json(payload): Json<PlanPayload>) -> Response {
    plan_handler_impl(payload)
}

fn plan_handler_impl(payload: PlanPayload) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => {
            warn!(error = %msg, "rejected plan request");
            return error_response(StatusCode::BAD_REQUEST, &msg);
        }
    };

    match execute_plan(&request) {
        Ok(outcome) => json_response(StatusCode::OK, build_plan_response(&request, outcome)),
        Err(e) => {
            warn!(error = %e, "plan computation failed");
            error_response(StatusCode::BAD_REQUEST, &e.to_string())
        }
    }
}

async fn correlation_handler(
    State(state): State<AppState>,
    Query(query): Query<CorrelationQuery>,
) -> Response {
    let Some(source) = state.prices.clone() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "No price directory configured; start the server with --data-dir",
        );
    };
    let request = match correlation_request_from_query(query) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    match tokio::task::spawn_blocking(move || correlate(source.as_ref(), &request)).await {
        Ok(Ok(report)) => json_response(StatusCode::OK, report),
        Ok(Err(msg)) => {
            warn!(error = %msg, "correlation failed");
            error_response(StatusCode::BAD_REQUEST, &msg)
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Correlation task failed: {e}"),
        ),
    }
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

fn build_plan_response(request: &PlanRequest, outcome: PlanOutcome) -> PlanResponse {
    let inputs = &request.inputs;
    PlanResponse {
        policy: describe_policy(&inputs.policy),
        inflation_rate: inputs.inflation_rate,
        years_before_retirement: inputs.years_before_retirement,
        yearly_income: inputs.yearly_income,
        timing: inputs.timing.into(),
        result: outcome.result,
        horizon_sweep: outcome.horizon_sweep,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_args() -> PlanArgs {
        PlanArgs {
            aar: Some(7.0),
            inflation_rate: 3.0,
            num_retirement_years: 20,
            num_years_before: 10.0,
            yearly_salary: 50_000.0,
            ..default_args_for_api()
        }
    }

    fn parse_plan(argv: &[&str]) -> Result<PlanArgs, clap::Error> {
        let mut full = vec!["retinvest", "plan"];
        full.extend_from_slice(argv);
        let cli = Cli::try_parse_from(full)?;
        match cli.command {
            Command::Plan(args) => Ok(args),
            other => panic!("expected plan command, got {other:?}"),
        }
    }

    #[test]
    fn build_inputs_converts_percentages_to_fractions() {
        let inputs = build_inputs(sample_args()).expect("valid inputs");
        assert_eq!(inputs.policy, ReturnPolicy::Constant { rate: 0.07 });
        assert_approx(inputs.inflation_rate, 0.03);
        assert_eq!(inputs.retirement_years, 20);
        assert_approx(inputs.years_before_retirement, 10.0);
        assert_eq!(inputs.timing, WithdrawalTiming::StartOfYear);
    }

    #[test]
    fn build_inputs_rejects_negative_retirement_years() {
        let mut args = sample_args();
        args.num_retirement_years = -1;
        let err = build_inputs(args).expect_err("must reject negative years");
        assert_eq!(err, "--num-retirement-years must be >= 0");
    }

    #[test]
    fn build_inputs_caps_retirement_years() {
        let mut args = sample_args();
        args.num_retirement_years = i64::from(MAX_HORIZON_YEARS);
        let inputs = build_inputs(args).expect("cap itself is accepted");
        assert_eq!(inputs.retirement_years, MAX_HORIZON_YEARS);

        let mut args = sample_args();
        args.num_retirement_years = i64::from(MAX_HORIZON_YEARS) + 1;
        let err = build_inputs(args).expect_err("must reject oversized horizon");
        assert_eq!(err, "--num-retirement-years must be <= 1000");

        let mut args = sample_args();
        args.num_retirement_years = i64::MAX;
        let err = build_inputs(args).expect_err("must reject values beyond u32");
        assert!(err.contains("--num-retirement-years"));
    }

    #[test]
    fn sweep_max_years_is_capped() {
        let mut args = sample_args();
        args.sweep_max_years = Some(i64::from(MAX_HORIZON_YEARS) + 1);
        let err = plan_request_from_args(args).expect_err("must reject oversized sweep");
        assert_eq!(err, "--sweep-max-years must be <= 1000");

        let err = api_request_from_json(r#"{"sweepMaxYears": 4294967295}"#)
            .expect_err("must reject huge sweep before computing");
        assert_eq!(err, "sweep-max-years must be <= 1000");

        let mut args = sample_args();
        args.sweep_max_years = Some(0);
        let err = plan_request_from_args(args).expect_err("must reject empty sweep");
        assert_eq!(err, "--sweep-max-years must be >= 1");
    }

    #[test]
    fn build_inputs_rejects_negative_years_before_and_salary() {
        let mut args = sample_args();
        args.num_years_before = -0.5;
        let err = build_inputs(args).expect_err("must reject negative years before");
        assert!(err.contains("--num-years-before"));

        let mut args = sample_args();
        args.yearly_salary = f64::NAN;
        let err = build_inputs(args).expect_err("must reject NaN salary");
        assert!(err.contains("--yearly-salary"));
    }

    #[test]
    fn build_inputs_rejects_non_finite_rates() {
        let mut args = sample_args();
        args.inflation_rate = f64::INFINITY;
        let err = build_inputs(args).expect_err("must reject infinite inflation");
        assert!(err.contains("--inflation-rate"));

        let mut args = sample_args();
        args.aar = Some(f64::NAN);
        let err = build_inputs(args).expect_err("must reject NaN return");
        assert!(err.contains("--aar"));
    }

    #[test]
    fn build_inputs_requires_policy_specific_rates() {
        let mut args = sample_args();
        args.aar = None;
        let err = build_inputs(args).expect_err("constant policy needs --aar");
        assert_eq!(err, "--aar is required with --policy constant");

        let mut args = sample_args();
        args.policy = CliReturnPolicy::GlidePath;
        args.stocks_aar = None;
        let err = build_inputs(args).expect_err("glide path needs --stocks-aar");
        assert!(err.contains("--stocks-aar"));

        let mut args = sample_args();
        args.policy = CliReturnPolicy::GlidePathByAge;
        args.retirement_age = None;
        let err = build_inputs(args).expect_err("age glide path needs --retirement-age");
        assert!(err.contains("--retirement-age"));
    }

    #[test]
    fn build_inputs_accepts_out_of_range_bond_percentage() {
        let mut args = sample_args();
        args.policy = CliReturnPolicy::GlidePath;
        args.initial_bond_percentage = 140.0;
        let inputs = build_inputs(args).expect("clamped per year, not rejected");
        assert!(matches!(
            inputs.policy,
            ReturnPolicy::GlidePathByIncrement {
                initial_bond_percentage,
                ..
            } if initial_bond_percentage == 140.0
        ));
    }

    #[test]
    fn cli_parses_plan_flags() {
        let args = parse_plan(&[
            "-p", "7", "-i", "3", "-N", "20", "-n", "10", "-Y", "50000",
        ])
        .expect("valid flags");
        let request = plan_request_from_args(args).expect("valid request");
        assert_eq!(request.inputs.policy, ReturnPolicy::Constant { rate: 0.07 });
        assert_eq!(request.sweep_max_years, None);
    }

    #[test]
    fn cli_parses_glide_path_flags() {
        let args = parse_plan(&[
            "--policy",
            "glide-path-by-age",
            "-B",
            "3",
            "-S",
            "7",
            "-a",
            "65",
            "-i",
            "2.5",
            "-N",
            "30",
            "-n",
            "0",
            "-Y",
            "40000",
            "--timing",
            "end-of-year",
        ])
        .expect("valid flags");
        let inputs = build_inputs(args).expect("valid inputs");
        assert_eq!(
            inputs.policy,
            ReturnPolicy::GlidePathByAge {
                start_age: 65,
                full_bond_age: 100.0,
                bond_aar: 0.03,
                stock_aar: 0.07,
            }
        );
        assert_eq!(inputs.timing, WithdrawalTiming::EndOfYear);
    }

    #[test]
    fn cli_rejects_missing_required_flag() {
        let err = parse_plan(&["-p", "7", "-i", "3", "-N", "20", "-n", "10"])
            .expect_err("--yearly-salary is required");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn cli_negative_years_reach_validation() {
        let args = parse_plan(&[
            "-p", "7", "-i", "3", "-N", "-5", "-n", "10", "-Y", "50000",
        ])
        .expect("negative numbers parse");
        let err = build_inputs(args).expect_err("must reject negative years");
        assert!(err.contains("--num-retirement-years"));
    }

    #[test]
    fn api_request_from_json_parses_web_keys() {
        let request = api_request_from_json(
            r#"{
                "policy": "glidePath",
                "bondsAar": 3,
                "stocksAar": 7,
                "initialBondPercentage": 60,
                "inflationRate": 2.5,
                "numRetirementYears": 30,
                "numYearsBefore": 5,
                "yearlySalary": 42000,
                "timing": "end",
                "sweepMaxYears": 10
            }"#,
        )
        .expect("valid payload");

        assert_eq!(
            request.inputs.policy,
            ReturnPolicy::GlidePathByIncrement {
                initial_bond_percentage: 60.0,
                bond_aar: 0.03,
                stock_aar: 0.07,
            }
        );
        assert_approx(request.inputs.inflation_rate, 0.025);
        assert_eq!(request.inputs.retirement_years, 30);
        assert_approx(request.inputs.years_before_retirement, 5.0);
        assert_approx(request.inputs.yearly_income, 42_000.0);
        assert_eq!(request.inputs.timing, WithdrawalTiming::EndOfYear);
        assert_eq!(request.sweep_max_years, Some(10));
    }

    #[test]
    fn api_request_uses_defaults_for_missing_keys() {
        let request = api_request_from_json("{}").expect("defaults are valid");
        assert_eq!(request.inputs.policy, ReturnPolicy::Constant { rate: 0.05 });
        assert_eq!(request.inputs.retirement_years, 30);
        assert_approx(request.inputs.inflation_rate, 0.025);
    }

    #[test]
    fn api_request_errors_use_payload_names() {
        let err = api_request_from_json(r#"{"numRetirementYears": -3}"#)
            .expect_err("must reject negative years");
        assert_eq!(err, "num-retirement-years must be >= 0");

        let err = api_request_from_json(r#"{"policy": "nope"}"#).expect_err("unknown policy");
        assert!(err.starts_with("Invalid API JSON payload"));
    }

    #[test]
    fn load_scenario_reads_toml_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("plan.toml");
        fs::write(
            &path,
            r#"
policy = "constant"
aar = 7
inflationRate = 3.0
numRetirementYears = 20
numYearsBefore = 10
yearlySalary = 50000
"#,
        )
        .expect("write scenario");

        let request = load_scenario(&path).expect("valid scenario");
        let outcome = execute_plan(&request).expect("computable plan");
        assert_approx(outcome.result.retirement_saving_factor, 14.264879831735271);
        assert_eq!(
            format_currency(outcome.result.required_savings),
            "$958,540.28"
        );
    }

    #[test]
    fn load_scenario_reports_bad_toml() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("broken.toml");
        fs::write(&path, "numRetirementYears = \"many\"\n").expect("write scenario");
        let err = load_scenario(&path).expect_err("must reject bad scenario");
        assert!(err.starts_with("Invalid scenario file"));

        let missing = dir.path().join("missing.toml");
        let err = load_scenario(&missing).expect_err("must report missing file");
        assert!(err.starts_with("Unable to read scenario"));
    }

    #[test]
    fn format_currency_groups_thousands() {
        assert_eq!(format_currency(958_540.2827622329), "$958,540.28");
        assert_eq!(format_currency(1_234_567.891), "$1,234,567.89");
        assert_eq!(format_currency(999.999), "$1,000.00");
        assert_eq!(format_currency(0.5), "$0.50");
        assert_eq!(format_currency(-1_000.0), "-$1,000.00");
        assert_eq!(format_currency(-0.001), "$0.00");
    }

    #[test]
    fn plan_report_lists_inputs_and_required_savings() {
        let request = plan_request_from_args(sample_args()).expect("valid request");
        let report = render_plan(&request).expect("computable plan");

        assert!(report.contains("constant 7.00% average annual return"));
        assert!(report.contains("yearly inflation rate: 3.00%"));
        assert!(report.contains("20 years of pension"));
        assert!(report.contains("10 years before pension"));
        assert!(report.contains("$50,000.00 yearly income in current currency ($67,195.82 at retirement time)"));
        assert!(report.contains("retirement saving factor: 14.2649"));
        assert!(report.contains("------------------\n$958,540.28\n------------------\n"));
    }

    #[test]
    fn plan_report_appends_horizon_sweep() {
        let mut args = sample_args();
        args.sweep_max_years = Some(3);
        let request = plan_request_from_args(args).expect("valid request");
        let report = render_plan(&request).expect("computable plan");
        let table = report
            .split_once("required savings\n")
            .map(|(_, rows)| rows)
            .expect("sweep table");
        assert_eq!(table.lines().count(), 3);
        assert!(table.lines().next().expect("first row").contains("1.0000"));
    }

    #[test]
    fn zero_growth_year_is_reported_as_division_by_zero() {
        let mut args = sample_args();
        args.aar = Some(-100.0);
        let request = plan_request_from_args(args).expect("validation passes");
        let err = render_plan(&request).expect_err("zero growth factor");
        assert!(err.starts_with("Division by zero"));
    }

    #[test]
    fn plan_response_serializes_camel_case_fields() {
        let mut args = sample_args();
        args.sweep_max_years = Some(2);
        let request = plan_request_from_args(args).expect("valid request");
        let outcome = execute_plan(&request).expect("computable plan");
        let json = serde_json::to_value(build_plan_response(&request, outcome)).expect("json");

        assert_eq!(json["timing"], "start-of-year");
        assert_eq!(json["retirementYears"], 20);
        assert_approx(
            json["retirementSavingFactor"].as_f64().expect("number"),
            14.264879831735271,
        );
        assert_eq!(json["annualReturns"].as_array().expect("array").len(), 20);
        assert_eq!(json["horizonSweep"].as_array().expect("array").len(), 2);
    }

    #[test]
    fn plan_response_omits_empty_sweep() {
        let request = plan_request_from_args(sample_args()).expect("valid request");
        let outcome = execute_plan(&request).expect("computable plan");
        let json = serde_json::to_value(build_plan_response(&request, outcome)).expect("json");
        assert!(json.get("horizonSweep").is_none());
    }

    #[test]
    fn error_response_is_json_and_uncached() {
        let response = error_response(StatusCode::BAD_REQUEST, "bad");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL),
            Some(&header::HeaderValue::from_static("no-store"))
        );
    }

    #[test]
    fn correlation_request_validates_symbols_and_windows() {
        let start = parse_start_date("2000-01-03").expect("valid date");
        let request = build_correlation_request("^GSPC", "AGG", start, 20, 50).expect("valid");
        assert_eq!(request.left, "^GSPC");

        let err = build_correlation_request("../etc/passwd", "AGG", start, 20, 50)
            .expect_err("path-like symbol");
        assert!(err.contains("--symbol1"));

        let err = build_correlation_request("SPY", "AGG", start, 1, 50).expect_err("window");
        assert_eq!(err, "--window must be >= 2");
    }

    #[test]
    fn correlation_query_requires_both_symbols() {
        let err = correlation_request_from_query(CorrelationQuery {
            symbol1: Some("SPY".to_string()),
            ..CorrelationQuery::default()
        })
        .expect_err("missing symbol2");
        assert!(err.contains("symbol2"));

        let request = correlation_request_from_query(CorrelationQuery {
            symbol1: Some("SPY".to_string()),
            symbol2: Some("AGG".to_string()),
            window: Some(10),
            ..CorrelationQuery::default()
        })
        .expect("valid query");
        assert_eq!(request.window, 10);
        assert_eq!(request.averaging_window, DEFAULT_AVERAGING_WINDOW);
        assert_eq!(request.start, parse_start_date(DEFAULT_START_DATE).expect("valid"));
    }

    #[test]
    fn run_correlate_writes_csv_report() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut spy = String::from("Date,Close\n");
        let mut agg = String::from("Date,Close\n");
        for day in 1..=28 {
            spy.push_str(&format!("2021-02-{day:02},{}\n", 100.0 + day as f64));
            agg.push_str(&format!("2021-02-{day:02},{}\n", 50.0 + (day as f64).sqrt()));
        }
        fs::write(dir.path().join("SPY.csv"), spy).expect("write SPY");
        fs::write(dir.path().join("AGG.csv"), agg).expect("write AGG");
        let output = dir.path().join("report.csv");

        run_correlate(CorrelateArgs {
            symbol1: "SPY".to_string(),
            symbol2: "AGG".to_string(),
            data_dir: dir.path().to_path_buf(),
            start_date: parse_start_date("2021-02-01").expect("valid date"),
            window: 5,
            averaging_window: 3,
            value_column: "Close".to_string(),
            output: Some(output.clone()),
        })
        .expect("report written");

        let text = fs::read_to_string(output).expect("read report");
        assert!(text.starts_with(
            "date,growth_SPY,growth_AGG,correlation,correlation_avg,correlation_avg_pos,correlation_avg_neg\n"
        ));
        assert_eq!(text.lines().count(), 29);
    }
}
