//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use gps_ingest::core::config::Config;
use gps_ingest::core::errors::{ErrorClass, IngestError};
use gps_ingest::ingest::coerce::{self, Coerced};
use gps_ingest::logger::EventSink;
use gps_ingest::logger::jsonl::{JsonlConfig, JsonlWriter};
use gps_ingest::pipeline::signals::ShutdownSignal;
use gps_ingest::pipeline::{PipelineRunner, RunLock, RunOutcome, RunRequest, RunStatus, run_daemon};
use gps_ingest::source::SourcePreference;
use gps_ingest::source::fetcher::SourceFetcher;
use gps_ingest::store::{HistoryQuery, PositionStore};

/// GPS telemetry ingestion: poll providers, keep history and latest positions.
#[derive(Debug, Parser)]
#[command(
    name = "gpsi",
    author,
    version,
    about = "GPS telemetry ingestion with provider failover",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Show per-attempt detail on stderr.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Only the summary line and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run one ingestion pass.
    Run(RunArgs),
    /// Run ingestion on a fixed period until SIGTERM/SIGINT.
    Daemon(DaemonArgs),
    /// Show the latest known position per device.
    Latest(LatestArgs),
    /// Query stored position history.
    History(HistoryArgs),
    /// Show recent ingestion runs.
    Runs(RunsArgs),
    /// Inspect configuration.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Which providers may be used.
    #[arg(long, value_name = "auto|primary|secondary", default_value = "auto")]
    source: SourcePreference,
    /// Only fetch this device.
    #[arg(long, value_name = "ID")]
    device_id: Option<i64>,
}

#[derive(Debug, Clone, Args)]
struct DaemonArgs {
    #[command(flatten)]
    run: RunArgs,
    /// Override `schedule.interval_secs`.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Args)]
struct LatestArgs {
    /// Maximum devices to show.
    #[arg(long, value_name = "N")]
    limit: Option<u32>,
}

#[derive(Debug, Clone, Args)]
struct HistoryArgs {
    #[arg(long, value_name = "ID")]
    device_id: Option<i64>,
    /// Only valid (true) or invalid (false) fixes.
    #[arg(long, value_name = "BOOL")]
    valid: Option<bool>,
    /// Earliest fix time (RFC 3339 or `YYYY-MM-DD HH:MM:SS`, UTC).
    #[arg(long, value_name = "TS", value_parser = parse_timestamp)]
    from: Option<DateTime<Utc>>,
    /// Latest fix time.
    #[arg(long, value_name = "TS", value_parser = parse_timestamp)]
    to: Option<DateTime<Utc>>,
    #[arg(long, value_name = "DEG", requires = "max_lat", allow_negative_numbers = true)]
    min_lat: Option<f64>,
    #[arg(long, value_name = "DEG", requires = "min_lat", allow_negative_numbers = true)]
    max_lat: Option<f64>,
    #[arg(long, value_name = "DEG", requires = "max_lng", allow_negative_numbers = true)]
    min_lng: Option<f64>,
    #[arg(long, value_name = "DEG", requires = "min_lng", allow_negative_numbers = true)]
    max_lng: Option<f64>,
    #[arg(long, value_name = "SPEED")]
    speed_min: Option<f64>,
    #[arg(long, value_name = "SPEED")]
    speed_max: Option<f64>,
    /// Page size (1..=2000, default 200).
    #[arg(long, value_name = "N")]
    limit: Option<u32>,
    /// Page number, starting at 1.
    #[arg(long, value_name = "N")]
    page: Option<u32>,
}

#[derive(Debug, Clone, Args)]
struct RunsArgs {
    #[arg(long, value_name = "N", default_value_t = 20)]
    limit: u32,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum ConfigCommand {
    /// Print the config file path in use.
    Path,
    /// Print the effective config with secrets masked.
    Show,
    /// Load and validate the effective config.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Target shell.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Fetch impossible, persistence failure, or environment failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// Some position chunks were committed before a write failed.
    #[error("{0}")]
    Partial(String),
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
            Self::Partial(_) => 4,
        }
    }
}

impl From<IngestError> for CliError {
    fn from(value: IngestError) -> Self {
        if matches!(value, IngestError::PartialWrite { .. }) {
            return Self::Partial(value.to_string());
        }
        class_error(Some(value.class()), value.to_string())
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Run(args) => run_once(cli, args),
        Command::Daemon(args) => run_daemon_cmd(cli, args),
        Command::Latest(args) => run_latest(cli, args),
        Command::History(args) => run_history(cli, args),
        Command::Runs(args) => run_runs(cli, args),
        Command::Config(args) => run_config(cli, args.command),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

// ──────────────────── run / daemon ────────────────────

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Ok(Config::load(cli.config.as_deref())?)
}

fn open_store(config: &Config) -> Result<PositionStore, IngestError> {
    PositionStore::open(
        &config.paths.sqlite_db,
        config.store.chunk_size,
        config.store.latest_policy,
    )
}

fn build_runner(config: &Config) -> Result<PipelineRunner<PositionStore>, IngestError> {
    let fetcher = SourceFetcher::from_config(config)?;
    Ok(PipelineRunner::new(fetcher, open_store(config)?))
}

fn run_request(args: &RunArgs) -> RunRequest {
    RunRequest {
        preference: args.source,
        device_id: args.device_id,
    }
}

fn run_once(cli: &Cli, args: &RunArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let request = run_request(args);
    let mut events = JsonlWriter::open(JsonlConfig::for_path(&config.paths.jsonl_log));

    let outcome = match RunLock::try_acquire(&config.paths.lock_file) {
        Ok(_lock) => match build_runner(&config) {
            Ok(mut runner) => runner.run(request, &mut events),
            Err(err) => setup_failure(request, &err, &mut events),
        },
        Err(err @ IngestError::LockBusy { .. }) => {
            let outcome = RunOutcome::skipped(request, Utc::now(), &err);
            events.emit(&outcome.log_entry());
            outcome
        }
        Err(err) => setup_failure(request, &err, &mut events),
    };

    report_outcome(cli, &outcome)?;
    outcome_result(&outcome)
}

fn setup_failure(request: RunRequest, err: &IngestError, events: &mut dyn EventSink) -> RunOutcome {
    let outcome = RunOutcome::failed(request, Utc::now(), err);
    events.emit(&outcome.log_entry());
    outcome
}

fn outcome_result(outcome: &RunOutcome) -> Result<(), CliError> {
    let message = outcome
        .error_message
        .clone()
        .unwrap_or_else(|| format!("run ended with status {}", outcome.status));
    match outcome.status {
        RunStatus::Success | RunStatus::Skipped => Ok(()),
        RunStatus::Partial => Err(CliError::Partial(message)),
        RunStatus::Failure => Err(class_error(outcome.error_class, message)),
    }
}

fn class_error(class: Option<ErrorClass>, message: String) -> CliError {
    match class {
        Some(ErrorClass::Config) => CliError::User(message),
        Some(ErrorClass::Internal) => CliError::Internal(message),
        Some(ErrorClass::Upstream | ErrorClass::Storage | ErrorClass::Environment) | None => {
            CliError::Runtime(message)
        }
    }
}

fn report_outcome(cli: &Cli, outcome: &RunOutcome) -> Result<(), CliError> {
    if cli.verbose {
        for attempt in &outcome.attempts {
            match (&attempt.records, &attempt.error) {
                (Some(n), _) => eprintln!(
                    "[GPI-FETCH] {} answered with {n} records in {}ms",
                    attempt.source,
                    attempt.elapsed.as_millis()
                ),
                (None, Some(err)) => eprintln!("[GPI-FETCH] {err}"),
                (None, None) => eprintln!("[GPI-FETCH] {} failed", attempt.source),
            }
        }
    }

    match output_mode(cli) {
        OutputMode::Human => {
            println!("{}", outcome.summary_line());
            if !cli.quiet {
                if let Some(err) = &outcome.error_message {
                    let label = match outcome.status {
                        RunStatus::Skipped => "skipped:".yellow(),
                        _ => "error:".red().bold(),
                    };
                    eprintln!("{label} {err}");
                }
            }
        }
        OutputMode::Json => {
            let mut payload = serde_json::to_value(outcome)?;
            if let Value::Object(map) = &mut payload {
                map.insert("summary".to_string(), Value::String(outcome.summary_line()));
            }
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn run_daemon_cmd(cli: &Cli, args: &DaemonArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let request = run_request(&args.run);
    let period = Duration::from_secs(args.interval_secs.unwrap_or(config.schedule.interval_secs));
    let mut runner = build_runner(&config)?;
    let mut events = JsonlWriter::open(JsonlConfig::for_path(&config.paths.jsonl_log));
    let shutdown = ShutdownSignal::install();

    if !cli.quiet && output_mode(cli) == OutputMode::Human {
        eprintln!(
            "gpsi daemon: every {}s, lock {}, log {}",
            period.as_secs(),
            config.paths.lock_file.display(),
            config.paths.jsonl_log.display()
        );
    }

    let mut report_error = None;
    run_daemon(
        &mut runner,
        request,
        &config.paths.lock_file,
        period,
        &mut events,
        || shutdown.should_shutdown(),
        |outcome| {
            if report_error.is_none() {
                if let Err(e) = report_outcome(cli, outcome) {
                    report_error = Some(e);
                }
            }
        },
    );
    report_error.map_or(Ok(()), Err)
}

// ──────────────────── read commands ────────────────────

fn run_latest(cli: &Cli, args: &LatestArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let rows = store.latest_positions(args.limit)?;

    match output_mode(cli) {
        OutputMode::Human => {
            if rows.is_empty() {
                println!("No positions stored yet.");
                return Ok(());
            }
            println!(
                "{}",
                format!(
                    "{:>8}  {:>12}  {:<24}  {:>10}  {:>11}  {:>7}  {}",
                    "device", "position", "fix_time", "lat", "lng", "speed", "valid"
                )
                .bold()
            );
            for row in &rows {
                println!(
                    "{:>8}  {:>12}  {:<24}  {:>10}  {:>11}  {:>7}  {}",
                    row.device_id,
                    row.last_external_id,
                    row.fix_time.as_deref().unwrap_or("-"),
                    fmt_opt(row.latitude, 6),
                    fmt_opt(row.longitude, 6),
                    fmt_opt(row.speed, 1),
                    if row.valid { "yes".green() } else { "no".red() },
                );
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "latest",
                "positions": rows,
            }))?;
        }
    }
    Ok(())
}

fn run_history(cli: &Cli, args: &HistoryArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let query = HistoryQuery {
        device_id: args.device_id,
        valid: args.valid,
        from: args.from,
        to: args.to,
        latitude: args.min_lat.zip(args.max_lat),
        longitude: args.min_lng.zip(args.max_lng),
        speed_min: args.speed_min,
        speed_max: args.speed_max,
        limit: args.limit,
        page: args.page,
    };
    let page = store.history(&query)?;

    match output_mode(cli) {
        OutputMode::Human => {
            for row in &page.data {
                println!(
                    "{:>10}  dev {:>6}  {:<24}  {:>10} {:>11}  speed {:>6}  {}",
                    row.external_id,
                    row.device_id,
                    row.fix_time.as_deref().unwrap_or("-"),
                    fmt_opt(row.latitude, 6),
                    fmt_opt(row.longitude, 6),
                    fmt_opt(row.speed, 1),
                    if row.valid { "valid" } else { "invalid" },
                );
            }
            let meta = page.meta;
            println!(
                "{}",
                format!(
                    "page {}/{} ({} per page, {} total)",
                    meta.current_page, meta.last_page, meta.per_page, meta.total
                )
                .dimmed()
            );
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "history",
                "data": page.data,
                "meta": page.meta,
            }))?;
        }
    }
    Ok(())
}

fn run_runs(cli: &Cli, args: &RunsArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let runs = store.recent_runs(args.limit)?;

    match output_mode(cli) {
        OutputMode::Human => {
            if runs.is_empty() {
                println!("No runs recorded yet.");
            }
            for run in &runs {
                let status = match run.status.as_str() {
                    "success" => run.status.green(),
                    "partial" => run.status.yellow(),
                    _ => run.status.red(),
                };
                println!(
                    "{}  {:<8}  source={:<9} rows={:<6} devices={:<5} discarded={:<4} {}ms{}",
                    run.started_at,
                    status,
                    run.source.as_deref().unwrap_or("none"),
                    run.rows_persisted,
                    run.devices_updated,
                    run.discarded,
                    run.duration_ms,
                    run.error_code
                        .as_deref()
                        .map(|c| format!("  [{c}]"))
                        .unwrap_or_default(),
                );
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "runs",
                "runs": runs,
            }))?;
        }
    }
    Ok(())
}

fn run_config(cli: &Cli, command: ConfigCommand) -> Result<(), CliError> {
    match command {
        ConfigCommand::Path => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();
            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists && !cli.quiet {
                        eprintln!("(file does not exist; defaults and GPI_* env apply)");
                    }
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    }))?;
                }
            }
            Ok(())
        }
        ConfigCommand::Show => {
            let config = load_config(cli)?.redacted();
            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Internal(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config show",
                        "config": config,
                    }))?;
                }
            }
            Ok(())
        }
        ConfigCommand::Validate => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                let caps = config.capabilities();
                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("{}", "Configuration is valid.".green());
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                        println!(
                            "  Providers: primary={} secondary={}",
                            configured_label(caps.primary.configured),
                            configured_label(caps.secondary.configured)
                        );
                    }
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                            "capabilities": caps,
                        }))?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("{} {e}", "Configuration is INVALID:".red().bold());
                    }
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": false,
                            "error_code": e.code(),
                            "error": e.to_string(),
                        }))?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ──────────────────── helpers ────────────────────

const fn configured_label(configured: bool) -> &'static str {
    if configured { "configured" } else { "disabled" }
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.precision$}"))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    match coerce::timestamp(Some(&Value::String(raw.to_string()))) {
        Coerced::Value(ts) => Ok(ts),
        Coerced::Absent => Err("timestamp must not be empty".to_string()),
        Coerced::Invalid(reason) => Err(reason),
    }
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("GPI_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
