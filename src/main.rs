//! capstream command line.
//!
//! Resolves an outfit, runs the capture pipeline over a time window and writes
//! the attributed captures as JSON, optionally followed by a per-character
//! table.
//!
//! ## Configuration
//!
//! - `config/capstream.toml` or the file named by `CAPSTREAM_CONFIG` / `--config`
//! - `RUST_LOG`: Logging filter (default: "info")
//!
//! Logs and progress go to stderr so stdout can carry the JSON.

use capstream::census::HttpQueryService;
use capstream::config::{CapstreamConfig, ConfigError};
use capstream::pipeline::{
    CapturePipeline, CaptureWindow, PipelineError, ProgressCallback, ProgressUpdate,
};
use capstream::report;
use capstream::resolve::{ResolveError, RosterResolver};
use capstream::shutdown::ShutdownSignal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{CommandFactory, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{self, BufRead, BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "capstream")]
#[command(about = "Build a facility capture leaderboard for an outfit", long_about = None)]
struct Cli {
    /// Your service ID without the s: prefix
    service_id: String,

    /// The tag of the outfit whose captures you want to search for
    outfit_tag: String,

    /// The start of the search period (ISO 8601 date or date/time, UTC if no offset)
    #[arg(value_parser = parse_datetime)]
    start_date: DateTime<Utc>,

    /// The end of the search period. If omitted, the current time is used.
    #[arg(value_parser = parse_datetime)]
    end_date: Option<DateTime<Utc>>,

    /// The JSON output path. You must specify this if you do not redirect standard output.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Display a table of the aggregated base captures per person
    #[arg(short, long)]
    table: bool,

    /// World (server) id to search
    #[arg(long)]
    world: Option<u32>,

    /// Correlation queries in flight at once
    #[arg(long)]
    parallelism: Option<usize>,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),

    #[error("failed to serialize output: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("start date {start} must be before end date {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Accepts RFC 3339, a naive date/time (taken as UTC) or a bare date.
fn parse_datetime(input: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(input) {
        return Ok(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Ok(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("'{input}' is not an ISO 8601 date or date/time"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn,hyper_util=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn spinner(message: &'static str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

fn download_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("Downloading capture events [{elapsed_precise}] {bar:40.blue/white} {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    bar.enable_steady_tick(Duration::from_millis(50));
    bar
}

/// Ask on stderr whether `path` may be replaced. Anything but "y"/"yes" declines.
fn confirm_overwrite(path: &Path) -> io::Result<bool> {
    eprint!("The path '{}' already exists. Overwrite? [y/N] ", path.display());
    io::stderr().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

async fn run(cli: Cli, shutdown: &ShutdownSignal) -> Result<ExitCode, CliError> {
    if let Some(path) = &cli.output {
        if path.exists() && !confirm_overwrite(path)? {
            return Ok(ExitCode::from(1));
        }
    }

    let start = cli.start_date;
    let end = cli.end_date.unwrap_or_else(Utc::now);
    if start >= end {
        return Err(CliError::InvalidWindow { start, end });
    }

    let config = match &cli.config {
        Some(path) => CapstreamConfig::load_from(path)?,
        None => CapstreamConfig::load()?,
    };

    let mut settings = config.pipeline.settings();
    if let Some(parallelism) = cli.parallelism {
        settings.correlator_parallelism = parallelism.max(1);
    }
    let window = CaptureWindow {
        world_id: cli.world.unwrap_or(config.pipeline.world_id),
        start,
        end,
    };
    let retry = config.retry.policy();

    let census = Arc::new(
        HttpQueryService::new(&config.census.root_endpoint, &cli.service_id)
            .with_namespace(&config.census.namespace)
            .with_timeout(config.census.timeout()),
    );

    let resolving = spinner("Retrieving outfit members");
    let roster = RosterResolver::new(census.clone(), retry)
        .with_cancellation(shutdown.token())
        .resolve(&cli.outfit_tag)
        .await;
    resolving.finish_and_clear();
    let roster = Arc::new(roster?);

    let bar = download_bar();
    let processing: Arc<OnceLock<ProgressBar>> = Arc::new(OnceLock::new());

    let progress: ProgressCallback = {
        let bar = bar.clone();
        let processing = processing.clone();
        Arc::new(move |update: ProgressUpdate| {
            if update.post_processing {
                processing.get_or_init(|| {
                    bar.finish_and_clear();
                    spinner("Processing capture events")
                });
                return;
            }

            bar.set_position(update.percentage.round() as u64);
            if let Some(timestamp) = update.current_timestamp {
                bar.set_message(timestamp.format("%Y-%m-%d %H:%M").to_string());
            }
        })
    };

    let result = CapturePipeline::new(census, retry)
        .with_settings(settings)
        .run(roster, window, progress, shutdown.token())
        .await;

    bar.finish_and_clear();
    if let Some(spinner) = processing.get() {
        spinner.finish_and_clear();
    }
    let records = result?;

    if shutdown.is_shutdown() {
        warn!(
            records = records.len(),
            "Run was interrupted, writing partial results"
        );
    }

    match &cli.output {
        Some(path) => {
            report::write_json(&records, BufWriter::new(File::create(path)?))?;
            info!(path = %path.display(), records = records.len(), "Results written");
        }
        None => report::write_json(&records, io::stdout().lock())?,
    }

    if cli.table {
        let table = report::render_table(&report::summarize(&records));
        if cli.output.is_some() {
            print!("{table}");
        } else {
            eprint!("{table}");
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    if cli.output.is_none() && !cli.table && io::stdout().is_terminal() {
        Cli::command()
            .error(
                clap::error::ErrorKind::MissingRequiredArgument,
                "If you do not redirect the standard output, you must specify an output file with -o/--output or display a results table with -t/--table.",
            )
            .exit();
    }

    let shutdown = ShutdownSignal::new();
    let listener = shutdown.listen();

    let code = match run(cli, &shutdown).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "capstream failed");
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    };

    listener.abort();
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_datetime_formats() {
        let expected = DateTime::parse_from_rfc3339("2024-03-01T12:30:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(parse_datetime("2024-03-01T12:30:00Z").unwrap(), expected);
        assert_eq!(parse_datetime("2024-03-01T14:30:00+02:00").unwrap(), expected);
        assert_eq!(parse_datetime("2024-03-01T12:30:00").unwrap(), expected);
        assert_eq!(parse_datetime("2024-03-01 12:30:00").unwrap(), expected);
        assert_eq!(parse_datetime("2024-03-01T12:30").unwrap(), expected);
        assert_eq!(
            parse_datetime("2024-03-01").unwrap().to_rfc3339(),
            "2024-03-01T00:00:00+00:00"
        );
    }

    #[test]
    fn test_parse_datetime_rejects_garbage() {
        assert!(parse_datetime("yesterday").is_err());
        assert!(parse_datetime("2024-13-01").is_err());
    }

    #[test]
    fn test_cli_parses_positionals_and_flags() {
        let cli = Cli::try_parse_from([
            "capstream",
            "example",
            "TEST",
            "2024-03-01",
            "2024-03-02",
            "-o",
            "out.json",
            "-t",
            "--world",
            "1",
            "--parallelism",
            "8",
        ])
        .unwrap();

        assert_eq!(cli.service_id, "example");
        assert_eq!(cli.outfit_tag, "TEST");
        assert!(cli.end_date.is_some());
        assert_eq!(cli.output, Some(PathBuf::from("out.json")));
        assert!(cli.table);
        assert_eq!(cli.world, Some(1));
        assert_eq!(cli.parallelism, Some(8));
    }

    #[test]
    fn test_cli_end_date_is_optional() {
        let cli = Cli::try_parse_from(["capstream", "example", "TEST", "2024-03-01"]).unwrap();
        assert!(cli.end_date.is_none());
        assert!(cli.output.is_none());
        assert!(!cli.table);
    }

    #[test]
    fn test_cli_verifies() {
        Cli::command().debug_assert();
    }
}
