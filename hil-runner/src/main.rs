use anyhow::{Context, Result};
use clap::Parser;
use hil_core::{
    Connection, Event, EventLog, FileLockRegistry, PatternMonitor, Pipeline, RunRequest, Settings,
    ShellRunner, TtyOpener,
};
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hil-runner", about = "Build, flash and test firmware on an attached board")]
struct Cli {
    /// Settings file (JSON); built-in defaults are used when absent
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Test instance, used to tag logs and events
    #[arg(short, long, default_value = "0")]
    instance: String,

    /// Connection (board plus debug probe) to test on
    #[arg(short, long)]
    connection: String,

    /// Serial port the board prints on
    #[arg(short = 'p', long)]
    serial_port: String,

    /// Serial number of the debug probe
    #[arg(short, long)]
    debugger: Option<String>,

    /// Clean build (remove the build directory first)
    #[arg(long)]
    clean: bool,

    /// Preprocessor define passed to the build, may be repeated
    #[arg(short = 'D', long = "define")]
    defines: Vec<String>,

    /// Root of the firmware source tree
    #[arg(long, default_value = ".")]
    source_root: PathBuf,

    /// Directory to build in
    #[arg(short, long, default_value = ".")]
    working_dir: PathBuf,

    /// Serial output that means the tests passed (regex)
    #[arg(short, long, default_value = r"\d+ Tests 0 Failures")]
    expect: String,

    /// Serial output that means the tests failed (regex)
    #[arg(long)]
    fail: Option<String>,

    /// File to append the board's serial output to
    #[arg(long)]
    test_report: Option<PathBuf>,

    /// Print a JSON summary on stdout when done
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Summary<'a> {
    instance: &'a str,
    connection: &'a Connection,
    result: i32,
    events: Vec<Event>,
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    match path {
        Some(path) => Settings::load(path).context("loading settings"),
        None => Ok(Settings::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout is reserved for the --json summary.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let settings = load_settings(cli.settings.as_ref())?;
    let mut monitor = PatternMonitor::new(Regex::new(&cli.expect).context("invalid --expect")?);
    if let Some(fail) = &cli.fail {
        monitor = monitor.with_fail_pattern(Regex::new(fail).context("invalid --fail")?);
    }

    let mut connection = Connection::new(&cli.connection, &cli.serial_port);
    if let Some(debugger) = &cli.debugger {
        connection = connection.with_debugger(debugger);
    }

    tracing::info!(
        instance = %cli.instance,
        platform = %settings.platform,
        connection = %connection.id,
        lock_dir = %settings.lock_dir.display(),
        "Starting pipeline"
    );

    let events = EventLog::for_instance(&cli.instance);
    let locks = FileLockRegistry::new(&settings.lock_dir);
    let pipeline = Pipeline::new(
        settings,
        Arc::new(ShellRunner::new()),
        Arc::new(locks),
        Arc::new(TtyOpener),
        Arc::new(monitor),
        Arc::new(events.clone()),
    );

    let request = RunRequest {
        instance: &cli.instance,
        connection: &connection,
        clean: cli.clean,
        defines: &cli.defines,
        source_root: &cli.source_root,
        working_dir: &cli.working_dir,
        test_report: cli.test_report.as_deref(),
    };
    let result = pipeline.run(&request).await;
    let dangling = events.dangling();
    if !dangling.is_empty() {
        tracing::error!(?dangling, "Stages left without a terminal event");
    }

    if cli.json {
        let summary = Summary {
            instance: &cli.instance,
            connection: &connection,
            result: result.code(),
            events: events.events(),
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    std::process::exit(result.exit_code());
}
