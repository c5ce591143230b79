use anyhow::{Context, Result};
use clap::Parser;
use hil_core::{build_firmware, EventLog, FirmwareRequest, Settings, ShellRunner};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "firmware-builder", about = "Build a firmware image for a HIL platform")]
struct Cli {
    /// Settings file (JSON); built-in defaults are used when absent
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Root of the firmware source tree
    #[arg(long, default_value = ".")]
    source_root: PathBuf,

    /// Directory to build in
    #[arg(short, long, default_value = ".")]
    working_dir: PathBuf,

    /// Preprocessor define passed to the build, may be repeated
    #[arg(short = 'D', long = "define")]
    defines: Vec<String>,

    /// Clean build (remove the build directory first)
    #[arg(long)]
    clean: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries only the path of the built image.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => Settings::load(path).context("loading settings")?,
        None => Settings::default(),
    };

    tracing::info!(
        platform = %settings.platform,
        board = %settings.board,
        source_root = %cli.source_root.display(),
        "Starting firmware build"
    );

    let events = EventLog::new();
    let request = FirmwareRequest {
        instance: "build",
        clean: cli.clean,
        defines: &cli.defines,
        source_root: &cli.source_root,
        working_dir: &cli.working_dir,
    };
    match build_firmware(&settings, &ShellRunner::new(), &events, &request).await {
        Ok(firmware) => {
            println!("{}", firmware.hex_path.display());
            Ok(())
        }
        Err(e) => {
            e.report(&events);
            tracing::error!(err = %e, "Firmware build failed");
            std::process::exit(e.result_code().exit_code());
        }
    }
}
