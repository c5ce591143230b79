//! Flashing the built image onto the board.

use std::path::Path;
use std::time::Duration;

use crate::config::Settings;
use crate::connection::Connection;
use crate::env::Environment;
use crate::process::{Invocation, ProcessRunner};

#[derive(Debug, Clone, Copy)]
pub struct DownloadRequest<'a> {
    pub connection: &'a Connection,
    pub hex_path: &'a Path,
    pub env: &'a Environment,
    pub working_dir: &'a Path,
    pub guard_time: Duration,
}

/// Flash `hex_path` onto the board of the connection. Returns `true` on
/// success within the guard time.
pub async fn download(
    runner: &dyn ProcessRunner,
    settings: &Settings,
    request: &DownloadRequest<'_>,
) -> bool {
    let invocation = Invocation::new(flash_args(settings, request.connection, request.hex_path))
        .shell()
        .env(request.env.clone())
        .working_dir(request.working_dir)
        .guard_time(request.guard_time);
    runner.run(&invocation).await.success
}

/// `west flash --skip-rebuild --nrf-family=<family> --hex-file <hex> --erase [--snr <n>]`
pub fn flash_args(settings: &Settings, connection: &Connection, hex_path: &Path) -> Vec<String> {
    let mut args = vec![
        settings.builder.clone(),
        "flash".to_string(),
        "--skip-rebuild".to_string(),
        format!("--nrf-family={}", settings.device_family),
        "--hex-file".to_string(),
        hex_path.to_string_lossy().into_owned(),
        "--erase".to_string(),
    ];
    if let Some(snr) = connection.debugger() {
        args.push("--snr".to_string());
        args.push(snr.to_string());
    }
    args
}
