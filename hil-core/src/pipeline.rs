//! Build → flash → monitor, one pipeline instance at a time.
//!
//! Each gate either moves the pipeline one state forward or ends it. Failed
//! gates short-circuit through `?` into a [`PipelineError`], which is turned
//! into terminal reporter events and the result code in exactly one place,
//! [`Pipeline::run`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::connection::Connection;
use crate::env::{log_environment, Environment, EnvironmentCapture};
use crate::error::{PipelineError, ResultCode};
use crate::lock::{self, LockDomain, LockRegistry, ResourceLock};
use crate::monitor::{Monitor, MonitorMode, MonitorSession};
use crate::process::ProcessRunner;
use crate::report::{EventKind, EventType, Reporter};
use crate::serial::SerialOpener;
use crate::stages::{self, BuildRequest, DownloadRequest};
use crate::tools;

/// Pipeline states, in the only order they can be visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Init,
    ToolsChecked,
    EnvReady,
    Built,
    ConnLocked,
    PlatformLocked,
    Downloaded,
    PlatformUnlocked,
    Monitored,
    Done,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Init => "init",
            PipelineState::ToolsChecked => "tools_checked",
            PipelineState::EnvReady => "env_ready",
            PipelineState::Built => "built",
            PipelineState::ConnLocked => "conn_locked",
            PipelineState::PlatformLocked => "platform_locked",
            PipelineState::Downloaded => "downloaded",
            PipelineState::PlatformUnlocked => "platform_unlocked",
            PipelineState::Monitored => "monitored",
            PipelineState::Done => "done",
        }
    }

    /// The state a successful gate leads to.
    pub fn next(&self) -> Option<PipelineState> {
        match self {
            PipelineState::Init => Some(PipelineState::ToolsChecked),
            PipelineState::ToolsChecked => Some(PipelineState::EnvReady),
            PipelineState::EnvReady => Some(PipelineState::Built),
            PipelineState::Built => Some(PipelineState::ConnLocked),
            PipelineState::ConnLocked => Some(PipelineState::PlatformLocked),
            PipelineState::PlatformLocked => Some(PipelineState::Downloaded),
            PipelineState::Downloaded => Some(PipelineState::PlatformUnlocked),
            PipelineState::PlatformUnlocked => Some(PipelineState::Monitored),
            PipelineState::Monitored => Some(PipelineState::Done),
            PipelineState::Done => None,
        }
    }

    /// Forward by one, or straight to `Done` from anywhere but `Done`.
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        match self {
            PipelineState::Done => false,
            _ => next == PipelineState::Done || self.next() == Some(next),
        }
    }
}

/// Follows one run through its states.
#[derive(Debug)]
struct StateTracker<'a> {
    state: PipelineState,
    instance: &'a str,
}

impl<'a> StateTracker<'a> {
    fn new(instance: &'a str) -> Self {
        StateTracker {
            state: PipelineState::Init,
            instance,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid pipeline transition {} -> {}",
            self.state.as_str(),
            next.as_str()
        );
        tracing::debug!(
            instance = self.instance,
            from = self.state.as_str(),
            to = next.as_str(),
            "Pipeline state"
        );
        self.state = next;
    }

    fn finish(mut self, result: ResultCode) -> ResultCode {
        tracing::info!(
            instance = self.instance,
            last_state = self.state.as_str(),
            result = result.code(),
            "Pipeline finished"
        );
        self.advance(PipelineState::Done);
        result
    }
}

/// Per-run inputs.
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    /// Test configuration identifier, used to correlate logs and events.
    pub instance: &'a str,
    pub connection: &'a Connection,
    pub clean: bool,
    pub defines: &'a [String],
    /// Root of the firmware source tree.
    pub source_root: &'a Path,
    /// Directory builds and downloads run in.
    pub working_dir: &'a Path,
    /// Where the monitor should append device output, if anywhere.
    pub test_report: Option<&'a Path>,
}

impl<'a> RunRequest<'a> {
    /// The inputs of the build half of this run.
    pub fn firmware(&self) -> FirmwareRequest<'a> {
        FirmwareRequest {
            instance: self.instance,
            clean: self.clean,
            defines: self.defines,
            source_root: self.source_root,
            working_dir: self.working_dir,
        }
    }
}

/// Inputs of a build without a board: tools check, environment, build.
#[derive(Debug, Clone, Copy)]
pub struct FirmwareRequest<'a> {
    pub instance: &'a str,
    pub clean: bool,
    pub defines: &'a [String],
    pub source_root: &'a Path,
    pub working_dir: &'a Path,
}

/// A built image and the environment it was built in.
#[derive(Debug, Clone)]
pub struct Firmware {
    pub env: Environment,
    pub hex_path: PathBuf,
}

/// Run the gates up to `Built` on their own, reporting BUILD events.
pub async fn build_firmware(
    settings: &Settings,
    runner: &dyn ProcessRunner,
    reporter: &dyn Reporter,
    request: &FirmwareRequest<'_>,
) -> Result<Firmware, PipelineError> {
    let mut tracker = StateTracker::new(request.instance);
    build_gates(settings, runner, reporter, request, &mut tracker).await
}

async fn build_gates(
    settings: &Settings,
    runner: &dyn ProcessRunner,
    reporter: &dyn Reporter,
    request: &FirmwareRequest<'_>,
    tracker: &mut StateTracker<'_>,
) -> Result<Firmware, PipelineError> {
    if !tools::check_installation(&settings.tools, runner).await {
        return Err(PipelineError::ToolMissing {
            platform: settings.platform.clone(),
        });
    }
    tracker.advance(PipelineState::ToolsChecked);

    let env = EnvironmentCapture::new(
        runner,
        &settings.toolchain_env_script,
        &settings.shell_env_script,
    )
    .working_dir(request.working_dir)
    .capture()
    .await;
    if env.is_empty() {
        return Err(PipelineError::EnvironmentSetup);
    }
    log_environment(&env);
    tracker.advance(PipelineState::EnvReady);

    reporter.event(EventType::Build, EventKind::Start, Some(&settings.platform));
    let build_started = Instant::now();
    let build_request = BuildRequest {
        clean: request.clean,
        defines: request.defines,
        env: &env,
        source_root: request.source_root,
        working_dir: request.working_dir,
        guard_time: settings.guard_times.build(),
    };
    let hex_path = stages::build(runner, settings, &build_request).await?;
    reporter.event(
        EventType::Build,
        EventKind::Passed,
        Some(&format!(
            "build took {:.0} second(s)",
            build_started.elapsed().as_secs_f64()
        )),
    );
    tracker.advance(PipelineState::Built);

    Ok(Firmware { env, hex_path })
}

/// The pipeline and its collaborators.
pub struct Pipeline {
    settings: Settings,
    runner: Arc<dyn ProcessRunner>,
    locks: Arc<dyn LockRegistry>,
    serial: Arc<dyn SerialOpener>,
    monitor: Arc<dyn Monitor>,
    reporter: Arc<dyn Reporter>,
}

impl Pipeline {
    pub fn new(
        settings: Settings,
        runner: Arc<dyn ProcessRunner>,
        locks: Arc<dyn LockRegistry>,
        serial: Arc<dyn SerialOpener>,
        monitor: Arc<dyn Monitor>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Pipeline {
            settings,
            runner,
            locks,
            serial,
            monitor,
            reporter,
        }
    }

    /// Run one pipeline instance to completion.
    ///
    /// Returns `0` on pass, `1` on build failure, `-1` on an infrastructure
    /// problem, or the monitor's verdict when the board was tested.
    pub async fn run(&self, request: &RunRequest<'_>) -> ResultCode {
        let mut tracker = StateTracker::new(request.instance);
        self.describe(request);

        let result = match self.execute(request, &mut tracker).await {
            Ok(()) => ResultCode::PASS,
            Err(e) => {
                tracing::warn!(instance = request.instance, err = %e, "Pipeline gate failed");
                e.report(self.reporter.as_ref());
                e.result_code()
            }
        };
        tracker.finish(result)
    }

    async fn execute(
        &self,
        request: &RunRequest<'_>,
        tracker: &mut StateTracker<'_>,
    ) -> Result<(), PipelineError> {
        let settings = &self.settings;
        let guard_times = &settings.guard_times;
        let runner = self.runner.as_ref();
        let reporter = self.reporter.as_ref();

        let Firmware { env, hex_path } =
            build_gates(settings, runner, reporter, &request.firmware(), tracker).await?;

        // Held until this function returns, whatever the outcome.
        let connection_lock = self.lookup(LockDomain::Connection, &request.connection.id)?;
        let _connection = lock::acquire(connection_lock.as_ref(), guard_times.connection_lock())
            .await
            .ok_or(PipelineError::LockTimeout {
                domain: LockDomain::Connection,
            })?;
        tracker.advance(PipelineState::ConnLocked);

        let platform_lock = self.lookup(LockDomain::Platform, &settings.platform)?;
        let Some(platform) =
            lock::acquire(platform_lock.as_ref(), guard_times.platform_lock()).await
        else {
            // Never acquired, so this is a no-op; kept so every path out of
            // the platform gate releases.
            platform_lock.release();
            return Err(PipelineError::LockTimeout {
                domain: LockDomain::Platform,
            });
        };
        tracker.advance(PipelineState::PlatformLocked);

        reporter.event(EventType::Download, EventKind::Start, None);
        let download_request = DownloadRequest {
            connection: request.connection,
            hex_path: &hex_path,
            env: &env,
            working_dir: request.working_dir,
            guard_time: guard_times.download(),
        };
        if !stages::download(runner, settings, &download_request).await {
            return Err(PipelineError::Download);
        }
        reporter.event(EventType::Download, EventKind::Complete, None);
        tracker.advance(PipelineState::Downloaded);

        // Once flashed, other pipelines may use the flashing subsystem while
        // this one monitors its own board.
        platform.release();
        tracker.advance(PipelineState::PlatformUnlocked);

        reporter.event(EventType::Test, EventKind::Start, None);
        let port = &request.connection.serial_port;
        let serial = self
            .serial
            .open(port, settings.serial_baud)
            .ok_or_else(|| PipelineError::SerialOpen { port: port.clone() })?;
        let session = MonitorSession {
            mode: MonitorMode::Serial,
            run_guard_time: guard_times.run(),
            inactivity_guard_time: guard_times.run_inactivity(),
            instance: request.instance,
            reporter,
            test_report: request.test_report,
        };
        let verdict = self.monitor.run(serial, session).await;
        tracker.advance(PipelineState::Monitored);

        if verdict != 0 {
            return Err(PipelineError::Test { verdict });
        }
        reporter.event(EventType::Test, EventKind::Complete, None);
        Ok(())
    }

    /// Look up a lock handle; a bad identity counts as failing to lock.
    fn lookup(&self, domain: LockDomain, id: &str) -> Result<Box<dyn ResourceLock>, PipelineError> {
        let found = match domain {
            LockDomain::Connection => self.locks.connection_lock(id),
            LockDomain::Platform => self.locks.platform_lock(id),
        };
        found.map_err(|e| {
            tracing::error!(domain = domain.as_str(), id, err = %e, "Lock lookup failed");
            PipelineError::LockTimeout { domain }
        })
    }

    fn describe(&self, request: &RunRequest<'_>) {
        let mut text = format!("running {}", self.settings.platform);
        if let Some(snr) = request.connection.debugger() {
            text.push_str(&format!(", on debugger serial number {}", snr));
        }
        if request.clean {
            text.push_str(", clean build");
        }
        if !request.defines.is_empty() {
            let defines = request
                .defines
                .iter()
                .map(|define| format!("\"{}\"", define))
                .collect::<Vec<_>>()
                .join(", ");
            text.push_str(&format!(", with #define(s) {}", defines));
        }
        text.push_str(&format!(
            ", source root \"{}\", working directory \"{}\"",
            request.source_root.display(),
            request.working_dir.display()
        ));
        tracing::info!(instance = request.instance, "{}.", text);
    }
}
