//! Error taxonomy for the pipeline.
//!
//! Every failure a gate can observe is a [`PipelineError`]. The orchestrator
//! converts it into terminal reporter events and a result code; nothing is
//! propagated further than that.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::lock::LockDomain;
use crate::report::{EventKind, EventType, Reporter};

/// Integer outcome of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const PASS: ResultCode = ResultCode(0);
    pub const FAILURE: ResultCode = ResultCode(1);
    pub const INFRASTRUCTURE: ResultCode = ResultCode(-1);

    pub fn code(&self) -> i32 {
        self.0
    }

    /// Process exit status for this result. The OS keeps only the low
    /// eight bits, so a nonzero code that would wrap to `0` becomes `1`.
    pub fn exit_code(&self) -> i32 {
        match self.0 {
            code if code != 0 && code & 0xff == 0 => 1,
            code => code,
        }
    }
}

/// Why the build stage produced no artifact.
#[derive(Error, Debug)]
pub enum BuildFailure {
    #[error("unable to clean build directory {}: {source}", .dir.display())]
    Clean {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Nonzero exit, spawn failure or guard-time expiry of the builder.
    #[error("builder failed or exceeded its guard time")]
    Builder,
}

/// A failed pipeline gate.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("there is a problem with the tools installation for {platform}")]
    ToolMissing { platform: String },

    #[error("environment setup failed")]
    EnvironmentSetup,

    #[error("build failed: {0}")]
    Build(#[from] BuildFailure),

    #[error("{}", lock_timeout_text(.domain))]
    LockTimeout { domain: LockDomain },

    #[error("download failed")]
    Download,

    #[error("unable to open serial port {port}")]
    SerialOpen { port: String },

    #[error("test failed with verdict {verdict}")]
    Test { verdict: i32 },
}

fn lock_timeout_text(domain: &LockDomain) -> &'static str {
    match domain {
        LockDomain::Connection => "unable to lock a connection",
        LockDomain::Platform => "unable to lock the platform",
    }
}

impl PipelineError {
    /// Result-code class of this failure.
    pub fn result_code(&self) -> ResultCode {
        match self {
            PipelineError::Build(_) => ResultCode::FAILURE,
            PipelineError::Test { verdict } => ResultCode(*verdict),
            PipelineError::ToolMissing { .. }
            | PipelineError::EnvironmentSetup
            | PipelineError::LockTimeout { .. }
            | PipelineError::Download
            | PipelineError::SerialOpen { .. } => ResultCode::INFRASTRUCTURE,
        }
    }

    /// Emit the terminal events for the gate that failed.
    ///
    /// A failure after TEST START also closes the test stage so that no
    /// started stage is left without a terminal event.
    pub fn report(&self, reporter: &dyn Reporter) {
        match self {
            PipelineError::ToolMissing { .. }
            | PipelineError::EnvironmentSetup
            | PipelineError::LockTimeout { .. } => {
                reporter.event(
                    EventType::Infrastructure,
                    EventKind::Failed,
                    Some(&self.to_string()),
                );
            }
            PipelineError::Build(BuildFailure::Clean { .. }) => {
                reporter.event(
                    EventType::Build,
                    EventKind::Failed,
                    Some("unable to clean build directory"),
                );
            }
            PipelineError::Build(BuildFailure::Builder) => {
                reporter.event(
                    EventType::Build,
                    EventKind::Failed,
                    Some("check debug log for details"),
                );
            }
            PipelineError::Download => {
                reporter.event(
                    EventType::Download,
                    EventKind::Failed,
                    Some("check debug log for details"),
                );
            }
            PipelineError::SerialOpen { .. } => {
                reporter.event(
                    EventType::Infrastructure,
                    EventKind::Failed,
                    Some(&self.to_string()),
                );
                reporter.event(EventType::Test, EventKind::Failed, None);
            }
            PipelineError::Test { .. } => {
                reporter.event(EventType::Test, EventKind::Failed, None);
            }
        }
    }
}

/// Errors loading [`Settings`](crate::config::Settings).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read settings file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid settings in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
