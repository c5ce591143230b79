//! Hardware-in-the-loop firmware pipeline.
//!
//! Builds a firmware image, flashes it onto a physically attached board and
//! watches the board's serial output for a verdict, while sharing debug
//! probes, boards and the flashing subsystem with every other pipeline
//! running in the lab.
//!
//! Modules, leaves first:
//! - **process**: external commands bounded by a guard time
//! - **env**: environment snapshots and the retrying two-stage capture
//! - **tools**: installation check
//! - **stages**: build and download
//! - **lock**: connection and platform lock domains
//! - **serial** / **monitor**: serial port and verdict collaborators
//! - **report**: event stream
//! - **pipeline**: the state machine tying it all together

pub mod config;
pub mod connection;
pub mod env;
pub mod error;
pub mod lock;
pub mod monitor;
pub mod pipeline;
pub mod process;
pub mod report;
pub mod serial;
pub mod stages;
pub mod tools;

pub use config::{GuardTimes, Settings};
pub use connection::Connection;
pub use env::{Environment, EnvironmentCapture, CAPTURE_ATTEMPTS};
pub use error::{BuildFailure, ConfigError, PipelineError, ResultCode};
pub use lock::{
    FileLock, FileLockRegistry, LockDomain, LockError, LockGuard, LockRegistry, ResourceLock,
};
pub use monitor::{Monitor, MonitorMode, MonitorSession, PatternMonitor};
pub use pipeline::{
    build_firmware, Firmware, FirmwareRequest, Pipeline, PipelineState, RunRequest,
};
pub use process::{Invocation, ProcessRunner, RunOutcome, ShellRunner};
pub use report::{Event, EventKind, EventLog, EventType, Reporter};
pub use serial::{SerialHandle, SerialOpener, TtyOpener, DEFAULT_BAUD};
pub use tools::ToolSpec;
