//! Watching the board's output for a verdict.
//!
//! Device test protocols are the monitor's business, not the pipeline's:
//! the pipeline hands over an open serial handle and takes back an integer
//! verdict, `0` meaning pass.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::Instant;

use crate::report::{EventKind, EventType, Reporter};
use crate::serial::SerialHandle;

/// How the monitored output reaches us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    Serial,
}

/// Everything a monitor gets besides the handle itself.
#[derive(Clone, Copy)]
pub struct MonitorSession<'a> {
    pub mode: MonitorMode,
    /// Total time the run may take.
    pub run_guard_time: Duration,
    /// Longest silence tolerated on the handle.
    pub inactivity_guard_time: Duration,
    pub instance: &'a str,
    pub reporter: &'a dyn Reporter,
    /// File the raw device output is appended to, if any.
    pub test_report: Option<&'a Path>,
}

#[async_trait]
pub trait Monitor: Send + Sync {
    /// Consume the handle and return a verdict (`0` = pass).
    async fn run(&self, serial: SerialHandle, session: MonitorSession<'_>) -> i32;
}

/// Passes when a line matches `pass`, fails on a `fail` match, on either
/// guard time expiring or on end of output.
#[derive(Debug, Clone)]
pub struct PatternMonitor {
    pass: Regex,
    fail: Option<Regex>,
}

impl PatternMonitor {
    pub fn new(pass: Regex) -> Self {
        PatternMonitor { pass, fail: None }
    }

    pub fn with_fail_pattern(mut self, fail: Regex) -> Self {
        self.fail = Some(fail);
        self
    }

    async fn open_report(path: Option<&Path>) -> Option<tokio::fs::File> {
        let path = path?;
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
        {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!(path = %path.display(), err = %e, "Unable to open test report");
                None
            }
        }
    }
}

#[async_trait]
impl Monitor for PatternMonitor {
    async fn run(&self, serial: SerialHandle, session: MonitorSession<'_>) -> i32 {
        let instance = session.instance;
        let mut report = Self::open_report(session.test_report).await;
        let mut lines = BufReader::new(serial).lines();
        let deadline = Instant::now() + session.run_guard_time;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(instance, "Run guard time expired");
                session.reporter.event(
                    EventType::Test,
                    EventKind::Error,
                    Some("run guard time expired"),
                );
                return 1;
            }
            let wait = remaining.min(session.inactivity_guard_time);

            let line = match tokio::time::timeout(wait, lines.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    tracing::warn!(instance, "Serial output ended without a verdict");
                    return 1;
                }
                Ok(Err(e)) => {
                    tracing::error!(instance, err = %e, "Serial read failed");
                    return 1;
                }
                Err(_) if wait < session.inactivity_guard_time => continue,
                Err(_) => {
                    tracing::warn!(
                        instance,
                        inactivity_secs = session.inactivity_guard_time.as_secs(),
                        "No output within the inactivity guard time"
                    );
                    session.reporter.event(
                        EventType::Test,
                        EventKind::Error,
                        Some("inactivity guard time expired"),
                    );
                    return 1;
                }
            };

            tracing::info!(instance, "{}", line);
            if let Some(file) = report.as_mut() {
                let written = match file.write_all(format!("{}\n", line).as_bytes()).await {
                    Ok(()) => file.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    tracing::warn!(err = %e, "Unable to append to test report");
                    report = None;
                }
            }

            if self.pass.is_match(&line) {
                return 0;
            }
            if self.fail.as_ref().is_some_and(|fail| fail.is_match(&line)) {
                return 1;
            }
        }
    }
}
