//! Fake collaborators for pipeline tests.
//!
//! Every fake writes into one shared [`Journal`], so tests can assert on the
//! relative order of process calls, lock operations, monitor runs and
//! reporter events.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hil_core::{
    Environment, EventKind, EventType, Invocation, LockDomain, LockError, LockRegistry, Monitor,
    MonitorSession, ProcessRunner, Reporter, ResourceLock, RunOutcome, SerialHandle,
    SerialOpener, Settings,
};
use tokio::sync::Notify;

pub const TOOLCHAIN_SCRIPT: &str = "toolchain-env.sh";
pub const SHELL_SCRIPT: &str = "shell-env.sh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Run { argv: Vec<String>, env: Environment },
    Acquire(LockDomain),
    AcquireFailed(LockDomain),
    Release { domain: LockDomain, was_held: bool },
    SerialOpen(String),
    Monitor,
    Event(EventType, EventKind, Option<String>),
}

#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Entry>>>);

impl Journal {
    pub fn push(&self, entry: Entry) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.0.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<(EventType, EventKind, Option<String>)> {
        self.entries()
            .into_iter()
            .filter_map(|entry| match entry {
                Entry::Event(t, k, d) => Some((t, k, d)),
                _ => None,
            })
            .collect()
    }

    pub fn event_types_and_kinds(&self) -> Vec<(EventType, EventKind)> {
        self.events().into_iter().map(|(t, k, _)| (t, k)).collect()
    }

    pub fn position(&self, wanted: &Entry) -> Option<usize> {
        self.entries().iter().position(|entry| entry == wanted)
    }

    pub fn count(&self, pred: impl Fn(&Entry) -> bool) -> usize {
        self.entries().iter().filter(|entry| pred(entry)).count()
    }

    /// Calls whose first argument is `program`.
    pub fn runs_of(&self, program: &str) -> Vec<(Vec<String>, Environment)> {
        self.entries()
            .into_iter()
            .filter_map(|entry| match entry {
                Entry::Run { argv, env } if argv.first().map(String::as_str) == Some(program) => {
                    Some((argv, env))
                }
                _ => None,
            })
            .collect()
    }

    pub fn lock_entries(&self) -> Vec<Entry> {
        self.entries()
            .into_iter()
            .filter(|entry| {
                matches!(
                    entry,
                    Entry::Acquire(_) | Entry::AcquireFailed(_) | Entry::Release { .. }
                )
            })
            .collect()
    }

    /// Started stages without a terminal event.
    pub fn dangling(&self) -> Vec<EventType> {
        let mut open = Vec::new();
        for (event_type, kind, _) in self.events() {
            if kind == EventKind::Start {
                open.push(event_type);
            } else if kind.is_terminal() {
                if let Some(pos) = open.iter().position(|t| *t == event_type) {
                    open.remove(pos);
                }
            }
        }
        open
    }
}

pub struct JournalReporter(pub Journal);

impl Reporter for JournalReporter {
    fn event(&self, event_type: EventType, kind: EventKind, detail: Option<&str>) {
        self.0
            .push(Entry::Event(event_type, kind, detail.map(str::to_string)));
    }
}

/// Process runner answering from a script instead of running anything.
pub struct ScriptedRunner {
    journal: Journal,
    toolchain: Mutex<VecDeque<Environment>>,
    shell: Mutex<VecDeque<Environment>>,
    pub build_ok: bool,
    pub download_ok: bool,
}

impl ScriptedRunner {
    pub fn new(journal: Journal) -> Self {
        ScriptedRunner {
            journal,
            toolchain: Mutex::new(VecDeque::from([toolchain_env()])),
            shell: Mutex::new(VecDeque::from([shell_env()])),
            build_ok: true,
            download_ok: true,
        }
    }

    /// Captures handed out by the toolchain script, one per attempt. Once the
    /// queue is empty every further attempt captures nothing.
    pub fn toolchain_captures(self, captures: Vec<Environment>) -> Self {
        *self.toolchain.lock().unwrap() = captures.into();
        self
    }

    pub fn shell_captures(self, captures: Vec<Environment>) -> Self {
        *self.shell.lock().unwrap() = captures.into();
        self
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> RunOutcome {
        self.journal.push(Entry::Run {
            argv: invocation.argv.clone(),
            env: invocation.env.clone(),
        });

        let first = invocation.argv.first().map(String::as_str).unwrap_or("");
        if invocation.capture_env {
            let queue = if first == TOOLCHAIN_SCRIPT {
                &self.toolchain
            } else {
                &self.shell
            };
            let captured_env = queue.lock().unwrap().pop_front().unwrap_or_default();
            return RunOutcome {
                success: !captured_env.is_empty(),
                captured_env,
            };
        }

        let ok = match invocation.argv.get(1).map(String::as_str) {
            Some("flash") => self.download_ok,
            Some("-v") => self.build_ok,
            _ => true,
        };
        if ok {
            RunOutcome::succeeded()
        } else {
            RunOutcome::failed()
        }
    }
}

pub fn toolchain_env() -> Environment {
    [("ZEPHYR_BASE", "/opt/ncs/zephyr"), ("PATH", "/opt/ncs/bin")]
        .into_iter()
        .collect()
}

pub fn shell_env() -> Environment {
    [("PATH", "/usr/bin"), ("HOME", "/home/ci")]
        .into_iter()
        .collect()
}

/// Lock registry whose locks succeed or time out as configured.
pub struct FakeLocks {
    journal: Journal,
    pub connection_ok: bool,
    pub platform_ok: bool,
}

impl FakeLocks {
    pub fn new(journal: Journal) -> Self {
        FakeLocks {
            journal,
            connection_ok: true,
            platform_ok: true,
        }
    }
}

impl LockRegistry for FakeLocks {
    fn connection_lock(&self, connection: &str) -> Result<Box<dyn ResourceLock>, LockError> {
        Ok(Box::new(FakeLock {
            domain: LockDomain::Connection,
            resource: connection.to_string(),
            ok: self.connection_ok,
            held: AtomicBool::new(false),
            journal: self.journal.clone(),
        }))
    }

    fn platform_lock(&self, platform: &str) -> Result<Box<dyn ResourceLock>, LockError> {
        Ok(Box::new(FakeLock {
            domain: LockDomain::Platform,
            resource: platform.to_string(),
            ok: self.platform_ok,
            held: AtomicBool::new(false),
            journal: self.journal.clone(),
        }))
    }
}

pub struct FakeLock {
    domain: LockDomain,
    resource: String,
    ok: bool,
    held: AtomicBool,
    journal: Journal,
}

#[async_trait]
impl ResourceLock for FakeLock {
    fn domain(&self) -> LockDomain {
        self.domain
    }

    fn resource(&self) -> &str {
        &self.resource
    }

    async fn try_acquire(&self, _guard_time: Duration) -> bool {
        if self.ok {
            self.held.store(true, Ordering::SeqCst);
            self.journal.push(Entry::Acquire(self.domain));
        } else {
            self.journal.push(Entry::AcquireFailed(self.domain));
        }
        self.ok
    }

    fn release(&self) {
        let was_held = self.held.swap(false, Ordering::SeqCst);
        self.journal.push(Entry::Release {
            domain: self.domain,
            was_held,
        });
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

pub struct FakeSerial {
    journal: Journal,
    pub ok: bool,
}

impl FakeSerial {
    pub fn new(journal: Journal) -> Self {
        FakeSerial { journal, ok: true }
    }
}

impl SerialOpener for FakeSerial {
    fn open(&self, path: &str, _baud: u32) -> Option<SerialHandle> {
        self.journal.push(Entry::SerialOpen(path.to_string()));
        self.ok
            .then(|| Box::new(&b"boot\n"[..]) as SerialHandle)
    }
}

/// Monitor returning a fixed verdict, optionally parked until released.
pub struct FakeMonitor {
    journal: Journal,
    pub verdict: i32,
    pub started: Option<Arc<Notify>>,
    pub release: Option<Arc<Notify>>,
}

impl FakeMonitor {
    pub fn new(journal: Journal, verdict: i32) -> Self {
        FakeMonitor {
            journal,
            verdict,
            started: None,
            release: None,
        }
    }

    pub fn gated(journal: Journal, started: Arc<Notify>, release: Arc<Notify>) -> Self {
        FakeMonitor {
            journal,
            verdict: 0,
            started: Some(started),
            release: Some(release),
        }
    }
}

#[async_trait]
impl Monitor for FakeMonitor {
    async fn run(&self, _serial: SerialHandle, _session: MonitorSession<'_>) -> i32 {
        self.journal.push(Entry::Monitor);
        if let Some(started) = &self.started {
            started.notify_one();
        }
        if let Some(release) = &self.release {
            release.notified().await;
        }
        self.verdict
    }
}

/// Settings that need nothing installed on the test machine.
pub fn test_settings() -> Settings {
    Settings {
        toolchain_env_script: PathBuf::from(TOOLCHAIN_SCRIPT),
        shell_env_script: PathBuf::from(SHELL_SCRIPT),
        tools: Vec::new(),
        ..Settings::default()
    }
}
