//! End-to-end pipeline behaviour against fake collaborators.

mod test_support;

use std::path::Path;
use std::sync::Arc;

use hil_core::{
    build_firmware, Connection, Environment, EventKind, EventType, FirmwareRequest, LockDomain,
    Pipeline, RunRequest, Settings, CAPTURE_ATTEMPTS,
};
use test_support::*;

const SERIAL_PORT: &str = "/dev/ttyFAKE0";

struct Harness {
    journal: Journal,
    settings: Settings,
    runner: ScriptedRunner,
    locks: FakeLocks,
    serial: FakeSerial,
    monitor: FakeMonitor,
    defines: Vec<String>,
}

impl Harness {
    fn new() -> Self {
        let journal = Journal::default();
        Harness {
            settings: test_settings(),
            runner: ScriptedRunner::new(journal.clone()),
            locks: FakeLocks::new(journal.clone()),
            serial: FakeSerial::new(journal.clone()),
            monitor: FakeMonitor::new(journal.clone(), 0),
            defines: Vec::new(),
            journal,
        }
    }

    async fn run(self) -> (i32, Journal) {
        let journal = self.journal.clone();
        let pipeline = Pipeline::new(
            self.settings,
            Arc::new(self.runner),
            Arc::new(self.locks),
            Arc::new(self.serial),
            Arc::new(self.monitor),
            Arc::new(JournalReporter(journal.clone())),
        );
        let connection = Connection::new("nrf53-0", SERIAL_PORT).with_debugger("960012345");
        let work = tempfile::tempdir().unwrap();
        let request = RunRequest {
            instance: "13.0",
            connection: &connection,
            clean: false,
            defines: &self.defines,
            source_root: Path::new("/src/ubxlib"),
            working_dir: work.path(),
            test_report: None,
        };
        let result = pipeline.run(&request).await;
        (result.code(), journal)
    }
}

fn infra_failed(detail: &str) -> (EventType, EventKind, Option<String>) {
    (
        EventType::Infrastructure,
        EventKind::Failed,
        Some(detail.to_string()),
    )
}

#[tokio::test]
async fn full_run_passes_with_paired_events() {
    let (result, journal) = Harness::new().run().await;

    assert_eq!(result, 0);
    assert_eq!(
        journal.event_types_and_kinds(),
        vec![
            (EventType::Build, EventKind::Start),
            (EventType::Build, EventKind::Passed),
            (EventType::Download, EventKind::Start),
            (EventType::Download, EventKind::Complete),
            (EventType::Test, EventKind::Start),
            (EventType::Test, EventKind::Complete),
        ]
    );
    let events = journal.events();
    assert_eq!(events[0].2.as_deref(), Some("NRF53"));
    assert!(events[1]
        .2
        .as_deref()
        .is_some_and(|detail| detail.starts_with("build took ")));
    assert!(journal.dangling().is_empty());
}

#[tokio::test]
async fn platform_lock_follows_connection_lock_and_is_released_before_monitor() {
    let (_, journal) = Harness::new().run().await;

    let conn = journal.position(&Entry::Acquire(LockDomain::Connection)).unwrap();
    let platform = journal.position(&Entry::Acquire(LockDomain::Platform)).unwrap();
    let monitor = journal.position(&Entry::Monitor).unwrap();
    assert!(conn < platform);
    assert!(platform < monitor);

    let platform_release = Entry::Release {
        domain: LockDomain::Platform,
        was_held: true,
    };
    let releases_before_monitor = journal.entries()[..monitor]
        .iter()
        .filter(|entry| **entry == platform_release)
        .count();
    assert_eq!(releases_before_monitor, 1);
    assert_eq!(journal.count(|entry| *entry == platform_release), 1);

    let conn_release = journal
        .position(&Entry::Release {
            domain: LockDomain::Connection,
            was_held: true,
        })
        .unwrap();
    assert!(conn_release > monitor);
}

#[tokio::test]
async fn empty_environment_fails_before_build() {
    let mut harness = Harness::new();
    harness.runner = harness.runner.toolchain_captures(Vec::new());
    let (result, journal) = harness.run().await;

    assert_eq!(result, -1);
    assert_eq!(journal.events(), vec![infra_failed("environment setup failed")]);
    assert_eq!(
        journal.runs_of(TOOLCHAIN_SCRIPT).len(),
        CAPTURE_ATTEMPTS as usize
    );
    assert!(journal.runs_of(SHELL_SCRIPT).is_empty());
    assert!(journal.lock_entries().is_empty());
}

#[tokio::test]
async fn shell_environment_is_retried_then_fails() {
    let mut harness = Harness::new();
    harness.runner = harness.runner.shell_captures(Vec::new());
    let (result, journal) = harness.run().await;

    assert_eq!(result, -1);
    assert_eq!(journal.runs_of(TOOLCHAIN_SCRIPT).len(), 1);
    assert_eq!(journal.runs_of(SHELL_SCRIPT).len(), CAPTURE_ATTEMPTS as usize);
    assert_eq!(journal.events(), vec![infra_failed("environment setup failed")]);
}

#[tokio::test]
async fn flaky_toolchain_capture_succeeds_on_third_attempt() {
    let mut harness = Harness::new();
    harness.runner = harness.runner.toolchain_captures(vec![
        Environment::new(),
        Environment::new(),
        toolchain_env(),
    ]);
    let (result, journal) = harness.run().await;

    assert_eq!(result, 0);
    assert_eq!(journal.runs_of(TOOLCHAIN_SCRIPT).len(), 3);
    assert_eq!(journal.runs_of(SHELL_SCRIPT).len(), 1);
}

#[tokio::test]
async fn build_sees_merged_environment_and_overrides() {
    let mut harness = Harness::new();
    harness.defines = vec!["U_CFG_APP_FILTER=port".to_string(), "U_DEBUG".to_string()];
    let (_, journal) = harness.run().await;

    let builds: Vec<_> = journal
        .runs_of("west")
        .into_iter()
        .filter(|(argv, _)| argv.get(1).map(String::as_str) == Some("-v"))
        .collect();
    assert_eq!(builds.len(), 1);
    let env = &builds[0].1;
    assert_eq!(env.get("PATH"), Some("/usr/bin"));
    assert_eq!(env.get("ZEPHYR_BASE"), Some("/opt/ncs/zephyr"));
    assert_eq!(env.get("HOME"), Some("/home/ci"));
    assert_eq!(env.get("CCACHE_DISABLE"), Some("1"));
    assert_eq!(env.get("U_FLAGS"), Some("-DU_CFG_APP_FILTER=port -DU_DEBUG"));
}

#[tokio::test]
async fn download_targets_the_debugger_of_the_connection() {
    let (_, journal) = Harness::new().run().await;

    let flashes: Vec<_> = journal
        .runs_of("west")
        .into_iter()
        .filter(|(argv, _)| argv.get(1).map(String::as_str) == Some("flash"))
        .collect();
    assert_eq!(flashes.len(), 1);
    let argv = &flashes[0].0;
    assert!(argv.ends_with(&["--erase".to_string(), "--snr".to_string(), "960012345".to_string()]));
    assert!(argv
        .iter()
        .any(|arg| arg.ends_with("build/zephyr/zephyr.hex")));
}

#[tokio::test]
async fn build_failure_is_one_and_takes_no_locks() {
    let mut harness = Harness::new();
    harness.runner.build_ok = false;
    let (result, journal) = harness.run().await;

    assert_eq!(result, 1);
    assert_eq!(
        journal.events(),
        vec![
            (EventType::Build, EventKind::Start, Some("NRF53".to_string())),
            (
                EventType::Build,
                EventKind::Failed,
                Some("check debug log for details".to_string())
            ),
        ]
    );
    assert!(journal.lock_entries().is_empty());
}

#[tokio::test]
async fn connection_lock_timeout_is_infrastructure_failure() {
    let mut harness = Harness::new();
    harness.locks.connection_ok = false;
    let (result, journal) = harness.run().await;

    assert_eq!(result, -1);
    assert_eq!(
        journal.events().last().cloned(),
        Some(infra_failed("unable to lock a connection"))
    );
    assert!(!journal
        .event_types_and_kinds()
        .iter()
        .any(|(t, _)| *t == EventType::Download));
    assert_eq!(
        journal.lock_entries(),
        vec![Entry::AcquireFailed(LockDomain::Connection)]
    );
    assert!(journal.dangling().is_empty());
}

#[tokio::test]
async fn platform_lock_timeout_still_releases_the_platform() {
    let mut harness = Harness::new();
    harness.locks.platform_ok = false;
    let (result, journal) = harness.run().await;

    assert_eq!(result, -1);
    assert_eq!(
        journal.events().last().cloned(),
        Some(infra_failed("unable to lock the platform"))
    );
    assert_eq!(
        journal.lock_entries(),
        vec![
            Entry::Acquire(LockDomain::Connection),
            Entry::AcquireFailed(LockDomain::Platform),
            Entry::Release {
                domain: LockDomain::Platform,
                was_held: false,
            },
            Entry::Release {
                domain: LockDomain::Connection,
                was_held: true,
            },
        ]
    );
    assert!(!journal
        .event_types_and_kinds()
        .iter()
        .any(|(t, _)| *t == EventType::Download));
}

#[tokio::test]
async fn download_failure_releases_both_locks() {
    let mut harness = Harness::new();
    harness.runner.download_ok = false;
    let (result, journal) = harness.run().await;

    assert_eq!(result, -1);
    assert_eq!(
        journal.events().last().cloned(),
        Some((
            EventType::Download,
            EventKind::Failed,
            Some("check debug log for details".to_string())
        ))
    );
    assert_eq!(
        journal.count(|entry| matches!(entry, Entry::Release { was_held: true, .. })),
        2
    );
    assert!(journal.position(&Entry::Monitor).is_none());
    assert!(journal.dangling().is_empty());
}

#[tokio::test]
async fn serial_open_failure_closes_the_test_stage() {
    let mut harness = Harness::new();
    harness.serial.ok = false;
    let (result, journal) = harness.run().await;

    assert_eq!(result, -1);
    let events = journal.events();
    let tail = &events[events.len() - 3..];
    assert_eq!(tail[0].0, EventType::Test);
    assert_eq!(tail[0].1, EventKind::Start);
    assert_eq!(
        tail[1],
        infra_failed(&format!("unable to open serial port {}", SERIAL_PORT))
    );
    assert_eq!((tail[2].0, tail[2].1), (EventType::Test, EventKind::Failed));
    assert!(journal.position(&Entry::Monitor).is_none());
    assert!(journal.dangling().is_empty());
}

#[tokio::test]
async fn monitor_verdict_is_passed_through() {
    let mut harness = Harness::new();
    harness.monitor = FakeMonitor::new(harness.journal.clone(), 5);
    let (result, journal) = harness.run().await;

    assert_eq!(result, 5);
    assert_eq!(
        journal.event_types_and_kinds().last().copied(),
        Some((EventType::Test, EventKind::Failed))
    );
    assert!(journal.dangling().is_empty());
}

#[tokio::test]
async fn missing_tool_fails_first() {
    let mut harness = Harness::new();
    harness.settings.tools = vec![hil_core::ToolSpec::new(
        "hil-core-tool-that-is-not-installed",
        "install it",
    )];
    let (result, journal) = harness.run().await;

    assert_eq!(result, -1);
    assert_eq!(
        journal.events(),
        vec![infra_failed(
            "there is a problem with the tools installation for NRF53"
        )]
    );
    assert!(journal.runs_of(TOOLCHAIN_SCRIPT).is_empty());
}

#[tokio::test]
async fn firmware_only_build_reports_like_a_full_run() {
    let journal = Journal::default();
    let runner = ScriptedRunner::new(journal.clone());
    let reporter = JournalReporter(journal.clone());
    let work = tempfile::tempdir().unwrap();
    let request = FirmwareRequest {
        instance: "build",
        clean: false,
        defines: &[],
        source_root: Path::new("/src/ubxlib"),
        working_dir: work.path(),
    };

    let firmware = build_firmware(&test_settings(), &runner, &reporter, &request)
        .await
        .unwrap();

    assert_eq!(
        firmware.hex_path,
        work.path().join("build").join("zephyr").join("zephyr.hex")
    );
    assert_eq!(firmware.env.get("PATH"), Some("/usr/bin"));
    let events = journal.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].1, EventKind::Start);
    assert!(events[1]
        .2
        .as_deref()
        .is_some_and(|detail| detail.starts_with("build took ")));
    assert!(journal.lock_entries().is_empty());
}
