//! Cross-pipeline resource locks.
//!
//! Two lock domains arbitrate the lab hardware:
//!
//! - **connection**: one debug probe, board and serial port;
//! - **platform**: the flashing/debug subsystem shared by every board of a
//!   platform. Flashing or starting a debug-log session on two boards at once
//!   can corrupt its state even across different connections.
//!
//! A pipeline always takes the connection lock before the platform lock, so
//! the two domains cannot form a wait cycle.
//!
//! The default backend keeps one lock file per resource and takes an
//! exclusive `flock(2)` on it. `flock` binds to the open file description,
//! which makes the lock exclusive across processes as well as across handles
//! inside one process.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use thiserror::Error;

/// Interval between `flock` attempts while waiting for a busy resource.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Which lock domain a resource belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockDomain {
    Connection,
    Platform,
}

impl LockDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockDomain::Connection => "connection",
            LockDomain::Platform => "platform",
        }
    }
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("invalid {} id {id:?}: {reason}", .domain.as_str())]
    InvalidId {
        domain: LockDomain,
        id: String,
        reason: &'static str,
    },

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        LockError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Mutual-exclusion handle for one resource.
///
/// Acquisition never blocks past its guard time and never errors: anything
/// that prevents taking the lock is logged and reported as "not acquired".
/// [`release`](ResourceLock::release) must be safe to call on a handle that
/// does not hold the lock.
#[async_trait]
pub trait ResourceLock: Send + Sync {
    fn domain(&self) -> LockDomain;

    fn resource(&self) -> &str;

    /// Try to take the lock, waiting at most `guard_time`.
    async fn try_acquire(&self, guard_time: Duration) -> bool;

    /// Give the lock up. A no-op if it is not held.
    fn release(&self);

    fn is_held(&self) -> bool;
}

/// Source of lock handles keyed by resource identity.
///
/// Each pipeline looks up its own handles; the state behind them is shared
/// by every pipeline using the same registry backing.
pub trait LockRegistry: Send + Sync {
    fn connection_lock(&self, connection: &str) -> Result<Box<dyn ResourceLock>, LockError>;

    fn platform_lock(&self, platform: &str) -> Result<Box<dyn ResourceLock>, LockError>;
}

/// Scoped hold on a [`ResourceLock`]; released on [`release`](Self::release)
/// or drop, whichever comes first.
pub struct LockGuard<'a> {
    lock: &'a dyn ResourceLock,
    released: bool,
}

impl<'a> LockGuard<'a> {
    pub fn domain(&self) -> LockDomain {
        self.lock.domain()
    }

    /// Release before the end of the scope.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.lock.release();
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("domain", &self.lock.domain())
            .field("resource", &self.lock.resource())
            .field("released", &self.released)
            .finish()
    }
}

/// Take `lock` within `guard_time`, returning a guard that releases it.
pub async fn acquire(lock: &dyn ResourceLock, guard_time: Duration) -> Option<LockGuard<'_>> {
    if lock.try_acquire(guard_time).await {
        Some(LockGuard {
            lock,
            released: false,
        })
    } else {
        None
    }
}

/// `flock`-backed [`ResourceLock`].
pub struct FileLock {
    domain: LockDomain,
    resource: String,
    path: PathBuf,
    held: Mutex<Option<Flock<File>>>,
    poll_interval: Duration,
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLock")
            .field("domain", &self.domain)
            .field("resource", &self.resource)
            .field("path", &self.path)
            .field("held", &self.is_held())
            .finish()
    }
}

impl FileLock {
    pub fn new(domain: LockDomain, resource: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        FileLock {
            domain,
            resource: resource.into(),
            path: path.into(),
            held: Mutex::new(None),
            poll_interval: LOCK_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn held(&self) -> MutexGuard<'_, Option<Flock<File>>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self) -> Result<File, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                LockError::io(format!("creating lock directory {}", parent.display()), e)
            })?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| LockError::io(format!("opening lock file {}", self.path.display()), e))
    }

    async fn wait_for_lock(
        &self,
        mut file: File,
        guard_time: Duration,
    ) -> Result<Option<Flock<File>>, LockError> {
        let start = Instant::now();
        loop {
            file = match try_flock_exclusive(file) {
                Ok(locked) => return Ok(Some(locked)),
                Err((file, None)) => file,
                Err((_, Some(errno))) => {
                    return Err(LockError::io(
                        format!("locking {}", self.path.display()),
                        io::Error::from(errno),
                    ))
                }
            };
            let elapsed = start.elapsed();
            if elapsed >= guard_time {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(guard_time - elapsed)).await;
        }
    }
}

#[async_trait]
impl ResourceLock for FileLock {
    fn domain(&self) -> LockDomain {
        self.domain
    }

    fn resource(&self) -> &str {
        &self.resource
    }

    async fn try_acquire(&self, guard_time: Duration) -> bool {
        if self.is_held() {
            return true;
        }
        tracing::info!(
            domain = self.domain.as_str(),
            resource = %self.resource,
            guard_secs = guard_time.as_secs(),
            "Waiting for lock"
        );

        let result = match self.open() {
            Ok(file) => self.wait_for_lock(file, guard_time).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(Some(file)) => {
                *self.held() = Some(file);
                tracing::info!(domain = self.domain.as_str(), resource = %self.resource, "Lock acquired");
                true
            }
            Ok(None) => {
                tracing::warn!(
                    domain = self.domain.as_str(),
                    resource = %self.resource,
                    "Guard time expired waiting for lock"
                );
                false
            }
            Err(e) => {
                tracing::error!(
                    domain = self.domain.as_str(),
                    resource = %self.resource,
                    err = %e,
                    "Unable to take lock"
                );
                false
            }
        }
    }

    fn release(&self) {
        // Dropping the guard unlocks and closes the descriptor.
        match self.held().take() {
            Some(_locked) => {
                tracing::info!(domain = self.domain.as_str(), resource = %self.resource, "Lock released");
            }
            None => {
                tracing::debug!(
                    domain = self.domain.as_str(),
                    resource = %self.resource,
                    "Release of a lock that is not held ignored"
                );
            }
        }
    }

    fn is_held(&self) -> bool {
        self.held().is_some()
    }
}

/// Registry handing out [`FileLock`]s from one lock directory.
#[derive(Debug, Clone)]
pub struct FileLockRegistry {
    dir: PathBuf,
    poll_interval: Duration,
}

impl FileLockRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileLockRegistry {
            dir: dir.into(),
            poll_interval: LOCK_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn lock(&self, domain: LockDomain, id: &str) -> Result<Box<dyn ResourceLock>, LockError> {
        validate_resource_id(domain, id)?;
        let path = self.dir.join(format!("{}-{}.lock", domain.as_str(), id));
        Ok(Box::new(
            FileLock::new(domain, id, path).with_poll_interval(self.poll_interval),
        ))
    }
}

impl LockRegistry for FileLockRegistry {
    fn connection_lock(&self, connection: &str) -> Result<Box<dyn ResourceLock>, LockError> {
        self.lock(LockDomain::Connection, connection)
    }

    fn platform_lock(&self, platform: &str) -> Result<Box<dyn ResourceLock>, LockError> {
        self.lock(LockDomain::Platform, platform)
    }
}

/// Resource ids become file names, so keep them to a safe alphabet.
fn validate_resource_id(domain: LockDomain, id: &str) -> Result<(), LockError> {
    let invalid = |reason| LockError::InvalidId {
        domain,
        id: id.to_string(),
        reason,
    };
    if id.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if id.starts_with('.') {
        return Err(invalid("must not start with '.'"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid("only ASCII alphanumerics, '-', '_' and '.' are allowed"));
    }
    Ok(())
}

/// Non-blocking exclusive `flock`. A busy lock hands the file back with no
/// error; any other failure carries its errno.
fn try_flock_exclusive(file: File) -> Result<Flock<File>, (File, Option<Errno>)> {
    Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(file, errno)| {
        if errno == Errno::EWOULDBLOCK {
            (file, None)
        } else {
            (file, Some(errno))
        }
    })
}
