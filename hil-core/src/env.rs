//! Environment snapshots and the two-stage environment capture.
//!
//! The toolchain and shell initialization scripts only work reliably when
//! the machine is quiet; under load they occasionally hand back nothing.
//! Each script therefore gets up to [`CAPTURE_ATTEMPTS`] tries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::process::{Invocation, ProcessRunner};

/// Attempts per initialization script before giving up.
pub const CAPTURE_ATTEMPTS: u32 = 3;

/// Variable name → value mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `name=value` lines as printed by `env`.
    ///
    /// Only the first `=` splits a line; lines without one, or with an
    /// empty name, are skipped.
    pub fn parse_dump(text: &str) -> Self {
        let vars = text
            .lines()
            .filter_map(|line| line.split_once('='))
            .filter(|(name, _)| !name.is_empty() && !name.contains(char::is_whitespace))
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        Environment { vars }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    /// Combine two snapshots; `other` wins on key conflicts.
    pub fn merge(mut self, other: Environment) -> Environment {
        self.vars.extend(other.vars);
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Environment {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Runs the toolchain initializer, then the shell initializer, and merges
/// what they leave behind.
pub struct EnvironmentCapture<'a> {
    runner: &'a dyn ProcessRunner,
    toolchain_script: PathBuf,
    shell_script: PathBuf,
    working_dir: Option<PathBuf>,
}

impl<'a> EnvironmentCapture<'a> {
    pub fn new(
        runner: &'a dyn ProcessRunner,
        toolchain_script: impl Into<PathBuf>,
        shell_script: impl Into<PathBuf>,
    ) -> Self {
        EnvironmentCapture {
            runner,
            toolchain_script: toolchain_script.into(),
            shell_script: shell_script.into(),
            working_dir: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Capture the merged environment.
    ///
    /// An empty result means capture failed: either script never produced
    /// anything. The shell script is not run at all unless the toolchain
    /// script succeeded.
    pub async fn capture(&self) -> Environment {
        let toolchain = self.capture_one(&self.toolchain_script).await;
        if toolchain.is_empty() {
            return Environment::new();
        }
        let shell = self.capture_one(&self.shell_script).await;
        if shell.is_empty() {
            return Environment::new();
        }
        toolchain.merge(shell)
    }

    async fn capture_one(&self, script: &Path) -> Environment {
        let mut invocation = Invocation::new([script.to_string_lossy().into_owned()]).capture_env();
        if let Some(dir) = &self.working_dir {
            invocation = invocation.working_dir(dir);
        }

        for attempt in 1..=CAPTURE_ATTEMPTS {
            let outcome = self.runner.run(&invocation).await;
            if !outcome.captured_env.is_empty() {
                return outcome.captured_env;
            }
            tracing::warn!(
                script = %script.display(),
                attempt,
                max_attempts = CAPTURE_ATTEMPTS,
                "Retrying to capture the environment variables"
            );
        }
        Environment::new()
    }
}

/// Log a captured environment one variable per line.
pub fn log_environment(env: &Environment) {
    tracing::debug!("Environment will be:");
    if env.is_empty() {
        tracing::debug!("EMPTY");
    }
    for (name, value) in env.iter() {
        tracing::debug!("{}={}", name, value);
    }
}
