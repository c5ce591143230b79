//! Installation check for the external tools a pipeline needs.

use std::time::Duration;

use serde::Deserialize;

use crate::process::{Invocation, ProcessRunner};

/// Guard time for a `--version` query.
const VERSION_GUARD_TIME: Duration = Duration::from_secs(30);

/// A tool that must be on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolSpec {
    /// Executable name looked up on `PATH`.
    pub name: String,
    /// Installation advice logged when the tool is missing.
    pub hint: String,
    /// Switch that makes the tool print its version, if it has one.
    #[serde(default)]
    pub version_switch: Option<String>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, hint: impl Into<String>) -> Self {
        ToolSpec {
            name: name.into(),
            hint: hint.into(),
            version_switch: None,
        }
    }

    pub fn with_version_switch(mut self, switch: impl Into<String>) -> Self {
        self.version_switch = Some(switch.into());
        self
    }
}

/// Tools needed to build and flash an NRF53 board.
pub fn default_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            "west",
            "can't find \"west\", the Zephyr build tool; install it with \
             \"pip install west\" followed by \"pip install -r \
             <ncs>/zephyr/scripts/requirements.txt\"",
        )
        .with_version_switch("--version"),
        ToolSpec::new(
            "nrfjprog",
            "couldn't find nrfjprog; install the nRF Command Line Tools from \
             https://www.nordicsemi.com/Products/Development-tools/nrf-command-line-tools",
        )
        .with_version_switch("--version"),
        ToolSpec::new(
            "JLinkExe",
            "can't find the SEGGER tools; install the latest J-Link software \
             from https://www.segger.com/downloads/jlink/ and add it to the path",
        ),
    ]
}

/// Check that every tool is installed, logging versions along the way.
///
/// Returns `false` if any tool is missing. Version queries are informative
/// only and never fail the check.
pub async fn check_installation(tools: &[ToolSpec], runner: &dyn ProcessRunner) -> bool {
    tracing::info!(count = tools.len(), "Checking tools");
    let mut success = true;

    for tool in tools {
        match which::which(&tool.name) {
            Ok(path) => {
                tracing::info!(tool = %tool.name, path = %path.display(), "Found tool");
                if let Some(switch) = &tool.version_switch {
                    let invocation = Invocation::new([tool.name.clone(), switch.clone()])
                        .guard_time(VERSION_GUARD_TIME);
                    if !runner.run(&invocation).await.success {
                        tracing::warn!(tool = %tool.name, "Unable to read tool version");
                    }
                }
            }
            Err(e) => {
                tracing::error!(tool = %tool.name, err = %e, hint = %tool.hint, "Tool not found");
                success = false;
            }
        }
    }

    success
}
