//! Lab settings.
//!
//! Everything that differs between labs or boards lives here: where the
//! toolchain scripts are, what to build, and how long each stage may take.
//! Settings are read from a JSON file; every field is optional and falls back
//! to the NRF53 defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::tools::{default_tools, ToolSpec};

/// Per-stage guard times, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GuardTimes {
    /// Can be long when many builds share the machine.
    pub build_secs: u64,
    pub connection_lock_secs: u64,
    pub platform_lock_secs: u64,
    pub download_secs: u64,
    pub run_secs: u64,
    pub run_inactivity_secs: u64,
}

impl Default for GuardTimes {
    fn default() -> Self {
        GuardTimes {
            build_secs: 60 * 30,
            connection_lock_secs: 60 * 60,
            platform_lock_secs: 60 * 60,
            download_secs: 60,
            run_secs: 60 * 60,
            run_inactivity_secs: 60 * 5,
        }
    }
}

impl GuardTimes {
    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_secs)
    }

    pub fn connection_lock(&self) -> Duration {
        Duration::from_secs(self.connection_lock_secs)
    }

    pub fn platform_lock(&self) -> Duration {
        Duration::from_secs(self.platform_lock_secs)
    }

    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }

    pub fn run(&self) -> Duration {
        Duration::from_secs(self.run_secs)
    }

    pub fn run_inactivity(&self) -> Duration {
        Duration::from_secs(self.run_inactivity_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Platform name; also the identity of the platform lock.
    pub platform: String,
    /// Script that sets up the toolchain (Zephyr) environment.
    pub toolchain_env_script: PathBuf,
    /// Script that sets up the shell environment the toolchain expects.
    pub shell_env_script: PathBuf,
    /// Build and flash front end.
    pub builder: String,
    pub board: String,
    /// Output directory, relative to the working directory.
    pub build_subdir: String,
    /// Application to build, relative to the source root.
    pub runner_dir: String,
    /// Directory under the output directory holding the image.
    pub toolchain_subdir: String,
    pub image: String,
    /// Value of the flasher's `--nrf-family` switch.
    pub device_family: String,
    pub tools: Vec<ToolSpec>,
    pub lock_dir: PathBuf,
    pub serial_baud: u32,
    pub guard_times: GuardTimes,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            platform: "NRF53".to_string(),
            toolchain_env_script: PathBuf::from("/opt/nrfconnect/zephyr/zephyr-env.sh"),
            shell_env_script: PathBuf::from("/opt/nrfconnect/toolchain/env.sh"),
            builder: "west".to_string(),
            board: "nrf5340pdk_nrf5340_cpuapp".to_string(),
            build_subdir: "build".to_string(),
            runner_dir: "port/platform/nordic/nrf53/sdk/nrfconnect/runner".to_string(),
            toolchain_subdir: "zephyr".to_string(),
            image: "zephyr.hex".to_string(),
            device_family: "NRF53".to_string(),
            tools: default_tools(),
            lock_dir: std::env::temp_dir().join("hil-locks"),
            serial_baud: 115_200,
            guard_times: GuardTimes::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
