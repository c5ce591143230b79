//! Description of one physical test connection.

use serde::{Deserialize, Serialize};

/// One debug probe, the board behind it and the board's serial port.
///
/// Immutable for the length of a run; the pipeline only borrows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Identity used for the connection lock.
    pub id: String,
    /// Serial number of the debugger, when more than one is attached.
    #[serde(default)]
    pub debugger: Option<String>,
    pub serial_port: String,
}

impl Connection {
    pub fn new(id: impl Into<String>, serial_port: impl Into<String>) -> Self {
        Connection {
            id: id.into(),
            debugger: None,
            serial_port: serial_port.into(),
        }
    }

    pub fn with_debugger(mut self, serial_number: impl Into<String>) -> Self {
        self.debugger = Some(serial_number.into());
        self
    }

    /// Debugger serial number, ignoring an empty one.
    pub fn debugger(&self) -> Option<&str> {
        self.debugger.as_deref().filter(|snr| !snr.is_empty())
    }
}
