//! Opening the board's serial port.

use tokio::io::AsyncRead;
use tokio_serial::SerialPortBuilderExt;

/// Baud rate used when nothing else is configured.
pub const DEFAULT_BAUD: u32 = 115_200;

/// An open serial port, readable asynchronously. Dropping it closes the port.
pub type SerialHandle = Box<dyn AsyncRead + Send + Unpin>;

pub trait SerialOpener: Send + Sync {
    /// Open `path` at `baud`; `None` if the port cannot be opened.
    fn open(&self, path: &str, baud: u32) -> Option<SerialHandle>;
}

/// Opens a tty device node as a non-blocking serial stream, 8N1 without
/// flow control. Must be called from within a tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct TtyOpener;

impl TtyOpener {
    pub fn new() -> Self {
        TtyOpener
    }
}

impl SerialOpener for TtyOpener {
    fn open(&self, path: &str, baud: u32) -> Option<SerialHandle> {
        let opened = tokio_serial::new(path, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async();
        match opened {
            Ok(stream) => {
                tracing::info!(port = path, baud, "Opened serial port");
                Some(Box::new(stream))
            }
            Err(e) => {
                tracing::error!(port = path, baud, err = %e, "Unable to open serial port");
                None
            }
        }
    }
}
