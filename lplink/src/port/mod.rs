//! Port abstraction for the serial link to the Launchpad.
//!
//! The state machines in this crate never block on I/O. They ask the port
//! for whatever bytes have arrived and write whole packets at once, so a
//! [`Port`] only has to offer non-blocking reads and plain writes.
//!
//! ```text
//! +------------------+   +------------------+
//! |    Discovery     |   | BootstrapLoader  |
//! +--------+---------+   +--------+---------+
//!          |                      |
//!          v                      v
//! +--------+----------------------+---------+
//! |                Terminal                 |
//! +--------------------+--------------------+
//!                      |
//!                      v
//! +--------------------+--------------------+
//! |   Port trait  (NativePort, MockPort)    |
//! +-----------------------------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::time::Duration;

use crate::error::Result;

/// Serial port configuration used when opening native ports.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Initial baud rate.
    pub baud_rate: u32,
    /// Timeout of a single blocking driver call.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9_600,
            timeout: Duration::from_millis(10),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with the given baud rate.
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Snapshot of one serial port taken at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortInfo {
    /// Port name/path, also used to reopen the port.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// USB serial number (if available).
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Port info with only a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the USB vendor and product id.
    #[must_use]
    pub fn with_usb(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }

    /// Set the USB serial number.
    #[must_use]
    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    /// Whether the port has this vendor and product id.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == Some(vid) && self.pid == Some(pid)
    }

    /// Last path component of the name (`/dev/cu.usbmodem1` -> `cu.usbmodem1`).
    pub fn basename(&self) -> &str {
        self.name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.name)
    }

    /// Numeric groups of the name, for a natural ordering (`COM12` -> `[12]`).
    pub fn sort_key(&self) -> Vec<u64> {
        self.name
            .split(|c: char| !c.is_ascii_digit())
            .filter(|group| !group.is_empty())
            .map(|group| group.parse().unwrap_or(u64::MAX))
            .collect()
    }
}

/// Serial port as seen by the terminal.
///
/// Implementations classify their failures into
/// [`Error::PermissionDenied`](crate::Error::PermissionDenied),
/// [`Error::DeviceVanished`](crate::Error::DeviceVanished) or
/// [`Error::Transport`](crate::Error::Transport), each carrying the port
/// name.
pub trait Port: Send {
    /// Port name/path.
    fn name(&self) -> &str;

    /// Open the port.
    fn open(&mut self) -> Result<()>;

    /// Close the port. Closing a closed port does nothing.
    fn close(&mut self);

    /// Whether the port is open.
    fn is_open(&self) -> bool;

    /// Set the baud rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Current baud rate.
    fn baud_rate(&self) -> u32;

    /// Discard bytes pending in the OS buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Write `data`, returning the number of bytes written.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Append the bytes that have already arrived to `buf` without blocking.
    ///
    /// Returns the number of bytes appended.
    fn read_available(&mut self, buf: &mut Vec<u8>) -> Result<usize>;
}

/// Source of port snapshots and the ports behind them.
pub trait PortEnumerator {
    /// Port type produced by this enumerator.
    type Port: Port;

    /// List all serial ports currently present.
    fn list_ports(&self) -> Result<Vec<PortInfo>>;

    /// Create an unopened port for `info`.
    fn create_port(&self, info: &PortInfo) -> Self::Port;
}

// Re-export the appropriate implementation based on features
#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
