//! Error types for lplink.

use std::{fmt, io};
use thiserror::Error;

/// Result type for lplink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for lplink operations.
///
/// Errors that concern one serial port carry its name so that discovery can
/// report per-port failures without wrapping them again.
#[derive(Debug, Error)]
pub enum Error {
    /// No port with the Launchpad vendor/product id was found.
    #[error("No Launchpad found")]
    NoDeviceFound,

    /// A board of the wrong family is attached.
    #[error("Incompatible board {name} found on {port}")]
    IncompatibleDeviceFound {
        /// Port the board was found on.
        port: String,
        /// Human readable board name.
        name: &'static str,
    },

    /// More than one Launchpad is attached and the ports cannot be ordered.
    #[error("Multiple Launchpads found: {}", join_ports(.ports))]
    AmbiguousDevices {
        /// Candidate port names.
        ports: Vec<String>,
    },

    /// The OS refused access to the port.
    #[error("Permission denied on {port}")]
    PermissionDenied {
        /// Port name.
        port: String,
    },

    /// The device went away (unplugged or reset).
    #[error("Device on {port} vanished")]
    DeviceVanished {
        /// Port name.
        port: String,
    },

    /// Any other serial transport failure.
    #[error("Serial error on {port}: {message}")]
    Transport {
        /// Port name.
        port: String,
        /// Driver message.
        message: String,
    },

    /// Received bytes could not be framed or decoded.
    #[error("Malformed packet: {0}")]
    MalformedPacket(#[from] MalformedPacket),

    /// CRC-32 of a BSL reply does not match its payload.
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// CRC carried by the packet.
        expected: u32,
        /// CRC computed over the payload.
        actual: u32,
    },

    /// A reply arrived that no command was waiting for.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// A step did not complete in time.
    #[error("Timeout on {port} during {step}")]
    Timeout {
        /// Port name.
        port: String,
        /// What was being waited for.
        step: String,
    },

    /// No candidate answered the version probe.
    #[error("No firmware answered the version probe")]
    NoFirmware,

    /// The BSL answered with an error code.
    #[error("Bootstrap loader rejected the command: {}", describe_reply(.reply))]
    ProtocolRejected {
        /// Raw reply payload.
        reply: Vec<u8>,
    },

    /// The BSL buffer cannot hold one batch.
    #[error("BSL buffer too small: {available} bytes available, {required} required")]
    BufferTooSmall {
        /// Buffer size reported by the device.
        available: u16,
        /// Buffer size needed for one batch.
        required: usize,
    },

    /// The firmware answered with a different version.
    #[error("Firmware version mismatch: expected {expected}, found {actual}")]
    VersionMismatch {
        /// Version the host was built for.
        expected: String,
        /// Version reported by the board.
        actual: String,
    },

    /// Every candidate port failed before the probe timed out.
    #[error("Probe failed on all ports: {}", join_ports(.ports))]
    ProbeFailed {
        /// Ports that reported an error.
        ports: Vec<String>,
    },

    /// The bootstrap loader failed on every candidate port.
    #[error("Programming failed on all ports")]
    ProgrammingFailed,

    /// The platform needs device rules that are not installed.
    #[error("Device access rules are not installed")]
    PermissionRulesMissing,

    /// The firmware image cannot be programmed.
    #[error("Invalid firmware: {0}")]
    InvalidFirmware(String),

    /// The operation was cancelled by its owner.
    #[error("Cancelled on {port}")]
    Cancelled {
        /// Port name.
        port: String,
    },

    /// The terminal or session is closed.
    #[error("Not connected")]
    NotConnected,

    /// The embedding application requested an interrupt.
    #[error("Interrupted")]
    Interrupted,

    /// I/O error (file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Port name carried by the error, if any.
    pub fn port(&self) -> Option<&str> {
        match self {
            Self::IncompatibleDeviceFound { port, .. }
            | Self::PermissionDenied { port }
            | Self::DeviceVanished { port }
            | Self::Transport { port, .. }
            | Self::Timeout { port, .. }
            | Self::Cancelled { port } => Some(port),
            _ => None,
        }
    }
}

/// Ways in which received bytes fail to form a packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedPacket {
    /// Fewer bytes than the header needs.
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),

    /// Application packet does not start with `L`.
    #[error("bad marker {0:#04x}")]
    BadMarker(u8),

    /// Declared length does not match the bytes present.
    #[error("declared length {declared} but {actual} bytes present")]
    LengthMismatch {
        /// Length from the header.
        declared: usize,
        /// Payload bytes present.
        actual: usize,
    },

    /// BSL reply does not start with the ack byte.
    #[error("bad ack byte {0:#04x}")]
    BadAck(u8),

    /// BSL reply header byte is not 0x08.
    #[error("bad header byte {0:#04x}")]
    BadHeader(u8),

    /// Bytes trailing a complete packet.
    #[error("{len} bytes after packet: {}", Hex(.prefix))]
    Overlong {
        /// Number of trailing bytes.
        len: usize,
        /// Leading trailing bytes.
        prefix: Vec<u8>,
    },

    /// Bytes that match neither framing.
    #[error("{len} unframed bytes: {}", Hex(.prefix))]
    Invalid {
        /// Number of discarded bytes.
        len: usize,
        /// Leading discarded bytes.
        prefix: Vec<u8>,
    },

    /// Device info reply of the wrong size.
    #[error("device info is {0} bytes, expected 25")]
    DeviceInfoLength(usize),
}

/// Hex dump of a short byte slice for messages.
pub(crate) struct Hex<'a>(pub &'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

fn join_ports(ports: &[String]) -> String {
    ports.join(", ")
}

fn describe_reply(reply: &[u8]) -> String {
    crate::protocol::bsl::describe_reply(reply)
}
