//! Application protocol spoken by the Launchpad firmware.
//!
//! ## Frame Format
//!
//! Commands and replies share one frame layout:
//!
//! ```text
//! +--------+------+--------+---------+-----------+
//! | Marker | Cmd  | Length |   Arg   |  Payload  |
//! +--------+------+--------+---------+-----------+
//! |   1    |  1   | 2 (LE) |    4    |  Length   |
//! +--------+------+--------+---------+-----------+
//! |  'L'   | code |        | ASCII   |           |
//! +--------+------+--------+---------+-----------+
//! ```

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{MalformedPacket, Result};

/// First byte of every application frame.
pub const MARKER: u8 = b'L';

/// Header size in bytes.
pub const HEADER_LEN: usize = 8;

/// Command code of the version query.
pub const VERSION_COMMAND: u8 = b'8';

/// Major version of the firmware generation this host speaks to.
pub const FIRMWARE_MAJOR: &str = "8";

/// Firmware release this host speaks to, compared on major.minor.
pub const FIRMWARE_VERSION: &str = "8.2";

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = 0xFFFF;

/// A decoded application frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPacket {
    /// Command code.
    pub cmd: u8,
    /// Four argument bytes.
    pub arg: [u8; 4],
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl AppPacket {
    /// Encode this packet.
    pub fn to_bytes(&self) -> Vec<u8> {
        pack_app(self.cmd, self.arg, &self.payload)
    }

    /// Firmware version carried by a version reply.
    ///
    /// The firmware answers the probe with its minor version in `arg`, padded
    /// with NUL, and an empty payload. Returns `None` for any other packet.
    pub fn firmware_version(&self) -> Option<String> {
        if self.cmd != VERSION_COMMAND || !self.payload.is_empty() {
            return None;
        }

        let end = self
            .arg
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        let minor = std::str::from_utf8(&self.arg[..end]).ok()?;
        if minor.is_empty() || !minor.is_ascii() || minor.contains('\0') {
            return None;
        }

        Some(format!("{FIRMWARE_MAJOR}.{minor}"))
    }
}

/// Encode an application frame.
///
/// # Panics
///
/// Panics if the payload is longer than [`MAX_PAYLOAD_LEN`], since the
/// length field cannot describe it.
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn pack_app(cmd: u8, arg: [u8; 4], payload: &[u8]) -> Vec<u8> {
    assert!(
        payload.len() <= MAX_PAYLOAD_LEN,
        "application payload of {} bytes exceeds the length field",
        payload.len()
    );

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(MARKER);
    buf.push(cmd);
    buf.write_u16::<LittleEndian>(payload.len() as u16).unwrap();
    buf.extend_from_slice(&arg);
    buf.extend_from_slice(payload);
    buf
}

/// Decode one complete application frame.
pub fn unpack_app(bytes: &[u8]) -> Result<AppPacket> {
    if bytes.len() < HEADER_LEN {
        return Err(MalformedPacket::TooShort(bytes.len()).into());
    }
    if bytes[0] != MARKER {
        return Err(MalformedPacket::BadMarker(bytes[0]).into());
    }

    let declared = usize::from(LittleEndian::read_u16(&bytes[2..4]));
    let actual = bytes.len() - HEADER_LEN;
    if declared != actual {
        return Err(MalformedPacket::LengthMismatch { declared, actual }.into());
    }

    let mut arg = [0u8; 4];
    arg.copy_from_slice(&bytes[4..8]);

    Ok(AppPacket {
        cmd: bytes[1],
        arg,
        payload: bytes[HEADER_LEN..].to_vec(),
    })
}

/// Build a command with four little-endian half-word parameters.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn command(cmd: u8, arg: [u8; 4], params: [u16; 4]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    for param in params {
        payload.write_u16::<LittleEndian>(param).unwrap();
    }
    pack_app(cmd, arg, &payload)
}

/// The version probe `L 8 00 00 v e r ?`.
pub fn version_probe() -> Vec<u8> {
    pack_app(VERSION_COMMAND, *b"ver?", &[])
}

/// The `knock` packet, echoed back by the firmware.
pub fn knock() -> Vec<u8> {
    pack_app(b'k', *b"nock", &[])
}

/// Whether two version strings name the same major.minor release.
///
/// The patch level is ignored. Strings with fewer than two components never
/// match.
pub fn same_release(expected: &str, actual: &str) -> bool {
    fn major_minor(version: &str) -> Option<(&str, &str)> {
        let mut parts = version.trim().split('.');
        let major = parts.next().filter(|s| !s.is_empty())?;
        let minor = parts.next().filter(|s| !s.is_empty())?;
        Some((major, minor))
    }

    match (major_minor(expected), major_minor(actual)) {
        (Some(e), Some(a)) => e == a,
        _ => false,
    }
}

/// major.minor of a version string, or the string itself if it has fewer
/// components.
pub fn release_of(version: &str) -> String {
    let parts: Vec<&str> = version.split('.').take(2).collect();
    parts.join(".")
}
