//! MSPM0 Bootstrap Loader (BSL) packets.
//!
//! ## Frame Format
//!
//! Host to device:
//!
//! ```text
//! +--------+--------+-----------+--------+
//! | Header | Length |  Payload  | CRC-32 |
//! +--------+--------+-----------+--------+
//! |   1    | 2 (LE) |  Length   | 4 (LE) |
//! +--------+--------+-----------+--------+
//! |  0x80  |        | cmd, data |        |
//! +--------+--------+-----------+--------+
//! ```
//!
//! Device to host, either a single ack byte or:
//!
//! ```text
//! +-----+--------+--------+-----------+--------+
//! | Ack | Header | Length |  Payload  | CRC-32 |
//! +-----+--------+--------+-----------+--------+
//! |  1  |   1    | 2 (LE) |  Length   | 4 (LE) |
//! +-----+--------+--------+-----------+--------+
//! | 0x00|  0x08  |        |           |        |
//! +-----+--------+--------+-----------+--------+
//! ```
//!
//! The ack byte is `0x00` on success; a non-zero value reports a framing
//! error seen by the device (see [`nak_description`]).

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    error::{Error, Hex, MalformedPacket, Result},
    protocol::crc::crc32,
};

/// First byte of a host packet.
pub const HOST_HEADER: u8 = 0x80;

/// Ack byte the device sends for an accepted packet.
pub const ACK: u8 = 0x00;

/// Second byte of a device reply.
pub const REPLY_HEADER: u8 = 0x08;

/// Framing overhead of a device reply (ack, header, length, CRC).
pub const REPLY_OVERHEAD: usize = 8;

/// Connection request.
pub const CMD_CONNECT: u8 = 0x12;
/// Mass erase of the main flash.
pub const CMD_MASS_ERASE: u8 = 0x15;
/// Device information query.
pub const CMD_GET_DEVICE_INFO: u8 = 0x19;
/// Unlock with the BSL password.
pub const CMD_UNLOCK: u8 = 0x21;
/// Program a block of data.
pub const CMD_PROGRAM_DATA: u8 = 0x24;
/// Leave the BSL and reset into the application.
pub const CMD_START_APPLICATION: u8 = 0x40;
/// Change the UART baud rate.
pub const CMD_CHANGE_BAUD_RATE: u8 = 0x52;

/// First byte of a core message response.
pub const CORE_RESPONSE: u8 = 0x3B;

/// Core response reporting success.
pub const OK: [u8; 2] = [CORE_RESPONSE, 0x00];

/// Factory default BSL password.
pub const DEFAULT_PASSWORD: [u8; 32] = [0xFF; 32];

/// UART baud rates the BSL can switch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BaudRate {
    /// 4800 baud.
    B4800 = 1,
    /// 9600 baud, the rate the BSL starts with.
    B9600 = 2,
    /// 19200 baud.
    B19200 = 3,
    /// 38400 baud.
    B38400 = 4,
    /// 57600 baud.
    B57600 = 5,
    /// 115200 baud.
    B115200 = 6,
    /// 1 MBaud.
    B1000000 = 7,
    /// 2 MBaud.
    B2000000 = 8,
    /// 3 MBaud.
    B3000000 = 9,
}

impl BaudRate {
    /// Code sent with the change baud rate command.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Rate in bits per second.
    pub fn bits_per_second(self) -> u32 {
        match self {
            Self::B4800 => 4_800,
            Self::B9600 => 9_600,
            Self::B19200 => 19_200,
            Self::B38400 => 38_400,
            Self::B57600 => 57_600,
            Self::B115200 => 115_200,
            Self::B1000000 => 1_000_000,
            Self::B2000000 => 2_000_000,
            Self::B3000000 => 3_000_000,
        }
    }
}

/// Encode a host packet around a command payload.
///
/// # Panics
///
/// Panics if the payload does not fit the 16-bit length field.
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn pack_bsl(payload: &[u8]) -> Vec<u8> {
    assert!(
        payload.len() <= usize::from(u16::MAX),
        "BSL payload of {} bytes exceeds the length field",
        payload.len()
    );

    let mut buf = Vec::with_capacity(payload.len() + 7);
    buf.push(HOST_HEADER);
    buf.write_u16::<LittleEndian>(payload.len() as u16).unwrap();
    buf.extend_from_slice(payload);
    buf.write_u32::<LittleEndian>(crc32(payload)).unwrap();
    buf
}

/// Decode a complete device reply and verify its checksum.
pub fn unpack_bsl(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() < REPLY_OVERHEAD {
        return Err(MalformedPacket::TooShort(bytes.len()).into());
    }
    if bytes[0] != ACK {
        return Err(MalformedPacket::BadAck(bytes[0]).into());
    }
    if bytes[1] != REPLY_HEADER {
        return Err(MalformedPacket::BadHeader(bytes[1]).into());
    }

    let declared = usize::from(LittleEndian::read_u16(&bytes[2..4]));
    let actual = bytes.len() - REPLY_OVERHEAD;
    if declared != actual {
        return Err(MalformedPacket::LengthMismatch { declared, actual }.into());
    }

    let payload = &bytes[4..4 + declared];
    let expected = LittleEndian::read_u32(&bytes[4 + declared..]);
    let actual = crc32(payload);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    Ok(payload.to_vec())
}

/// Connection request. Answered with an ack byte.
pub fn connect() -> Vec<u8> {
    pack_bsl(&[CMD_CONNECT])
}

/// Change the device baud rate. Answered with an ack byte at the old rate.
pub fn change_baud_rate(rate: BaudRate) -> Vec<u8> {
    pack_bsl(&[CMD_CHANGE_BAUD_RATE, rate.code()])
}

/// Device information query. Answered with a [`DeviceInfo`] reply.
pub fn get_device_info() -> Vec<u8> {
    pack_bsl(&[CMD_GET_DEVICE_INFO])
}

/// Unlock with a 32-byte password. Answered with a core response.
pub fn unlock(password: &[u8; 32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(33);
    payload.push(CMD_UNLOCK);
    payload.extend_from_slice(password);
    pack_bsl(&payload)
}

/// Mass erase. Answered with a core response.
pub fn mass_erase() -> Vec<u8> {
    pack_bsl(&[CMD_MASS_ERASE])
}

/// Program `data` at `address`. Answered with an ack byte.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn program_data(address: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(data.len() + 5);
    payload.push(CMD_PROGRAM_DATA);
    payload.write_u32::<LittleEndian>(address).unwrap();
    payload.extend_from_slice(data);
    pack_bsl(&payload)
}

/// Leave the BSL and start the application. Answered with an ack byte.
pub fn start_application() -> Vec<u8> {
    pack_bsl(&[CMD_START_APPLICATION])
}

/// Whether a reply payload is the success core response.
pub fn is_ok(reply: &[u8]) -> bool {
    reply == OK
}

/// Meaning of a non-zero ack byte.
pub fn nak_description(byte: u8) -> Option<&'static str> {
    let text = match byte {
        0x51 => "header incorrect",
        0x52 => "checksum incorrect",
        0x53 => "packet size zero",
        0x54 => "packet size exceeds buffer",
        0x55 => "unknown error",
        0x56 => "unknown baud rate",
        _ => return None,
    };
    Some(text)
}

/// Meaning of a core message response code (the byte after `0x3B`).
pub fn core_response_description(code: u8) -> Option<&'static str> {
    let text = match code {
        0x00 => "success",
        0x01 => "BSL locked",
        0x02 => "BSL password error",
        0x03 => "multiple BSL password errors",
        0x04 => "unknown command",
        0x05 => "invalid memory range",
        0x06 => "invalid command",
        0x07 => "factory reset disabled",
        0x08 => "factory reset password error",
        0x09 => "read-out error",
        0x0A => "invalid address or length alignment",
        0x0B => "invalid length for standalone verification",
        _ => return None,
    };
    Some(text)
}

/// Human readable text for a rejected reply.
pub fn describe_reply(reply: &[u8]) -> String {
    match reply {
        [byte] => match nak_description(*byte) {
            Some(text) => format!("{text} ({byte:#04x})"),
            None => format!("ack {byte:#04x}"),
        },
        [CORE_RESPONSE, code] => match core_response_description(*code) {
            Some(text) => format!("{text} ({:02X} {code:02X})", CORE_RESPONSE),
            None => format!("core response {code:#04x}"),
        },
        _ => Hex(reply).to_string(),
    }
}

/// Device information returned by the get device info command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceInfo {
    /// Response code (`0x31`).
    pub response: u8,
    /// Command interpreter version.
    pub command_interpreter_version: u16,
    /// BSL build id.
    pub build_id: u16,
    /// Application version.
    pub application_version: u32,
    /// Plug-in interface version.
    pub interface_version: u16,
    /// Largest packet payload the BSL accepts.
    pub max_buffer_size: u16,
    /// Start address of the BSL data buffer.
    pub buffer_start_address: u32,
    /// BCR configuration id.
    pub bcr_configuration_id: u32,
    /// BSL configuration id.
    pub bsl_configuration_id: u32,
}

impl DeviceInfo {
    /// Size of the encoded structure.
    pub const LEN: usize = 25;

    /// Parse the reply payload of the get device info command.
    pub fn parse(reply: &[u8]) -> Result<Self> {
        if reply.len() != Self::LEN {
            return Err(MalformedPacket::DeviceInfoLength(reply.len()).into());
        }

        let mut cursor = reply;
        Ok(Self {
            response: cursor.read_u8()?,
            command_interpreter_version: cursor.read_u16::<LittleEndian>()?,
            build_id: cursor.read_u16::<LittleEndian>()?,
            application_version: cursor.read_u32::<LittleEndian>()?,
            interface_version: cursor.read_u16::<LittleEndian>()?,
            max_buffer_size: cursor.read_u16::<LittleEndian>()?,
            buffer_start_address: cursor.read_u32::<LittleEndian>()?,
            bcr_configuration_id: cursor.read_u32::<LittleEndian>()?,
            bsl_configuration_id: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Device reply frame around `payload`, as the BSL sends it.
    pub(crate) fn reply_frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![ACK, REPLY_HEADER];
        buf.extend_from_slice(&u16::try_from(payload.len()).unwrap().to_le_bytes());
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&crc32(payload).to_le_bytes());
        buf
    }

    /// Encoded device info with the given buffer size.
    pub(crate) fn device_info_bytes(max_buffer_size: u16) -> Vec<u8> {
        let mut buf = vec![0x31];
        buf.extend_from_slice(&0x0001u16.to_le_bytes());
        buf.extend_from_slice(&0x0002u16.to_le_bytes());
        buf.extend_from_slice(&0x0000_0003u32.to_le_bytes());
        buf.extend_from_slice(&0x0004u16.to_le_bytes());
        buf.extend_from_slice(&max_buffer_size.to_le_bytes());
        buf.extend_from_slice(&0x2000_0160u32.to_le_bytes());
        buf.extend_from_slice(&0x0000_0005u32.to_le_bytes());
        buf.extend_from_slice(&0x0000_0006u32.to_le_bytes());
        buf
    }

    #[test]
    fn test_connect_packet() {
        assert_eq!(
            connect(),
            vec![0x80, 0x01, 0x00, 0x12, 0x3A, 0x61, 0x44, 0xDE]
        );
    }

    #[test]
    fn test_change_baud_rate_packet() {
        let data = change_baud_rate(BaudRate::B1000000);
        assert_eq!(&data[..5], &[0x80, 0x02, 0x00, 0x52, 0x07]);
        assert_eq!(data.len(), 9);
    }

    #[test]
    fn test_unlock_packet() {
        let data = unlock(&DEFAULT_PASSWORD);
        assert_eq!(&data[..4], &[0x80, 33, 0x00, 0x21]);
        assert!(data[4..36].iter().all(|&b| b == 0xFF));
        assert_eq!(data.len(), 40);
    }

    #[test]
    fn test_program_data_packet() {
        let data = program_data(12 * 1024, &[0xAA, 0xBB]);
        assert_eq!(&data[..3], &[0x80, 0x07, 0x00]);
        assert_eq!(&data[3..8], &[0x24, 0x00, 0x30, 0x00, 0x00]);
        assert_eq!(&data[8..10], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_round_trip_sizes() {
        for size in [0usize, 1, 2, 25, 12 * 1024, 0xFFFF] {
            let payload: Vec<u8> = (0..size).map(|i| (i * 7) as u8).collect();
            let packed = pack_bsl(&payload);
            assert_eq!(packed.len(), size + 7);

            // The device echo differs from the host frame only in its prefix
            let mut reply = vec![ACK, REPLY_HEADER];
            reply.extend_from_slice(&packed[1..]);
            assert_eq!(unpack_bsl(&reply).unwrap(), payload);
        }
    }

    #[test]
    fn test_any_bit_flip_is_checksum_mismatch() {
        let frame = reply_frame(&[0x3B, 0x00, 0x12]);
        // payload and CRC bytes
        for index in 4..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[index] ^= 1 << bit;
                let err = unpack_bsl(&corrupted).unwrap_err();
                assert!(
                    matches!(err, Error::ChecksumMismatch { .. }),
                    "byte {index} bit {bit}: {err}"
                );
            }
        }
    }

    #[test]
    fn test_unpack_errors_are_distinct() {
        let frame = reply_frame(&[0x3B, 0x00]);

        let mut bad_ack = frame.clone();
        bad_ack[0] = 0x51;
        assert!(matches!(
            unpack_bsl(&bad_ack).unwrap_err(),
            Error::MalformedPacket(MalformedPacket::BadAck(0x51))
        ));

        let mut bad_header = frame.clone();
        bad_header[1] = 0x09;
        assert!(matches!(
            unpack_bsl(&bad_header).unwrap_err(),
            Error::MalformedPacket(MalformedPacket::BadHeader(0x09))
        ));

        let mut long = frame.clone();
        long.push(0);
        assert!(matches!(
            unpack_bsl(&long).unwrap_err(),
            Error::MalformedPacket(MalformedPacket::LengthMismatch {
                declared: 2,
                actual: 3
            })
        ));

        assert!(matches!(
            unpack_bsl(&frame[..5]).unwrap_err(),
            Error::MalformedPacket(MalformedPacket::TooShort(5))
        ));
    }

    #[test]
    fn test_device_info_parse() {
        let info = DeviceInfo::parse(&device_info_bytes(0x3000 + 0x100)).unwrap();
        assert_eq!(info.response, 0x31);
        assert_eq!(info.command_interpreter_version, 1);
        assert_eq!(info.build_id, 2);
        assert_eq!(info.application_version, 3);
        assert_eq!(info.interface_version, 4);
        assert_eq!(info.max_buffer_size, 0x3100);
        assert_eq!(info.buffer_start_address, 0x2000_0160);
        assert_eq!(info.bcr_configuration_id, 5);
        assert_eq!(info.bsl_configuration_id, 6);
    }

    #[test]
    fn test_device_info_wrong_length() {
        let err = DeviceInfo::parse(&[0x31; 24]).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedPacket(MalformedPacket::DeviceInfoLength(24))
        ));
    }

    #[test]
    fn test_describe_reply() {
        assert_eq!(describe_reply(&[0x3B, 0x01]), "BSL locked (3B 01)");
        assert_eq!(describe_reply(&[0x56]), "unknown baud rate (0x56)");
        assert_eq!(describe_reply(&[0x3B, 0x7F]), "core response 0x7f");
        assert_eq!(describe_reply(&[0x01, 0x02, 0x03]), "01 02 03");
        assert!(is_ok(&[0x3B, 0x00]));
        assert!(!is_ok(&[0x3B, 0x00, 0x00]));
    }

    #[test]
    fn test_baud_rate_codes() {
        assert_eq!(BaudRate::B1000000.code(), 7);
        assert_eq!(BaudRate::B1000000.bits_per_second(), 1_000_000);
        assert_eq!(BaudRate::B9600.code(), 2);
    }

    #[test]
    #[should_panic(expected = "exceeds the length field")]
    fn test_pack_bsl_rejects_oversized_payload() {
        let _ = pack_bsl(&vec![0u8; usize::from(u16::MAX) + 1]);
    }
}
