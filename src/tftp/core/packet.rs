//! TFTP packet serialization and deserialization
//!
//! Wire formats (RFC 1350), all integers big-endian:
//!
//! ```text
//! RRQ/WRQ | 01/02 | filename | 0 | mode | 0 |
//! DATA    | 03    | block #  | data (0..=512 bytes) |
//! ACK     | 04    | block #  |
//! ERROR   | 05    | code     | message | 0 |
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Maximum DATA payload. A shorter payload marks the last block.
pub const SEGMENT_SIZE: usize = 512;

/// Opcode plus block number.
pub const DATA_HEADER_SIZE: usize = 4;

/// Receive buffer large enough for any UDP datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Decoding and encoding failures, each naming the offending field
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet too short: {len} bytes")]
    TooShort { len: usize },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("{field} is not null-terminated")]
    Unterminated { field: &'static str },
    #[error("{field} is not valid UTF-8")]
    InvalidText { field: &'static str },
    #[error("{field} is empty")]
    Empty { field: &'static str },
    #[error("{field} contains a null byte")]
    EmbeddedNul { field: &'static str },
    #[error("unsupported transfer mode '{0}'")]
    UnsupportedMode(String),
    #[error("{opcode} packet has invalid length {len}")]
    InvalidLength { opcode: Opcode, len: usize },
    #[error("payload of {len} bytes exceeds the segment size")]
    PayloadTooLarge { len: usize },
}

/// TFTP opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Opcode::Rrq),
            2 => Some(Opcode::Wrq),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            _ => None,
        }
    }

    /// Read the opcode of a raw datagram without decoding the rest
    pub fn peek(buf: &[u8]) -> Option<Self> {
        match buf {
            [hi, lo, ..] => Self::from_u16(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Rrq => "RRQ",
            Opcode::Wrq => "WRQ",
            Opcode::Data => "DATA",
            Opcode::Ack => "ACK",
            Opcode::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Error codes carried by ERROR packets
///
/// Equality and hashing follow the wire value, so `Other(3)` and
/// `DiskFull` are the same code.
#[derive(Debug, Clone, Copy)]
pub enum ErrorCode {
    NotDefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTransferId,
    FileExists,
    NoSuchUser,
    /// Any code outside of RFC 1350
    Other(u16),
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::NotDefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTransferId => 5,
            ErrorCode::FileExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::Other(code) => code,
        }
    }

    /// Message used when no better one is available
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::NotDefined | ErrorCode::Other(_) => "Undefined error code",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

impl PartialEq for ErrorCode {
    fn eq(&self, other: &Self) -> bool {
        self.as_u16() == other.as_u16()
    }
}

impl Eq for ErrorCode {}

impl Hash for ErrorCode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_u16().hash(state);
    }
}

impl From<u16> for ErrorCode {
    fn from(value: u16) -> Self {
        match value {
            0 => ErrorCode::NotDefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            other => ErrorCode::Other(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_u16(), self.default_message())
    }
}

/// Transfer modes accepted by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    Netascii,
    Octet,
}

impl TransferMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferMode::Netascii => "netascii",
            TransferMode::Octet => "octet",
        }
    }
}

impl FromStr for TransferMode {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("octet") {
            Ok(TransferMode::Octet)
        } else if s.eq_ignore_ascii_case("netascii") {
            Ok(TransferMode::Netascii)
        } else {
            Err(PacketError::UnsupportedMode(s.to_string()))
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded TFTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq { filename: String, mode: TransferMode },
    Wrq { filename: String, mode: TransferMode },
    Data { block_num: u16, data: Vec<u8> },
    Ack(u16),
    Error { code: ErrorCode, msg: String },
}

impl Packet {
    /// ERROR packet with the code's default message
    pub fn error(code: ErrorCode) -> Self {
        Packet::Error {
            code,
            msg: code.default_message().to_string(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq { .. } => Opcode::Rrq,
            Packet::Wrq { .. } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack(_) => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let mut buf = Vec::with_capacity(DATA_HEADER_SIZE + SEGMENT_SIZE);
        buf.extend_from_slice(&(self.opcode() as u16).to_be_bytes());

        match self {
            Packet::Rrq { filename, mode } | Packet::Wrq { filename, mode } => {
                if filename.is_empty() {
                    return Err(PacketError::Empty { field: "filename" });
                }
                put_str(&mut buf, filename, "filename")?;
                put_str(&mut buf, mode.as_str(), "mode")?;
            }
            Packet::Data { block_num, data } => {
                if data.len() > SEGMENT_SIZE {
                    return Err(PacketError::PayloadTooLarge { len: data.len() });
                }
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack(block_num) => buf.extend_from_slice(&block_num.to_be_bytes()),
            Packet::Error { code, msg } => {
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                put_str(&mut buf, msg, "message")?;
            }
        }

        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < 2 {
            return Err(PacketError::TooShort { len: buf.len() });
        }
        let raw = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode = Opcode::from_u16(raw).ok_or(PacketError::UnknownOpcode(raw))?;
        let body = &buf[2..];

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let (filename, rest) = take_str(body, "filename")?;
                if filename.is_empty() {
                    return Err(PacketError::Empty { field: "filename" });
                }
                let (mode, _options) = take_str(rest, "mode")?;
                let mode = mode.parse()?;
                let filename = filename.to_string();
                if opcode == Opcode::Rrq {
                    Ok(Packet::Rrq { filename, mode })
                } else {
                    Ok(Packet::Wrq { filename, mode })
                }
            }
            Opcode::Data => {
                if buf.len() < DATA_HEADER_SIZE {
                    return Err(PacketError::InvalidLength { opcode, len: buf.len() });
                }
                let data = &buf[DATA_HEADER_SIZE..];
                if data.len() > SEGMENT_SIZE {
                    return Err(PacketError::PayloadTooLarge { len: data.len() });
                }
                Ok(Packet::Data {
                    block_num: u16::from_be_bytes([buf[2], buf[3]]),
                    data: data.to_vec(),
                })
            }
            Opcode::Ack => {
                if buf.len() != 4 {
                    return Err(PacketError::InvalidLength { opcode, len: buf.len() });
                }
                Ok(Packet::Ack(u16::from_be_bytes([buf[2], buf[3]])))
            }
            Opcode::Error => {
                if buf.len() < 5 {
                    return Err(PacketError::InvalidLength { opcode, len: buf.len() });
                }
                let code = ErrorCode::from(u16::from_be_bytes([buf[2], buf[3]]));
                let msg = &buf[4..];
                let end = msg
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or(PacketError::Unterminated { field: "message" })?;
                Ok(Packet::Error {
                    code,
                    msg: String::from_utf8_lossy(&msg[..end]).into_owned(),
                })
            }
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Rrq { filename, mode } | Packet::Wrq { filename, mode } => {
                write!(f, "{} <file: {}, mode: {}>", self.opcode(), filename, mode)
            }
            Packet::Data { block_num, data } => {
                write!(f, "DATA <block: {}, size: {}>", block_num, data.len())
            }
            Packet::Ack(block_num) => write!(f, "ACK <block: {}>", block_num),
            Packet::Error { code, msg } => write!(f, "ERROR <code: {}, msg: {}>", code.as_u16(), msg),
        }
    }
}

fn put_str(buf: &mut Vec<u8>, value: &str, field: &'static str) -> Result<(), PacketError> {
    if value.as_bytes().contains(&0) {
        return Err(PacketError::EmbeddedNul { field });
    }
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
    Ok(())
}

/// Split off a null-terminated string, returning it and the bytes after the terminator
fn take_str<'a>(buf: &'a [u8], field: &'static str) -> Result<(&'a str, &'a [u8]), PacketError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(PacketError::Unterminated { field })?;
    let value = std::str::from_utf8(&buf[..end]).map_err(|_| PacketError::InvalidText { field })?;
    Ok((value, &buf[end + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: Packet) {
        let bytes = packet.serialize().unwrap();
        assert_eq!(Packet::deserialize(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_round_trip_all_opcodes() {
        round_trip(Packet::Rrq {
            filename: "report.txt".to_string(),
            mode: TransferMode::Octet,
        });
        round_trip(Packet::Wrq {
            filename: "upload/boot.img".to_string(),
            mode: TransferMode::Netascii,
        });
        round_trip(Packet::Data {
            block_num: 7,
            data: vec![0xAB; SEGMENT_SIZE],
        });
        round_trip(Packet::Data {
            block_num: u16::MAX,
            data: Vec::new(),
        });
        round_trip(Packet::Ack(0));
        round_trip(Packet::Error {
            code: ErrorCode::FileNotFound,
            msg: "no such file".to_string(),
        });
        round_trip(Packet::Error {
            code: ErrorCode::Other(42),
            msg: String::new(),
        });
        round_trip(Packet::Error {
            code: ErrorCode::Other(3),
            msg: "quota".to_string(),
        });
    }

    #[test]
    fn test_error_code_equality_follows_wire_value() {
        use std::collections::HashSet;

        assert_eq!(ErrorCode::Other(3), ErrorCode::DiskFull);
        assert_eq!(ErrorCode::Other(0), ErrorCode::NotDefined);
        assert_ne!(ErrorCode::Other(8), ErrorCode::NoSuchUser);

        let codes: HashSet<ErrorCode> = [ErrorCode::Other(7), ErrorCode::NoSuchUser].into_iter().collect();
        assert_eq!(codes.len(), 1);

        let bytes = Packet::Error {
            code: ErrorCode::Other(3),
            msg: String::new(),
        }
        .serialize()
        .unwrap();
        assert_eq!(&bytes[..4], b"\x00\x05\x00\x03");
    }

    #[test]
    fn test_rrq_wire_layout() {
        let bytes = Packet::Rrq {
            filename: "a".to_string(),
            mode: TransferMode::Octet,
        }
        .serialize()
        .unwrap();
        assert_eq!(bytes, b"\x00\x01a\x00octet\x00");
    }

    #[test]
    fn test_mode_is_case_insensitive() {
        let packet = Packet::deserialize(b"\x00\x02file\x00NetASCII\x00").unwrap();
        assert_eq!(
            packet,
            Packet::Wrq {
                filename: "file".to_string(),
                mode: TransferMode::Netascii
            }
        );
    }

    #[test]
    fn test_request_options_are_ignored() {
        let packet = Packet::deserialize(b"\x00\x01boot.img\x00octet\x00blksize\x001400\x00").unwrap();
        assert_eq!(
            packet,
            Packet::Rrq {
                filename: "boot.img".to_string(),
                mode: TransferMode::Octet
            }
        );
    }

    #[test]
    fn test_malformed_requests_name_the_field() {
        assert_eq!(
            Packet::deserialize(b"\x00\x01file"),
            Err(PacketError::Unterminated { field: "filename" })
        );
        assert_eq!(
            Packet::deserialize(b"\x00\x01file\x00octet"),
            Err(PacketError::Unterminated { field: "mode" })
        );
        assert_eq!(
            Packet::deserialize(b"\x00\x01\x00octet\x00"),
            Err(PacketError::Empty { field: "filename" })
        );
        assert_eq!(
            Packet::deserialize(b"\x00\x01file\x00mail\x00"),
            Err(PacketError::UnsupportedMode("mail".to_string()))
        );
        assert_eq!(
            Packet::deserialize(b"\x00\x01\xff\xfe\x00octet\x00"),
            Err(PacketError::InvalidText { field: "filename" })
        );
    }

    #[test]
    fn test_malformed_fixed_width_packets() {
        assert_eq!(Packet::deserialize(b"\x00"), Err(PacketError::TooShort { len: 1 }));
        assert_eq!(Packet::deserialize(b"\x00\x09"), Err(PacketError::UnknownOpcode(9)));
        assert_eq!(
            Packet::deserialize(b"\x00\x03\x00"),
            Err(PacketError::InvalidLength {
                opcode: Opcode::Data,
                len: 3
            })
        );
        assert_eq!(
            Packet::deserialize(b"\x00\x04\x00\x01\x00"),
            Err(PacketError::InvalidLength {
                opcode: Opcode::Ack,
                len: 5
            })
        );
        assert_eq!(
            Packet::deserialize(b"\x00\x05\x00\x01no terminator"),
            Err(PacketError::Unterminated { field: "message" })
        );

        let mut oversized = vec![0, 3, 0, 1];
        oversized.extend_from_slice(&[0u8; SEGMENT_SIZE + 1]);
        assert_eq!(
            Packet::deserialize(&oversized),
            Err(PacketError::PayloadTooLarge { len: SEGMENT_SIZE + 1 })
        );
    }

    #[test]
    fn test_serialize_rejects_invalid_values() {
        let nul = Packet::Rrq {
            filename: "bad\0name".to_string(),
            mode: TransferMode::Octet,
        };
        assert_eq!(nul.serialize(), Err(PacketError::EmbeddedNul { field: "filename" }));

        let big = Packet::Data {
            block_num: 1,
            data: vec![0; SEGMENT_SIZE + 1],
        };
        assert_eq!(big.serialize(), Err(PacketError::PayloadTooLarge { len: SEGMENT_SIZE + 1 }));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::from(1), ErrorCode::FileNotFound);
        assert_eq!(ErrorCode::from(99), ErrorCode::Other(99));
        assert_eq!(ErrorCode::DiskFull.as_u16(), 3);
        assert_eq!(
            Packet::error(ErrorCode::AccessViolation),
            Packet::Error {
                code: ErrorCode::AccessViolation,
                msg: "Access violation".to_string()
            }
        );
    }

    #[test]
    fn test_peek_opcode() {
        assert_eq!(Opcode::peek(b"\x00\x05\x00"), Some(Opcode::Error));
        assert_eq!(Opcode::peek(b"\x00"), None);
        assert_eq!(Opcode::peek(b"\x01\x00"), None);
    }
}
