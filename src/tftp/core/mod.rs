//! TFTP core protocol implementation
//!
//! This module contains the protocol pieces shared by the server and the client:
//! - `packet`: Packet serialization and deserialization
//! - `convert`: Netascii translation

mod convert;
mod packet;

// Public core types
pub use convert::{NetasciiDecoder, NetasciiEncoder, read_segment};
pub use packet::{
    DATA_HEADER_SIZE, ErrorCode, MAX_DATAGRAM_SIZE, Opcode, Packet, PacketError, SEGMENT_SIZE, TransferMode,
};
