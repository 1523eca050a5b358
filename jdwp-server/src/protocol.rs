// JDWP protocol definitions and packet handling
//
// Reference: https://docs.oracle.com/javase/8/docs/platform/jpda/jdwp/jdwp-protocol.html

use crate::commands::error_codes;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

// All multi-byte values are big-endian

pub type JdwpResult<T> = Result<T, JdwpError>;

/// Transport-level failures. Any of these ends the connection.
#[derive(Debug, Error)]
pub enum JdwpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid handshake")]
    InvalidHandshake,

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Connection closed")]
    ConnectionClosed,
}

// JDWP handshake string
pub const JDWP_HANDSHAKE: &[u8] = b"JDWP-Handshake";

// Packet structure:
// length (4 bytes) - includes header
// id (4 bytes)
// flags (1 byte) - 0x00 = command, 0x80 = reply
// [Command packet: command set (1 byte) + command (1 byte)]
// [Reply packet: error code (2 bytes)]
// data (variable)

pub const HEADER_SIZE: usize = 11;
pub const REPLY_FLAG: u8 = 0x80;

/// Frames declaring more than this are rejected before any allocation
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    pub id: u32,
    pub command_set: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPacket {
    pub id: u32,
    pub error_code: u16,
    pub data: Vec<u8>,
}

/// Either direction of traffic on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Command(CommandPacket),
    Reply(ReplyPacket),
}

/// Fixed 11-byte prefix shared by both packet kinds. `tail` is the command
/// set and command for commands, the error code for replies.
#[derive(Debug, Clone, Copy)]
struct Header {
    id: u32,
    flags: u8,
    tail: [u8; 2],
}

impl Header {
    fn read(buf: &mut &[u8]) -> JdwpResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(JdwpError::Protocol(format!("Invalid packet length: {}", buf.len())));
        }

        let declared = buf.get_u32() as usize;
        if declared != buf.len() + 4 {
            return Err(JdwpError::Protocol(format!(
                "Length field {} does not match frame of {} bytes",
                declared,
                buf.len() + 4
            )));
        }

        let id = buf.get_u32();
        let flags = buf.get_u8();
        let tail = [buf.get_u8(), buf.get_u8()];
        Ok(Self { id, flags, tail })
    }

    fn write(&self, data: &[u8]) -> Vec<u8> {
        let length = HEADER_SIZE + data.len();
        let mut buf = BytesMut::with_capacity(length);
        buf.put_u32(length as u32);
        buf.put_u32(self.id);
        buf.put_u8(self.flags);
        buf.put_slice(&self.tail);
        buf.put_slice(data);
        buf.to_vec()
    }
}

impl CommandPacket {
    pub fn new(id: u32, command_set: u8, command: u8) -> Self {
        Self::with_data(id, command_set, command, Vec::new())
    }

    pub fn with_data(id: u32, command_set: u8, command: u8, data: Vec<u8>) -> Self {
        Self {
            id,
            command_set,
            command,
            data,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        Header {
            id: self.id,
            flags: 0,
            tail: [self.command_set, self.command],
        }
        .write(&self.data)
    }

    pub fn decode(mut buf: &[u8]) -> JdwpResult<Self> {
        let header = Header::read(&mut buf)?;
        if header.flags & REPLY_FLAG != 0 {
            return Err(JdwpError::Protocol(format!("Expected a command, got flags {:#x}", header.flags)));
        }

        let [command_set, command] = header.tail;
        Ok(Self::with_data(header.id, command_set, command, buf.to_vec()))
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl ReplyPacket {
    pub fn new(id: u32, data: Vec<u8>) -> Self {
        Self {
            id,
            error_code: error_codes::NONE,
            data,
        }
    }

    /// Reply carrying only an error code
    pub fn error(id: u32, error_code: u16) -> Self {
        Self {
            id,
            error_code,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        Header {
            id: self.id,
            flags: REPLY_FLAG,
            tail: self.error_code.to_be_bytes(),
        }
        .write(&self.data)
    }

    pub fn decode(mut buf: &[u8]) -> JdwpResult<Self> {
        let header = Header::read(&mut buf)?;
        if header.flags != REPLY_FLAG {
            return Err(JdwpError::Protocol(format!("Expected a reply, got flags {:#x}", header.flags)));
        }

        Ok(Self {
            id: header.id,
            error_code: u16::from_be_bytes(header.tail),
            data: buf.to_vec(),
        })
    }

    pub fn is_error(&self) -> bool {
        self.error_code != error_codes::NONE
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn error_message(&self) -> &'static str {
        error_message(self.error_code)
    }
}

impl Packet {
    /// Decode a complete frame (header included) by inspecting the flags byte
    pub fn decode(buf: &[u8]) -> JdwpResult<Self> {
        match buf.get(8) {
            Some(flags) if flags & REPLY_FLAG != 0 => ReplyPacket::decode(buf).map(Packet::Reply),
            Some(_) => CommandPacket::decode(buf).map(Packet::Command),
            None => Err(JdwpError::Protocol(format!("Invalid packet length: {}", buf.len()))),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Command(command) => command.encode(),
            Packet::Reply(reply) => reply.encode(),
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Packet::Command(command) => command.id,
            Packet::Reply(reply) => reply.id,
        }
    }
}

/// Symbolic name of an error code this server can produce
pub fn error_message(error_code: u16) -> &'static str {
    match error_code {
        error_codes::NONE => "NONE",
        error_codes::INVALID_THREAD => "INVALID_THREAD",
        error_codes::THREAD_NOT_SUSPENDED => "THREAD_NOT_SUSPENDED",
        error_codes::INVALID_OBJECT => "INVALID_OBJECT",
        error_codes::INVALID_LOCATION => "INVALID_LOCATION",
        error_codes::INVALID_FRAMEID => "INVALID_FRAMEID",
        error_codes::NOT_IMPLEMENTED => "NOT_IMPLEMENTED",
        error_codes::INVALID_EVENT_TYPE => "INVALID_EVENT_TYPE",
        error_codes::ILLEGAL_ARGUMENT => "ILLEGAL_ARGUMENT",
        error_codes::VM_DEAD => "VM_DEAD",
        error_codes::INTERNAL => "INTERNAL",
        error_codes::ALREADY_INVOKING => "ALREADY_INVOKING",
        _ => "UNKNOWN_ERROR",
    }
}
