//! Packet Encoding and Decoding
//!
//! A frame on the wire is one opcode byte followed by an opcode-defined
//! payload. This module defines the two packet traits the engine works with
//! and the cursors they use to read and write payloads.
//!
//! ## Incoming
//!
//! The receive pipeline reads the opcode byte, asks the [`Protocol`] for a
//! decoder and calls [`IncomingPacket::read`] with the bytes that follow.
//! `read` wraps the packet's own `decode` and turns cursor errors into a
//! [`ReadPacketResult`]:
//!
//! - reading past the available bytes means the frame is incomplete
//!   (`NeedMoreData`)
//! - any other decode error means the framing can no longer be trusted
//!   (`DiscardAll`)
//!
//! ## Outgoing
//!
//! [`OutgoingPacket::write`] always emits the opcode byte first and returns
//! the number of bytes written, measured to the furthest position the writer
//! reached (seeking backwards to patch a length field does not shrink it).
//!
//! All multi-byte integers are big-endian.
//!
//! [`Protocol`]: super::Protocol

use crate::connection::Connection;
use crate::engine::HandlerError;
use crate::protocol::Protocol;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors produced while encoding or decoding a packet payload.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// The reader ran past the bytes received so far
    #[error("unexpected end of data: needed {needed} bytes, {available} available")]
    UnexpectedEnd { needed: usize, available: usize },

    /// The writer ran past the end of its buffer
    #[error("buffer full: needed {needed} bytes, {available} available")]
    BufferFull { needed: usize, available: usize },

    /// The payload is malformed
    #[error("invalid packet data: {0}")]
    InvalidData(String),
}

/// Outcome of decoding one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPacketResult {
    /// The packet was decoded and may be handled
    Success,
    /// The packet was consumed but must not be handled
    DiscardSingle,
    /// The packet is bad; drop everything buffered after it
    DiscardAll,
    /// The frame is incomplete; retry once more bytes arrive
    NeedMoreData,
}

/// A packet received from a peer.
///
/// A fresh instance is produced by [`Protocol::decoder`] for every frame,
/// filled in by [`decode`](Self::decode) and, unless discarded, consumed by
/// [`handle`](Self::handle) under the engine's global lock.
pub trait IncomingPacket<P: Protocol>: Send {
    /// Human-readable name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Decodes the payload that follows the opcode byte.
    fn decode(&mut self, reader: &mut PacketReader<'_>) -> Result<ReadPacketResult, CodecError>;

    /// Applies the packet to the connection state and the shared world.
    fn handle(
        self: Box<Self>,
        conn: &Arc<Connection<P>>,
        state: &mut P::State,
        world: &mut P::World,
    ) -> Result<(), HandlerError>;

    /// Decodes from `buf` and reports how many bytes the frame consumed.
    ///
    /// `buf` holds every unconsumed byte after the opcode, so it may contain
    /// more than this one frame.
    fn read(&mut self, buf: &[u8]) -> (ReadPacketResult, usize) {
        let mut reader = PacketReader::new(buf);
        match self.decode(&mut reader) {
            Ok(result) => {
                let consumed = reader.consumed();
                if consumed > buf.len() {
                    // Seeked past the end without reading
                    (ReadPacketResult::NeedMoreData, 0)
                } else {
                    (result, consumed)
                }
            }
            Err(CodecError::UnexpectedEnd { .. }) => (ReadPacketResult::NeedMoreData, 0),
            Err(e) => {
                debug!(packet = self.name(), error = %e, "Failed to decode packet");
                (ReadPacketResult::DiscardAll, 0)
            }
        }
    }
}

/// A packet to be sent to a peer, serialized by a packet group.
pub trait OutgoingPacket: Send {
    /// The opcode byte that precedes the payload.
    fn id(&self) -> u8;

    /// Human-readable name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Encodes the payload (without the opcode byte).
    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<(), CodecError>;

    /// Writes opcode and payload to the start of `buf`, returning the length.
    fn write(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let mut writer = PacketWriter::new(buf);
        writer.write_u8(self.id())?;
        self.encode(&mut writer)?;
        Ok(writer.len())
    }
}

/// Cuts a decoded string at the first NUL and, when `single_line` is set,
/// at the first line break, with tabs turned into spaces.
fn clean_string(mut s: String, single_line: bool) -> String {
    if let Some(nul) = s.find('\0') {
        s.truncate(nul);
    }
    if single_line {
        if let Some(eol) = s.find(['\r', '\n']) {
            s.truncate(eol);
        }
        if s.contains('\t') {
            s = s.replace('\t', " ");
        }
    }
    s
}

/// Read cursor over the bytes following an opcode.
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    position: usize,
    last_position: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            position: 0,
            last_position: 0,
        }
    }

    /// Bytes consumed so far (the furthest position reached).
    pub fn consumed(&self) -> usize {
        self.last_position
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left after the current position.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.position)
    }

    pub fn seek_from_start(&mut self, count: usize) {
        self.position = count;
        self.last_position = self.last_position.max(self.position);
    }

    pub fn seek_from_current(&mut self, count: usize) {
        self.position += count;
        self.last_position = self.last_position.max(self.position);
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        let end = self.position + count;
        if end > self.buf.len() {
            return Err(CodecError::UnexpectedEnd {
                needed: end,
                available: self.buf.len(),
            });
        }
        let buf: &'a [u8] = self.buf;
        let bytes = &buf[self.position..end];
        self.seek_from_current(count);
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, CodecError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        self.take(count)
    }

    /// Decodes `len` bytes of 8-bit text as a single line.
    pub fn read_ascii(&mut self, len: usize) -> Result<String, CodecError> {
        let bytes = self.take(len)?;
        Ok(clean_string(String::from_utf8_lossy(bytes).into_owned(), true))
    }

    /// Decodes text up to (and consuming) the next NUL byte.
    pub fn read_terminated_ascii(&mut self) -> Result<String, CodecError> {
        let rest = &self.buf[self.position.min(self.buf.len())..];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(CodecError::UnexpectedEnd {
                needed: self.buf.len() + 1,
                available: self.buf.len(),
            })?;
        let text = self.read_ascii(len)?;
        self.seek_from_current(1);
        Ok(text)
    }

    /// Decodes `len` bytes of big-endian UTF-16 text as a single line.
    pub fn read_utf16_be(&mut self, len: usize) -> Result<String, CodecError> {
        let bytes = self.take(len)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        Ok(clean_string(String::from_utf16_lossy(&units), true))
    }

    /// Decodes a UTF-8 string prefixed by its byte length as an `i32`.
    pub fn read_utf8_prefixed(&mut self) -> Result<String, CodecError> {
        let len = self.read_i32()?;
        let len = usize::try_from(len)
            .map_err(|_| CodecError::InvalidData(format!("negative string length {len}")))?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::InvalidData(e.to_string()))
    }
}

/// Write cursor used by [`OutgoingPacket::write`].
#[derive(Debug)]
pub struct PacketWriter<'a> {
    buf: &'a mut [u8],
    position: usize,
    last_position: usize,
}

impl<'a> PacketWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            position: 0,
            last_position: 0,
        }
    }

    /// Bytes written so far (the furthest position reached).
    pub fn len(&self) -> usize {
        self.last_position
    }

    pub fn is_empty(&self) -> bool {
        self.last_position == 0
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn seek_from_start(&mut self, count: usize) {
        self.position = count;
        self.last_position = self.last_position.max(self.position);
    }

    pub fn seek_from_current(&mut self, count: usize) {
        self.position += count;
        self.last_position = self.last_position.max(self.position);
    }

    fn space(&mut self, count: usize) -> Result<&mut [u8], CodecError> {
        let end = self.position + count;
        if end > self.buf.len() {
            return Err(CodecError::BufferFull {
                needed: end,
                available: self.buf.len(),
            });
        }
        let start = self.position;
        self.seek_from_current(count);
        Ok(&mut self.buf[start..end])
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), CodecError> {
        self.space(1)?[0] = value;
        Ok(())
    }

    pub fn write_i8(&mut self, value: i8) -> Result<(), CodecError> {
        self.write_u8(value as u8)
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), CodecError> {
        self.write_u8(u8::from(value))
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), CodecError> {
        self.space(2)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn write_i16(&mut self, value: i16) -> Result<(), CodecError> {
        self.write_u16(value as u16)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), CodecError> {
        self.space(4)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), CodecError> {
        self.write_u32(value as u32)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.space(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_zeros(&mut self, count: usize) -> Result<(), CodecError> {
        self.space(count)?.fill(0);
        Ok(())
    }

    pub fn write_ascii(&mut self, value: &str) -> Result<(), CodecError> {
        self.write_bytes(value.as_bytes())
    }

    /// Writes at most `max_len` bytes of `value`, zero-padding up to `max_len`.
    pub fn write_ascii_fixed(&mut self, value: &str, max_len: usize) -> Result<(), CodecError> {
        let bytes = value.as_bytes();
        let len = bytes.len().min(max_len);
        self.write_bytes(&bytes[..len])?;
        self.write_zeros(max_len - len)
    }

    pub fn write_utf16_be(&mut self, value: &str) -> Result<(), CodecError> {
        for unit in value.encode_utf16() {
            self.write_u16(unit)?;
        }
        Ok(())
    }

    /// Writes a UTF-8 string prefixed by its byte length as an `i32`.
    pub fn write_utf8_prefixed(&mut self, value: &str) -> Result<(), CodecError> {
        let len = i32::try_from(value.len())
            .map_err(|_| CodecError::InvalidData(format!("string too long: {}", value.len())))?;
        self.write_i32(len)?;
        self.write_bytes(value.as_bytes())
    }
}
