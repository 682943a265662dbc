//! The receive pipeline: decrypt, decompress, split frames, compact.
//!
//! ```text
//!  receiving ──decrypt──> decrypted ──decompress──> decompressed
//!  [received_len..]       (scratch)                  [offset .. offset+length]
//!                                                         │
//!                                        frame loop <─────┘
//!                                        opcode -> decoder -> read -> handle
//! ```
//!
//! Undecoded bytes stay in the decompressed buffer between reads. Once they
//! start past the middle of the buffer they are moved to the front.

use super::conn::{Connection, EncryptionMode};
use super::handler::ConnectionError;
use crate::buffer::{PooledBuffer, BUFFER_LEN};
use crate::protocol::strategy::copy_bytes;
use crate::protocol::{
    ConnectionState, EncryptionInitResult, Protocol, ReadPacketResult, StrategyError,
};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Where the bytes to decompress ended up after the decryption stage.
enum Decrypted {
    /// Still in the receive buffer
    Received { offset: usize, length: usize },
    /// In the decrypt scratch buffer
    Scratch { length: usize },
}

/// Receive-side buffers and framing state of one connection.
///
/// Owned by the connection's read task; dropping it returns all three
/// buffers to the pool.
pub struct ReceivePipeline<P: Protocol> {
    conn: Arc<Connection<P>>,
    receiving: PooledBuffer,
    decrypted: PooledBuffer,
    decompressed: PooledBuffer,
    /// Handshake bytes kept in `receiving` until the encryption decides
    received_len: usize,
    offset: usize,
    length: usize,
}

impl<P: Protocol> ReceivePipeline<P> {
    pub fn new(conn: Arc<Connection<P>>) -> Self {
        let pool = Arc::clone(conn.engine().pool());
        Self {
            conn,
            receiving: pool.lease(),
            decrypted: pool.lease(),
            decompressed: pool.lease(),
            received_len: 0,
            offset: 0,
            length: 0,
        }
    }

    pub fn connection(&self) -> &Arc<Connection<P>> {
        &self.conn
    }

    /// The part of the receive buffer the next transport read goes into.
    ///
    /// Sized so the read still fits next to the undecoded bytes once they
    /// are moved to the front of the decompressed buffer.
    pub fn receive_space(&mut self) -> Result<&mut [u8], ConnectionError> {
        let end = BUFFER_LEN - self.length;
        if self.received_len >= end {
            return Err(ConnectionError::BufferOverflow);
        }
        Ok(&mut self.receiving[self.received_len..end])
    }

    /// The `(offset, length)` of the decompressed bytes not yet decoded.
    pub fn unconsumed(&self) -> (usize, usize) {
        (self.offset, self.length)
    }

    /// Processes `new_bytes` just read into [`receive_space`](Self::receive_space).
    ///
    /// Returns an error when the connection must be closed: a bad handshake,
    /// a buffer overflow, a strategy failure or a fatal handler error.
    pub fn process_received_data(&mut self, new_bytes: usize) -> Result<(), ConnectionError> {
        let length = self.received_len + new_bytes;
        let Some(decrypted) = self.decrypt(length)? else {
            return Ok(());
        };

        let produced = self.decompress(decrypted)?;
        let (offset, length) = Self::frame_loop(
            &self.conn,
            &self.decompressed[..],
            self.offset,
            self.length + produced,
        )?;

        self.compact(offset, length)
    }

    /// Runs the handshake or decrypts. `None` means the handshake needs
    /// more bytes.
    fn decrypt(&mut self, length: usize) -> Result<Option<Decrypted>, ConnectionError> {
        let conn = &self.conn;
        let mut state = conn.lock_state();
        let Some(encryption) = state.strategies().encryption else {
            return Ok(Some(Decrypted::Received { offset: 0, length }));
        };

        let mut offset = 0;
        let mut length = length;
        match conn.encryption_mode() {
            EncryptionMode::Disabled => {
                return Ok(Some(Decrypted::Received { offset, length }));
            }
            EncryptionMode::Pending => {
                let (result, consumed) = encryption.init(&self.receiving[..length]);
                let consumed = consumed.min(length);
                match result {
                    EncryptionInitResult::SuccessUseEncryption => {
                        debug!(conn = %conn.id(), encryption = encryption.name(), "Using encryption");
                        conn.set_encryption_mode(EncryptionMode::Enabled);
                    }
                    EncryptionInitResult::SuccessNoEncryption => {
                        debug!(conn = %conn.id(), "Peer does not use encryption");
                        conn.set_encryption_mode(EncryptionMode::Disabled);
                    }
                    EncryptionInitResult::InvalidData => {
                        return Err(ConnectionError::Handshake(format!(
                            "{} not recognised",
                            encryption.name()
                        )));
                    }
                    EncryptionInitResult::NotEnoughData => {
                        trace!(conn = %conn.id(), buffered = length, "Handshake needs more data");
                        self.received_len = length;
                        return Ok(None);
                    }
                }
                offset += consumed;
                length -= consumed;
                self.received_len = 0;

                if conn.encryption_mode() == EncryptionMode::Disabled {
                    return Ok(Some(Decrypted::Received { offset, length }));
                }
            }
            EncryptionMode::Enabled => {}
        }

        let produced = encryption.decrypt(
            &self.receiving[offset..offset + length],
            &mut self.decrypted[..],
        )?;
        Ok(Some(Decrypted::Scratch { length: produced }))
    }

    /// Appends the decrypted bytes, decompressed, after the unconsumed tail.
    fn decompress(&mut self, decrypted: Decrypted) -> Result<usize, ConnectionError> {
        let src = match decrypted {
            Decrypted::Received { offset, length } => &self.receiving[offset..offset + length],
            Decrypted::Scratch { length } => &self.decrypted[..length],
        };
        let mut state = self.conn.lock_state();
        let compression = state.strategies().compression;

        // Decompressed output has no known bound, so it always starts
        // right after the undecoded bytes at the front
        let fits = compression.is_none() && self.offset + self.length + src.len() <= BUFFER_LEN;
        if self.offset > 0 && !fits {
            self.decompressed
                .copy_within(self.offset..self.offset + self.length, 0);
            trace!(
                conn = %self.conn.id(),
                from = self.offset,
                bytes = self.length,
                "Moved undecoded bytes to the front"
            );
            self.offset = 0;
        }

        let dst = &mut self.decompressed[self.offset + self.length..];
        let result = match compression {
            Some(compression) => compression.decompress(src, dst),
            None => copy_bytes(src, dst),
        };
        result.map_err(|e| match e {
            StrategyError::OutputTooSmall { .. } => ConnectionError::BufferOverflow,
            e => ConnectionError::Strategy(e),
        })
    }

    /// Decodes and dispatches complete frames from `bytes[offset..offset + length]`.
    ///
    /// Returns the unconsumed region left over.
    fn frame_loop(
        conn: &Arc<Connection<P>>,
        bytes: &[u8],
        mut offset: usize,
        mut length: usize,
    ) -> Result<(usize, usize), ConnectionError> {
        let engine = conn.engine();

        while length > 0 {
            let opcode = bytes[offset];
            let decoder = {
                let state = conn.lock_state();
                engine.protocol().decoder(opcode, conn, &state)
            };

            let Some(mut decoder) = decoder else {
                warn!(
                    conn = %conn.id(),
                    opcode = format_args!("0x{:02X}", opcode),
                    discarded = length,
                    "Unknown opcode, discarding buffered data"
                );
                trace!(conn = %conn.id(), data = ?&bytes[offset..offset + length.min(64)], "Discarded data");
                offset += length;
                length = 0;
                break;
            };

            let available = length - 1;
            let (result, consumed) = match decoder.packet.read(&bytes[offset + 1..offset + length]) {
                (_, consumed) if consumed > available => {
                    debug!(
                        conn = %conn.id(),
                        packet = decoder.packet.name(),
                        consumed,
                        available,
                        "Decoder claimed more bytes than buffered"
                    );
                    (ReadPacketResult::NeedMoreData, 0)
                }
                read => read,
            };
            match result {
                ReadPacketResult::NeedMoreData => {
                    trace!(
                        conn = %conn.id(),
                        packet = decoder.packet.name(),
                        buffered = length,
                        "Incomplete frame, need more data"
                    );
                    break;
                }
                ReadPacketResult::Success => {
                    offset += 1 + consumed;
                    length -= 1 + consumed;
                    if decoder.discard_after_read {
                        trace!(conn = %conn.id(), packet = decoder.packet.name(), "Discarded packet");
                        engine.stats().packet_discarded();
                    } else {
                        trace!(conn = %conn.id(), packet = decoder.packet.name(), "Handling packet");
                        engine.handle(conn, decoder.packet)?;
                        if conn.is_closed() {
                            break;
                        }
                    }
                }
                ReadPacketResult::DiscardSingle => {
                    debug!(conn = %conn.id(), packet = decoder.packet.name(), "Discarded packet");
                    offset += 1 + consumed;
                    length -= 1 + consumed;
                }
                ReadPacketResult::DiscardAll => {
                    debug!(
                        conn = %conn.id(),
                        packet = decoder.packet.name(),
                        discarded = length,
                        "Bad packet, discarding buffered data"
                    );
                    offset += length;
                    length = 0;
                }
            }
        }

        Ok((offset, length))
    }

    /// Moves undecoded bytes to the front once they start past the middle.
    fn compact(&mut self, offset: usize, length: usize) -> Result<(), ConnectionError> {
        if length == 0 {
            self.offset = 0;
            self.length = 0;
            return Ok(());
        }

        if offset > BUFFER_LEN / 2 {
            self.decompressed.copy_within(offset..offset + length, 0);
            trace!(conn = %self.conn.id(), from = offset, bytes = length, "Compacted receive buffer");
            self.offset = 0;
        } else if offset + length == BUFFER_LEN {
            return Err(ConnectionError::BufferOverflow);
        } else {
            self.offset = offset;
        }
        self.length = length;
        Ok(())
    }
}
