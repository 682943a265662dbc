//! Protocol Collaborator Interfaces
//!
//! The engine owns framing, buffering, batching and dispatch, but it knows
//! nothing about concrete opcodes. An application plugs in through the
//! traits in this module:
//!
//! - [`Protocol`]: maps an opcode byte to a fresh decoder, creates the
//!   per-connection state and is told when a connection closes
//! - [`ConnectionState`]: per-connection data, optionally exposing the
//!   connection's [`Encryption`] and [`Compression`] strategies through
//!   [`Strategies`]
//! - [`IncomingPacket`] / [`OutgoingPacket`]: the packets themselves
//!
//! ## Example
//!
//! ```ignore
//! struct MyProtocol;
//!
//! impl Protocol for MyProtocol {
//!     type State = MyState;
//!     type World = MyWorld;
//!
//!     fn init_state(&self, id: ConnectionId, endpoint: Option<SocketAddr>) -> MyState {
//!         MyState::new(id, endpoint)
//!     }
//!
//!     fn decoder(
//!         &self,
//!         opcode: u8,
//!         _conn: &Arc<Connection<Self>>,
//!         _state: &MyState,
//!     ) -> Option<PacketDecoder<Self>> {
//!         match opcode {
//!             0x01 => Some(PacketDecoder::handle(Box::new(Login::default()))),
//!             0x73 => Some(PacketDecoder::discard(Box::new(KeepAlive::default()))),
//!             _ => None,
//!         }
//!     }
//! }
//! ```

pub mod packet;
pub mod strategy;

pub use packet::{
    CodecError, IncomingPacket, OutgoingPacket, PacketReader, PacketWriter, ReadPacketResult,
};
pub use strategy::{Compression, Encryption, EncryptionInitResult, StrategyError};

use crate::connection::{Connection, ConnectionId};
use std::net::SocketAddr;
use std::sync::Arc;

/// Per-connection application state.
///
/// The state is locked while a packet decoder is looked up, while the
/// receive pipeline decrypts/decompresses and while the send worker
/// compresses/encrypts, so strategies may keep mutable cipher state.
pub trait ConnectionState: Send + 'static {
    /// The connection's encryption and compression, if it uses any.
    ///
    /// ```ignore
    /// fn strategies(&mut self) -> Strategies<'_> {
    ///     Strategies {
    ///         encryption: self.cipher.as_mut().map(|c| c as &mut dyn Encryption),
    ///         compression: None,
    ///     }
    /// }
    /// ```
    fn strategies(&mut self) -> Strategies<'_> {
        Strategies::default()
    }
}

/// Mutable views of a connection's strategies, borrowed together so a send
/// can compress and encrypt under one lock.
#[derive(Default)]
pub struct Strategies<'a> {
    pub encryption: Option<&'a mut dyn Encryption>,
    pub compression: Option<&'a mut dyn Compression>,
}

/// A decoder chosen for one opcode.
pub struct PacketDecoder<P: Protocol> {
    /// A fresh packet instance to decode into
    pub packet: Box<dyn IncomingPacket<P>>,
    /// Decode the frame but do not hand it to the application
    pub discard_after_read: bool,
}

impl<P: Protocol> PacketDecoder<P> {
    /// A decoder whose packet is handled after a successful read.
    pub fn handle(packet: Box<dyn IncomingPacket<P>>) -> Self {
        Self {
            packet,
            discard_after_read: false,
        }
    }

    /// A decoder whose packet is read (to advance the stream) and dropped.
    pub fn discard(packet: Box<dyn IncomingPacket<P>>) -> Self {
        Self {
            packet,
            discard_after_read: true,
        }
    }
}

/// The application protocol driven by the engine.
pub trait Protocol: Send + Sync + Sized + 'static {
    /// Per-connection state
    type State: ConnectionState;

    /// Shared game state, guarded by the engine's single global lock
    type World: Send + 'static;

    /// Creates the state for a newly opened connection.
    fn init_state(&self, id: ConnectionId, endpoint: Option<SocketAddr>) -> Self::State;

    /// Looks up the decoder for `opcode`; `None` means the opcode is unknown.
    fn decoder(
        &self,
        opcode: u8,
        conn: &Arc<Connection<Self>>,
        state: &Self::State,
    ) -> Option<PacketDecoder<Self>>;

    /// Called once, under the global lock, after a connection has closed.
    fn on_close(
        &self,
        _conn: &Arc<Connection<Self>>,
        _state: &mut Self::State,
        _world: &mut Self::World,
        _reason: &str,
    ) {
    }
}
