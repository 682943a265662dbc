//! # Shardlink - Client-Connection Engine for Persistent Game Servers
//!
//! Shardlink turns raw byte streams from game clients into discrete packets
//! and back again. It batches outgoing traffic, negotiates per-connection
//! encryption and serializes every mutation of the shared game world behind
//! one lock.
//!
//! ## Features
//!
//! - **Layered receive pipeline**: decrypt, decompress, split frames, compact
//! - **Packet groups**: serialize once, compress once, broadcast many times
//! - **Join buffer**: small sends merged into one write, flushed every 333ms
//! - **Single send worker**: FIFO ordering of all outgoing traffic
//! - **Pooled buffers**: hot-path I/O never allocates
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Shardlink                                  │
//! │                                                                         │
//! │  ┌─────────────┐    ┌──────────────┐    ┌──────────────────────────┐    │
//! │  │ Transport   │───>│ Connection   │───>│ ConnectionEngine::handle │    │
//! │  │ (read half) │    │ Handler +    │    │ (global world lock)      │    │
//! │  └─────────────┘    │ Receive      │    └────────────┬─────────────┘    │
//! │                     │ Pipeline     │                 │                  │
//! │                     └──────────────┘                 ▼                  │
//! │                                          ┌──────────────────────────┐   │
//! │                                          │ Protocol (application)   │   │
//! │                                          │ builds PacketGroups      │   │
//! │                                          └────────────┬─────────────┘   │
//! │                                                       │ send            │
//! │  ┌─────────────┐    ┌──────────────┐    ┌────────────▼─────────────┐    │
//! │  │ Transport   │<───│ Send worker  │<───│ Join buffer / send queue │    │
//! │  │ (write half)│    │ compress,    │    └──────────────────────────┘    │
//! │  └─────────────┘    │ encrypt      │                                    │
//! │                     └──────────────┘                                    │
//! │                                                                         │
//! │                      BufferPool (shared by every stage)                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use shardlink::chat::{ChatProtocol, ChatWorld};
//! use shardlink::connection::{handle_connection, Connection};
//! use shardlink::engine::{ConnectionEngine, EngineConfig};
//! use std::sync::{Arc, Mutex};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     let world = Arc::new(Mutex::new(ChatWorld::default()));
//!     let engine = ConnectionEngine::start(ChatProtocol::default(), world, EngineConfig::default());
//!
//!     let listener = TcpListener::bind("127.0.0.1:2593").await.unwrap();
//!     loop {
//!         let (stream, addr) = listener.accept().await.unwrap();
//!         let (reader, writer) = stream.into_split();
//!         let conn = Connection::open(&engine, writer, Some(addr));
//!         tokio::spawn(handle_connection(conn, reader));
//!     }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`buffer`]: fixed-capacity buffer pool
//! - [`protocol`]: the traits an application implements, packet cursors
//! - [`group`]: outgoing packet groups
//! - [`connection`]: per-connection receive pipeline and send side
//! - [`engine`]: global-lock dispatch and the send worker
//! - [`chat`]: a small chat protocol built on the engine
//!
//! ## Design Highlights
//!
//! ### Single-Writer World
//!
//! Packets are decoded on each connection's own task, but handled under one
//! lock over the application's world, so game state never sees two handlers
//! at once. The lock is never held around I/O.
//!
//! ### Serialize Once
//!
//! A packet group is serialized and compressed at most once. A `Free` group
//! detaches its final bytes on first send and can then be broadcast to any
//! number of connections without touching its packets again.

pub mod buffer;
pub mod chat;
pub mod connection;
pub mod engine;
pub mod group;
pub mod protocol;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types for convenience
pub use buffer::{BufferPool, PooledBuffer, BUFFER_LEN};
pub use connection::{handle_connection, Connection, ConnectionError, ConnectionId};
pub use engine::{ConnectionEngine, EngineConfig, EngineStats, HandlerError};
pub use group::{GroupKind, PacketGroup};
pub use protocol::{ConnectionState, IncomingPacket, OutgoingPacket, Protocol};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// The default port the demo server listens on
pub const DEFAULT_PORT: u16 = 2593;

/// The default host the demo server binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of Shardlink
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
