//! Connection Module
//!
//! This module manages individual peer connections. Each connection has a
//! read task of its own, while sends from every connection funnel into the
//! engine's single send worker.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Transport listener                         │
//! │                    (main.rs)                                │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ accept(), Connection::open
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler (read task)               │
//! │                                                             │
//! │  ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐  │
//! │  │ Read bytes  │──>│ Decrypt /    │──>│ Frame loop,      │  │
//! │  │             │   │ decompress   │   │ engine.handle()  │  │
//! │  └─────────────┘   └──────────────┘   └──────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!
//!  application ──send_packet_group──> join buffer ──(flush)──> engine queue
//!                                      (333ms tick)              │
//!                                                                ▼
//!                                            send worker: process_sending
//! ```
//!
//! ## Features
//!
//! - **Encryption handshake**: the first bytes decide whether the peer
//!   encrypts; sending before that is a fatal error
//! - **Pooled buffers**: three receive buffers per connection, returned to
//!   the pool when the read task ends
//! - **Join buffer**: small SingleUse groups are merged into one write and
//!   flushed periodically
//!
//! ## Example
//!
//! ```ignore
//! use shardlink::connection::{handle_connection, Connection};
//!
//! let (stream, addr) = listener.accept().await?;
//! let (reader, writer) = stream.into_split();
//! let conn = Connection::open(&engine, writer, Some(addr));
//! conn.set_packet_groups_joining(true);
//! tokio::spawn(handle_connection(conn, reader));
//! ```

pub mod conn;
pub mod handler;
pub mod receive;

// Re-export commonly used types
pub use conn::{BoxedWriter, Connection, ConnectionId, EncryptionMode};
pub use handler::{handle_connection, ConnectionError, ConnectionHandler};
pub use receive::ReceivePipeline;
