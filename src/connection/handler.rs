//! Connection Handler Module
//!
//! Each connection gets its own read task that runs in a loop, reading bytes
//! from the transport and feeding them through the receive pipeline.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Transport accepted, Connection::open
//!        │
//!        ▼
//! 2. ConnectionHandler spawned
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │      Main Loop               │
//!    │                              │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Read into receive space │ │
//!    │  └───────────┬─────────────┘ │
//!    │              │               │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Decrypt, decompress     │ │
//!    │  └───────────┬─────────────┘ │
//!    │              │               │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Decode + handle frames  │ │
//!    │  └───────────┬─────────────┘ │
//!    │              │               │
//!    │              ▼               │
//!    │         [Loop back]          │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. Peer disconnects / protocol error / Connection::close
//!        │
//!        ▼
//! 5. Buffers released, Protocol::on_close, transport shut down
//! ```
//!
//! Only one read is outstanding per connection: the next read is issued
//! after the previous bytes have been decoded and handled.

use super::conn::Connection;
use super::receive::ReceivePipeline;
use crate::engine::HandlerError;
use crate::group::GroupError;
use crate::protocol::{Protocol, StrategyError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, trace, warn};

/// Drives the read side of one connection.
pub struct ConnectionHandler<P: Protocol, R> {
    /// The transport's read half
    reader: R,

    /// Receive buffers and framing state
    pipeline: ReceivePipeline<P>,
}

impl<P: Protocol, R: AsyncRead + Unpin> ConnectionHandler<P, R> {
    pub fn new(conn: Arc<Connection<P>>, reader: R) -> Self {
        Self {
            reader,
            pipeline: ReceivePipeline::new(conn),
        }
    }

    /// Runs the read loop until the peer disconnects, an error occurs or the
    /// connection is closed, then tears the connection down.
    ///
    /// Returns `Ok(())` when the connection was closed locally.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let conn = Arc::clone(self.pipeline.connection());
        info!(conn = %conn.id(), peer = ?conn.endpoint(), "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(conn = %conn.id(), reason = ?conn.close_reason(), "Connection closed"),
            Err(e) => match e {
                ConnectionError::ClientDisconnected => {
                    debug!(conn = %conn.id(), "Client disconnected")
                }
                ConnectionError::Io(io_err)
                    if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    debug!(conn = %conn.id(), "Connection reset by client")
                }
                _ => warn!(conn = %conn.id(), error = %e, "Connection error"),
            },
        }
        if let Err(e) = &result {
            conn.close(e.to_string());
        }

        drop(self);
        conn.finish().await;
        result
    }

    /// The read-decode-handle loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        let conn = Arc::clone(self.pipeline.connection());
        let mut closed_rx = conn.subscribe_closed();

        loop {
            let space = self.pipeline.receive_space()?;
            let n = tokio::select! {
                read = self.reader.read(space) => read?,
                _ = closed_rx.wait_for(|closed| *closed) => return Ok(()),
            };

            if n == 0 {
                return Err(ConnectionError::ClientDisconnected);
            }

            conn.engine().stats().bytes_received(n);
            trace!(conn = %conn.id(), bytes = n, "Read data");

            self.pipeline.process_received_data(n)?;
            if conn.is_closed() {
                return Ok(());
            }
        }
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// The encryption handshake was not recognised
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Undecoded bytes fill the whole receive buffer
    #[error("Receive buffer overflow")]
    BufferOverflow,

    /// Encryption or compression failed
    #[error("Strategy error: {0}")]
    Strategy(#[from] StrategyError),

    /// A packet group could not be finalized
    #[error("Packet group error: {0}")]
    Group(#[from] GroupError),

    #[error("Tried sending data with encryption not initialised.")]
    EncryptionNotInitialised,

    /// Writing to the transport took too long
    #[error("Send timed out after {0:?}")]
    SendTimeout(Duration),

    /// The connection is closed
    #[error("Connection closed")]
    Closed,

    /// A packet handler failed fatally
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),
}

/// Handles a connection's read side to completion.
///
/// Connection-level errors are logged and end only this connection; a fatal
/// handler error is returned so the owner can stop the server.
pub async fn handle_connection<P, R>(conn: Arc<Connection<P>>, reader: R) -> Result<(), HandlerError>
where
    P: Protocol,
    R: AsyncRead + Unpin,
{
    let id = conn.id();
    match ConnectionHandler::new(conn, reader).run().await {
        Ok(()) => Ok(()),
        Err(ConnectionError::Handler(e)) => Err(e),
        Err(e) => {
            match e {
                ConnectionError::ClientDisconnected => {}
                ConnectionError::Io(ref io_err)
                    if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
                _ => {
                    debug!(conn = %id, error = %e, "Connection ended with error");
                }
            }
            Ok(())
        }
    }
}
