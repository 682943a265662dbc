//! The connection engine: global-lock dispatch and the shared send queue.

use super::stats::EngineStats;
use super::worker::{drain_loop, OutgoingMessage, SendQueue};
use crate::buffer::BufferPool;
use crate::connection::{Connection, ConnectionId};
use crate::group::PacketGroup;
use crate::lock;
use crate::protocol::{IncomingPacket, Protocol};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Configuration for a [`ConnectionEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often a connection's join buffer is flushed (default: 333ms)
    pub join_flush_interval: Duration,

    /// Upper bound for writing one packet group to a transport (default: 30s)
    pub send_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            join_flush_interval: Duration::from_millis(333),
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// Errors returned by packet handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The server cannot continue; propagated to the connection's owner
    #[error("fatal handler error: {0}")]
    Fatal(String),

    /// The server is shutting down; propagated like [`HandlerError::Fatal`]
    #[error("operation cancelled")]
    Cancelled,

    /// Any other failure; logged and absorbed
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// True for the errors that are propagated instead of absorbed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Cancelled)
    }
}

/// Dispatches decoded packets under one global lock and owns the send queue.
///
/// # Example
///
/// ```ignore
/// let world = Arc::new(Mutex::new(GameWorld::default()));
/// let engine = ConnectionEngine::start(GameProtocol, world, EngineConfig::default());
///
/// let (stream, addr) = listener.accept().await?;
/// let (reader, writer) = stream.into_split();
/// let conn = Connection::open(&engine, writer, Some(addr));
/// tokio::spawn(handle_connection(conn, reader));
/// ```
pub struct ConnectionEngine<P: Protocol> {
    protocol: P,
    /// The global lock every packet handler runs under
    world: Arc<Mutex<P::World>>,
    config: EngineConfig,
    pool: Arc<BufferPool>,
    queue: Arc<SendQueue<P>>,
    stats: Arc<EngineStats>,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl<P: Protocol> ConnectionEngine<P> {
    /// Starts an engine backed by the shared buffer pool.
    ///
    /// Spawns the send worker, so this must be called inside a Tokio runtime.
    pub fn start(protocol: P, world: Arc<Mutex<P::World>>, config: EngineConfig) -> Arc<Self> {
        Self::start_with_pool(protocol, world, config, BufferPool::shared())
    }

    /// Starts an engine leasing every buffer from `pool`.
    pub fn start_with_pool(
        protocol: P,
        world: Arc<Mutex<P::World>>,
        config: EngineConfig,
        pool: Arc<BufferPool>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = Arc::new(SendQueue::new());

        tokio::spawn(drain_loop(Arc::clone(&queue), shutdown_rx));

        info!(
            join_flush_interval_ms = config.join_flush_interval.as_millis(),
            "Connection engine started"
        );

        Arc::new(Self {
            protocol,
            world,
            config,
            pool,
            queue,
            stats: Arc::new(EngineStats::new()),
            next_id: AtomicU64::new(1),
            shutdown_tx,
        })
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn world(&self) -> &Arc<Mutex<P::World>> {
        &self.world
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// Number of sends waiting for the worker.
    pub fn pending_sends(&self) -> usize {
        self.queue.len()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Runs `f` under the global lock.
    pub fn with_world<R>(&self, f: impl FnOnce(&mut P::World) -> R) -> R {
        let mut world = lock(&self.world);
        f(&mut world)
    }

    /// Queues one send of `group` to `conn`.
    ///
    /// The group's queued count is incremented before the send becomes
    /// visible to the worker.
    pub fn enqueue_outgoing(&self, conn: &Arc<Connection<P>>, group: Arc<PacketGroup>) {
        group.enqueued();
        self.queue.push(OutgoingMessage {
            conn: Arc::clone(conn),
            group,
        });
    }

    /// Runs a decoded packet's handler under the global lock.
    ///
    /// Locks the world, then the connection's state. Non-fatal handler
    /// errors are logged and absorbed; only [`HandlerError::Fatal`] and
    /// [`HandlerError::Cancelled`] are returned to the caller.
    pub fn handle(
        &self,
        conn: &Arc<Connection<P>>,
        packet: Box<dyn IncomingPacket<P>>,
    ) -> Result<(), HandlerError> {
        let name = packet.name();
        let result = {
            let mut world = lock(&self.world);
            let mut state = conn.lock_state();
            packet.handle(conn, &mut state, &mut world)
        };

        match result {
            Ok(()) => {
                self.stats.packet_handled();
                Ok(())
            }
            Err(HandlerError::Cancelled) => {
                debug!(conn = %conn.id(), packet = name, "Packet handler cancelled");
                Err(HandlerError::Cancelled)
            }
            Err(e @ HandlerError::Fatal(_)) => {
                error!(conn = %conn.id(), packet = name, error = %e, "Fatal error in packet handler");
                Err(e)
            }
            Err(e) => {
                self.stats.handler_fault();
                error!(conn = %conn.id(), packet = name, error = %e, "Packet handler failed");
                Ok(())
            }
        }
    }

    /// Resolves once the send queue has been drained since the last enqueue.
    ///
    /// Also resolves when the engine shuts down, since nothing will drain the
    /// queue after that.
    pub async fn wait_for_all_sent(&self) {
        let mut drained_rx = self.queue.subscribe_drained();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = drained_rx.wait_for(|drained| *drained) => {}
            _ = shutdown_rx.wait_for(|shutdown| *shutdown) => {}
        }
    }

    /// Stops the send worker after its current item.
    ///
    /// This is called automatically when the engine is dropped.
    pub fn shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!(pending = self.queue.len(), "Connection engine stopped");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

impl<P: Protocol> Drop for ConnectionEngine<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
