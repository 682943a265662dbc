//! One peer connection: identity, close lifecycle and the outgoing side.

use super::handler::ConnectionError;
use crate::engine::ConnectionEngine;
use crate::group::{GroupKind, PacketGroup};
use crate::lock;
use crate::protocol::strategy::copy_bytes;
use crate::protocol::{ConnectionState, OutgoingPacket, Protocol, Strategies};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// The write half of a connection's transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a connection stands in the encryption handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EncryptionMode {
    /// No handshake seen yet
    Pending = 0,
    /// The peer encrypts; traffic both ways goes through the cipher
    Enabled = 1,
    /// The peer chose plain traffic
    Disabled = 2,
}

impl EncryptionMode {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Enabled,
            2 => Self::Disabled,
            _ => Self::Pending,
        }
    }
}

/// A connected peer.
///
/// Always shared as `Arc<Connection<P>>`: the read task, the send queue and
/// the application each hold a reference.
pub struct Connection<P: Protocol> {
    id: ConnectionId,
    endpoint: Option<SocketAddr>,
    engine: Arc<ConnectionEngine<P>>,
    state: Mutex<P::State>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,

    encryption: AtomicU8,
    joining_allowed: AtomicBool,
    flusher_running: AtomicBool,
    /// The pending group small sends are merged into
    joined: Mutex<Option<Arc<PacketGroup>>>,

    closed: watch::Sender<bool>,
    close_reason: Mutex<Option<String>>,
    finished: AtomicBool,
}

impl<P: Protocol> Connection<P> {
    /// Registers a new connection with `engine`.
    ///
    /// `writer` is the transport's write half; the read half is driven by
    /// [`ConnectionHandler`](super::ConnectionHandler).
    pub fn open(
        engine: &Arc<ConnectionEngine<P>>,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        endpoint: Option<SocketAddr>,
    ) -> Arc<Self> {
        let id = engine.next_connection_id();
        let state = engine.protocol().init_state(id, endpoint);
        engine.stats().connection_opened();
        debug!(conn = %id, peer = ?endpoint, "Connection opened");

        Arc::new(Self {
            id,
            endpoint,
            engine: Arc::clone(engine),
            state: Mutex::new(state),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            encryption: AtomicU8::new(EncryptionMode::Pending as u8),
            joining_allowed: AtomicBool::new(false),
            flusher_running: AtomicBool::new(false),
            joined: Mutex::new(None),
            closed: watch::Sender::new(false),
            close_reason: Mutex::new(None),
            finished: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    pub fn engine(&self) -> &Arc<ConnectionEngine<P>> {
        &self.engine
    }

    /// Locks the per-connection state.
    ///
    /// Must not be called while the same thread holds it, which includes
    /// code running inside a packet handler.
    pub fn lock_state(&self) -> MutexGuard<'_, P::State> {
        lock(&self.state)
    }

    pub fn encryption_mode(&self) -> EncryptionMode {
        EncryptionMode::from_u8(self.encryption.load(Ordering::Acquire))
    }

    pub(crate) fn set_encryption_mode(&self, mode: EncryptionMode) {
        self.encryption.store(mode as u8, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn close_reason(&self) -> Option<String> {
        lock(&self.close_reason).clone()
    }

    pub(crate) fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Closes the connection.
    ///
    /// Idempotent: only the first reason is kept. Pending joined packets are
    /// dropped, later sends are ignored and the read task stops at its next
    /// await. The protocol's `on_close` runs from the read task, so this is
    /// safe to call from inside a packet handler.
    pub fn close(&self, reason: impl Into<String>) {
        if self.closed.send_replace(true) {
            return;
        }
        let reason = reason.into();
        info!(conn = %self.id, reason = %reason, "Closing connection");

        *lock(&self.close_reason) = Some(reason);
        lock(&self.joined).take();
    }

    /// Tears down after the read task has stopped: runs the protocol's close
    /// hook under the global lock and shuts the transport down.
    pub(crate) async fn finish(self: &Arc<Self>) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close("Connection closed");
        let reason = self.close_reason().unwrap_or_default();

        self.engine.with_world(|world| {
            let mut state = self.lock_state();
            self.engine
                .protocol()
                .on_close(self, &mut state, world, &reason);
        });

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                trace!(conn = %self.id, error = %e, "Transport shutdown failed");
            }
        }
        self.engine.stats().connection_closed();
        debug!(conn = %self.id, "Connection finished");
    }

    pub fn packet_groups_joining(&self) -> bool {
        self.joining_allowed.load(Ordering::Acquire)
    }

    /// Allows or disallows merging of outgoing groups.
    ///
    /// Allowing starts the periodic flush; disallowing flushes whatever is
    /// pending and lets the periodic flush stop on its next tick.
    pub fn set_packet_groups_joining(self: &Arc<Self>, allowed: bool) {
        self.joining_allowed.store(allowed, Ordering::Release);
        if allowed {
            if !self.flusher_running.swap(true, Ordering::AcqRel) {
                let interval = self.engine.config().join_flush_interval;
                tokio::spawn(join_flush_loop(
                    Arc::downgrade(self),
                    interval,
                    self.closed.subscribe(),
                ));
                trace!(conn = %self.id, "Join flush started");
            }
        } else {
            self.flush_joined();
        }
    }

    /// True while a joined group is waiting for the next flush.
    pub fn has_pending_join(&self) -> bool {
        lock(&self.joined).is_some()
    }

    /// Sends `group` to this connection.
    ///
    /// With joining allowed, a SingleUse group is merged into the pending
    /// joined group; when the merge is refused the pending group is queued
    /// and `group` takes its place. Other kinds are never merged: the pending
    /// group is queued first to keep ordering, then `group` itself.
    pub fn send_packet_group(self: &Arc<Self>, group: Arc<PacketGroup>) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if group.is_empty() {
            warn!(conn = %self.id, "Tried to send an empty packet group");
            return Ok(());
        }
        if !self.packet_groups_joining() {
            self.engine.enqueue_outgoing(self, group);
            return Ok(());
        }

        let mut joined = lock(&self.joined);
        if group.kind() != GroupKind::SingleUse {
            if let Some(pending) = joined.take() {
                self.engine.enqueue_outgoing(self, pending);
            }
            self.engine.enqueue_outgoing(self, group);
            return Ok(());
        }

        let merged = match joined.as_ref() {
            Some(pending) => pending.safe_add_group(&group),
            None => false,
        };
        if !merged {
            if let Some(previous) = joined.replace(group) {
                trace!(conn = %self.id, "Joined group full, flushing");
                self.engine.enqueue_outgoing(self, previous);
            }
        }
        Ok(())
    }

    /// Sends one packet in its own SingleUse group.
    pub fn send_single_packet(
        self: &Arc<Self>,
        packet: impl OutgoingPacket + 'static,
    ) -> Result<(), ConnectionError> {
        let group = PacketGroup::with_pool(GroupKind::SingleUse, Arc::clone(self.engine.pool()));
        group.add_packet(packet);
        self.send_packet_group(group)
    }

    /// Queues the pending joined group, if any.
    pub fn flush_joined(self: &Arc<Self>) {
        let pending = lock(&self.joined).take();
        if let Some(group) = pending {
            if !self.is_closed() {
                self.engine.enqueue_outgoing(self, group);
            }
        }
    }

    /// Writes one queued group to the transport. Runs on the send worker.
    ///
    /// The group is dequeued on every path; a failed send closes the
    /// connection with the failure as reason.
    pub(crate) async fn process_sending(self: &Arc<Self>, group: &Arc<PacketGroup>) {
        let result = self.send_group(group).await;
        group.dequeued();

        if let Err(e) = result {
            error!(conn = %self.id, error = %e, "Failed to send packet group");
            self.close(e.to_string());
        }
    }

    async fn send_group(&self, group: &PacketGroup) -> Result<(), ConnectionError> {
        if self.is_closed() {
            trace!(conn = %self.id, "Connection closed, dropping outgoing group");
            return Ok(());
        }

        let mut out = self.engine.pool().lease();
        let len = {
            let mut state = self.lock_state();
            let Strategies {
                encryption,
                compression,
            } = state.strategies();
            let mode = self.encryption_mode();

            group.with_final_bytes(compression, |bytes| -> Result<usize, ConnectionError> {
                match encryption {
                    Some(_) if mode == EncryptionMode::Pending => {
                        Err(ConnectionError::EncryptionNotInitialised)
                    }
                    Some(encryption) if mode == EncryptionMode::Enabled => {
                        Ok(encryption.encrypt(bytes, &mut out)?)
                    }
                    _ => Ok(copy_bytes(bytes, &mut out)?),
                }
            })??
        };

        self.write_to_transport(&out[..len]).await
    }

    async fn write_to_transport(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(ConnectionError::Closed);
        };

        let timeout = self.engine.config().send_timeout;
        let write = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => {
                self.engine.stats().group_sent(bytes.len());
                trace!(conn = %self.id, bytes = bytes.len(), "Sent packet group");
                Ok(())
            }
            Ok(Err(e)) => Err(ConnectionError::Io(e)),
            Err(_) => Err(ConnectionError::SendTimeout(timeout)),
        }
    }
}

impl<P: Protocol> fmt::Debug for Connection<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("encryption", &self.encryption_mode())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Flushes a connection's joined group every `interval` while joining is
/// allowed.
async fn join_flush_loop<P: Protocol>(
    conn: Weak<Connection<P>>,
    interval: Duration,
    mut closed_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = closed_rx.wait_for(|closed| *closed) => {
                return;
            }
        }

        let Some(conn) = conn.upgrade() else {
            return;
        };
        if !conn.packet_groups_joining() {
            conn.flusher_running.store(false, Ordering::Release);
            // Joining may have been re-enabled while we were stopping
            if conn.packet_groups_joining() && !conn.flusher_running.swap(true, Ordering::AcqRel) {
                continue;
            }
            trace!(conn = %conn.id, "Join flush stopped");
            return;
        }
        conn.flush_joined();
    }
}
