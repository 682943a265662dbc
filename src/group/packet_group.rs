//! Batched, serialize-once outgoing packets.

use crate::buffer::{BufferPool, PooledBuffer, BUFFER_LEN};
use crate::lock;
use crate::protocol::strategy::copy_bytes;
use crate::protocol::{CodecError, Compression, OutgoingPacket, StrategyError};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// How a group behaves once it has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Released as soon as its last queued send completes
    SingleUse,
    /// Kept alive by its owner and may be sent any number of times
    MultiUse,
    /// Detaches its compressed bytes on first use for repeated broadcast
    Free,
}

/// Errors produced while finalizing a group.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GroupError {
    /// The group was released and has no payload anymore
    #[error("packet group has been released")]
    Released,

    /// A packet failed to serialize
    #[error("failed to serialize {packet}: {source}")]
    Serialize {
        packet: &'static str,
        #[source]
        source: CodecError,
    },

    /// The compression strategy failed
    #[error("compression failed: {0}")]
    Compression(#[from] StrategyError),
}

struct GroupState {
    kind: GroupKind,
    packets: Vec<Box<dyn OutgoingPacket>>,
    pool: Arc<BufferPool>,

    uncompressed: Option<PooledBuffer>,
    uncompressed_len: usize,
    compressed: Option<PooledBuffer>,
    compressed_len: usize,
    detached: Option<Bytes>,

    written: bool,
    compression_done: bool,
    is_empty: bool,
    dispose_requested: bool,
    released: bool,
}

/// A batch of outgoing packets sent as one transport write.
///
/// Groups are shared as `Arc<PacketGroup>`: the application keeps one
/// reference, the send queue holds one per pending send.
pub struct PacketGroup {
    state: Mutex<GroupState>,
    queued: AtomicI32,
}

fn write_packets(
    packets: &[Box<dyn OutgoingPacket>],
    buf: &mut [u8],
    start: usize,
) -> Result<usize, GroupError> {
    let mut position = start;
    for packet in packets {
        let written = packet
            .write(&mut buf[position..])
            .map_err(|source| GroupError::Serialize {
                packet: packet.name(),
                source,
            })?;
        trace!(
            packet = packet.name(),
            opcode = packet.id(),
            bytes = written,
            "Serialized packet"
        );
        position += written;
    }
    Ok(position)
}

impl GroupState {
    fn is_locked(&self, queued: i32) -> bool {
        self.written
            || self.compression_done
            || self.released
            || self.detached.is_some()
            || queued > 0
    }

    fn ensure_written(&mut self) -> Result<(), GroupError> {
        if self.written {
            return Ok(());
        }
        if self.released {
            return Err(GroupError::Released);
        }

        let mut buf = self.pool.lease();
        let len = write_packets(&self.packets, &mut buf, 0)?;
        self.uncompressed = Some(buf);
        self.uncompressed_len = len;
        self.written = true;
        Ok(())
    }

    fn ensure_compressed(
        &mut self,
        compression: Option<&mut dyn Compression>,
    ) -> Result<(), GroupError> {
        if self.compression_done {
            return Ok(());
        }

        let mut out = self.pool.lease();
        let src = match &self.uncompressed {
            Some(buf) => &buf[..self.uncompressed_len],
            None => &[][..],
        };
        let len = match compression {
            Some(compression) => compression.compress(src, &mut out)?,
            None => copy_bytes(src, &mut out)?,
        };

        self.compressed = Some(out);
        self.compressed_len = len;
        self.compression_done = true;
        Ok(())
    }

    /// Turns a Free group into an immutable MultiUse payload.
    fn detach(&mut self) {
        let bytes = match &self.compressed {
            Some(buf) => Bytes::copy_from_slice(&buf[..self.compressed_len]),
            None => Bytes::new(),
        };
        debug!(
            packets = self.packets.len(),
            bytes = bytes.len(),
            "Detached free packet group"
        );

        self.detached = Some(bytes);
        self.uncompressed = None;
        self.compressed = None;
        self.packets.clear();
        self.kind = GroupKind::MultiUse;
    }

    fn final_bytes(&self) -> &[u8] {
        if let Some(bytes) = &self.detached {
            return bytes;
        }
        match &self.compressed {
            Some(buf) => &buf[..self.compressed_len],
            None => &[],
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        trace!(packets = self.packets.len(), "Released packet group");
        self.packets.clear();
        self.uncompressed = None;
        self.compressed = None;
        self.detached = None;
        self.is_empty = true;
        self.released = true;
    }
}

impl PacketGroup {
    /// Creates an empty group backed by the shared buffer pool.
    pub fn new(kind: GroupKind) -> Arc<Self> {
        Self::with_pool(kind, BufferPool::shared())
    }

    /// Creates an empty group leasing its buffers from `pool`.
    pub fn with_pool(kind: GroupKind, pool: Arc<BufferPool>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GroupState {
                kind,
                packets: Vec::new(),
                pool,
                uncompressed: None,
                uncompressed_len: 0,
                compressed: None,
                compressed_len: 0,
                detached: None,
                written: false,
                compression_done: false,
                is_empty: true,
                dispose_requested: false,
                released: false,
            }),
            queued: AtomicI32::new(0),
        })
    }

    pub fn single_use() -> Arc<Self> {
        Self::new(GroupKind::SingleUse)
    }

    pub fn multi_use() -> Arc<Self> {
        Self::new(GroupKind::MultiUse)
    }

    pub fn free() -> Arc<Self> {
        Self::new(GroupKind::Free)
    }

    pub fn kind(&self) -> GroupKind {
        lock(&self.state).kind
    }

    /// True while no packet (and no detached payload) is in the group.
    pub fn is_empty(&self) -> bool {
        lock(&self.state).is_empty
    }

    pub fn packet_count(&self) -> usize {
        lock(&self.state).packets.len()
    }

    /// Length of the serialized, uncompressed payload (0 until written).
    pub fn written_len(&self) -> usize {
        lock(&self.state).uncompressed_len
    }

    pub fn is_written(&self) -> bool {
        lock(&self.state).written
    }

    pub fn is_compressed(&self) -> bool {
        lock(&self.state).compression_done
    }

    pub fn is_released(&self) -> bool {
        lock(&self.state).released
    }

    /// Number of sends of this group still waiting in the engine's queue.
    pub fn queued_count(&self) -> i32 {
        self.queued.load(Ordering::Acquire)
    }

    /// Appends a packet. Ignored once the group is written, compressed,
    /// queued or released.
    pub fn add_packet(&self, packet: impl OutgoingPacket + 'static) {
        self.add_boxed(Box::new(packet));
    }

    pub fn add_boxed(&self, packet: Box<dyn OutgoingPacket>) {
        let mut state = lock(&self.state);
        if state.is_locked(self.queued_count()) {
            warn!(
                packet = packet.name(),
                "Packet group is locked, ignoring added packet"
            );
            return;
        }
        state.packets.push(packet);
        state.is_empty = false;
    }

    /// Merges `other`'s packets into this group.
    ///
    /// Serializes this group first if needed, then appends `other`'s packets
    /// directly into this group's buffer, but only while the serialized
    /// length is below half of [`BUFFER_LEN`]. On success `other` is left
    /// empty. Returns `false`, leaving this group's payload unchanged, when
    /// the merge is not possible.
    pub fn safe_add_group(&self, other: &PacketGroup) -> bool {
        if std::ptr::eq(self, other) || self.queued_count() > 0 || other.queued_count() > 0 {
            return false;
        }

        let mut state = lock(&self.state);
        if state.kind == GroupKind::Free
            || state.compression_done
            || state.released
            || state.detached.is_some()
        {
            return false;
        }

        let mut other_state = lock(&other.state);
        if other_state.kind == GroupKind::Free
            || other_state.released
            || other_state.packets.is_empty()
        {
            return false;
        }

        if let Err(e) = state.ensure_written() {
            warn!(error = %e, "Failed to serialize packet group for merging");
            return false;
        }
        if state.uncompressed_len >= BUFFER_LEN / 2 {
            return false;
        }

        let start = state.uncompressed_len;
        let Some(buf) = state.uncompressed.as_mut() else {
            return false;
        };
        match write_packets(&other_state.packets, buf, start) {
            Ok(end) => {
                state.uncompressed_len = end;
                state.packets.append(&mut other_state.packets);
                state.is_empty = false;

                other_state.uncompressed = None;
                other_state.uncompressed_len = 0;
                other_state.written = false;
                other_state.is_empty = true;
                trace!(bytes = end, "Merged packet groups");
                true
            }
            Err(e) => {
                debug!(error = %e, "Packet groups do not fit together");
                false
            }
        }
    }

    /// Runs `f` with the group's final (serialized and compressed) bytes.
    ///
    /// Serialization and compression happen at most once; later calls see
    /// the same bytes and ignore `compression`. The first call on a
    /// [`GroupKind::Free`] group detaches an immutable copy of the bytes,
    /// drops every packet and retypes the group as [`GroupKind::MultiUse`].
    pub fn with_final_bytes<R>(
        &self,
        compression: Option<&mut dyn Compression>,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, GroupError> {
        let mut state = lock(&self.state);
        if state.detached.is_none() {
            if state.released {
                return Err(GroupError::Released);
            }
            state.ensure_written()?;
            state.ensure_compressed(compression)?;
            if state.kind == GroupKind::Free {
                state.detach();
            }
        }
        Ok(f(state.final_bytes()))
    }

    /// Records that one send of this group entered the engine's queue.
    pub fn enqueued(&self) {
        self.queued.fetch_add(1, Ordering::AcqRel);
    }

    /// Records that one queued send of this group has been processed.
    ///
    /// A SingleUse group (or one whose disposal was requested while queued)
    /// is released once no send is pending anymore.
    pub fn dequeued(&self) {
        let remaining = self.queued.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining < 0 {
            warn!(remaining, "Packet group dequeued more often than enqueued");
        }
        if remaining > 0 {
            return;
        }

        let mut state = lock(&self.state);
        // Re-check under the lock, a concurrent send may have queued it again
        if self.queued_count() <= 0
            && (state.kind == GroupKind::SingleUse || state.dispose_requested)
        {
            state.release();
        }
    }

    /// Releases the group's packets and buffers.
    ///
    /// If a send is still queued the group is downgraded to SingleUse instead
    /// and released by the last [`dequeued`](Self::dequeued).
    pub fn dispose(&self) {
        let mut state = lock(&self.state);
        if self.queued_count() > 0 {
            state.dispose_requested = true;
            if state.kind == GroupKind::MultiUse {
                state.kind = GroupKind::SingleUse;
            }
            return;
        }
        state.release();
    }
}

impl fmt::Debug for PacketGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("PacketGroup")
            .field("kind", &state.kind)
            .field("packets", &state.packets.len())
            .field("written", &state.written)
            .field("compression_done", &state.compression_done)
            .field("queued", &self.queued_count())
            .field("released", &state.released)
            .finish()
    }
}
