use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every connection of an engine.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Total number of connections opened
    pub connections_opened: AtomicU64,
    /// Currently open connections
    pub active_connections: AtomicU64,
    /// Packets handed to the application
    pub packets_handled: AtomicU64,
    /// Packets decoded and dropped (discard-after-read opcodes)
    pub packets_discarded: AtomicU64,
    /// Handler errors that were logged and absorbed
    pub handler_faults: AtomicU64,
    /// Packet groups written to a transport
    pub groups_sent: AtomicU64,
    /// Total bytes read from transports
    pub bytes_received: AtomicU64,
    /// Total bytes written to transports
    pub bytes_sent: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn packet_handled(&self) {
        self.packets_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_discarded(&self) {
        self.packets_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_fault(&self) {
        self.handler_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn group_sent(&self, bytes: usize) {
        self.groups_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn bytes_received(&self, count: usize) {
        self.bytes_received.fetch_add(count as u64, Ordering::Relaxed);
    }
}
