//! Buffer Pool Module
//!
//! Every byte that crosses a connection passes through a fixed-capacity
//! buffer leased from a [`BufferPool`]. The receive pipeline holds three of
//! them per connection (receive, decrypt scratch, decompress scratch), packet
//! groups hold one or two while they are being serialized and compressed, and
//! the send worker leases one scratch buffer per outgoing write.
//!
//! ## Lifetime
//!
//! ```text
//!   BufferPool::lease() ──> PooledBuffer ──> (exclusively owned) ──> Drop ──> back to pool
//! ```
//!
//! A [`PooledBuffer`] returns itself to its pool when dropped, so every exit
//! path (success, early return, `?` propagation) releases the lease.
//!
//! All buffers share the same capacity, [`BUFFER_LEN`]. It is the frame
//! window of the protocol: a single frame, a serialized packet group and a
//! compressed payload all have to fit into it.

pub mod pool;

pub use pool::{BufferPool, PooledBuffer};

/// Capacity of every pooled buffer (64 KB).
pub const BUFFER_LEN: usize = 64 * 1024;
