//! Packet Group Module
//!
//! Outgoing traffic is sent in packet groups: a batch of packets serialized
//! once, compressed once and written to the transport as one unit.
//!
//! ## Lifecycle variants
//!
//! ```text
//! SingleUse ── send ──> queued (count > 0) ── last dequeue ──> released
//!
//! MultiUse  ── send ──> queued ── dequeue ──> kept by its owner, resendable
//!
//! Free ── first final_bytes ──> compressed copy detached, packets dropped,
//!                               retyped MultiUse (immutable broadcast payload)
//! ```
//!
//! Two unsent groups can be merged with [`PacketGroup::safe_add_group`] while
//! the target's serialized length is below half of [`BUFFER_LEN`]; the
//! connection's join buffer uses this to turn many small sends into one
//! transport write.
//!
//! [`BUFFER_LEN`]: crate::buffer::BUFFER_LEN

pub mod packet_group;

pub use packet_group::{GroupError, GroupKind, PacketGroup};
