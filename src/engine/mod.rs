//! Connection Engine Module
//!
//! The engine ties connections to the application: every decoded packet is
//! handled under one global lock over the application's world, and every
//! outgoing packet group is written by one background worker.
//!
//! ## Architecture
//!
//! ```text
//!  read task (per connection)              send worker (one per engine)
//! ┌──────────────────────────┐           ┌──────────────────────────┐
//! │ ReceivePipeline          │           │ drain_loop               │
//! │   decode frame           │           │   pop OutgoingMessage    │
//! │        │                 │           │        │                 │
//! │        ▼                 │           │        ▼                 │
//! │ ConnectionEngine::handle │           │ Connection::             │
//! │   lock world ─┐          │           │   process_sending        │
//! │   lock state  │ handler  │           │   compress, encrypt,     │
//! │               └──────────┼─ send ───>│   write to transport     │
//! └──────────────────────────┘   queue   └──────────────────────────┘
//! ```
//!
//! Lock order is world, then connection state, then join buffer, then group.
//! The send worker only ever takes connection state, then group.

pub mod dispatch;
pub mod stats;
pub mod worker;

pub use dispatch::{ConnectionEngine, EngineConfig, HandlerError};
pub use stats::EngineStats;
pub use worker::OutgoingMessage;
