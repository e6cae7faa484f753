//! Core module: concurrency primitives for the I/O engine
//!
//! Design principles:
//! - One lock, one purpose: only the pending-registration handoff is shared mutable state
//! - Readers never block the loop: registration views are swapped wholesale
//! - Everything else is owned by a single event-loop thread

mod pending;
mod snapshot;

pub use pending::PendingQueue;
pub use snapshot::Snapshot;
