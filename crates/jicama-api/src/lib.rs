//! Jicama API - Wire models for the lock protocol
//!
//! This crate defines:
//! - Identifier value types (`LockId`, `ThreadId`, `ClientId`, `LockLevel`)
//! - Lock contexts exchanged during recall and reconnection
//! - Request/reply message enums carried over the (out-of-scope) transport
//! - Read-only snapshot models for administrative tooling

pub mod message;
pub mod model;

// Re-export commonly used types
pub use message::{LockRequestMessage, NotifyMode, ServerLockMessage};
pub use model::{
    ClientId, HoldSnapshot, LockContext, LockContextState, LockId, LockLevel, LockOwner,
    LockSnapshot, PendingSnapshot, ThreadId, WaiterSnapshot,
};
