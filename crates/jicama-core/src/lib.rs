//! Jicama Core - Distributed lock manager
//!
//! This crate provides:
//! - The authoritative server-side per-lock state machine and its
//!   checkout-based lock store
//! - The dispatch front door (buffering gate, liveness validation,
//!   disconnect sweep, reconnection replay)
//! - The client-side per-thread lock state machine with greedy local
//!   arbitration
//! - Timer scheduling for tryLock/wait/recall deadlines
//! - The channel and liveness abstractions the transport layer implements

pub mod channel;
pub mod client;
pub mod model;
pub mod server;

// Re-export commonly used types
pub use channel::{ClientLiveness, LockChannel};
pub use client::{ClientLockManager, LockRequestTransport, WaitOutcome};
pub use model::LockManagerConfig;
pub use server::{LockManager, NotifiedWaiters};
