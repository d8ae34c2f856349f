//! # Outpost Sync Engine
//!
//! Facility-side sync for Outpost.
//!
//! This crate provides:
//! - The facility sync state machine (idle → pushing → pulling → synced)
//! - Paged push and pull with adaptive page sizes
//! - Retry of transient transport errors with exponential backoff
//! - The transport abstraction and a scripted mock transport
//!
//! ## Architecture
//!
//! A session runs **push-then-pull**:
//! 1. Open a session with central and adopt its tick
//! 2. Export local changes since the last push and send them in pages
//! 3. Wait until central has persisted them
//! 4. Pull central's snapshot in pages, run incoming hooks and save
//!
//! ## Key Invariants
//!
//! - Every pending change is pushed exactly once per session
//! - The push and pull cursors only move after their phase succeeded
//! - A failed session always drops its staging area

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod config;
mod engine;
mod error;
mod limiter;
mod transport;

pub use batch::{BatchTransferCoordinator, TransferReport};
pub use config::{LimiterConfig, RetryConfig, SyncConfig};
pub use engine::{FacilitySyncEngine, SyncCycleResult, SyncState, SyncStats};
pub use error::{SyncError, SyncResult};
pub use limiter::DynamicLimiter;
pub use transport::{MockTransport, SyncTransport};
