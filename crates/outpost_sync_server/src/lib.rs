//! # Outpost Sync Server
//!
//! Central side of Outpost sync.
//!
//! This crate provides:
//! - Session lifecycle with a capacity limit and idle timeout
//! - Staging and persisting of pushed facility changes
//! - Snapshots of changes for facilities to pull, without echoes
//! - Dispatch of CBOR-encoded protocol messages
//!
//! # Protocol
//!
//! A facility session runs push-then-pull:
//! 1. The facility opens a session; central reserves a unique tick for it
//! 2. The facility pushes pages of changes, then asks central to persist them
//! 3. Central stamps every persisted record with a fresh tock
//! 4. The facility asks for a snapshot; central waits for writers at or
//!    below the snapshot tick, then stages every change the facility has not
//!    seen, leaving out what it just pushed
//! 5. The facility pulls the snapshot in pages and ends the session

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod config;
mod error;
mod manager;
mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use manager::CentralSyncManager;
pub use server::SyncServer;
