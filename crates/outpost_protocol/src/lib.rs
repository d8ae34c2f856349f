//! # Outpost Sync Protocol
//!
//! Sync protocol types and CBOR codecs for Outpost.
//!
//! This crate provides:
//! - `SyncTick`, the logical clock value stamped on every synced write
//! - `ChangeRecord`, the unit of transfer between facility and central nodes
//! - `Cursor` for resumable pagination ordered by (tick, record)
//! - Protocol messages (session start, push, pull, completion)
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod cursor;
mod error;
mod messages;
mod record;
mod tick;

pub use codec::{from_cbor, to_cbor};
pub use cursor::Cursor;
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    EndSessionRequest, InitiatePullRequest, PullMetadata, PullPage, PullRequest, PushAck,
    PushRequest, StartSessionRequest, StartSessionResponse, SyncMessage,
};
pub use record::{ChangeRecord, Direction, FieldTicks, RecordData, RecordKey, FIELD_TICKS_KEY};
pub use tick::{SyncTick, TickTock};
