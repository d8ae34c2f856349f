//! Protocol messages for sync.

use crate::codec::{from_cbor, to_cbor};
use crate::cursor::Cursor;
use crate::error::ProtocolResult;
use crate::record::{ChangeRecord, RecordData};
use crate::tick::SyncTick;
use serde::{Deserialize, Serialize};

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMessage {
    /// Facility asks to open a session.
    StartSession(StartSessionRequest),
    /// Central confirms the session.
    SessionStarted(StartSessionResponse),
    /// One page of outgoing facility changes.
    Push(PushRequest),
    /// Central acknowledges a pushed page.
    PushAck(PushAck),
    /// Facility has sent every page; central should persist them.
    CompletePush {
        /// Session ID.
        session_id: String,
    },
    /// Facility asks whether the pushed changes are persisted yet.
    CheckPushComplete {
        /// Session ID.
        session_id: String,
    },
    /// Whether the pushed changes are persisted.
    PushComplete {
        /// True once central has persisted the push.
        complete: bool,
    },
    /// Facility asks central to snapshot changes to pull.
    InitiatePull(InitiatePullRequest),
    /// Snapshot of changes to pull is ready.
    PullReady(PullMetadata),
    /// Facility requests one page of changes.
    Pull(PullRequest),
    /// One page of changes.
    PullPage(PullPage),
    /// Facility closes the session successfully.
    EndSession(EndSessionRequest),
    /// Facility reports a local failure for the session.
    MarkErrored {
        /// Session ID.
        session_id: String,
        /// Error description.
        error: String,
    },
    /// Generic acknowledgement.
    Ack,
    /// Request failed.
    Error {
        /// Error description.
        message: String,
        /// Whether retrying the same request may succeed.
        retryable: bool,
    },
}

impl SyncMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::StartSession(_) => 1,
            SyncMessage::SessionStarted(_) => 2,
            SyncMessage::Push(_) => 3,
            SyncMessage::PushAck(_) => 4,
            SyncMessage::CompletePush { .. } => 5,
            SyncMessage::PushComplete { .. } => 6,
            SyncMessage::InitiatePull(_) => 7,
            SyncMessage::PullReady(_) => 8,
            SyncMessage::Pull(_) => 9,
            SyncMessage::PullPage(_) => 10,
            SyncMessage::EndSession(_) => 11,
            SyncMessage::MarkErrored { .. } => 12,
            SyncMessage::Ack => 13,
            SyncMessage::Error { .. } => 14,
            SyncMessage::CheckPushComplete { .. } => 15,
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// Request to open a sync session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSessionRequest {
    /// Facility the device belongs to.
    pub facility_id: String,
    /// Device ID.
    pub device_id: String,
    /// Tick the facility last pulled up to.
    pub last_synced_tick: SyncTick,
    /// Free-form diagnostics recorded on the session.
    #[serde(default)]
    pub debug_info: RecordData,
}

impl StartSessionRequest {
    /// Creates a new start request.
    pub fn new(
        facility_id: impl Into<String>,
        device_id: impl Into<String>,
        last_synced_tick: SyncTick,
    ) -> Self {
        Self {
            facility_id: facility_id.into(),
            device_id: device_id.into(),
            last_synced_tick,
            debug_info: RecordData::new(),
        }
    }
}

/// Response to a session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSessionResponse {
    /// New session ID.
    pub session_id: String,
    /// Unique tick reserved for this session.
    pub started_at_tick: SyncTick,
}

/// One page of pushed changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Session ID.
    pub session_id: String,
    /// Changes in this page.
    pub changes: Vec<ChangeRecord>,
}

/// Acknowledgement of a pushed page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAck {
    /// Number of changes staged from the page.
    pub accepted: u32,
}

impl PushAck {
    /// Creates an acknowledgement for `accepted` changes.
    pub fn new(accepted: usize) -> Self {
        Self {
            accepted: u32::try_from(accepted).unwrap_or(u32::MAX),
        }
    }
}

/// Request to snapshot changes for pulling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiatePullRequest {
    /// Session ID.
    pub session_id: String,
    /// Tick the facility last pulled up to.
    pub since: SyncTick,
    /// Only snapshot these models. `None` snapshots every pulled model.
    #[serde(default)]
    pub tables_to_include: Option<Vec<String>>,
    /// Models to snapshot from the beginning of time, whatever `since` is.
    #[serde(default)]
    pub tables_for_full_resync: Vec<String>,
}

impl InitiatePullRequest {
    /// Creates a request for everything changed after `since`.
    pub fn new(session_id: impl Into<String>, since: SyncTick) -> Self {
        Self {
            session_id: session_id.into(),
            since,
            tables_to_include: None,
            tables_for_full_resync: Vec::new(),
        }
    }

    /// Restricts the snapshot to the named models.
    #[must_use]
    pub fn with_tables_to_include<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables_to_include = Some(tables.into_iter().map(Into::into).collect());
        self
    }

    /// Re-sends the named models in full.
    #[must_use]
    pub fn with_tables_for_full_resync<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables_for_full_resync = tables.into_iter().map(Into::into).collect();
        self
    }
}

/// Summary of a prepared pull snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullMetadata {
    /// Number of changes waiting to be pulled.
    pub total_to_pull: u64,
    /// Tick the snapshot is complete up to.
    pub pull_until: SyncTick,
}

/// Request for one page of changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Session ID.
    pub session_id: String,
    /// Position after the last change already received.
    pub since: Cursor,
    /// Maximum number of changes to return.
    pub limit: u32,
}

/// One page of pulled changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullPage {
    /// Changes in `(sync_tick, record key)` order.
    pub records: Vec<ChangeRecord>,
    /// Cursor to request the next page with.
    pub cursor: Cursor,
}

impl PullPage {
    /// Builds a page, advancing `since` past the returned records.
    pub fn new(records: Vec<ChangeRecord>, since: &Cursor) -> Self {
        let mut cursor = since.clone();
        cursor.advance(&records);
        Self { records, cursor }
    }

    /// Returns true if this page is the last one for a request of `limit`.
    pub fn is_last(&self, limit: u32) -> bool {
        self.records.len() < limit as usize
    }
}

/// Request to close a session successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndSessionRequest {
    /// Session ID.
    pub session_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Direction, FIELD_TICKS_KEY};
    use serde_json::json;

    fn change(id: &str, tick: i64) -> ChangeRecord {
        let data = json!({"name": "Ana", FIELD_TICKS_KEY: {"name": tick}})
            .as_object()
            .cloned()
            .unwrap();
        ChangeRecord::new(Direction::Outgoing, "patients", id, data, SyncTick::new(tick))
    }

    #[test]
    fn push_message_survives_cbor() {
        let message = SyncMessage::Push(PushRequest {
            session_id: "s-1".into(),
            changes: vec![change("p1", 4), change("p2", 7).deleted()],
        });

        let bytes = message.encode().unwrap();
        let decoded = SyncMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.type_code(), 3);
    }

    #[test]
    fn pull_request_table_options() {
        let plain = InitiatePullRequest::new("s-1", SyncTick::new(9));
        assert_eq!(plain.tables_to_include, None);
        assert!(plain.tables_for_full_resync.is_empty());

        let message = SyncMessage::InitiatePull(
            InitiatePullRequest::new("s-1", SyncTick::new(9))
                .with_tables_to_include(["patients"])
                .with_tables_for_full_resync(["facility_settings"]),
        );
        let decoded = SyncMessage::decode(&message.encode().unwrap()).unwrap();
        match decoded {
            SyncMessage::InitiatePull(request) => {
                assert_eq!(request.tables_to_include, Some(vec!["patients".to_string()]));
                assert_eq!(request.tables_for_full_resync, vec!["facility_settings".to_string()]);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn pull_page_cursor_follows_last_record() {
        let since = Cursor::since(SyncTick::new(2));
        let page = PullPage::new(vec![change("a", 3), change("b", 4)], &since);
        assert_eq!(page.cursor.tick, SyncTick::new(4));
        assert!(page.is_last(3));
        assert!(!page.is_last(2));

        let empty = PullPage::new(Vec::new(), &since);
        assert_eq!(empty.cursor, since);
        assert!(empty.is_last(1));
    }

    #[test]
    fn error_message_carries_retryability() {
        let message = SyncMessage::Error {
            message: "session lapsed".into(),
            retryable: false,
        };
        let decoded = SyncMessage::decode(&message.encode().unwrap()).unwrap();
        assert!(matches!(
            decoded,
            SyncMessage::Error {
                retryable: false,
                ..
            }
        ));
    }

    #[test]
    fn push_ack_saturates() {
        assert_eq!(PushAck::new(12).accepted, 12);
    }
}
