//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::manager::CentralSyncManager;
use outpost_core::{LiveStore, RelationPlanner};
use outpost_protocol::{PushAck, SyncMessage};
use std::sync::Arc;
use tracing::{debug, warn};

/// The sync server.
///
/// Dispatches protocol messages to the [`CentralSyncManager`]. Failures are
/// answered with [`SyncMessage::Error`] so the facility can tell transient
/// errors from permanent ones.
///
/// # Example
///
/// ```
/// use outpost_core::{LiveStore, ModelRegistry, RelationPlanner, TickClock};
/// use outpost_protocol::{StartSessionRequest, SyncMessage, SyncTick};
/// use outpost_sync_server::{ServerConfig, SyncServer};
/// use std::sync::Arc;
///
/// let store = Arc::new(LiveStore::new(Arc::new(TickClock::default())));
/// let planner = Arc::new(RelationPlanner::new(Arc::new(ModelRegistry::new())));
/// let server = SyncServer::new(ServerConfig::default(), store, planner);
///
/// let request = StartSessionRequest::new("facility-1", "device-1", SyncTick::ORIGIN);
/// let reply = server.handle_message(SyncMessage::StartSession(request));
/// assert!(matches!(reply, SyncMessage::SessionStarted(_)));
/// ```
pub struct SyncServer {
    manager: CentralSyncManager,
}

impl SyncServer {
    /// Creates a server over central's live store.
    pub fn new(config: ServerConfig, store: Arc<LiveStore>, planner: Arc<RelationPlanner>) -> Self {
        Self {
            manager: CentralSyncManager::new(config, store, planner),
        }
    }

    /// The session manager behind this server.
    pub fn manager(&self) -> &CentralSyncManager {
        &self.manager
    }

    /// Handles a sync message, answering failures with an error message.
    pub fn handle_message(&self, message: SyncMessage) -> SyncMessage {
        let type_code = message.type_code();
        match self.dispatch(message) {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_server_error() {
                    warn!(type_code, error = %e, "sync request failed");
                } else {
                    debug!(type_code, error = %e, "sync request rejected");
                }
                SyncMessage::Error {
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                }
            }
        }
    }

    /// Handles a CBOR-encoded message and returns the encoded reply.
    ///
    /// Only undecodable input is an error; request failures are encoded as
    /// [`SyncMessage::Error`].
    pub fn handle_bytes(&self, bytes: &[u8]) -> ServerResult<Vec<u8>> {
        let message = SyncMessage::decode(bytes)?;
        Ok(self.handle_message(message).encode()?)
    }

    fn dispatch(&self, message: SyncMessage) -> ServerResult<SyncMessage> {
        let m = &self.manager;
        Ok(match message {
            SyncMessage::StartSession(req) => SyncMessage::SessionStarted(m.start_session(&req)?),
            SyncMessage::Push(req) => {
                let accepted = m.add_incoming_changes(&req.session_id, req.changes)?;
                SyncMessage::PushAck(PushAck::new(accepted))
            }
            SyncMessage::CompletePush { session_id } => SyncMessage::PushComplete {
                complete: m.complete_push(&session_id)?,
            },
            SyncMessage::CheckPushComplete { session_id } => SyncMessage::PushComplete {
                complete: m.check_push_complete(&session_id)?,
            },
            SyncMessage::InitiatePull(req) => SyncMessage::PullReady(m.initiate_pull(&req)?),
            SyncMessage::Pull(req) => {
                SyncMessage::PullPage(m.pull(&req.session_id, &req.since, req.limit)?)
            }
            SyncMessage::EndSession(req) => {
                m.end_session(&req.session_id)?;
                SyncMessage::Ack
            }
            SyncMessage::MarkErrored { session_id, error } => {
                m.mark_session_errored(&session_id, &error)?;
                SyncMessage::Ack
            }
            other => {
                return Err(ServerError::InvalidRequest(format!(
                    "unexpected message type {}",
                    other.type_code()
                )))
            }
        })
    }
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("manager", &self.manager)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_core::{ModelRegistry, ModelSchema, TickClock};
    use outpost_protocol::{
        ChangeRecord, Cursor, Direction, EndSessionRequest, InitiatePullRequest, PullRequest,
        PushRequest, RecordData, StartSessionRequest, SyncTick,
    };

    fn server() -> SyncServer {
        let store = Arc::new(LiveStore::new(Arc::new(TickClock::new(SyncTick::new(10)))));
        let registry = ModelRegistry::new().with_model(ModelSchema::new("patients").with_attributes(["id"]));
        let planner = Arc::new(RelationPlanner::new(Arc::new(registry)));
        SyncServer::new(ServerConfig::default(), store, planner)
    }

    fn start(server: &SyncServer) -> String {
        let request = StartSessionRequest::new("facility-1", "device-1", SyncTick::ORIGIN);
        match server.handle_message(SyncMessage::StartSession(request)) {
            SyncMessage::SessionStarted(resp) => resp.session_id,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn full_session_over_messages() {
        let server = server();
        let session_id = start(&server);

        let change = ChangeRecord::new(
            Direction::Outgoing,
            "patients",
            "p1",
            RecordData::new(),
            SyncTick::new(4),
        );
        let reply = server.handle_message(SyncMessage::Push(PushRequest {
            session_id: session_id.clone(),
            changes: vec![change],
        }));
        assert_eq!(reply, SyncMessage::PushAck(PushAck::new(1)));

        let reply = server.handle_message(SyncMessage::CompletePush {
            session_id: session_id.clone(),
        });
        assert_eq!(reply, SyncMessage::PushComplete { complete: true });
        let reply = server.handle_message(SyncMessage::CheckPushComplete {
            session_id: session_id.clone(),
        });
        assert_eq!(reply, SyncMessage::PushComplete { complete: true });

        let reply = server.handle_message(SyncMessage::InitiatePull(InitiatePullRequest::new(
            session_id.clone(),
            SyncTick::ORIGIN,
        )));
        let metadata = match reply {
            SyncMessage::PullReady(metadata) => metadata,
            other => panic!("unexpected reply {other:?}"),
        };
        // The only change is the facility's own push.
        assert_eq!(metadata.total_to_pull, 0);

        let reply = server.handle_message(SyncMessage::Pull(PullRequest {
            session_id: session_id.clone(),
            since: Cursor::default(),
            limit: 100,
        }));
        let page = match reply {
            SyncMessage::PullPage(page) => page,
            other => panic!("unexpected reply {other:?}"),
        };
        assert!(page.records.is_empty());

        let reply = server.handle_message(SyncMessage::EndSession(EndSessionRequest {
            session_id: session_id.clone(),
        }));
        assert_eq!(reply, SyncMessage::Ack);
        assert!(server.manager().sessions().get(&session_id).unwrap().completed_at.is_some());
    }

    #[test]
    fn failures_become_error_messages() {
        let server = server();
        let reply = server.handle_message(SyncMessage::EndSession(EndSessionRequest {
            session_id: "missing".into(),
        }));
        assert!(matches!(reply, SyncMessage::Error { retryable: false, .. }));

        let reply = server.handle_message(SyncMessage::Ack);
        assert!(matches!(reply, SyncMessage::Error { .. }));
    }

    #[test]
    fn bytes_round_trip() {
        let server = server();
        let request = SyncMessage::StartSession(StartSessionRequest::new("f", "d", SyncTick::ORIGIN));
        let reply = server.handle_bytes(&request.encode().unwrap()).unwrap();
        assert!(matches!(
            SyncMessage::decode(&reply).unwrap(),
            SyncMessage::SessionStarted(_)
        ));
        assert!(server.handle_bytes(&[0xff, 0x00]).is_err());
    }

    #[test]
    fn errored_sessions_are_acknowledged() {
        let server = server();
        let session_id = start(&server);
        let reply = server.handle_message(SyncMessage::MarkErrored {
            session_id: session_id.clone(),
            error: "disk full".into(),
        });
        assert_eq!(reply, SyncMessage::Ack);
        let row = server.manager().sessions().get(&session_id).unwrap();
        assert_eq!(row.error.as_deref(), Some("disk full"));
    }
}
