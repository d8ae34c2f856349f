//! In-process transport that still goes through the wire codec.
//!
//! Every request is CBOR-encoded, handed to [`SyncServer::handle_bytes`] and
//! the reply decoded again, so tests exercise the same message path as a
//! networked deployment.

use outpost_protocol::{
    EndSessionRequest, InitiatePullRequest, PullMetadata, PullPage, PullRequest, PushAck,
    PushRequest, StartSessionRequest, StartSessionResponse, SyncMessage,
};
use outpost_sync_engine::{SyncError, SyncResult, SyncTransport};
use outpost_sync_server::SyncServer;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A [`SyncTransport`] connected to an in-process [`SyncServer`].
///
/// Each request is served on its own thread; a reply that does not arrive
/// within the request timeout fails with [`SyncError::Timeout`] while the
/// server carries on.
#[derive(Debug)]
pub struct LoopbackTransport {
    server: Arc<SyncServer>,
    connected: AtomicBool,
    requests: AtomicUsize,
    push_sizes: Mutex<Vec<usize>>,
    latency: Mutex<Duration>,
    timeout: Mutex<Duration>,
}

impl LoopbackTransport {
    /// Connects to `server`.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self {
            server,
            connected: AtomicBool::new(true),
            requests: AtomicUsize::new(0),
            push_sizes: Mutex::new(Vec::new()),
            latency: Mutex::new(Duration::ZERO),
            timeout: Mutex::new(Duration::from_secs(30)),
        }
    }

    /// Delays every request by `latency` before the server sees it.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Simulates losing or regaining the link. Requests on a lost link fail
    /// with a retryable transport error.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of requests that reached the server.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Size of every push page sent, in order.
    pub fn push_sizes(&self) -> Vec<usize> {
        self.push_sizes.lock().clone()
    }

    fn round_trip(&self, message: SyncMessage) -> SyncResult<SyncMessage> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("loopback link is down"));
        }
        let bytes = message.encode()?;
        let server = Arc::clone(&self.server);
        let latency = *self.latency.lock();
        let (reply_tx, reply_rx) = mpsc::channel();
        thread::spawn(move || {
            thread::sleep(latency);
            // The caller may have given up already.
            let _ = reply_tx.send(server.handle_bytes(&bytes));
        });

        let reply = match reply_rx.recv_timeout(*self.timeout.lock()) {
            Ok(reply) => reply.map_err(|e| SyncError::Protocol(e.to_string()))?,
            Err(RecvTimeoutError::Timeout) => return Err(SyncError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(SyncError::transport_retryable("loopback server thread died"))
            }
        };
        self.requests.fetch_add(1, Ordering::SeqCst);

        match SyncMessage::decode(&reply)? {
            SyncMessage::Error { message, retryable } => Err(SyncError::Server { message, retryable }),
            reply => Ok(reply),
        }
    }
}

fn unexpected(reply: SyncMessage) -> SyncError {
    SyncError::Protocol(format!("unexpected reply type {}", reply.type_code()))
}

impl SyncTransport for LoopbackTransport {
    fn set_request_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }

    fn start_session(&self, request: &StartSessionRequest) -> SyncResult<StartSessionResponse> {
        match self.round_trip(SyncMessage::StartSession(request.clone()))? {
            SyncMessage::SessionStarted(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    fn push(&self, request: &PushRequest) -> SyncResult<PushAck> {
        let size = request.changes.len();
        match self.round_trip(SyncMessage::Push(request.clone()))? {
            SyncMessage::PushAck(ack) => {
                self.push_sizes.lock().push(size);
                Ok(ack)
            }
            other => Err(unexpected(other)),
        }
    }

    fn complete_push(&self, session_id: &str) -> SyncResult<bool> {
        let message = SyncMessage::CompletePush {
            session_id: session_id.to_string(),
        };
        match self.round_trip(message)? {
            SyncMessage::PushComplete { complete } => Ok(complete),
            other => Err(unexpected(other)),
        }
    }

    fn check_push_complete(&self, session_id: &str) -> SyncResult<bool> {
        let message = SyncMessage::CheckPushComplete {
            session_id: session_id.to_string(),
        };
        match self.round_trip(message)? {
            SyncMessage::PushComplete { complete } => Ok(complete),
            other => Err(unexpected(other)),
        }
    }

    fn initiate_pull(&self, request: &InitiatePullRequest) -> SyncResult<PullMetadata> {
        match self.round_trip(SyncMessage::InitiatePull(request.clone()))? {
            SyncMessage::PullReady(metadata) => Ok(metadata),
            other => Err(unexpected(other)),
        }
    }

    fn pull(&self, request: &PullRequest) -> SyncResult<PullPage> {
        match self.round_trip(SyncMessage::Pull(request.clone()))? {
            SyncMessage::PullPage(page) => Ok(page),
            other => Err(unexpected(other)),
        }
    }

    fn end_session(&self, session_id: &str) -> SyncResult<()> {
        let message = SyncMessage::EndSession(EndSessionRequest {
            session_id: session_id.to_string(),
        });
        match self.round_trip(message)? {
            SyncMessage::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn mark_session_errored(&self, session_id: &str, error: &str) -> SyncResult<()> {
        let message = SyncMessage::MarkErrored {
            session_id: session_id.to_string(),
            error: error.to_string(),
        };
        match self.round_trip(message)? {
            SyncMessage::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
