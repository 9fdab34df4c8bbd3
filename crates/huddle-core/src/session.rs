//! Client sessions for Huddle.
//!
//! A session is the server-side record of one live connection. It owns the
//! sending half of the connection's outbound queue, so pushing a message
//! never waits on the socket.

use huddle_protocol::{codec, ProtocolError, ServerMessage};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Counter behind [`ConnectionId::generate`].
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
///
/// Ids increase monotonically, so ordering by id is ordering by connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a connection ID from a raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identity assigned to a session by a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Held glyph id.
    pub glyph_id: String,
    /// Display name from the handshake.
    pub name: Option<String>,
    /// Device type from the handshake.
    pub device_type: Option<String>,
}

/// Errors from pushing a message into a session's outbound queue.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The client is not draining its queue fast enough.
    #[error("Outbound queue of {0} is full")]
    QueueFull(ConnectionId),

    /// The session was torn down or its writer has gone away.
    #[error("Session {0} is closed")]
    Closed(ConnectionId),

    /// The message could not be encoded.
    #[error("Failed to encode message: {0}")]
    Encode(#[from] ProtocolError),
}

/// Errors from assigning an identity.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifyError {
    /// The session already holds a glyph.
    #[error("Session already identified as {0}")]
    AlreadyIdentified(String),

    /// The session was torn down.
    #[error("Session is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct SessionState {
    identity: Option<Identity>,
    closed: bool,
}

/// Server-side state of one live connection.
#[derive(Debug)]
pub struct ClientSession {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    outbound: mpsc::Sender<Arc<str>>,
    /// Cancelled when the server tears the connection down.
    teardown: CancellationToken,
    connected_at: Instant,
    /// Milliseconds since `connected_at` of the last inbound activity.
    last_seen_ms: AtomicU64,
    state: Mutex<SessionState>,
}

impl ClientSession {
    /// Create a session that sends through `outbound`.
    #[must_use]
    pub fn new(id: ConnectionId, peer: Option<SocketAddr>, outbound: mpsc::Sender<Arc<str>>) -> Self {
        Self {
            id,
            peer,
            outbound,
            teardown: CancellationToken::new(),
            connected_at: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Create a session together with its outbound queue.
    #[must_use]
    pub fn with_queue(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(id, peer, tx), rx)
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the remote address, if known.
    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Get the assigned identity.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        self.state.lock().identity.clone()
    }

    /// Get the held glyph id.
    #[must_use]
    pub fn glyph_id(&self) -> Option<String> {
        self.state
            .lock()
            .identity
            .as_ref()
            .map(|identity| identity.glyph_id.clone())
    }

    /// Check whether a handshake has completed.
    #[must_use]
    pub fn is_identified(&self) -> bool {
        self.state.lock().identity.is_some()
    }

    /// Check whether the session has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Assign the session's identity. Succeeds at most once.
    ///
    /// # Errors
    ///
    /// Fails if the session is already identified or already closed. The
    /// caller still owns the glyph in that case.
    pub fn identify(&self, identity: Identity) -> Result<(), IdentifyError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(IdentifyError::Closed);
        }
        if let Some(existing) = &state.identity {
            return Err(IdentifyError::AlreadyIdentified(existing.glyph_id.clone()));
        }
        state.identity = Some(identity);
        Ok(())
    }

    /// Mark the session closed.
    ///
    /// Returns the identity the session held, only on the call that actually
    /// closed it, so the glyph is released exactly once.
    pub fn close(&self) -> Option<Identity> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.closed = true;
        state.identity.clone()
    }

    /// Ask the connection's socket tasks to say goodbye and close.
    pub fn request_teardown(&self) {
        self.teardown.cancel();
    }

    /// Token cancelled by [`request_teardown`](Self::request_teardown).
    #[must_use]
    pub fn teardown_token(&self) -> CancellationToken {
        self.teardown.clone()
    }

    /// Queue a message for this client.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the queue is full or closed.
    pub fn send(&self, message: &ServerMessage) -> Result<(), DeliveryError> {
        let text: Arc<str> = codec::encode(message)?.into();
        self.send_text(text)
    }

    /// Queue pre-encoded text for this client.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or its queue is full.
    pub fn send_text(&self, text: Arc<str>) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed(self.id));
        }
        self.outbound.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull(self.id),
            TrySendError::Closed(_) => DeliveryError::Closed(self.id),
        })
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        let elapsed = self.connected_at.elapsed().as_millis() as u64;
        self.last_seen_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last inbound activity (or since connect).
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.connected_at.elapsed().saturating_sub(last_seen)
    }
}
