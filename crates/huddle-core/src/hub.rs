//! The Huddle hub: per-connection state machine over the pool and registry.
//!
//! A connection moves `Connecting -> Identified -> Closed`. The hub owns every
//! transition; the transport only feeds it socket events and drains each
//! session's outbound queue.

use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::event::{DisconnectedEvent, Tick};
use crate::gate::DEFAULT_TARGET_FPS;
use crate::pool::{GlyphGrant, GlyphPool, PoolError};
use crate::registry::{Registry, RegistryError};
use crate::session::{ClientSession, ConnectionId, DeliveryError, Identity, IdentifyError};
use huddle_protocol::{
    codec, ClientMessage, Handshake, MessageType, ProtocolError, ServerMessage, CAPACITY_WARNING,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Target rate for proximity pushes.
    pub outgoing_fps: u32,
    /// Capacity of each session's outbound queue.
    pub outbound_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outgoing_fps: DEFAULT_TARGET_FPS,
            outbound_queue: 256,
        }
    }
}

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The glyph pool is exhausted.
    #[error("No glyph available")]
    Capacity,

    /// The connection is not registered (already closed or never opened).
    #[error("Unknown session: {0}")]
    UnknownSession(ConnectionId),

    /// The client sent something that could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The session was torn down while the request was in flight.
    #[error("Session closed: {0}")]
    SessionClosed(ConnectionId),

    /// The server is shutting down.
    #[error("Not accepting connections")]
    NotAccepting,

    /// A reply to the client could not be queued.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Registry rejected the session.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Session state machine shared by all connections.
#[derive(Debug)]
pub struct Hub {
    pool: Arc<GlyphPool>,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    upstream: mpsc::UnboundedSender<DisconnectedEvent>,
    accepting: AtomicBool,
    outbound_queue: usize,
    epoch: Instant,
}

impl Hub {
    /// Create a hub. The receiver yields a [`DisconnectedEvent`] for every
    /// identified session that goes away.
    #[must_use]
    pub fn new(pool: Arc<GlyphPool>, config: HubConfig) -> (Self, mpsc::UnboundedReceiver<DisconnectedEvent>) {
        let (upstream, events) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), config.outgoing_fps);

        let hub = Self {
            pool,
            registry,
            dispatcher,
            upstream,
            accepting: AtomicBool::new(true),
            outbound_queue: config.outbound_queue,
            epoch: Instant::now(),
        };
        (hub, events)
    }

    /// Open a session for a new connection.
    ///
    /// Returns the session and the receiving end of its outbound queue.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::NotAccepting`] while the server is stopping.
    pub fn connect(
        &self,
        peer: Option<SocketAddr>,
    ) -> Result<(Arc<ClientSession>, mpsc::Receiver<Arc<str>>), HubError> {
        if !self.is_accepting() {
            return Err(HubError::NotAccepting);
        }

        let (session, outbound) = ClientSession::with_queue(ConnectionId::generate(), peer, self.outbound_queue);
        let session = Arc::new(session);
        let count = self.registry.add(Arc::clone(&session))?;

        // A stop that began after the first check may already have swept the registry
        if !self.is_accepting() {
            if let Ok(session) = self.registry.remove(session.id()) {
                session.close();
            }
            return Err(HubError::NotAccepting);
        }

        info!(connection = %session.id(), peer = ?peer, sessions = count, "Client connected");
        Ok((session, outbound))
    }

    /// Handle a text frame from a client.
    ///
    /// Malformed input is answered with an error message to the sender and
    /// then returned as [`HubError::Protocol`]; the session stays open.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown, the input is malformed,
    /// or a handshake could not be completed.
    pub fn handle_text(&self, id: ConnectionId, text: &str) -> Result<(), HubError> {
        let session = self.session(id)?;
        self.handle(&session, codec::decode(text))
    }

    /// Handle a binary frame from a client. The payload must be UTF-8 JSON.
    ///
    /// # Errors
    ///
    /// Same as [`handle_text`](Self::handle_text).
    pub fn handle_binary(&self, id: ConnectionId, data: &[u8]) -> Result<(), HubError> {
        let session = self.session(id)?;
        self.handle(&session, codec::decode_bytes(data))
    }

    fn handle(
        &self,
        session: &Arc<ClientSession>,
        decoded: Result<ClientMessage, ProtocolError>,
    ) -> Result<(), HubError> {
        let idle = session.idle_for();
        session.touch();

        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                warn!(connection = %session.id(), error = %e, "Malformed message");
                if let Err(send_err) = session.send(&ServerMessage::malformed(e.to_string())) {
                    warn!(connection = %session.id(), error = %send_err, "Failed to report protocol error");
                }
                return Err(e.into());
            }
        };

        trace!(
            connection = %session.id(),
            kind = message.message_type().map_or("Unknown", MessageType::as_str),
            "Inbound message"
        );

        match message {
            ClientMessage::Handshake(handshake) => self.handshake(session, handshake),
            ClientMessage::Alive => {
                debug!(connection = %session.id(), idle_ms = idle.as_millis() as u64, "Alive");
                Ok(())
            }
            ClientMessage::Message(raw) => {
                self.dispatcher.relay_message(session.id(), &raw);
                Ok(())
            }
            ClientMessage::Unknown(kind) => {
                debug!(connection = %session.id(), kind = %kind, "Ignoring unknown message type");
                Ok(())
            }
        }
    }

    fn handshake(&self, session: &Arc<ClientSession>, handshake: Handshake) -> Result<(), HubError> {
        if let Some(options) = &handshake.options {
            info!(connection = %session.id(), options = %options, "Handshake options");
        }

        if let Some(existing) = session.identity() {
            debug!(connection = %session.id(), glyph = %existing.glyph_id, "Repeated handshake");
            return self.send_glyph(session, &existing.glyph_id);
        }

        let grant = match self.grant(session.id(), handshake.glyph_id.as_deref()) {
            Ok(grant) => grant,
            Err(PoolError::Exhausted) => {
                warn!(connection = %session.id(), "Glyph pool exhausted");
                session.send_text(Arc::from(CAPACITY_WARNING))?;
                return Err(HubError::Capacity);
            }
            Err(e) => {
                warn!(connection = %session.id(), error = %e, "Glyph allocation failed");
                return Err(HubError::Capacity);
            }
        };

        let identity = Identity {
            glyph_id: grant.id.clone(),
            name: handshake.name,
            device_type: handshake.device_type,
        };

        if let Err(e) = session.identify(identity.clone()) {
            // The glyph never reached the session
            self.release(&grant.id);
            return match e {
                IdentifyError::Closed => Err(HubError::SessionClosed(session.id())),
                IdentifyError::AlreadyIdentified(glyph) => self.send_glyph(session, &glyph),
            };
        }

        info!(
            connection = %session.id(),
            glyph = %identity.glyph_id,
            name = identity.name.as_deref().unwrap_or(""),
            device_type = identity.device_type.as_deref().unwrap_or(""),
            "Client identified"
        );
        session.send(&ServerMessage::glyph(grant.id, grant.data))?;
        Ok(())
    }

    /// Grant the requested glyph when it is free, otherwise the next in line.
    fn grant(&self, connection: ConnectionId, requested: Option<&str>) -> Result<GlyphGrant, PoolError> {
        if let Some(glyph) = requested {
            match self.pool.reuse_if_free(glyph) {
                Ok(grant) => return Ok(grant),
                Err(PoolError::NotAvailable(_)) => {
                    warn!(connection = %connection, glyph = %glyph, "Requested glyph is held by another session");
                }
                Err(e) => {
                    debug!(connection = %connection, error = %e, "Requested glyph not reusable");
                }
            }
        }
        self.pool.allocate()
    }

    fn send_glyph(&self, session: &ClientSession, glyph: &str) -> Result<(), HubError> {
        let data = self.pool.payload(glyph).unwrap_or_default();
        session.send(&ServerMessage::glyph(glyph, data))?;
        Ok(())
    }

    fn release(&self, glyph: &str) {
        if let Err(e) = self.pool.release(glyph) {
            warn!(glyph = %glyph, error = %e, "Glyph release failed");
        }
    }

    /// Close a session after its socket went away.
    ///
    /// Returns the event sent upstream, if the session held a glyph.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownSession`] if the session was already removed.
    pub fn disconnect(&self, id: ConnectionId) -> Result<Option<DisconnectedEvent>, HubError> {
        let session = self
            .registry
            .remove(id)
            .map_err(|_| HubError::UnknownSession(id))?;

        let event = self.teardown(&session);
        info!(
            connection = %id,
            peer = ?session.peer(),
            glyph = event.as_ref().map(|e| e.identity.as_str()).unwrap_or(""),
            sessions = self.registry.len(),
            "Client disconnected"
        );
        Ok(event)
    }

    /// Tear down every live session and signal their sockets to close.
    ///
    /// Returns the number of sessions closed.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for session in self.registry.snapshot() {
            // A concurrent disconnect may win the removal
            let Ok(session) = self.registry.remove(session.id()) else {
                continue;
            };
            self.teardown(&session);
            session.request_teardown();
            closed += 1;
        }

        if closed > 0 {
            info!(sessions = closed, "Closed all sessions");
        }
        closed
    }

    fn teardown(&self, session: &ClientSession) -> Option<DisconnectedEvent> {
        let identity = session.close()?;
        self.release(&identity.glyph_id);

        let event = DisconnectedEvent {
            identity: identity.glyph_id,
        };
        if self.upstream.send(event.clone()).is_err() {
            debug!(glyph = %event.identity, "No upstream listener for disconnect");
        }
        Some(event)
    }

    /// Dispatch one upstream tick.
    pub fn process_tick(&self, tick: &Tick) -> DispatchStats {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.process_tick_at(tick, now_ms)
    }

    /// Dispatch one upstream tick at an explicit clock reading.
    pub fn process_tick_at(&self, tick: &Tick, now_ms: u64) -> DispatchStats {
        let stats = self.dispatcher.dispatch(tick, now_ms);
        trace!(?stats, "Tick dispatched");
        stats
    }

    /// Allow or refuse new connections.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Check whether new connections are accepted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Change the outbound proximity rate.
    pub fn set_outgoing_fps(&self, fps: u32) {
        self.dispatcher.gate().set_target_fps(fps);
    }

    /// Get the outbound proximity rate.
    #[must_use]
    pub fn outgoing_fps(&self) -> u32 {
        self.dispatcher.gate().target_fps()
    }

    /// Measured rate of upstream proximity ticks.
    #[must_use]
    pub fn inbound_fps(&self) -> f64 {
        self.dispatcher.inbound_fps()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Look up a live session.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownSession`] if no such session is live.
    pub fn session(&self, id: ConnectionId) -> Result<Arc<ClientSession>, HubError> {
        self.registry.get(id).map_err(|_| HubError::UnknownSession(id))
    }

    /// Get the glyph pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<GlyphPool> {
        &self.pool
    }

    /// Get the registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DeviceEvent, ProximityEvent};

    fn pool(size: usize) -> Arc<GlyphPool> {
        let definitions = (1..=size).map(|i| (i.to_string(), format!("glyph-{}", i)));
        Arc::new(GlyphPool::new(definitions).unwrap())
    }

    fn hub(size: usize) -> (Hub, mpsc::UnboundedReceiver<DisconnectedEvent>) {
        Hub::new(pool(size), HubConfig::default())
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(text.to_string());
        }
        out
    }

    fn handshake(glyph: Option<&str>) -> String {
        match glyph {
            Some(glyph) => format!(r#"{{"Type":"Handshake","Data":{{"Name":"Tablet","GlyphId":"{}"}}}}"#, glyph),
            None => r#"{"Type":"Handshake","Data":{"Name":"Tablet"}}"#.to_string(),
        }
    }

    #[test]
    fn test_three_client_scenario() {
        let (hub, mut events) = hub(5);
        let (c1, mut rx1) = hub.connect(None).unwrap();
        let (c2, mut rx2) = hub.connect(None).unwrap();
        let (c3, mut rx3) = hub.connect(None).unwrap();

        hub.handle_text(c1.id(), &handshake(None)).unwrap();
        hub.handle_text(c2.id(), &handshake(None)).unwrap();
        assert_eq!(drain(&mut rx1), vec![r#"{"Type":"Glyph","Id":"1","GlyphData":"glyph-1"}"#]);
        assert_eq!(drain(&mut rx2), vec![r#"{"Type":"Glyph","Id":"2","GlyphData":"glyph-2"}"#]);

        // Client 3 asks for client 1's glyph while it is still held
        hub.handle_text(c3.id(), &handshake(Some("1"))).unwrap();
        assert_eq!(drain(&mut rx3), vec![r#"{"Type":"Glyph","Id":"3","GlyphData":"glyph-3"}"#]);
        assert_eq!(c1.glyph_id().as_deref(), Some("1"));
        assert_eq!(hub.pool().available(), 2);

        let event = hub.disconnect(c1.id()).unwrap();
        assert_eq!(event, Some(DisconnectedEvent { identity: "1".to_string() }));
        assert_eq!(hub.pool().available(), 3);
        assert!(!hub.pool().is_held("1"));

        assert_eq!(events.try_recv().unwrap().identity, "1");
        assert!(events.try_recv().is_err());

        // A second disconnect for the same connection emits nothing
        assert!(matches!(hub.disconnect(c1.id()), Err(HubError::UnknownSession(_))));
        assert!(events.try_recv().is_err());
        assert_eq!(hub.pool().available(), 3);
    }

    #[test]
    fn test_reconnect_reuses_free_glyph() {
        let (hub, _events) = hub(5);
        let (c1, _rx1) = hub.connect(None).unwrap();
        hub.handle_text(c1.id(), &handshake(Some("4"))).unwrap();

        assert_eq!(c1.glyph_id().as_deref(), Some("4"));
        assert_eq!(hub.pool().available(), 4);
    }

    #[test]
    fn test_capacity_exhaustion() {
        let (hub, _events) = hub(2);
        let mut clients = Vec::new();
        for _ in 0..2 {
            let (session, rx) = hub.connect(None).unwrap();
            hub.handle_text(session.id(), &handshake(None)).unwrap();
            clients.push((session, rx));
        }

        let (late, mut rx) = hub.connect(None).unwrap();
        assert!(matches!(
            hub.handle_text(late.id(), &handshake(None)),
            Err(HubError::Capacity)
        ));
        assert_eq!(drain(&mut rx), vec![CAPACITY_WARNING]);
        assert!(!late.is_identified());
        assert_eq!(hub.pool().available(), 0);
        assert_eq!(hub.pool().held(), 2);

        // Unidentified sessions emit nothing on disconnect
        assert_eq!(hub.disconnect(late.id()).unwrap(), None);
    }

    #[test]
    fn test_malformed_reaches_sender_only() {
        let (hub, _events) = hub(5);
        let (a, mut rx_a) = hub.connect(None).unwrap();
        let (_b, mut rx_b) = hub.connect(None).unwrap();

        let result = hub.handle_text(a.id(), "{not json");
        assert!(matches!(result, Err(HubError::Protocol(ProtocolError::InvalidJson(_)))));

        let replies = drain(&mut rx_a);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with(r#"{"Type":"Error","Code":300,"Reason":"Could not deserialize message."#));
        assert!(drain(&mut rx_b).is_empty());

        // The session stays usable
        hub.handle_text(a.id(), &handshake(None)).unwrap();
        assert!(a.is_identified());
    }

    #[test]
    fn test_message_relay() {
        let (hub, _events) = hub(5);
        let (a, mut rx_a) = hub.connect(None).unwrap();
        let (_b, mut rx_b) = hub.connect(None).unwrap();
        let (_c, mut rx_c) = hub.connect(None).unwrap();

        let raw = r#"{"Type":"Message","Data":{"Text":"hello"}}"#;
        hub.handle_text(a.id(), raw).unwrap();

        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b), vec![raw]);
        assert_eq!(drain(&mut rx_c), vec![raw]);
    }

    #[test]
    fn test_alive_and_unknown_are_silent() {
        let (hub, _events) = hub(5);
        let (a, mut rx_a) = hub.connect(None).unwrap();
        let (_b, mut rx_b) = hub.connect(None).unwrap();

        hub.handle_text(a.id(), r#"{"Type":"Alive"}"#).unwrap();
        hub.handle_text(a.id(), r#"{"Type":"Shrug","Data":{}}"#).unwrap();

        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_repeated_handshake_keeps_glyph() {
        let (hub, _events) = hub(5);
        let (a, mut rx_a) = hub.connect(None).unwrap();

        hub.handle_text(a.id(), &handshake(None)).unwrap();
        hub.handle_text(a.id(), &handshake(Some("5"))).unwrap();

        let replies = drain(&mut rx_a);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0], replies[1]);
        assert_eq!(a.glyph_id().as_deref(), Some("1"));
        assert_eq!(hub.pool().held(), 1);
    }

    #[test]
    fn test_binary_frames() {
        let (hub, _events) = hub(5);
        let (a, mut rx_a) = hub.connect(None).unwrap();

        hub.handle_binary(a.id(), handshake(None).as_bytes()).unwrap();
        assert!(a.is_identified());

        assert!(matches!(
            hub.handle_binary(a.id(), &[0xff, 0xfe]),
            Err(HubError::Protocol(ProtocolError::NotUtf8))
        ));
        assert_eq!(drain(&mut rx_a).len(), 2);
    }

    #[test]
    fn test_unknown_session() {
        let (hub, _events) = hub(5);
        let id = ConnectionId::new(u64::MAX);

        assert!(matches!(hub.handle_text(id, "{}"), Err(HubError::UnknownSession(_))));
        assert!(matches!(hub.disconnect(id), Err(HubError::UnknownSession(_))));
    }

    #[test]
    fn test_close_all() {
        let (hub, mut events) = hub(5);
        let (a, mut rx_a) = hub.connect(None).unwrap();
        let (b, _rx_b) = hub.connect(None).unwrap();
        hub.handle_text(a.id(), &handshake(None)).unwrap();
        drain(&mut rx_a);

        hub.set_accepting(false);
        assert_eq!(hub.close_all(), 2);

        assert_eq!(hub.session_count(), 0);
        assert_eq!(hub.pool().available(), 5);
        assert!(a.teardown_token().is_cancelled());
        assert!(b.teardown_token().is_cancelled());
        assert_eq!(events.try_recv().unwrap().identity, "1");
        assert!(events.try_recv().is_err());

        assert!(matches!(hub.connect(None), Err(HubError::NotAccepting)));
        // The socket task's own disconnect arrives late and is ignored
        assert!(matches!(hub.disconnect(a.id()), Err(HubError::UnknownSession(_))));
    }

    #[test]
    fn test_handshake_after_close_returns_glyph() {
        let (hub, _events) = hub(5);
        let (a, _rx_a) = hub.connect(None).unwrap();
        a.close();

        assert!(matches!(
            hub.handle_text(a.id(), &handshake(None)),
            Err(HubError::SessionClosed(_))
        ));
        assert_eq!(hub.pool().available(), 5);
    }

    #[test]
    fn test_process_tick() {
        let (hub, _events) = hub(5);
        let (a, mut rx_a) = hub.connect(None).unwrap();
        hub.handle_text(a.id(), &handshake(None)).unwrap();
        drain(&mut rx_a);

        let tick = Tick::new()
            .with_device(DeviceEvent::new("1", true))
            .with_proximity(ProximityEvent::new("1", 0.5, 0.5, 90.0));
        let stats = hub.process_tick_at(&tick, 0);

        assert_eq!(stats.identify_clears, 1);
        assert_eq!(stats.proximity_sent, 1);
        assert_eq!(drain(&mut rx_a).len(), 2);

        hub.set_outgoing_fps(1);
        assert_eq!(hub.outgoing_fps(), 1);
        assert!(!hub.process_tick_at(&tick, 500).proximity_admitted);
    }

    #[test]
    fn test_concurrent_handshakes() {
        let (hub, _events) = hub(3);
        let hub = Arc::new(hub);

        let results: Vec<Option<String>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let hub = Arc::clone(&hub);
                    scope.spawn(move || {
                        let (session, _rx) = hub.connect(None).unwrap();
                        match hub.handle_text(session.id(), &handshake(None)) {
                            Ok(()) => session.glyph_id(),
                            Err(HubError::Capacity) => None,
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut granted: Vec<String> = results.into_iter().flatten().collect();
        granted.sort();
        assert_eq!(granted, vec!["1", "2", "3"]);
        assert_eq!(hub.pool().available(), 0);
    }
}
