//! Broadcast dispatcher for Huddle.
//!
//! Turns upstream ticks into targeted sends and relays client messages to
//! every other client. Every send is a non-blocking queue push; a failure
//! for one session is logged and never stops delivery to the rest.

use crate::event::{DeviceEvent, ProximityEvent, Tick};
use crate::gate::FrameGate;
use crate::registry::Registry;
use crate::session::{ClientSession, ConnectionId};
use huddle_protocol::{codec, ServerMessage};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What one dispatch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Sessions told to show their glyph.
    pub identify_prompts: usize,
    /// Sessions told to hide their glyph.
    pub identify_clears: usize,
    /// Whether the frame gate let proximity through.
    pub proximity_admitted: bool,
    /// Proximity messages queued.
    pub proximity_sent: usize,
    /// Sends that failed.
    pub delivery_failures: usize,
}

#[derive(Debug, Default)]
struct InboundRate {
    last_at: Option<u64>,
    fps: f64,
}

/// Fans ticks and relayed messages out to sessions.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    gate: FrameGate,
    inbound: Mutex<InboundRate>,
}

impl Dispatcher {
    /// Create a dispatcher over a registry with the given outgoing rate.
    #[must_use]
    pub fn new(registry: Arc<Registry>, outgoing_fps: u32) -> Self {
        Self {
            registry,
            gate: FrameGate::new(outgoing_fps),
            inbound: Mutex::new(InboundRate::default()),
        }
    }

    /// Get the frame gate.
    #[must_use]
    pub fn gate(&self) -> &FrameGate {
        &self.gate
    }

    /// Rate at which proximity-carrying ticks arrive, in frames per second.
    #[must_use]
    pub fn inbound_fps(&self) -> f64 {
        self.inbound.lock().fps
    }

    /// Dispatch one tick at `now_ms`.
    ///
    /// Identify reconciliation always runs first; proximity relay follows if
    /// the frame gate admits this tick.
    pub fn dispatch(&self, tick: &Tick, now_ms: u64) -> DispatchStats {
        let sessions = self.registry.snapshot();
        let mut stats = DispatchStats::default();

        self.reconcile_identify(&sessions, &tick.devices, &mut stats);

        if !tick.proximities.is_empty() {
            self.record_inbound(now_ms);

            if self.gate.try_admit(now_ms) {
                stats.proximity_admitted = true;
                self.relay_proximities(&sessions, &tick.proximities, &mut stats);
            } else {
                trace!(events = tick.proximities.len(), "Proximity frame dropped by gate");
            }
        }

        stats
    }

    /// Relay a client's raw message to every other live session.
    ///
    /// Returns the number of sessions the message was queued for.
    pub fn relay_message(&self, sender: ConnectionId, raw: &str) -> usize {
        let sessions = self.registry.snapshot();
        self.relay_to(&sessions, sender, raw)
    }

    pub(crate) fn relay_to(
        &self,
        sessions: &[Arc<ClientSession>],
        sender: ConnectionId,
        raw: &str,
    ) -> usize {
        let text: Arc<str> = Arc::from(raw);
        let mut stats = DispatchStats::default();
        let mut delivered = 0;

        for session in sessions.iter().filter(|s| s.id() != sender) {
            if deliver(session, &text, &mut stats) {
                delivered += 1;
            }
        }

        debug!(connection = %sender, recipients = delivered, "Relayed message");
        delivered
    }

    fn reconcile_identify(
        &self,
        sessions: &[Arc<ClientSession>],
        devices: &[DeviceEvent],
        stats: &mut DispatchStats,
    ) {
        let identified: HashSet<&str> = devices
            .iter()
            .filter(|d| d.is_identified)
            .map(|d| d.device_id.as_str())
            .collect();

        let (Some(prompt), Some(clear)) = (
            encode(&ServerMessage::identify(true)),
            encode(&ServerMessage::identify(false)),
        ) else {
            return;
        };

        for session in sessions {
            // Sessions without a glyph have nothing to show
            let Some(glyph) = session.glyph_id() else {
                continue;
            };

            if identified.contains(glyph.as_str()) {
                if deliver(session, &clear, stats) {
                    stats.identify_clears += 1;
                }
            } else if deliver(session, &prompt, stats) {
                stats.identify_prompts += 1;
            }
        }
    }

    fn relay_proximities(
        &self,
        sessions: &[Arc<ClientSession>],
        proximities: &[ProximityEvent],
        stats: &mut DispatchStats,
    ) {
        for proximity in proximities {
            let Some(text) = encode(&proximity.to_message()) else {
                continue;
            };

            for session in sessions {
                if session.glyph_id().as_deref() != Some(proximity.identity.as_str()) {
                    continue;
                }
                if deliver(session, &text, stats) {
                    stats.proximity_sent += 1;
                }
            }
        }
    }

    fn record_inbound(&self, now_ms: u64) {
        let mut inbound = self.inbound.lock();
        if let Some(last) = inbound.last_at {
            let elapsed = now_ms.saturating_sub(last);
            if elapsed > 0 {
                inbound.fps = 1000.0 / elapsed as f64;
            }
        }
        inbound.last_at = Some(now_ms);
    }
}

fn encode(message: &ServerMessage) -> Option<Arc<str>> {
    match codec::encode(message) {
        Ok(text) => Some(text.into()),
        Err(e) => {
            warn!(kind = message.kind(), error = %e, "Failed to encode message");
            None
        }
    }
}

/// Queue `text` for `session`. Closed sessions are skipped silently.
fn deliver(session: &ClientSession, text: &Arc<str>, stats: &mut DispatchStats) -> bool {
    if session.is_closed() {
        trace!(connection = %session.id(), "Skipping closed session");
        return false;
    }

    match session.send_text(Arc::clone(text)) {
        Ok(()) => true,
        Err(e) => {
            warn!(connection = %session.id(), error = %e, "Delivery failed");
            stats.delivery_failures += 1;
            false
        }
    }
}
