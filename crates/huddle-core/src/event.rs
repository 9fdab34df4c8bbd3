//! Events exchanged with the sensing pipeline.
//!
//! The pipeline delivers one [`Tick`] at a time; the relay answers with a
//! [`DisconnectedEvent`] whenever an identified client goes away.

use huddle_protocol::{Presence, Proximity, ServerMessage};
use serde::{Deserialize, Serialize};

/// A device seen by the sensors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    /// Glyph id the device was matched to.
    pub device_id: String,
    /// Whether the sensors have identified the device's glyph.
    pub is_identified: bool,
}

impl DeviceEvent {
    /// Create a device event.
    #[must_use]
    pub fn new(device_id: impl Into<String>, is_identified: bool) -> Self {
        Self {
            device_id: device_id.into(),
            is_identified,
        }
    }
}

/// Position and heading of one device plus the devices around it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityEvent {
    /// Glyph id of the device this event is addressed to.
    pub identity: String,
    /// Normalized position.
    pub x: f64,
    /// Normalized position.
    pub y: f64,
    /// Heading in degrees.
    pub orientation: f64,
    /// Other devices in view.
    #[serde(default)]
    pub presences: Vec<Presence>,
}

impl ProximityEvent {
    /// Create a proximity event without neighbours.
    #[must_use]
    pub fn new(identity: impl Into<String>, x: f64, y: f64, orientation: f64) -> Self {
        Self {
            identity: identity.into(),
            x,
            y,
            orientation,
            presences: Vec::new(),
        }
    }

    /// Attach a neighbouring device.
    #[must_use]
    pub fn with_presence(mut self, identity: impl Into<String>, x: f64, y: f64, orientation: f64) -> Self {
        self.presences.push(Presence {
            identity: identity.into(),
            location: [x, y],
            orientation,
        });
        self
    }

    /// Wire message for this event.
    #[must_use]
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Proximity(Proximity {
            identity: self.identity.clone(),
            location: [self.x, self.y],
            orientation: self.orientation,
            presences: self.presences.clone(),
        })
    }
}

/// Sent upstream when a session holding a glyph disconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectedEvent {
    /// Glyph id the session held.
    pub identity: String,
}

/// One batch of sensing results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Devices seen in this tick.
    #[serde(default)]
    pub devices: Vec<DeviceEvent>,
    /// Proximity results in this tick.
    #[serde(default)]
    pub proximities: Vec<ProximityEvent>,
}

impl Tick {
    /// Create an empty tick.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device.
    #[must_use]
    pub fn with_device(mut self, device: DeviceEvent) -> Self {
        self.devices.push(device);
        self
    }

    /// Add a proximity result.
    #[must_use]
    pub fn with_proximity(mut self, proximity: ProximityEvent) -> Self {
        self.proximities.push(proximity);
        self
    }

    /// Check if the tick carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.proximities.is_empty()
    }
}
