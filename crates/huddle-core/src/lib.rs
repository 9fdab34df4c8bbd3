//! # huddle-core
//!
//! Transport-free core of the Huddle presence relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Pool** - Finite, recyclable glyph identities
//! - **Registry** - Live sessions keyed by connection id
//! - **Gate** - Minimum-interval throttle for proximity pushes
//! - **Dispatcher** - Fans upstream ticks and client messages out to sessions
//! - **Hub** - Per-connection state machine tying the above together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│     Hub     │────▶│  GlyphPool  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!        ┌─────────┐         ▼
//!        │  Tick   │──▶┌─────────────┐     ┌─────────────┐
//!        └─────────┘   │ Dispatcher  │────▶│  Registry   │
//!                      └─────────────┘     └─────────────┘
//! ```

pub mod dispatcher;
pub mod event;
pub mod gate;
pub mod hub;
pub mod pool;
pub mod registry;
pub mod session;

pub use dispatcher::{DispatchStats, Dispatcher};
pub use event::{DeviceEvent, DisconnectedEvent, ProximityEvent, Tick};
pub use gate::{FrameGate, DEFAULT_TARGET_FPS};
pub use hub::{Hub, HubConfig, HubError};
pub use pool::{GlyphGrant, GlyphPool, PoolError, PoolStats};
pub use registry::{Registry, RegistryError};
pub use session::{ClientSession, ConnectionId, DeliveryError, Identity, IdentifyError};
