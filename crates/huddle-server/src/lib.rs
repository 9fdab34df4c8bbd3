//! # huddle-server
//!
//! WebSocket front end for the Huddle presence relay.
//!
//! [`HuddleServer`] owns a [`huddle_core::Hub`] and at most one listener.
//! Clients speak the JSON protocol from `huddle-protocol`; the sensing
//! pipeline feeds [`huddle_core::Tick`]s through [`HuddleServer::process`].

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod server;

pub use config::Config;
pub use server::{HuddleServer, ServerError};
