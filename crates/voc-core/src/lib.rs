//! voc-core - Core types for the Volvo On Call client
//!
//! This crate provides the value types shared by the transport, the runtime
//! (state cache, command invoker, poller) and the MQTT bridge: vehicle
//! snapshots with dotted-path attribute lookup, command kinds and invocation
//! statuses, and the client configuration.

pub mod config;
pub mod error;
pub mod geocode;
pub mod models;

pub use config::VocConfig;
pub use error::{AttributeError, AttributeResult, ConfigError};
pub use geocode::{Geocoder, NoGeocoder};
pub use models::*;
