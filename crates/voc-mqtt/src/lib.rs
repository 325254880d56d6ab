//! voc-mqtt - MQTT bridge for Volvo On Call vehicles
//!
//! Publishes every vehicle's state as retained Home Assistant entities and
//! turns messages on command topics into remote commands.
//!
//! # Topics
//!
//! - `volvo/{vin}/{component}/{object_id}/state` - entity state
//! - `volvo/{vin}/{component}/{object_id}/avail` - `online`/`offline`
//! - `volvo/{vin}/{component}/{object_id}/cmd` - commands for locks and switches
//! - `volvo/{vin}/call/{method}` - named service calls, optional JSON parameters
//! - `volvo/{vin}/command/state` - outcome of commands issued on the bus
//! - `volvo/bridge/status` - bridge liveness, `offline` as last will
//! - `owntracks/volvo/{vin}` - vehicle position
//! - `homeassistant/{component}/volvo_{vin}/{object_id}/config` - discovery

pub mod bridge;
pub mod bus;
pub mod entity;
pub mod error;
pub mod topic;

pub use bridge::{parse_command, Bridge, CommandOutcome, CommandRequest};
pub use bus::{client_id, options_from_url, BusEvent, MessageBus, MosquittoConfig, MqttBus};
pub use entity::{Instrument, INSTRUMENTS};
pub use error::{BridgeError, BusError, BusResult};
