//! Bridge between the vehicle runtime and the message bus
//!
//! A single loop owns all publishing state. It reacts to:
//! - bus connection events: on every (re)connect it subscribes to the
//!   command topics again and republishes the full state once
//! - inbound messages: translated to commands and submitted in the
//!   background, the outcome comes back through an internal channel
//! - poller reports: the refreshed snapshots are diffed against what was
//!   last published and only changed payloads go out, retained

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voc_core::{CommandKind, InvocationStatus, Snapshot, VehicleId};
use voc_runtime::{wait_for_shutdown, CommandInvoker, InvokerError, PollReport};

use crate::bus::{BusEvent, MessageBus};
use crate::entity::{self, INSTRUMENTS};
use crate::error::BridgeError;
use crate::topic::{self, Inbound, BRIDGE_STATUS_TOPIC, STATE_OFFLINE, STATE_ONLINE};

/// Result of a command issued through the bus, published on
/// `volvo/{vin}/command/state`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub vehicle_id: VehicleId,
    pub command: String,
    pub status: InvocationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CommandOutcome {
    fn from_result(
        vehicle_id: VehicleId,
        kind: &CommandKind,
        result: Result<voc_core::TerminalStatus, InvokerError>,
    ) -> Self {
        let (status, detail) = match result {
            Ok(terminal) => (terminal.status(), terminal.detail().map(String::from)),
            Err(e) => (InvocationStatus::Error, Some(e.to_string())),
        };
        Self {
            vehicle_id,
            command: kind.name().to_string(),
            status,
            detail,
        }
    }
}

/// A command request decoded from an inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub vehicle_id: VehicleId,
    pub kind: CommandKind,
    pub params: Option<Value>,
}

/// Decode an inbound message.
///
/// Entity commands take the plain payloads announced in discovery
/// (`lock`/`unlock`, `on`/`off`). Named calls take an empty payload or a
/// JSON object with the request parameters. Anything else is rejected.
pub fn parse_command(topic: &str, payload: &[u8]) -> Result<CommandRequest, String> {
    let inbound = Inbound::parse(topic).ok_or_else(|| format!("unexpected topic {}", topic))?;
    let payload =
        std::str::from_utf8(payload).map_err(|_| "payload is not valid UTF-8".to_string())?;

    match inbound {
        Inbound::Command {
            vin,
            component,
            object_id,
        } => {
            let instrument = entity::find(component, object_id)
                .filter(|i| i.is_actuator())
                .ok_or_else(|| format!("no actuator {}/{}", component, object_id))?;
            let kind = instrument
                .command(payload)
                .ok_or_else(|| format!("invalid payload '{}' for {}", payload, instrument.name))?;
            Ok(CommandRequest {
                vehicle_id: VehicleId::new(vin),
                kind,
                params: None,
            })
        }
        Inbound::Call { vin, method } => {
            let params = if payload.trim().is_empty() {
                None
            } else {
                match serde_json::from_str::<Value>(payload) {
                    Ok(value @ Value::Object(_)) => Some(value),
                    Ok(_) => return Err("call parameters must be a JSON object".to_string()),
                    Err(e) => return Err(format!("invalid call parameters: {}", e)),
                }
            };
            Ok(CommandRequest {
                vehicle_id: VehicleId::new(vin),
                kind: CommandKind::call(method),
                params,
            })
        }
    }
}

/// Publishes vehicle state to the bus and submits commands received from it
pub struct Bridge<B: MessageBus> {
    bus: Arc<B>,
    invoker: Arc<CommandInvoker>,
    connected: bool,
    /// Last payload published per topic
    published: HashMap<String, String>,
    /// Last snapshot version published per vehicle
    versions: HashMap<VehicleId, u64>,
    subscribed: HashSet<VehicleId>,
    outcomes_tx: mpsc::Sender<CommandOutcome>,
    outcomes_rx: Option<mpsc::Receiver<CommandOutcome>>,
    commands: Vec<JoinHandle<()>>,
}

impl<B: MessageBus + 'static> Bridge<B> {
    pub fn new(bus: Arc<B>, invoker: Arc<CommandInvoker>) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::channel(16);
        Self {
            bus,
            invoker,
            connected: false,
            published: HashMap::new(),
            versions: HashMap::new(),
            subscribed: HashSet::new(),
            outcomes_tx,
            outcomes_rx: Some(outcomes_rx),
            commands: Vec::new(),
        }
    }

    /// Serve until shutdown is signalled or the bus driver goes away.
    ///
    /// On shutdown the bridge marks itself offline and aborts commands it
    /// is still waiting for; their outcomes are not published.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<BusEvent>,
        mut reports: broadcast::Receiver<Arc<PollReport>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BridgeError> {
        let mut outcomes = self.outcomes_rx.take().ok_or(BridgeError::Closed)?;
        info!("Bridge started");

        let result = loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break Ok(()),
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break Err(BridgeError::Closed),
                },
                report = reports.recv() => match report {
                    Ok(report) => self.handle_report(&report).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Missed poller reports, republishing");
                        self.publish_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Poller stopped");
                        break Ok(());
                    }
                },
                Some(outcome) = outcomes.recv() => self.handle_outcome(outcome).await,
            }
        };

        for task in self.commands.drain(..) {
            task.abort();
        }
        if self.connected {
            if let Err(e) = self
                .bus
                .publish(BRIDGE_STATUS_TOPIC, STATE_OFFLINE.as_bytes(), true)
                .await
            {
                warn!(error = %e, "Failed to publish offline status");
            }
        }
        info!("Bridge stopped");
        result
    }

    pub async fn handle_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Connected => self.handle_connected().await,
            BusEvent::Message { topic, payload } => self.handle_message(&topic, &payload),
            BusEvent::Disconnected(reason) => {
                warn!(reason = %reason, "Bus connection lost");
                self.connected = false;
            }
        }
    }

    /// Publish everything from scratch after a (re)connect
    async fn handle_connected(&mut self) {
        self.connected = true;
        self.published.clear();
        self.versions.clear();
        self.subscribed.clear();
        self.publish(BRIDGE_STATUS_TOPIC.to_string(), STATE_ONLINE.to_string())
            .await;
        self.publish_all().await;
    }

    /// Submit the command carried by an inbound message in the background
    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) {
        let request = match parse_command(topic, payload) {
            Ok(request) => request,
            Err(reason) => {
                warn!(topic = %topic, reason = %reason, "Rejecting inbound message");
                return;
            }
        };
        info!(vehicle = %request.vehicle_id, command = %request.kind, "Command received");

        let invoker = self.invoker.clone();
        let outcomes = self.outcomes_tx.clone();
        let task = tokio::spawn(async move {
            let CommandRequest {
                vehicle_id,
                kind,
                params,
            } = request;
            let result = match invoker.submit(&vehicle_id, kind.clone(), params).await {
                Ok(handle) => invoker.await_result(&handle).await,
                Err(e) => Err(e),
            };
            if matches!(result, Err(InvokerError::Cancelled)) {
                return;
            }
            let _ = outcomes
                .send(CommandOutcome::from_result(vehicle_id, &kind, result))
                .await;
        });
        self.commands.retain(|t| !t.is_finished());
        self.commands.push(task);
    }

    pub async fn handle_report(&mut self, report: &PollReport) {
        debug!(tick = report.tick, "Publishing refreshed vehicles");
        for id in &report.refreshed {
            if let Some(snapshot) = self.invoker.registry().get_snapshot(id) {
                self.publish_snapshot(&snapshot).await;
            }
        }
    }

    pub async fn handle_outcome(&mut self, outcome: CommandOutcome) {
        let topic = topic::outcome_topic(outcome.vehicle_id.as_str());
        match serde_json::to_vec(&outcome) {
            Ok(payload) if self.connected => {
                if let Err(e) = self.bus.publish(&topic, &payload, false).await {
                    warn!(topic = %topic, error = %e, "Failed to publish command outcome");
                }
            }
            Ok(_) => debug!(topic = %topic, "Not connected, dropping command outcome"),
            Err(e) => warn!(error = %e, "Failed to encode command outcome"),
        }
        if let Some(snapshot) = self.invoker.registry().get_snapshot(&outcome.vehicle_id) {
            self.publish_snapshot(&snapshot).await;
        }
    }

    async fn publish_all(&mut self) {
        let registry = self.invoker.registry().clone();
        for id in registry.vehicles() {
            if let Some(snapshot) = registry.get_snapshot(&id) {
                self.publish_snapshot(&snapshot).await;
            }
        }
    }

    /// Publish the entities of a snapshot whose payload changed since the
    /// last publish. Snapshots older than the last one published for the
    /// vehicle are discarded. Returns the number of messages sent.
    pub async fn publish_snapshot(&mut self, snapshot: &Snapshot) -> usize {
        if !self.connected {
            return 0;
        }
        let id = &snapshot.vehicle_id;
        if let Some(&last) = self.versions.get(id) {
            if snapshot.version <= last {
                debug!(vehicle = %id, version = snapshot.version, last, "Skipping stale snapshot");
                return 0;
            }
        }
        self.versions.insert(id.clone(), snapshot.version);
        self.subscribe_vehicle(snapshot).await;

        let vin = id.as_str();
        let name = snapshot.registration_number().unwrap_or(vin).to_string();
        let mutable = self.invoker.is_mutable();
        let mut sent = 0;
        for instrument in INSTRUMENTS.iter().filter(|i| i.is_supported(snapshot)) {
            if let Some(doc) = instrument.discovery(vin, &name, mutable) {
                let topic = topic::discovery_topic(
                    vin,
                    instrument.component().as_str(),
                    &instrument.object_id(),
                );
                sent += self.publish(topic, doc.to_string()).await as usize;
            }
            if let Some(topic) = instrument.availability_topic(vin) {
                let availability = instrument.availability(snapshot).to_string();
                sent += self.publish(topic, availability).await as usize;
            }
            if let Some(state) = instrument.state(snapshot) {
                sent += self.publish(instrument.state_topic(vin), state).await as usize;
            }
        }
        debug!(vehicle = %id, version = snapshot.version, sent, "Snapshot published");
        sent
    }

    async fn subscribe_vehicle(&mut self, snapshot: &Snapshot) {
        if self.subscribed.contains(&snapshot.vehicle_id) {
            return;
        }
        let vin = snapshot.vehicle_id.as_str();
        let mut filters = vec![topic::call_filter(vin)];
        if self.invoker.is_mutable() {
            filters.extend(
                INSTRUMENTS
                    .iter()
                    .filter(|i| i.is_supported(snapshot))
                    .filter_map(|i| i.command_topic(vin)),
            );
        }
        for filter in &filters {
            if let Err(e) = self.bus.subscribe(filter).await {
                warn!(filter = %filter, error = %e, "Subscribe failed");
                return;
            }
        }
        debug!(vehicle = %vin, count = filters.len(), "Subscribed to command topics");
        self.subscribed.insert(snapshot.vehicle_id.clone());
    }

    /// Retained publish unless the topic already carries this payload
    async fn publish(&mut self, topic: String, payload: String) -> bool {
        if self.published.get(&topic) == Some(&payload) {
            return false;
        }
        match self.bus.publish(&topic, payload.as_bytes(), true).await {
            Ok(()) => {
                self.published.insert(topic, payload);
                true
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Publish failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_lock_commands() {
        let request = parse_command("volvo/YV1ABC123/lock/lock/cmd", b"lock").unwrap();
        assert_eq!(request.vehicle_id, VehicleId::new("YV1ABC123"));
        assert_eq!(request.kind, CommandKind::Lock);
        assert_eq!(request.params, None);

        let request = parse_command("volvo/YV1ABC123/switch/heater/cmd", b"off").unwrap();
        assert_eq!(request.kind, CommandKind::HeaterStop);
    }

    #[test]
    fn test_parse_call_with_params() {
        let request = parse_command(
            "volvo/YV1ABC123/call/engine_start",
            br#"{"runtime": 5}"#,
        )
        .unwrap();
        assert_eq!(request.kind, CommandKind::EngineStart);
        assert_eq!(request.params, Some(json!({"runtime": 5})));

        let request = parse_command("volvo/YV1ABC123/call/honk_and_blink", b"").unwrap();
        assert_eq!(request.kind, CommandKind::HonkAndBlink);
        assert_eq!(request.params, None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_command("volvo/YV1ABC123/lock/lock/cmd", b"open").is_err());
        assert!(parse_command("volvo/YV1ABC123/lock/lock/cmd", &[0xff, 0xfe]).is_err());
        assert!(parse_command("volvo/YV1ABC123/sensor/odometer/cmd", b"on").is_err());
        assert!(parse_command("volvo/YV1ABC123/binary_sensor/doors_hood_open/cmd", b"on").is_err());
        assert!(parse_command("volvo/YV1ABC123/call/engine_start", b"[1, 2]").is_err());
        assert!(parse_command("volvo/YV1ABC123/call/engine_start", b"{runtime").is_err());
        assert!(parse_command("other/topic", b"lock").is_err());
    }

    #[test]
    fn test_outcome_payload() {
        let outcome = CommandOutcome::from_result(
            VehicleId::new("YV1ABC123"),
            &CommandKind::Lock,
            Err(InvokerError::ReadOnly),
        );
        let payload = serde_json::to_value(&outcome).unwrap();
        assert_eq!(payload["vehicle_id"], "YV1ABC123");
        assert_eq!(payload["command"], "lock");
        assert_eq!(payload["status"], "error");
        assert!(payload["detail"].as_str().is_some());

        let outcome = CommandOutcome::from_result(
            VehicleId::new("YV1ABC123"),
            &CommandKind::HeaterStart,
            Ok(voc_core::TerminalStatus::Successful),
        );
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"vehicle_id": "YV1ABC123", "command": "heater_start", "status": "successful"})
        );
    }
}
