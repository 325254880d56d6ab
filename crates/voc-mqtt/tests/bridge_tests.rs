//! Bridge tests with a recording bus

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use voc_client::testing::{wait_for, MockCloud};
use voc_client::Transport;
use voc_core::{Snapshot, VehicleId};
use voc_mqtt::topic::BRIDGE_STATUS_TOPIC;
use voc_mqtt::{Bridge, BusEvent, BusResult, MessageBus};
use voc_runtime::{CommandInvoker, InvokerConfig, Poller, PollerConfig, VehicleRegistry};

const VIN: &str = "YV1ABC123";

// =============================================================================
// Fixtures
// =============================================================================

#[derive(Default)]
struct RecordingBus {
    published: Mutex<Vec<(String, String, bool)>>,
    subscriptions: Mutex<Vec<String>>,
}

impl RecordingBus {
    fn take(&self) -> Vec<(String, String, bool)> {
        std::mem::take(&mut *self.published.lock())
    }

    fn last_on(&self, topic: &str) -> Option<String> {
        self.published
            .lock()
            .iter()
            .rev()
            .find(|(t, _, _)| t == topic)
            .map(|(_, payload, _)| payload.clone())
    }

    fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> BusResult<()> {
        self.published.lock().push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
            retain,
        ));
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> BusResult<()> {
        self.subscriptions.lock().push(filter.to_string());
        Ok(())
    }
}

/// Bridge over a registry that never reaches a service
fn offline_bridge(mutable: bool) -> (Arc<RecordingBus>, Arc<VehicleRegistry>, Bridge<RecordingBus>) {
    let transport = Transport::with_credentials("http://127.0.0.1:9/", "user", "pass").unwrap();
    let registry = Arc::new(VehicleRegistry::new(Arc::new(transport)));
    let invoker = Arc::new(CommandInvoker::new(
        registry.clone(),
        InvokerConfig {
            mutable,
            ..Default::default()
        },
    ));
    let bus = Arc::new(RecordingBus::default());
    let bridge = Bridge::new(bus.clone(), invoker);
    (bus, registry, bridge)
}

fn attributes(front_left_open: bool) -> Value {
    json!({
        "registrationNumber": "ABC123",
        "carLocked": true,
        "odometer": 12_345_000,
        "heater": {"status": "off"},
        "doors": {
            "hoodOpen": false,
            "frontLeftDoorOpen": front_left_open,
            "frontRightDoorOpen": false
        },
        "position": {"latitude": 57.7, "longitude": 11.9}
    })
}

fn snapshot(version: u64, front_left_open: bool) -> Snapshot {
    Snapshot::new(VehicleId::new(VIN), version, attributes(front_left_open))
}

// =============================================================================
// Publishing
// =============================================================================

#[tokio::test]
async fn test_single_attribute_change_publishes_one_message() {
    let (bus, _registry, mut bridge) = offline_bridge(true);
    bridge.handle_event(BusEvent::Connected).await;

    let first = bridge.publish_snapshot(&snapshot(1, false)).await;
    assert!(first > 0);
    bus.take();

    let sent = bridge.publish_snapshot(&snapshot(2, true)).await;
    assert_eq!(sent, 1);
    assert_eq!(
        bus.take(),
        vec![(
            format!("volvo/{}/binary_sensor/doors_front_left_door_open/state", VIN),
            "open".to_string(),
            true
        )]
    );
}

#[tokio::test]
async fn test_first_publish_announces_and_retains_everything() {
    let (bus, _registry, mut bridge) = offline_bridge(true);
    bridge.handle_event(BusEvent::Connected).await;
    assert_eq!(
        bus.take(),
        vec![(BRIDGE_STATUS_TOPIC.to_string(), "online".to_string(), true)]
    );

    bridge.publish_snapshot(&snapshot(1, false)).await;
    let published = bus.take();
    assert!(published.iter().all(|(_, _, retain)| *retain));

    let lock_config = format!("homeassistant/lock/volvo_{}/lock/config", VIN);
    let (_, doc, _) = published.iter().find(|(t, _, _)| *t == lock_config).unwrap();
    let doc: Value = serde_json::from_str(doc).unwrap();
    assert_eq!(doc["name"], "ABC123 Lock");
    assert_eq!(doc["command_topic"], format!("volvo/{}/lock/lock/cmd", VIN));

    let state = |topic: String| {
        published
            .iter()
            .find(|(t, _, _)| *t == topic)
            .map(|(_, p, _)| p.clone())
    };
    assert_eq!(state(format!("volvo/{}/lock/lock/state", VIN)).as_deref(), Some("lock"));
    assert_eq!(state(format!("volvo/{}/lock/lock/avail", VIN)).as_deref(), Some("online"));
    assert_eq!(
        state(format!("volvo/{}/sensor/odometer/state", VIN)).as_deref(),
        Some("12345")
    );
    assert!(state(format!("owntracks/volvo/{}", VIN)).is_some());
    // not reported by this vehicle
    assert!(state(format!("volvo/{}/sensor/fuel_amount/state", VIN)).is_none());

    assert_eq!(
        bus.subscriptions(),
        vec![
            format!("volvo/{}/call/+", VIN),
            format!("volvo/{}/lock/lock/cmd", VIN),
            format!("volvo/{}/switch/heater/cmd", VIN),
        ]
    );
}

#[tokio::test]
async fn test_unchanged_snapshot_publishes_nothing() {
    let (bus, _registry, mut bridge) = offline_bridge(true);
    bridge.handle_event(BusEvent::Connected).await;
    bridge.publish_snapshot(&snapshot(1, false)).await;
    bus.take();

    assert_eq!(bridge.publish_snapshot(&snapshot(2, false)).await, 0);
    assert!(bus.take().is_empty());
}

#[tokio::test]
async fn test_stale_snapshot_is_discarded() {
    let (bus, _registry, mut bridge) = offline_bridge(true);
    bridge.handle_event(BusEvent::Connected).await;
    bridge.publish_snapshot(&snapshot(3, false)).await;
    bus.take();

    assert_eq!(bridge.publish_snapshot(&snapshot(2, true)).await, 0);
    assert!(bus.take().is_empty());
}

#[tokio::test]
async fn test_nothing_published_while_disconnected() {
    let (bus, _registry, mut bridge) = offline_bridge(true);
    assert_eq!(bridge.publish_snapshot(&snapshot(1, false)).await, 0);

    bridge.handle_event(BusEvent::Connected).await;
    bridge
        .handle_event(BusEvent::Disconnected("broker went away".into()))
        .await;
    bus.take();
    assert_eq!(bridge.publish_snapshot(&snapshot(2, true)).await, 0);
    assert!(bus.take().is_empty());
}

#[tokio::test]
async fn test_reconnect_resubscribes_and_republishes_once() {
    let (bus, registry, mut bridge) = offline_bridge(true);
    let id = VehicleId::new(VIN);
    registry.register(id.clone(), format!("http://127.0.0.1:9/vehicles/{}", VIN));
    registry.commit(snapshot(1, false)).unwrap();

    bridge.handle_event(BusEvent::Connected).await;
    let initial = bus.take();
    assert!(initial.len() > 1);
    let subscriptions = bus.subscriptions().len();

    bridge
        .handle_event(BusEvent::Disconnected("connection reset".into()))
        .await;
    bridge.handle_event(BusEvent::Connected).await;

    assert_eq!(bus.take(), initial);
    assert_eq!(bus.subscriptions().len(), subscriptions * 2);
}

#[tokio::test]
async fn test_read_only_bridge_exposes_no_command_topics() {
    let (bus, _registry, mut bridge) = offline_bridge(false);
    bridge.handle_event(BusEvent::Connected).await;
    bridge.publish_snapshot(&snapshot(1, false)).await;

    let lock_config = format!("homeassistant/lock/volvo_{}/lock/config", VIN);
    let doc: Value = serde_json::from_str(&bus.last_on(&lock_config).unwrap()).unwrap();
    assert!(doc.get("command_topic").is_none());
    assert_eq!(bus.subscriptions(), vec![format!("volvo/{}/call/+", VIN)]);
}

// =============================================================================
// Commands
// =============================================================================

struct Running {
    cloud: MockCloud,
    _server: voc_client::testing::TestServer,
    bus: Arc<RecordingBus>,
    invoker: Arc<CommandInvoker>,
    poller: Arc<Poller>,
    events: mpsc::Sender<BusEvent>,
    shutdown: watch::Sender<bool>,
    bridge: tokio::task::JoinHandle<Result<(), voc_mqtt::BridgeError>>,
}

async fn running_bridge() -> Running {
    let cloud = MockCloud::new();
    cloud.add_vehicle(
        VIN,
        "ABC123",
        json!({"vehicleType": "V60"}),
        json!({
            "carLocked": false,
            "doors": {"frontLeftDoorOpen": false},
            "heater": {"status": "off"}
        }),
        None,
    );
    cloud.on_success("lock", json!({"carLocked": true}));
    let server = cloud.serve().await.unwrap();

    let registry = Arc::new(VehicleRegistry::new(Arc::new(server.transport().unwrap())));
    let invoker = Arc::new(CommandInvoker::new(
        registry.clone(),
        InvokerConfig {
            mutable: true,
            poll_interval: Duration::from_millis(20),
            poll_budget: Duration::from_secs(5),
        },
    ));
    let poller = Arc::new(Poller::new(registry, PollerConfig::default()));
    let bus = Arc::new(RecordingBus::default());

    let (events, events_rx) = mpsc::channel(16);
    let (shutdown, shutdown_rx) = watch::channel(false);
    let bridge = Bridge::new(bus.clone(), invoker.clone());
    let bridge = tokio::spawn(bridge.run(events_rx, poller.subscribe(), shutdown_rx));

    events.send(BusEvent::Connected).await.unwrap();
    poller.tick().await.unwrap();

    Running {
        cloud,
        _server: server,
        bus,
        invoker,
        poller,
        events,
        shutdown,
        bridge,
    }
}

fn lock_state() -> String {
    format!("volvo/{}/lock/lock/state", VIN)
}

fn outcome_topic() -> String {
    format!("volvo/{}/command/state", VIN)
}

#[tokio::test]
async fn test_lock_command_round_trip() {
    let rt = running_bridge().await;
    let bus = rt.bus.clone();
    assert!(
        wait_for(
            || {
                let bus = bus.clone();
                async move { bus.last_on(&lock_state()).as_deref() == Some("unlock") }
            },
            Duration::from_secs(5)
        )
        .await
    );

    rt.events
        .send(BusEvent::Message {
            topic: format!("volvo/{}/lock/lock/cmd", VIN),
            payload: b"lock".to_vec(),
        })
        .await
        .unwrap();

    let bus = rt.bus.clone();
    assert!(
        wait_for(
            || {
                let bus = bus.clone();
                async move { bus.last_on(&outcome_topic()).is_some() }
            },
            Duration::from_secs(5)
        )
        .await
    );
    let outcome: Value = serde_json::from_str(&rt.bus.last_on(&outcome_topic()).unwrap()).unwrap();
    assert_eq!(
        outcome,
        json!({"vehicle_id": VIN, "command": "lock", "status": "successful"})
    );

    let bus = rt.bus.clone();
    assert!(
        wait_for(
            || {
                let bus = bus.clone();
                async move { bus.last_on(&lock_state()).as_deref() == Some("lock") }
            },
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(rt.invoker.submitted_count(), 1);

    rt.shutdown.send_replace(true);
    rt.bridge.await.unwrap().unwrap();
    let last = rt.bus.take().pop().unwrap();
    assert_eq!(last, (BRIDGE_STATUS_TOPIC.to_string(), "offline".to_string(), true));
}

#[tokio::test]
async fn test_malformed_message_submits_nothing() {
    let rt = running_bridge().await;

    for (topic, payload) in [
        (format!("volvo/{}/lock/lock/cmd", VIN), b"open".to_vec()),
        (format!("volvo/{}/call/engine_start", VIN), b"[15]".to_vec()),
        (format!("volvo/{}/sensor/odometer/cmd", VIN), b"0".to_vec()),
    ] {
        rt.events
            .send(BusEvent::Message { topic, payload })
            .await
            .unwrap();
    }
    // a well-formed message after the rejected ones is still processed
    rt.events
        .send(BusEvent::Message {
            topic: format!("volvo/{}/call/honk_and_blink", VIN),
            payload: Vec::new(),
        })
        .await
        .unwrap();

    let bus = rt.bus.clone();
    assert!(
        wait_for(
            || {
                let bus = bus.clone();
                async move { bus.last_on(&outcome_topic()).is_some() }
            },
            Duration::from_secs(5)
        )
        .await
    );
    let outcome: Value = serde_json::from_str(&rt.bus.last_on(&outcome_topic()).unwrap()).unwrap();
    assert_eq!(outcome["command"], "honk_and_blink");
    assert_eq!(rt.invoker.submitted_count(), 1);
    assert_eq!(
        rt.cloud
            .request_count(&format!("POST /vehicles/{}/honkAndBlink", VIN)),
        1
    );
    assert_eq!(
        rt.cloud
            .request_count(&format!("POST /vehicles/{}/lock", VIN)),
        0
    );

    rt.shutdown.send_replace(true);
    rt.bridge.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rejected_command_publishes_failure() {
    let rt = running_bridge().await;
    rt.cloud.fail_submissions(Some(500));

    rt.events
        .send(BusEvent::Message {
            topic: format!("volvo/{}/switch/heater/cmd", VIN),
            payload: b"on".to_vec(),
        })
        .await
        .unwrap();

    let bus = rt.bus.clone();
    assert!(
        wait_for(
            || {
                let bus = bus.clone();
                async move { bus.last_on(&outcome_topic()).is_some() }
            },
            Duration::from_secs(5)
        )
        .await
    );
    let outcome: Value = serde_json::from_str(&rt.bus.last_on(&outcome_topic()).unwrap()).unwrap();
    assert_eq!(outcome["command"], "heater_start");
    assert_eq!(outcome["status"], "error");
    assert!(outcome["detail"].as_str().is_some());

    // the bridge keeps serving after a failed command
    rt.poller.tick().await.unwrap();
    rt.shutdown.send_replace(true);
    rt.bridge.await.unwrap().unwrap();
}
