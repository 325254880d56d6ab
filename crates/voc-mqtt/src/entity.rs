//! Vehicle instruments exposed on the bus
//!
//! Each [`Instrument`] maps one attribute path of a [`Snapshot`] to a Home
//! Assistant entity: a state payload, a discovery document and, for
//! actuators, the commands its `cmd` topic accepts.

use serde_json::{json, Map, Value};
use voc_core::{CommandKind, Snapshot};

use crate::topic::{self, STATE_OFFLINE, STATE_ONLINE};

/// Home Assistant component an instrument is announced as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Lock,
    Switch,
    Sensor,
    BinarySensor,
    /// Published as an OwnTracks location, never announced
    Position,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Switch => "switch",
            Self::Sensor => "sensor",
            Self::BinarySensor => "binary_sensor",
            Self::Position => "device_tracker",
        }
    }
}

/// Binary sensor classes and the payloads they use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Door,
    Window,
    Safety,
    Plug,
    Problem,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Door => "door",
            Self::Window => "window",
            Self::Safety => "safety",
            Self::Plug => "plug",
            Self::Problem => "problem",
        }
    }

    /// `(payload_on, payload_off)`
    pub fn payloads(&self) -> (&'static str, &'static str) {
        match self {
            Self::Door | Self::Window => ("open", "close"),
            Self::Safety => ("unsafe", "safe"),
            Self::Plug | Self::Problem => ("on", "off"),
        }
    }
}

/// How a raw numeric attribute is turned into the published value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    Raw,
    /// Metres to whole kilometres
    MetresToKm,
    /// Tenths to one decimal place
    Tenths,
}

/// What an instrument reads and how it encodes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reading {
    /// `carLocked`: lock/unlock
    Lock,
    /// `heater.status`: on unless the status is `off`
    Heater,
    Sensor {
        unit: &'static str,
        icon: &'static str,
        scale: Scale,
    },
    /// Booleans, warning strings (anything but `Normal`) and failure lists
    Binary(DeviceClass),
    /// Charge cable state, connected unless `PlugRemoved`
    ChargeCable,
    Position,
}

/// One attribute exposed as an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instrument {
    /// Dotted attribute path in the snapshot
    pub attr: &'static str,
    /// Human readable name, prefixed with the vehicle name in discovery
    pub name: &'static str,
    pub reading: Reading,
}

const fn sensor(
    attr: &'static str,
    name: &'static str,
    unit: &'static str,
    icon: &'static str,
    scale: Scale,
) -> Instrument {
    Instrument {
        attr,
        name,
        reading: Reading::Sensor { unit, icon, scale },
    }
}

const fn binary(attr: &'static str, name: &'static str, class: DeviceClass) -> Instrument {
    Instrument {
        attr,
        name,
        reading: Reading::Binary(class),
    }
}

/// Every instrument the bridge knows about
pub static INSTRUMENTS: &[Instrument] = &[
    Instrument {
        attr: "position",
        name: "Position",
        reading: Reading::Position,
    },
    Instrument {
        attr: "carLocked",
        name: "Lock",
        reading: Reading::Lock,
    },
    Instrument {
        attr: "heater.status",
        name: "Heater",
        reading: Reading::Heater,
    },
    sensor("odometer", "Odometer", "km", "mdi:speedometer", Scale::MetresToKm),
    sensor("tripMeter1", "Trip meter 1", "km", "mdi:speedometer", Scale::MetresToKm),
    sensor("tripMeter2", "Trip meter 2", "km", "mdi:speedometer", Scale::MetresToKm),
    sensor("fuelAmount", "Fuel amount", "L", "mdi:gas-station", Scale::Raw),
    sensor("fuelAmountLevel", "Fuel level", "%", "mdi:water-percent", Scale::Raw),
    sensor(
        "averageFuelConsumption",
        "Fuel consumption",
        "L/100 km",
        "mdi:gas-station",
        Scale::Tenths,
    ),
    sensor("distanceToEmpty", "Range", "km", "mdi:ruler", Scale::Raw),
    sensor(
        "hvBattery.distanceToHVBatteryEmpty",
        "Battery range",
        "km",
        "mdi:ruler",
        Scale::Raw,
    ),
    sensor(
        "hvBattery.hvBatteryLevel",
        "Battery level",
        "%",
        "mdi:battery",
        Scale::Raw,
    ),
    sensor(
        "hvBattery.timeToHVBatteryFullyCharged",
        "Time to fully charged",
        "minutes",
        "mdi:clock",
        Scale::Raw,
    ),
    Instrument {
        attr: "hvBattery.hvBatteryChargeStatus",
        name: "Battery charging",
        reading: Reading::ChargeCable,
    },
    binary("doors.hoodOpen", "Hood", DeviceClass::Door),
    binary("doors.tailgateOpen", "Tailgate", DeviceClass::Door),
    binary("doors.frontLeftDoorOpen", "Front left door", DeviceClass::Door),
    binary("doors.frontRightDoorOpen", "Front right door", DeviceClass::Door),
    binary("doors.rearLeftDoorOpen", "Rear left door", DeviceClass::Door),
    binary("doors.rearRightDoorOpen", "Rear right door", DeviceClass::Door),
    binary("windows.frontLeftWindowOpen", "Front left window", DeviceClass::Window),
    binary("windows.frontRightWindowOpen", "Front right window", DeviceClass::Window),
    binary("windows.rearLeftWindowOpen", "Rear left window", DeviceClass::Window),
    binary("windows.rearRightWindowOpen", "Rear right window", DeviceClass::Window),
    binary("tyrePressure.frontLeftTyrePressure", "Front left tyre", DeviceClass::Problem),
    binary("tyrePressure.frontRightTyrePressure", "Front right tyre", DeviceClass::Problem),
    binary("tyrePressure.rearLeftTyrePressure", "Rear left tyre", DeviceClass::Problem),
    binary("tyrePressure.rearRightTyrePressure", "Rear right tyre", DeviceClass::Problem),
    binary("washerFluidLevel", "Washer fluid", DeviceClass::Safety),
    binary("brakeFluid", "Brake fluid", DeviceClass::Safety),
    binary("serviceWarningStatus", "Service", DeviceClass::Safety),
    binary("bulbFailures", "Bulbs", DeviceClass::Safety),
];

/// Find the instrument behind an inbound command topic
pub fn find(component: &str, object_id: &str) -> Option<&'static Instrument> {
    INSTRUMENTS
        .iter()
        .find(|i| i.component().as_str() == component && i.object_id() == object_id)
}

impl Instrument {
    pub fn component(&self) -> Component {
        match self.reading {
            Reading::Lock => Component::Lock,
            Reading::Heater => Component::Switch,
            Reading::Sensor { .. } => Component::Sensor,
            Reading::Binary(_) | Reading::ChargeCable => Component::BinarySensor,
            Reading::Position => Component::Position,
        }
    }

    /// Topic level derived from the attribute path
    pub fn object_id(&self) -> String {
        match self.reading {
            Reading::Lock => "lock".to_string(),
            Reading::Heater => "heater".to_string(),
            _ => topic::object_id(self.attr),
        }
    }

    pub fn unit(&self) -> Option<&'static str> {
        match self.reading {
            Reading::Sensor { unit, .. } => Some(unit),
            _ => None,
        }
    }

    /// Accepts commands on its `cmd` topic
    pub fn is_actuator(&self) -> bool {
        matches!(self.reading, Reading::Lock | Reading::Heater)
    }

    /// Topic carrying the retained state payload
    pub fn state_topic(&self, vin: &str) -> String {
        match self.reading {
            Reading::Position => topic::owntracks_topic(vin),
            _ => format!("{}/state", self.base_topic(vin)),
        }
    }

    /// Topic carrying `online`/`offline`; positions have none
    pub fn availability_topic(&self, vin: &str) -> Option<String> {
        match self.reading {
            Reading::Position => None,
            _ => Some(format!("{}/avail", self.base_topic(vin))),
        }
    }

    pub fn command_topic(&self, vin: &str) -> Option<String> {
        self.is_actuator()
            .then(|| format!("{}/cmd", self.base_topic(vin)))
    }

    fn base_topic(&self, vin: &str) -> String {
        topic::entity_topic(vin, self.component().as_str(), &self.object_id())
    }

    /// Whether the snapshot reports this instrument at all
    pub fn is_supported(&self, snapshot: &Snapshot) -> bool {
        snapshot.get(self.attr).map(|v| !v.is_null()).unwrap_or(false)
    }

    /// `online` when the snapshot yields a state for this instrument
    pub fn availability(&self, snapshot: &Snapshot) -> &'static str {
        if self.state(snapshot).is_some() {
            STATE_ONLINE
        } else {
            STATE_OFFLINE
        }
    }

    /// Encoded state payload, or `None` if the snapshot does not carry a
    /// usable value.
    pub fn state(&self, snapshot: &Snapshot) -> Option<String> {
        let value = snapshot.get(self.attr).ok().filter(|v| !v.is_null())?;
        match self.reading {
            Reading::Lock => {
                let locked = value.as_bool()?;
                Some(if locked { "lock" } else { "unlock" }.to_string())
            }
            Reading::Heater => {
                let on = value.as_str().map(|s| s != "off").unwrap_or(false);
                Some(on_off(on).to_string())
            }
            Reading::Sensor { scale, .. } => sensor_value(value, scale),
            Reading::Binary(class) => {
                let (on, off) = class.payloads();
                let active = binary_value(value)?;
                Some(if active { on } else { off }.to_string())
            }
            Reading::ChargeCable => {
                let status = value.as_str()?;
                Some(on_off(status != "PlugRemoved").to_string())
            }
            Reading::Position => owntracks(value).map(|v| v.to_string()),
        }
    }

    /// Home Assistant discovery document; `None` for positions.
    ///
    /// `vehicle_name` prefixes the entity name, typically the registration
    /// number.
    pub fn discovery(&self, vin: &str, vehicle_name: &str, mutable: bool) -> Option<Value> {
        let availability_topic = self.availability_topic(vin)?;
        let mut doc = Map::new();
        doc.insert("name".into(), json!(format!("{} {}", vehicle_name, self.name)));
        doc.insert(
            "unique_id".into(),
            json!(format!("volvo_{}_{}", topic::single_level(vin), self.object_id())),
        );
        doc.insert("state_topic".into(), json!(self.state_topic(vin)));
        doc.insert("availability_topic".into(), json!(availability_topic));
        doc.insert("payload_available".into(), json!(STATE_ONLINE));
        doc.insert("payload_not_available".into(), json!(STATE_OFFLINE));
        if mutable {
            if let Some(command_topic) = self.command_topic(vin) {
                doc.insert("command_topic".into(), json!(command_topic));
            }
        }

        match self.reading {
            Reading::Lock => {
                doc.insert("payload_lock".into(), json!("lock"));
                doc.insert("payload_unlock".into(), json!("unlock"));
                doc.insert("optimistic".into(), json!(false));
            }
            Reading::Heater => {
                doc.insert("payload_on".into(), json!("on"));
                doc.insert("payload_off".into(), json!("off"));
                doc.insert("icon".into(), json!("mdi:radiator"));
                doc.insert("optimistic".into(), json!(false));
            }
            Reading::Sensor { unit, icon, .. } => {
                doc.insert("icon".into(), json!(icon));
                doc.insert("unit_of_measurement".into(), json!(unit));
            }
            Reading::Binary(class) => insert_binary(&mut doc, class),
            Reading::ChargeCable => insert_binary(&mut doc, DeviceClass::Plug),
            Reading::Position => return None,
        }
        Some(Value::Object(doc))
    }

    /// Map a payload received on the `cmd` topic to a command
    pub fn command(&self, payload: &str) -> Option<CommandKind> {
        match (self.reading, payload.trim()) {
            (Reading::Lock, "lock") => Some(CommandKind::Lock),
            (Reading::Lock, "unlock") => Some(CommandKind::Unlock),
            (Reading::Heater, "on") => Some(CommandKind::HeaterStart),
            (Reading::Heater, "off") => Some(CommandKind::HeaterStop),
            _ => None,
        }
    }
}

fn insert_binary(doc: &mut Map<String, Value>, class: DeviceClass) {
    let (on, off) = class.payloads();
    doc.insert("payload_on".into(), json!(on));
    doc.insert("payload_off".into(), json!(off));
    doc.insert("device_class".into(), json!(class.as_str()));
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

fn binary_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Array(items) => Some(!items.is_empty()),
        Value::String(s) => Some(s != "Normal"),
        _ => None,
    }
}

fn sensor_value(value: &Value, scale: Scale) -> Option<String> {
    if let Value::String(s) = value {
        return Some(s.clone());
    }
    let n = value.as_f64()?;
    let out = match scale {
        Scale::Raw => return Some(value.to_string()),
        Scale::MetresToKm => format!("{}", (n / 1000.0).round() as i64),
        Scale::Tenths => format!("{}", n.round() / 10.0),
    };
    Some(out)
}

/// OwnTracks location document for a `position` attribute
fn owntracks(position: &Value) -> Option<Value> {
    let lat = position.get("latitude")?.as_f64()?;
    let lon = position.get("longitude")?.as_f64()?;
    let tst = position
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(voc_core::parse_timestamp)
        .map(|t| t.timestamp());
    let mut doc = json!({
        "_type": "location",
        "tid": "volvo",
        "t": "p",
        "lat": lat,
        "lon": lon,
        "acc": 1,
    });
    if let (Some(tst), Value::Object(map)) = (tst, &mut doc) {
        map.insert("tst".into(), json!(tst));
    }
    Some(doc)
}
