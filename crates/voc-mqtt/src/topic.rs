//! Topic naming for the bridge.
//!
//! State and command topics live under `volvo/{vin}/...`; Home Assistant
//! discovery documents under `homeassistant/...`. Every topic level built
//! from vehicle data is reduced to `[A-Za-z0-9_-]` so it stays a single
//! valid level.

/// Prefix of all vehicle topics
pub const TOPIC_PREFIX: &str = "volvo";
/// Prefix of Home Assistant discovery topics
pub const DISCOVERY_PREFIX: &str = "homeassistant";
/// Retained bridge liveness topic
pub const BRIDGE_STATUS_TOPIC: &str = "volvo/bridge/status";

pub const STATE_ONLINE: &str = "online";
pub const STATE_OFFLINE: &str = "offline";

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
///
/// ```
/// # use voc_mqtt::topic::single_level;
/// assert_eq!(single_level("foo/bar/baz"), "foo_bar_baz");
/// assert_eq!(single_level("hello å ä ö"), "hello______");
/// ```
pub fn single_level(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Turn a camelCase attribute path into a snake_case topic level.
///
/// ```
/// # use voc_mqtt::topic::object_id;
/// assert_eq!(object_id("doors.frontLeftDoorOpen"), "doors_front_left_door_open");
/// assert_eq!(object_id("hvBattery.hvBatteryLevel"), "hv_battery_hv_battery_level");
/// assert_eq!(object_id("odometer"), "odometer");
/// ```
pub fn object_id(attr: &str) -> String {
    let mut slug = String::with_capacity(attr.len() + 8);
    let mut prev_lower = false;
    for c in attr.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                slug.push('_');
            }
            slug.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            slug.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    single_level(&slug)
}

/// Base topic of one entity: `volvo/{vin}/{component}/{object_id}`
pub fn entity_topic(vin: &str, component: &str, object_id: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        TOPIC_PREFIX,
        single_level(vin),
        component,
        object_id
    )
}

/// `homeassistant/{component}/volvo_{vin}/{object_id}/config`
pub fn discovery_topic(vin: &str, component: &str, object_id: &str) -> String {
    format!(
        "{}/{}/{}/{}/config",
        DISCOVERY_PREFIX,
        component,
        single_level(&format!("{}/{}", TOPIC_PREFIX, vin)),
        object_id
    )
}

/// OwnTracks location topic for a vehicle
pub fn owntracks_topic(vin: &str) -> String {
    format!("owntracks/{}/{}", TOPIC_PREFIX, single_level(vin))
}

/// Topic receiving JSON outcomes of commands issued through the bridge
pub fn outcome_topic(vin: &str) -> String {
    format!("{}/{}/command/state", TOPIC_PREFIX, single_level(vin))
}

/// Subscription filter for named calls: `volvo/{vin}/call/+`
pub fn call_filter(vin: &str) -> String {
    format!("{}/{}/call/+", TOPIC_PREFIX, single_level(vin))
}

/// A parsed inbound topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// `volvo/{vin}/{component}/{object_id}/cmd`
    Command {
        vin: &'a str,
        component: &'a str,
        object_id: &'a str,
    },
    /// `volvo/{vin}/call/{method}`
    Call { vin: &'a str, method: &'a str },
}

impl<'a> Inbound<'a> {
    /// Parse a topic the bridge subscribes to.
    ///
    /// ```
    /// # use voc_mqtt::topic::Inbound;
    /// assert_eq!(
    ///     Inbound::parse("volvo/ABC123/lock/lock/cmd"),
    ///     Some(Inbound::Command { vin: "ABC123", component: "lock", object_id: "lock" })
    /// );
    /// assert_eq!(
    ///     Inbound::parse("volvo/ABC123/call/honk_and_blink"),
    ///     Some(Inbound::Call { vin: "ABC123", method: "honk_and_blink" })
    /// );
    /// assert_eq!(Inbound::parse("volvo/ABC123/lock/lock/state"), None);
    /// ```
    pub fn parse(topic: &'a str) -> Option<Self> {
        let rest = topic.strip_prefix(TOPIC_PREFIX)?.strip_prefix('/')?;
        let levels: Vec<&str> = rest.split('/').collect();
        match levels.as_slice() {
            [vin, "call", method] if !method.is_empty() => Some(Self::Call {
                vin: *vin,
                method: *method,
            }),
            [vin, component, object_id, "cmd"] => Some(Self::Command {
                vin: *vin,
                component: *component,
                object_id: *object_id,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn discovery_topic_uses_single_level_node_id() {
        assert_eq!(
            discovery_topic("YV1ABC123", "binary_sensor", "doors_hood_open"),
            "homeassistant/binary_sensor/volvo_YV1ABC123/doors_hood_open/config"
        );
    }

    #[test]
    fn vehicle_topics() {
        assert_eq!(
            entity_topic("YV1ABC123", "switch", "heater"),
            "volvo/YV1ABC123/switch/heater"
        );
        assert_eq!(owntracks_topic("YV1ABC123"), "owntracks/volvo/YV1ABC123");
        assert_eq!(outcome_topic("YV1ABC123"), "volvo/YV1ABC123/command/state");
        assert_eq!(call_filter("YV1ABC123"), "volvo/YV1ABC123/call/+");
    }

    #[test]
    fn object_id_handles_acronyms_and_digits() {
        assert_eq!(object_id("tripMeter1"), "trip_meter1");
        assert_eq!(
            object_id("hvBattery.distanceToHVBatteryEmpty"),
            "hv_battery_distance_to_hvbattery_empty"
        );
    }

    #[test]
    fn parse_rejects_foreign_topics() {
        assert_eq!(Inbound::parse("owntracks/volvo/ABC123"), None);
        assert_eq!(Inbound::parse("volvo/ABC123/call/"), None);
        assert_eq!(Inbound::parse("volvo"), None);
        assert_eq!(Inbound::parse("volvo/bridge/status"), None);
    }
}
