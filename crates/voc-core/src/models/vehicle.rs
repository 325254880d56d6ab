//! Vehicle identity and attribute snapshots

use std::fmt;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AttributeError, AttributeResult};

/// Timestamp format used by the VOC service (`2018-05-13T13:40:37+0000`)
pub const SERVICE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// Unique vehicle identifier (VIN)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(String);

impl VehicleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VehicleId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for VehicleId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The full attribute tree of one vehicle as of one successful refresh.
///
/// Snapshots are never mutated after construction; the state cache replaces
/// them wholesale and hands them out as `Arc<Snapshot>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Vehicle this snapshot belongs to
    pub vehicle_id: VehicleId,
    /// Per-vehicle version, assigned when the fetch started
    pub version: u64,
    /// When the fetch completed
    pub fetched_at: DateTime<Utc>,
    /// Attribute tree (always a JSON object)
    pub attributes: Value,
}

impl Snapshot {
    pub fn new(vehicle_id: VehicleId, version: u64, attributes: Value) -> Self {
        Self {
            vehicle_id,
            version,
            fetched_at: Utc::now(),
            attributes,
        }
    }

    /// Returns true if the attribute tree holds no attributes
    pub fn is_empty(&self) -> bool {
        match &self.attributes {
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
            _ => false,
        }
    }

    /// Resolve a dotted attribute path, e.g. `windows.frontLeftWindowOpen`
    pub fn get(&self, path: &str) -> AttributeResult<&Value> {
        resolve_path(&self.attributes, path)
    }

    /// Returns true if the path resolves to a value
    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_ok()
    }

    /// Resolve a path and interpret the value as a service timestamp
    pub fn get_timestamp(&self, path: &str) -> AttributeResult<DateTime<FixedOffset>> {
        let value = self.get(path)?;
        let leaf = path.rsplit('.').next().unwrap_or(path);
        value
            .as_str()
            .and_then(parse_timestamp)
            .ok_or_else(|| AttributeError::type_mismatch(path, leaf, "timestamp"))
    }

    /// Registration number, if the service reported one
    pub fn registration_number(&self) -> Option<&str> {
        self.get("registrationNumber").ok().and_then(Value::as_str)
    }
}

/// Parse a timestamp in the service format, falling back to RFC 3339
pub fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(s, SERVICE_TIMESTAMP_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
}

/// Resolve a dotted path against a value tree.
///
/// An empty path yields the root. Mapping segments are looked up by key;
/// list segments must be numeric indices. Any other intermediate type is a
/// type mismatch.
///
/// ```
/// # use voc_core::resolve_path;
/// # use serde_json::json;
/// let tree = json!({"doors": {"frontLeftDoorOpen": false}, "bulbFailures": ["left"]});
/// assert_eq!(resolve_path(&tree, "doors.frontLeftDoorOpen").unwrap(), &json!(false));
/// assert_eq!(resolve_path(&tree, "bulbFailures.0").unwrap(), &json!("left"));
/// assert!(resolve_path(&tree, "doors.hoodOpen").is_err());
/// ```
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> AttributeResult<&'a Value> {
    if path.is_empty() {
        return Ok(root);
    }

    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map
                .get(segment)
                .ok_or_else(|| AttributeError::AttributeNotFound(path.to_string()))?,
            Value::Array(items) => {
                let index: usize = segment
                    .parse()
                    .map_err(|_| AttributeError::type_mismatch(path, segment, "list index"))?;
                items
                    .get(index)
                    .ok_or_else(|| AttributeError::AttributeNotFound(path.to_string()))?
            }
            _ => return Err(AttributeError::type_mismatch(path, segment, "mapping")),
        };
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn snapshot() -> Snapshot {
        Snapshot::new(
            VehicleId::new("YV1ABC123"),
            1,
            json!({
                "registrationNumber": "ABC123",
                "odometer": 123456,
                "doors": {"frontLeftDoorOpen": false, "hoodOpen": true},
                "timeFullyAccessibleUntil": "2018-05-13T13:40:37+0000",
                "bulbFailures": [],
                "heater": {"status": "off", "seatSelection": null}
            }),
        )
    }

    #[test]
    fn test_empty_path_is_root() {
        let snap = snapshot();
        assert_eq!(snap.get("").unwrap(), &snap.attributes);
    }

    #[test]
    fn test_nested_lookup() {
        let snap = snapshot();
        assert_eq!(snap.get("doors.hoodOpen").unwrap(), &json!(true));
        assert_eq!(snap.get("odometer").unwrap(), &json!(123456));
    }

    #[test]
    fn test_null_leaf_resolves() {
        let snap = snapshot();
        assert_eq!(snap.get("heater.seatSelection").unwrap(), &Value::Null);
    }

    #[test]
    fn test_missing_leaf_is_not_found() {
        let snap = snapshot();
        assert_eq!(
            snap.get("doors.rearLeftDoorOpen"),
            Err(AttributeError::AttributeNotFound(
                "doors.rearLeftDoorOpen".to_string()
            ))
        );
    }

    #[test]
    fn test_scalar_intermediate_is_type_mismatch() {
        let snap = snapshot();
        match snap.get("odometer.value") {
            Err(AttributeError::TypeMismatch { segment, .. }) => assert_eq!(segment, "value"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_non_numeric_list_segment_is_type_mismatch() {
        let snap = snapshot();
        assert!(matches!(
            snap.get("bulbFailures.first"),
            Err(AttributeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_timestamp_parsing() {
        let snap = snapshot();
        let ts = snap.get_timestamp("timeFullyAccessibleUntil").unwrap();
        assert_eq!(ts.to_rfc3339(), "2018-05-13T13:40:37+00:00");
        assert!(matches!(
            snap.get_timestamp("odometer"),
            Err(AttributeError::TypeMismatch {
                expected: "timestamp",
                ..
            })
        ));
    }

    #[test]
    fn test_registration_number_and_emptiness() {
        let snap = snapshot();
        assert_eq!(snap.registration_number(), Some("ABC123"));
        assert!(!snap.is_empty());
        assert!(Snapshot::new(VehicleId::new("X"), 1, json!({})).is_empty());
    }
}
