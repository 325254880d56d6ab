//! Vehicle registry and state cache
//!
//! Holds the set of vehicles known from the customer account together with
//! the last attribute snapshot fetched for each one. Snapshots are replaced
//! wholesale and only ever by a newer version; refreshes for the same
//! vehicle are coalesced into one in-flight fetch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};
use voc_client::{Transport, TransportError};
use voc_core::{AttributeError, AttributeResult, Snapshot, VehicleId};

use crate::error::RegistryError;

type RefreshResult = Result<Arc<Snapshot>, RegistryError>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

/// Resources merged into a vehicle snapshot, in merge order
const STATE_RESOURCES: [&str; 3] = ["attributes", "status", "position"];

/// A vehicle known to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VehicleRecord {
    pub id: VehicleId,
    /// Vehicle resource URL reported by the service
    pub url: String,
    pub registration: Option<String>,
}

#[derive(Debug)]
struct VehicleEntry {
    record: VehicleRecord,
    snapshot: Option<Arc<Snapshot>>,
    /// Highest version handed out to a fetch
    issued_version: u64,
}

/// Result of committing a snapshot to the cache
#[derive(Debug, Clone)]
pub enum Commit {
    /// The snapshot replaced the cached one
    Accepted(Arc<Snapshot>),
    /// A newer snapshot was already cached; it is returned instead
    Discarded { current: Arc<Snapshot> },
}

impl Commit {
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        match self {
            Self::Accepted(snapshot) => snapshot,
            Self::Discarded { current } => current,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Known vehicles and their cached state
pub struct VehicleRegistry {
    transport: Arc<Transport>,
    vehicles: RwLock<BTreeMap<VehicleId, VehicleEntry>>,
    in_flight: Mutex<HashMap<VehicleId, (u64, SharedRefresh)>>,
    flight_counter: AtomicU64,
}

impl VehicleRegistry {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            vehicles: RwLock::new(BTreeMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            flight_counter: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    // =========================================================================
    // Vehicle list
    // =========================================================================

    /// Fetch the account's vehicle relations and register every vehicle.
    ///
    /// Vehicles are never removed; ids missing from the account are logged.
    #[instrument(skip(self))]
    pub async fn refresh_vehicle_list(&self) -> Result<Vec<VehicleId>, RegistryError> {
        let account = self.transport.customer_account().await?;
        if let Some(username) = &account.username {
            debug!("Account for <{}> received", username);
        }

        let mut listed = Vec::with_capacity(account.account_vehicle_relations.len());
        for relation_url in &account.account_vehicle_relations {
            let relation = self.transport.vehicle_relation(relation_url).await?;
            let id = VehicleId::new(relation.vehicle_id);
            self.register(id.clone(), relation.vehicle);
            listed.push(id);
        }

        let listed_set: HashSet<&VehicleId> = listed.iter().collect();
        for known in self.vehicles() {
            if !listed_set.contains(&known) {
                warn!(vehicle = %known, "Vehicle no longer listed by the account");
            }
        }

        info!(count = listed.len(), "Vehicle list refreshed");
        Ok(listed)
    }

    /// Add a vehicle or update its resource URL
    pub fn register(&self, id: VehicleId, url: impl Into<String>) {
        let url = url.into();
        let mut vehicles = self.vehicles.write();
        match vehicles.get_mut(&id) {
            Some(entry) => entry.record.url = url,
            None => {
                info!(vehicle = %id, "Registered vehicle");
                vehicles.insert(
                    id.clone(),
                    VehicleEntry {
                        record: VehicleRecord {
                            id,
                            url,
                            registration: None,
                        },
                        snapshot: None,
                        issued_version: 0,
                    },
                );
            }
        }
    }

    /// Ids of all known vehicles, in VIN order
    pub fn vehicles(&self) -> Vec<VehicleId> {
        self.vehicles.read().keys().cloned().collect()
    }

    pub fn vehicle(&self, id: &VehicleId) -> Option<VehicleRecord> {
        self.vehicles.read().get(id).map(|e| e.record.clone())
    }

    /// Find a vehicle by VIN or registration number, ignoring case
    pub fn find(&self, vin_or_registration: &str) -> Option<VehicleRecord> {
        let wanted = vin_or_registration.trim();
        self.vehicles
            .read()
            .values()
            .find(|entry| {
                entry.record.id.as_str().eq_ignore_ascii_case(wanted)
                    || entry
                        .record
                        .registration
                        .as_deref()
                        .is_some_and(|r| r.eq_ignore_ascii_case(wanted))
            })
            .map(|entry| entry.record.clone())
    }

    // =========================================================================
    // Vehicle state
    // =========================================================================

    /// Fetch the vehicle's attributes, status and position and replace its
    /// snapshot. Concurrent calls for the same vehicle share one fetch.
    pub async fn refresh_vehicle_state(self: &Arc<Self>, id: &VehicleId) -> RefreshResult {
        let refresh = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(id) {
                Some((_, shared)) => {
                    debug!(vehicle = %id, "Joining in-flight refresh");
                    shared.clone()
                }
                None => {
                    let token = self.flight_counter.fetch_add(1, Ordering::SeqCst);
                    let registry = Arc::clone(self);
                    let vehicle_id = id.clone();
                    let shared = async move {
                        let result = registry.fetch_state(&vehicle_id).await;
                        let mut in_flight = registry.in_flight.lock();
                        if in_flight.get(&vehicle_id).map(|(t, _)| *t) == Some(token) {
                            in_flight.remove(&vehicle_id);
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(id.clone(), (token, shared.clone()));
                    shared
                }
            }
        };
        refresh.await
    }

    /// Refresh the vehicle's state from a fetch that starts no earlier than
    /// this call. A refresh already in flight may have read the state before
    /// a change the caller knows about, so it is waited out instead of joined.
    pub async fn reconcile_vehicle_state(self: &Arc<Self>, id: &VehicleId) -> RefreshResult {
        let since = self.flight_counter.load(Ordering::SeqCst);
        loop {
            let earlier = self
                .in_flight
                .lock()
                .get(id)
                .filter(|(token, _)| *token < since)
                .map(|(_, shared)| shared.clone());
            match earlier {
                Some(shared) => {
                    debug!(vehicle = %id, "Waiting out earlier refresh");
                    let _ = shared.await;
                }
                None => return self.refresh_vehicle_state(id).await,
            }
        }
    }

    #[instrument(skip(self))]
    async fn fetch_state(&self, id: &VehicleId) -> RefreshResult {
        let (url, version) = {
            let mut vehicles = self.vehicles.write();
            let entry = vehicles
                .get_mut(id)
                .ok_or_else(|| RegistryError::UnknownVehicle(id.clone()))?;
            let cached = entry.snapshot.as_ref().map(|s| s.version).unwrap_or(0);
            entry.issued_version = entry.issued_version.max(cached) + 1;
            (entry.record.url.clone(), entry.issued_version)
        };
        debug!(vehicle = %id, version, "Refreshing vehicle state");

        let (attributes, status, position) = tokio::join!(
            self.transport.vehicle_resource(&url, STATE_RESOURCES[0]),
            self.transport.vehicle_resource(&url, STATE_RESOURCES[1]),
            self.transport.vehicle_resource(&url, STATE_RESOURCES[2]),
        );

        let position = match position {
            Err(e) if e.is_not_found() => {
                debug!(vehicle = %id, "No position reported");
                Value::Null
            }
            other => other?,
        };

        let mut merged = Map::new();
        for (resource, value) in STATE_RESOURCES.iter().zip([attributes?, status?, position]) {
            match value {
                Value::Object(map) => merged.extend(map),
                Value::Null => {}
                other => {
                    return Err(TransportError::Protocol(format!(
                        "{} is not an object: {}",
                        resource, other
                    ))
                    .into())
                }
            }
        }

        let snapshot = Snapshot::new(id.clone(), version, Value::Object(merged));
        Ok(self.commit(snapshot)?.snapshot().clone())
    }

    /// Replace a vehicle's snapshot unless a newer one is already cached
    pub fn commit(&self, snapshot: Snapshot) -> Result<Commit, RegistryError> {
        let mut vehicles = self.vehicles.write();
        let entry = vehicles
            .get_mut(&snapshot.vehicle_id)
            .ok_or_else(|| RegistryError::UnknownVehicle(snapshot.vehicle_id.clone()))?;

        if let Some(current) = &entry.snapshot {
            if current.version >= snapshot.version {
                debug!(
                    vehicle = %snapshot.vehicle_id,
                    stale = snapshot.version,
                    current = current.version,
                    "Discarding stale snapshot"
                );
                return Ok(Commit::Discarded {
                    current: current.clone(),
                });
            }
        }

        if let Some(registration) = snapshot.registration_number() {
            entry.record.registration = Some(registration.to_string());
        }
        entry.issued_version = entry.issued_version.max(snapshot.version);
        let snapshot = Arc::new(snapshot);
        entry.snapshot = Some(snapshot.clone());
        Ok(Commit::Accepted(snapshot))
    }

    /// Last cached snapshot, if any
    pub fn get_snapshot(&self, id: &VehicleId) -> Option<Arc<Snapshot>> {
        self.vehicles.read().get(id).and_then(|e| e.snapshot.clone())
    }

    /// Resolve a dotted attribute path in the cached snapshot
    pub fn get_attribute(&self, id: &VehicleId, path: &str) -> AttributeResult<Value> {
        let snapshot = self
            .get_snapshot(id)
            .ok_or_else(|| AttributeError::UnknownVehicle(id.to_string()))?;
        snapshot.get(path).cloned()
    }

    /// Fetch the vehicle's trip journal
    #[instrument(skip(self))]
    pub async fn trips(&self, id: &VehicleId) -> Result<Value, RegistryError> {
        let record = self
            .vehicle(id)
            .ok_or_else(|| RegistryError::UnknownVehicle(id.clone()))?;
        Ok(self.transport.vehicle_resource(&record.url, "trips").await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> VehicleRegistry {
        let transport = Transport::with_credentials("http://127.0.0.1:9/", "u", "p").unwrap();
        VehicleRegistry::new(Arc::new(transport))
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = registry();
        registry.register(VehicleId::new("V1"), "http://a/vehicles/V1");
        registry.register(VehicleId::new("V1"), "http://b/vehicles/V1");
        assert_eq!(registry.vehicles(), vec![VehicleId::new("V1")]);
        assert_eq!(
            registry.vehicle(&VehicleId::new("V1")).unwrap().url,
            "http://b/vehicles/V1"
        );
    }

    #[test]
    fn test_stale_snapshot_is_discarded() {
        let registry = registry();
        let id = VehicleId::new("V1");
        registry.register(id.clone(), "http://a/vehicles/V1");

        let newer = Snapshot::new(id.clone(), 2, json!({"carLocked": true}));
        let older = Snapshot::new(id.clone(), 1, json!({"carLocked": false}));

        assert!(registry.commit(newer).unwrap().is_accepted());
        let outcome = registry.commit(older).unwrap();
        assert!(!outcome.is_accepted());
        assert_eq!(outcome.snapshot().version, 2);
        assert_eq!(
            registry.get_attribute(&id, "carLocked").unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_commit_unknown_vehicle() {
        let registry = registry();
        let snapshot = Snapshot::new(VehicleId::new("NOPE"), 1, json!({}));
        assert_eq!(
            registry.commit(snapshot).unwrap_err(),
            RegistryError::UnknownVehicle(VehicleId::new("NOPE"))
        );
    }

    #[test]
    fn test_get_attribute_without_snapshot() {
        let registry = registry();
        let id = VehicleId::new("V1");
        registry.register(id.clone(), "http://a/vehicles/V1");
        assert_eq!(
            registry.get_attribute(&id, "odometer"),
            Err(AttributeError::UnknownVehicle("V1".into()))
        );
    }

    #[test]
    fn test_find_by_registration() {
        let registry = registry();
        let id = VehicleId::new("YV1ABC123");
        registry.register(id.clone(), "http://a/vehicles/YV1ABC123");
        registry
            .commit(Snapshot::new(
                id.clone(),
                1,
                json!({"registrationNumber": "ABC123"}),
            ))
            .unwrap();

        assert_eq!(registry.find("abc123").unwrap().id, id);
        assert_eq!(registry.find("yv1abc123").unwrap().id, id);
        assert!(registry.find("XYZ999").is_none());
    }
}
