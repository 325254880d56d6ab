//! Read-only commands: list, status, print, trips

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use voc_core::{Geocoder, Snapshot};
use voc_mqtt::entity::{Reading, INSTRUMENTS};
use voc_runtime::{VehicleRecord, VehicleRegistry};

use crate::output::{format_value, InstrumentRow, OutputContext, TripRow, VehicleRow};

/// List the account's vehicles
pub async fn list(registry: &Arc<VehicleRegistry>, ctx: &OutputContext) -> Result<()> {
    let mut rows = Vec::new();
    for id in registry.vehicles() {
        let snapshot = match registry.refresh_vehicle_state(&id).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                ctx.warn(&format!("Could not refresh {}: {}", id, e));
                None
            }
        };
        let record = registry.vehicle(&id);
        let model = snapshot
            .as_deref()
            .map(|s| {
                let kind = s.get("vehicleType").map(format_value).unwrap_or_default();
                match s.get("modelYear") {
                    Ok(year) => format!("{} {}", kind, format_value(year)),
                    Err(_) => kind,
                }
            })
            .unwrap_or_default();
        rows.push(VehicleRow {
            vin: id.to_string(),
            registration: record.and_then(|r| r.registration).unwrap_or_default(),
            model: model.trim().to_string(),
        });
    }
    ctx.print(&rows);
    Ok(())
}

/// Refresh one vehicle and show every instrument it reports
pub async fn status(
    registry: &Arc<VehicleRegistry>,
    vehicle: &VehicleRecord,
    geocoder: &dyn Geocoder,
    ctx: &OutputContext,
) -> Result<()> {
    let snapshot = registry
        .refresh_vehicle_state(&vehicle.id)
        .await
        .with_context(|| format!("Failed to refresh {}", vehicle.id))?;

    let mut rows = Vec::new();
    for instrument in INSTRUMENTS.iter().filter(|i| i.is_supported(&snapshot)) {
        let value = match instrument.reading {
            Reading::Position => describe_position(&snapshot, geocoder).await,
            _ => instrument.state(&snapshot),
        };
        rows.push(InstrumentRow {
            name: instrument.name.to_string(),
            value: value.unwrap_or_else(|| "-".to_string()),
            unit: instrument.unit().unwrap_or_default().to_string(),
        });
    }

    ctx.info(&format!(
        "{} ({})",
        vehicle.registration.as_deref().unwrap_or("-"),
        vehicle.id
    ));
    ctx.print(&rows);
    Ok(())
}

async fn describe_position(snapshot: &Snapshot, geocoder: &dyn Geocoder) -> Option<String> {
    let lat = snapshot.get("position.latitude").ok()?.as_f64()?;
    let lon = snapshot.get("position.longitude").ok()?.as_f64()?;
    let coordinates = format!("{:.6}, {:.6}", lat, lon);
    Some(match geocoder.reverse(lat, lon).await {
        Some(address) => format!("{} ({})", coordinates, address),
        None => coordinates,
    })
}

/// Print all attributes, or the one at a dotted path
pub async fn print(
    registry: &Arc<VehicleRegistry>,
    vehicle: &VehicleRecord,
    attribute: Option<&str>,
    ctx: &OutputContext,
) -> Result<()> {
    let snapshot = registry
        .refresh_vehicle_state(&vehicle.id)
        .await
        .with_context(|| format!("Failed to refresh {}", vehicle.id))?;
    match attribute {
        Some(path) => {
            let value = registry.get_attribute(&vehicle.id, path)?;
            ctx.print_value(&value);
        }
        None => ctx.print_value(&snapshot.attributes),
    }
    Ok(())
}

/// Show the trip journal
pub async fn trips(
    registry: &Arc<VehicleRegistry>,
    vehicle: &VehicleRecord,
    ctx: &OutputContext,
) -> Result<()> {
    let journal = registry
        .trips(&vehicle.id)
        .await
        .with_context(|| format!("Failed to fetch trips for {}", vehicle.id))?;
    ctx.print(&trip_rows(&journal));
    Ok(())
}

fn trip_rows(journal: &Value) -> Vec<TripRow> {
    let trips = journal
        .get("trips")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut rows = Vec::new();
    for trip in &trips {
        let id = trip.get("id").map(format_value).unwrap_or_default();
        let details = trip
            .get("tripDetails")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for detail in &details {
            let field = |key: &str| detail.get(key).map(format_value).unwrap_or_default();
            let distance_km = detail
                .get("distance")
                .and_then(Value::as_f64)
                .map(|m| format!("{:.1}", m / 1000.0))
                .unwrap_or_default();
            rows.push(TripRow {
                id: id.clone(),
                start: field("startTime"),
                end: field("endTime"),
                distance_km,
                fuel: field("fuelConsumption"),
            });
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_trip_rows() {
        let journal = json!({
            "trips": [
                {
                    "id": 1001,
                    "tripDetails": [
                        {
                            "startTime": "2018-05-13T08:00:00+0000",
                            "endTime": "2018-05-13T08:30:00+0000",
                            "distance": 23_460,
                            "fuelConsumption": 145
                        }
                    ]
                },
                {"id": 1002}
            ]
        });
        let rows = trip_rows(&journal);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "1001");
        assert_eq!(rows[0].distance_km, "23.5");
        assert_eq!(rows[0].fuel, "145");
    }

    #[test]
    fn test_trip_rows_tolerate_empty_journal() {
        assert!(trip_rows(&json!({})).is_empty());
        assert!(trip_rows(&json!({"trips": []})).is_empty());
    }
}
