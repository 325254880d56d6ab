//! Prometheus textfile export
//!
//! Renders vehicle state in the Prometheus text exposition format for the
//! node_exporter textfile collector. The file is replaced atomically so the
//! collector never reads a partial write.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tempfile::NamedTempFile;
use voc_core::Snapshot;
use voc_runtime::VehicleRegistry;

use crate::output::{format_value, OutputContext};

struct Family {
    name: &'static str,
    help: &'static str,
    kind: &'static str,
    /// Attribute path and the `type` label of each series
    series: &'static [(&'static str, Option<&'static str>)],
}

const FAMILIES: &[Family] = &[
    Family {
        name: "odometer",
        help: "Vehicle main odometer in meter.",
        kind: "counter",
        series: &[("odometer", None)],
    },
    Family {
        name: "trip_meter",
        help: "trip meters (in meter) differentiated by type",
        kind: "counter",
        series: &[("tripMeter1", Some("TM")), ("tripMeter2", Some("TA"))],
    },
    Family {
        name: "fuel_amount",
        help: "tank size and current volume in liters",
        kind: "gauge",
        series: &[
            ("fuelTankVolume", Some("capacity")),
            ("fuelAmount", Some("level")),
        ],
    },
    Family {
        name: "fuel_level",
        help: "tank level in percent",
        kind: "gauge",
        series: &[("fuelAmountLevel", None)],
    },
    Family {
        name: "car_status",
        help: "car status metrics",
        kind: "gauge",
        series: &[
            ("engineRunning", Some("engineRunning")),
            ("carLocked", Some("carLocked")),
        ],
    },
    Family {
        name: "distance",
        help: "distance values",
        kind: "gauge",
        series: &[("distanceToEmpty", Some("toEmpty"))],
    },
    Family {
        name: "consumption",
        help: "consumption values",
        kind: "gauge",
        series: &[("averageFuelConsumption", Some("fuel"))],
    },
    Family {
        name: "speed",
        help: "speed values",
        kind: "gauge",
        series: &[("averageSpeed", Some("average"))],
    },
];

/// Refresh every vehicle and write its metrics to `path`
pub async fn metrics(
    registry: &Arc<VehicleRegistry>,
    path: &Path,
    ctx: &OutputContext,
) -> Result<()> {
    let mut snapshots = Vec::new();
    for id in registry.vehicles() {
        match registry.refresh_vehicle_state(&id).await {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(e) => ctx.warn(&format!("Could not refresh {}: {}", id, e)),
        }
    }

    let text = render(&snapshots);
    write_atomic(path, &text)?;
    ctx.success(&format!(
        "Wrote metrics for {} vehicle(s) to {}",
        snapshots.len(),
        path.display()
    ));
    Ok(())
}

/// Render snapshots in the Prometheus text format.
///
/// Series whose attribute a vehicle does not report are left out; booleans
/// are written as 0 or 1.
pub fn render(snapshots: &[Arc<Snapshot>]) -> String {
    let mut out = String::new();
    for family in FAMILIES {
        out.push_str(&format!("# HELP {} {}\n", family.name, family.help));
        out.push_str(&format!("# TYPE {} {}\n", family.name, family.kind));
        for (attr, series_type) in family.series {
            for snapshot in snapshots {
                let Some(value) = sample(snapshot, attr) else {
                    continue;
                };
                out.push_str(&format!(
                    "{}{{{}}} {}\n",
                    family.name,
                    labels(snapshot, *series_type),
                    value
                ));
            }
        }
        out.push('\n');
    }
    out
}

fn sample(snapshot: &Snapshot, attr: &str) -> Option<String> {
    match snapshot.get(attr).ok()? {
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn labels(snapshot: &Snapshot, series_type: Option<&str>) -> String {
    let text = |path: &str| snapshot.get(path).map(format_value).unwrap_or_default();
    let mut pairs = vec![
        ("vin", snapshot.vehicle_id.to_string()),
        (
            "registration",
            snapshot.registration_number().unwrap_or_default().to_string(),
        ),
        ("model", text("vehicleType")),
        ("modelyear", text("modelYear")),
    ];
    if let Some(series_type) = series_type {
        pairs.push(("type", series_type.to_string()));
    }
    pairs
        .iter()
        .map(|(key, value)| format!("{}=\"{}\"", key, escape_label(value)))
        .collect::<Vec<_>>()
        .join(",")
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Replace `path` with `contents` through a temporary file in the same
/// directory
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    file.write_all(contents.as_bytes())
        .context("Failed to write metrics")?;

    // NamedTempFile is created 0600
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))
            .context("Failed to set metrics file permissions")?;
    }

    file.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use voc_core::VehicleId;

    fn snapshot() -> Arc<Snapshot> {
        Arc::new(Snapshot::new(
            VehicleId::new("YV1ABC123"),
            1,
            json!({
                "registrationNumber": "ABC123",
                "vehicleType": "V60",
                "modelYear": 2017,
                "odometer": 2_045_000,
                "tripMeter1": 12_000,
                "tripMeter2": 340_000,
                "fuelAmount": 38,
                "fuelAmountLevel": 63,
                "carLocked": true,
                "engineRunning": false,
                "distanceToEmpty": 410
            }),
        ))
    }

    #[test]
    fn test_render_metrics() {
        let text = render(&[snapshot()]);
        let labels = r#"vin="YV1ABC123",registration="ABC123",model="V60",modelyear="2017""#;

        assert!(text.starts_with(
            "# HELP odometer Vehicle main odometer in meter.\n# TYPE odometer counter\n"
        ));
        assert!(text.contains(&format!("odometer{{{}}} 2045000\n", labels)));
        assert!(text.contains(&format!("trip_meter{{{},type=\"TM\"}} 12000\n", labels)));
        assert!(text.contains(&format!("trip_meter{{{},type=\"TA\"}} 340000\n", labels)));
        assert!(text.contains(&format!("fuel_level{{{}}} 63\n", labels)));
        assert!(text.contains(&format!(
            "car_status{{{},type=\"carLocked\"}} 1\n",
            labels
        )));
        assert!(text.contains(&format!(
            "car_status{{{},type=\"engineRunning\"}} 0\n",
            labels
        )));
        assert!(text.contains(&format!("distance{{{},type=\"toEmpty\"}} 410\n", labels)));
    }

    #[test]
    fn test_unreported_attributes_are_left_out() {
        let text = render(&[snapshot()]);
        assert!(text.contains("# TYPE speed gauge\n"));
        assert!(!text.contains("speed{"));
        assert!(!text.contains("type=\"capacity\""));
    }

    #[test]
    fn test_label_values_are_escaped() {
        assert_eq!(escape_label(r#"V60 "Cross" \ 2"#), r#"V60 \"Cross\" \\ 2"#);
        assert_eq!(escape_label("a\nb"), "a\\nb");
    }

    #[test]
    fn test_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voc.prom");
        std::fs::write(&path, "stale").unwrap();

        write_atomic(&path, "odometer 1\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "odometer 1\n");
        // Only the target remains in the directory
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
