//! Command implementations for voc

pub mod actions;
pub mod metrics;
pub mod mqtt;
pub mod vehicles;

pub use actions::invoke;
pub use metrics::metrics;
pub use mqtt::mqtt;
pub use vehicles::{list, print, status, trips};

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use voc_client::Transport;
use voc_core::VocConfig;
use voc_runtime::{VehicleRecord, VehicleRegistry};

/// Log in and load the account's vehicle list
pub async fn connect(config: &VocConfig) -> Result<Arc<VehicleRegistry>> {
    if !config.has_credentials() {
        bail!("No credentials: set username and password in voc.conf or pass --user and --pass");
    }
    let transport = Transport::new(config).context("Failed to create VOC client")?;
    let registry = Arc::new(VehicleRegistry::new(Arc::new(transport)));
    registry
        .refresh_vehicle_list()
        .await
        .context("Failed to list vehicles")?;
    Ok(registry)
}

/// The vehicle named by VIN or registration number, or the first one
pub fn select_vehicle(registry: &VehicleRegistry, vin: Option<&str>) -> Result<VehicleRecord> {
    match vin {
        Some(vin) => registry
            .find(vin)
            .with_context(|| format!("No vehicle with VIN or registration {}", vin)),
        None => registry
            .vehicles()
            .first()
            .and_then(|id| registry.vehicle(id))
            .context("No vehicles on this account"),
    }
}
