//! Periodic full-state refresh

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use voc_core::{VehicleId, VocConfig};

use crate::error::RegistryError;
use crate::invoker::wait_for_shutdown;
use crate::registry::VehicleRegistry;

/// Default refresh interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

/// Poller configuration
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Upper bound of the random delay added to every interval
    pub jitter: Duration,
    /// Maximum number of vehicles refreshed concurrently
    pub parallelism: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            jitter: Duration::from_secs(10),
            parallelism: 4,
        }
    }
}

impl From<&VocConfig> for PollerConfig {
    fn from(config: &VocConfig) -> Self {
        Self {
            interval: config.interval(),
            jitter: config.jitter(),
            ..Default::default()
        }
    }
}

/// Outcome of one refresh tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollReport {
    pub tick: u64,
    /// Vehicles whose state was refreshed
    pub refreshed: Vec<VehicleId>,
    /// Vehicles whose refresh failed, with the reason
    pub failed: Vec<(VehicleId, String)>,
    /// Vehicles first seen during this tick
    pub discovered: Vec<VehicleId>,
}

/// Drives periodic refreshes of the vehicle list and every vehicle's state
pub struct Poller {
    registry: Arc<VehicleRegistry>,
    config: PollerConfig,
    reports: broadcast::Sender<Arc<PollReport>>,
    ticks: AtomicU64,
}

impl Poller {
    pub fn new(registry: Arc<VehicleRegistry>, config: PollerConfig) -> Self {
        let (reports, _) = broadcast::channel(16);
        Self {
            registry,
            config,
            reports,
            ticks: AtomicU64::new(0),
        }
    }

    /// Receive a report after every tick
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PollReport>> {
        self.reports.subscribe()
    }

    /// Run one refresh tick.
    ///
    /// A failure for one vehicle is recorded in the report; only an
    /// authentication failure aborts the tick.
    pub async fn tick(&self) -> Result<Arc<PollReport>, RegistryError> {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(tick, "Refreshing vehicles");

        let known_before = self.registry.vehicles();
        match self.registry.refresh_vehicle_list().await {
            Ok(_) => {}
            Err(e) if e.is_auth() => return Err(e),
            Err(e) => warn!(error = %e, "Vehicle list refresh failed, using known vehicles"),
        }

        let vehicles = self.registry.vehicles();
        let discovered = vehicles
            .iter()
            .filter(|id| !known_before.contains(id))
            .cloned()
            .collect();

        let results: Vec<(VehicleId, Result<_, RegistryError>)> = stream::iter(vehicles)
            .map(|id| async move {
                let result = self.registry.refresh_vehicle_state(&id).await;
                (id, result)
            })
            .buffer_unordered(self.config.parallelism.max(1))
            .collect()
            .await;

        let mut report = PollReport {
            tick,
            discovered,
            ..Default::default()
        };
        for (id, result) in results {
            match result {
                Ok(_) => report.refreshed.push(id),
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!(vehicle = %id, error = %e, "Vehicle refresh failed");
                    report.failed.push((id, e.to_string()));
                }
            }
        }
        report.refreshed.sort();
        report.failed.sort();

        info!(
            tick,
            refreshed = report.refreshed.len(),
            failed = report.failed.len(),
            "Refresh complete"
        );
        let report = Arc::new(report);
        let _ = self.reports.send(report.clone());
        Ok(report)
    }

    /// Tick immediately, then every interval plus jitter, until shutdown.
    ///
    /// Returns an error if the service rejects the credentials.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), RegistryError> {
        info!(interval = ?self.config.interval, "Poller started");
        loop {
            if let Err(e) = self.tick().await {
                error!(error = %e, "Authentication failed, stopping poller");
                return Err(e);
            }

            let delay = self.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Poller stopped");
                    return Ok(());
                }
            }
        }
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.interval + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voc_client::Transport;

    fn poller(config: PollerConfig) -> Poller {
        let transport = Transport::with_credentials("http://127.0.0.1:9/", "u", "p").unwrap();
        Poller::new(Arc::new(VehicleRegistry::new(Arc::new(transport))), config)
    }

    #[test]
    fn test_delay_within_jitter() {
        let poller = poller(PollerConfig {
            interval: Duration::from_secs(60),
            jitter: Duration::from_secs(2),
            parallelism: 1,
        });
        for _ in 0..50 {
            let delay = poller.next_delay();
            assert!(delay >= Duration::from_secs(60));
            assert!(delay <= Duration::from_secs(62));
        }
    }

    #[test]
    fn test_zero_jitter() {
        let poller = poller(PollerConfig {
            interval: Duration::from_secs(5),
            jitter: Duration::ZERO,
            parallelism: 1,
        });
        assert_eq!(poller.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_config_from_voc_config() {
        let mut config = VocConfig::default();
        config.interval = 60;
        config.jitter = 0;
        let poller_config = PollerConfig::from(&config);
        assert_eq!(poller_config.interval, Duration::from_secs(60));
        assert_eq!(poller_config.jitter, Duration::ZERO);
        assert_eq!(poller_config.parallelism, 4);
    }
}
