//! Long-running MQTT bridge

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};
use voc_core::VocConfig;
use voc_mqtt::{client_id, options_from_url, Bridge, BridgeError, MosquittoConfig, MqttBus};
use voc_runtime::{
    CommandInvoker, InvokerConfig, Poller, PollerConfig, RegistryError, VehicleRegistry,
};

use crate::output::OutputContext;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

type BridgeTask = JoinHandle<Result<(), BridgeError>>;

/// Why the bridge mode is stopping
#[derive(Debug)]
enum Stop {
    Poller(Result<(), RegistryError>),
    Bridge(Result<Result<(), BridgeError>, JoinError>),
    Interrupted,
}

/// Broker URL from `mqtt_url`, else from the mosquitto_pub options file
fn broker_url(config: &VocConfig) -> Result<String> {
    if let Some(url) = &config.mqtt_url {
        debug!("Using MQTT url from voc.conf");
        return Ok(url.clone());
    }
    let path = MosquittoConfig::default_path().context("Could not determine config directory")?;
    debug!(path = %path.display(), "Using MQTT url from mosquitto_pub");
    let mosquitto = MosquittoConfig::load(&path)?;
    Ok(mosquitto.url())
}

/// Wait until the poller ends, the bridge task ends or `interrupt` fires
async fn wait_for_stop<P, I>(poller: P, bridge: &mut BridgeTask, interrupt: I) -> Stop
where
    P: Future<Output = Result<(), RegistryError>>,
    I: Future,
{
    tokio::select! {
        result = poller => Stop::Poller(result),
        joined = bridge => Stop::Bridge(joined),
        _ = interrupt => Stop::Interrupted,
    }
}

/// Bridge every vehicle on the account to the broker until interrupted
pub async fn mqtt(
    config: &VocConfig,
    registry: Arc<VehicleRegistry>,
    ctx: &OutputContext,
) -> Result<()> {
    let options = options_from_url(&broker_url(config)?, &client_id())?;
    let invoker = Arc::new(CommandInvoker::new(
        registry.clone(),
        InvokerConfig::from(config),
    ));
    let poller = Poller::new(registry, PollerConfig::from(config));

    let (bus, events, driver) = MqttBus::connect(options);
    let bus = Arc::new(bus);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bridge = Bridge::new(bus.clone(), invoker.clone());
    let mut bridge = tokio::spawn(bridge.run(events, poller.subscribe(), shutdown_rx.clone()));

    ctx.info(&format!(
        "Polling VOC every {} seconds, press Ctrl-C to stop",
        config.interval
    ));
    let stop = wait_for_stop(
        poller.run(shutdown_rx),
        &mut bridge,
        tokio::signal::ctrl_c(),
    )
    .await;

    shutdown_tx.send_replace(true);
    invoker.shutdown().await;
    let (result, joined) = match stop {
        Stop::Poller(result) => (result.context("Poller stopped"), bridge.await),
        Stop::Bridge(joined) => {
            warn!("Bridge stopped, shutting down");
            (Ok(()), joined)
        }
        Stop::Interrupted => {
            info!("Interrupted, shutting down");
            (Ok(()), bridge.await)
        }
    };
    let bridged = joined
        .context("Bridge task failed")
        .and_then(|r| r.context("Bridge stopped"));

    if let Err(e) = bus.disconnect().await {
        debug!(error = %e, "MQTT disconnect failed");
    }
    if tokio::time::timeout(DISCONNECT_TIMEOUT, driver).await.is_err() {
        debug!("MQTT driver did not stop in time");
    }
    result.and(bridged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    #[tokio::test]
    async fn test_bridge_exit_stops_the_mode() {
        let mut bridge: BridgeTask = tokio::spawn(async { Err(BridgeError::Closed) });
        let poller = pending::<Result<(), RegistryError>>();

        let stop = wait_for_stop(poller, &mut bridge, pending::<()>()).await;
        assert!(matches!(stop, Stop::Bridge(Ok(Err(BridgeError::Closed)))));
    }

    #[tokio::test]
    async fn test_interrupt_stops_the_mode() {
        let mut bridge: BridgeTask = tokio::spawn(pending());
        let poller = pending::<Result<(), RegistryError>>();

        let stop = wait_for_stop(poller, &mut bridge, async {}).await;
        assert!(matches!(stop, Stop::Interrupted));
        bridge.abort();
    }
}
