//! Remote command invocation
//!
//! A submitted command is tracked as an explicit state machine:
//!
//! ```text
//! Queued -> Running -> Successful | Failed | TimedOut | Error
//! ```
//!
//! At most one invocation per (vehicle, command) may be in flight. Each
//! accepted invocation gets its own polling task, which queries the status
//! URL returned by the service until a terminal status or the polling
//! budget runs out. Before a terminal status is delivered, the vehicle's
//! state is refreshed once so awaiters see the command's effect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use voc_client::TransportError;
use voc_core::{CommandKind, InvocationInfo, InvocationStatus, TerminalStatus, VehicleId, VocConfig};

use crate::error::{InvokerError, InvokerResult};
use crate::registry::VehicleRegistry;

/// Default interval between status polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default total time to wait for a terminal status
pub const DEFAULT_POLL_BUDGET: Duration = Duration::from_secs(120);

/// Invoker configuration
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    /// Whether commands may be issued at all
    pub mutable: bool,
    pub poll_interval: Duration,
    pub poll_budget: Duration,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            mutable: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_budget: DEFAULT_POLL_BUDGET,
        }
    }
}

impl From<&VocConfig> for InvokerConfig {
    fn from(config: &VocConfig) -> Self {
        Self {
            mutable: config.mutable,
            poll_interval: config.poll_interval(),
            poll_budget: config.poll_budget(),
        }
    }
}

/// Observable state of an invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationState {
    Active(InvocationStatus),
    Finished(TerminalStatus),
    /// The invoker shut down before the invocation finished
    Cancelled,
}

/// Handle to a submitted invocation; cheap to clone
#[derive(Debug, Clone)]
pub struct InvocationHandle {
    pub vehicle_id: VehicleId,
    pub kind: CommandKind,
    /// Remote invocation id
    pub remote_id: String,
    state: watch::Receiver<InvocationState>,
}

impl InvocationHandle {
    /// Current status without waiting
    pub fn status(&self) -> InvocationStatus {
        match &*self.state.borrow() {
            InvocationState::Active(status) => *status,
            InvocationState::Finished(terminal) => terminal.status(),
            InvocationState::Cancelled => InvocationStatus::Error,
        }
    }

    /// Wait for the terminal status
    pub async fn wait(&self) -> InvokerResult<TerminalStatus> {
        let mut state = self.state.clone();
        loop {
            match &*state.borrow_and_update() {
                InvocationState::Finished(terminal) => return Ok(terminal.clone()),
                InvocationState::Cancelled => return Err(InvokerError::Cancelled),
                InvocationState::Active(_) => {}
            }
            if state.changed().await.is_err() {
                return Err(InvokerError::Cancelled);
            }
        }
    }
}

type InvocationKey = (VehicleId, CommandKind);

enum Slot {
    /// Reserved while the submission request is in flight
    Submitting,
    Tracking(Arc<Mutex<InvocationInfo>>),
}

/// Removes a `Submitting` reservation unless it was handed over to a
/// polling task.
struct Reservation<'a> {
    outstanding: &'a Mutex<HashMap<InvocationKey, Slot>>,
    key: InvocationKey,
    armed: bool,
}

impl Reservation<'_> {
    fn complete(mut self, info: Arc<Mutex<InvocationInfo>>) -> InvocationKey {
        self.armed = false;
        self.outstanding
            .lock()
            .insert(self.key.clone(), Slot::Tracking(info));
        self.key.clone()
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.outstanding.lock().remove(&self.key);
        }
    }
}

/// Submits commands and tracks them to completion
pub struct CommandInvoker {
    registry: Arc<VehicleRegistry>,
    config: InvokerConfig,
    outstanding: Mutex<HashMap<InvocationKey, Slot>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    submitted: AtomicU64,
}

impl CommandInvoker {
    pub fn new(registry: Arc<VehicleRegistry>, config: InvokerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry,
            config,
            outstanding: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
            submitted: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<VehicleRegistry> {
        &self.registry
    }

    pub fn is_mutable(&self) -> bool {
        self.config.mutable
    }

    /// Number of invocations accepted by the service so far
    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Submit a command to a vehicle.
    ///
    /// `params` replaces the command's default request body.
    pub async fn submit(
        self: &Arc<Self>,
        vehicle_id: &VehicleId,
        kind: CommandKind,
        params: Option<Value>,
    ) -> InvokerResult<InvocationHandle> {
        if !self.config.mutable {
            return Err(InvokerError::ReadOnly);
        }
        if *self.shutdown_tx.borrow() {
            return Err(InvokerError::Cancelled);
        }
        let record = self
            .registry
            .vehicle(vehicle_id)
            .ok_or_else(|| InvokerError::UnknownVehicle(vehicle_id.clone()))?;

        let reservation = self.reserve(vehicle_id, &kind)?;

        let body = params.unwrap_or_else(|| kind.default_params());
        info!(vehicle = %vehicle_id, command = %kind, "Submitting command");

        let response = self
            .registry
            .transport()
            .invoke_service(&record.url, kind.service_path(), &body)
            .await
            .map_err(|e| {
                warn!(vehicle = %vehicle_id, command = %kind, error = %e, "Submission failed");
                InvokerError::from(e)
            })?;

        let status_url = response.service.clone().ok_or_else(|| {
            InvokerError::InvalidResponse("response carries no status URL".to_string())
        })?;
        let remote_id = response.invocation_id().unwrap_or_default();
        debug!(
            vehicle = %vehicle_id,
            command = %kind,
            remote_id = %remote_id,
            status = ?response.status,
            "Command accepted"
        );

        let info = Arc::new(Mutex::new(InvocationInfo {
            vehicle_id: vehicle_id.clone(),
            kind: kind.clone(),
            remote_id: remote_id.clone(),
            status_url: status_url.clone(),
            status: InvocationStatus::Queued,
            submitted_at: Utc::now(),
            last_polled_at: None,
            detail: None,
        }));
        let (state_tx, state_rx) = watch::channel(InvocationState::Active(InvocationStatus::Queued));

        let key = reservation.complete(info.clone());
        self.submitted.fetch_add(1, Ordering::SeqCst);

        let invoker = Arc::clone(self);
        let shutdown = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            invoker.track(key, status_url, info, state_tx, shutdown).await;
        });
        {
            let mut tasks = self.tasks.lock();
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }

        Ok(InvocationHandle {
            vehicle_id: vehicle_id.clone(),
            kind,
            remote_id,
            state: state_rx,
        })
    }

    /// Wait for an invocation's terminal status
    pub async fn await_result(&self, handle: &InvocationHandle) -> InvokerResult<TerminalStatus> {
        handle.wait().await
    }

    /// In-flight invocations
    pub fn outstanding(&self) -> Vec<InvocationInfo> {
        self.outstanding
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Tracking(info) => Some(info.lock().clone()),
                Slot::Submitting => None,
            })
            .collect()
    }

    /// Cancel every polling task and wait for them to exit.
    ///
    /// Awaiters of unfinished invocations get [`InvokerError::Cancelled`].
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();
        for task in tasks {
            let _ = task.await;
        }
        debug!(tasks = count, "Command invoker shut down");
    }

    fn reserve(&self, vehicle_id: &VehicleId, kind: &CommandKind) -> InvokerResult<Reservation<'_>> {
        let key = (vehicle_id.clone(), kind.clone());
        let mut outstanding = self.outstanding.lock();
        if outstanding.contains_key(&key) {
            return Err(InvokerError::Conflict {
                vehicle_id: vehicle_id.clone(),
                kind: kind.clone(),
            });
        }
        outstanding.insert(key.clone(), Slot::Submitting);
        Ok(Reservation {
            outstanding: &self.outstanding,
            key,
            armed: true,
        })
    }

    // =========================================================================
    // Polling
    // =========================================================================

    async fn track(
        self: Arc<Self>,
        key: InvocationKey,
        status_url: String,
        info: Arc<Mutex<InvocationInfo>>,
        state_tx: watch::Sender<InvocationState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (vehicle_id, kind) = key.clone();
        let deadline = Instant::now() + self.config.poll_budget;

        let polled = tokio::select! {
            terminal = self.poll_until_terminal(&status_url, deadline, &info, &state_tx) => Some(terminal),
            _ = wait_for_shutdown(&mut shutdown) => None,
        };
        let Some(terminal) = polled else {
            debug!(vehicle = %vehicle_id, command = %kind, "Invocation cancelled");
            self.outstanding.lock().remove(&key);
            state_tx.send_replace(InvocationState::Cancelled);
            return;
        };

        let refreshed = tokio::select! {
            result = self.registry.reconcile_vehicle_state(&vehicle_id) => Some(result),
            _ = wait_for_shutdown(&mut shutdown) => None,
        };
        match refreshed {
            Some(Ok(snapshot)) => {
                debug!(vehicle = %vehicle_id, version = snapshot.version, "State reconciled")
            }
            Some(Err(e)) => {
                warn!(vehicle = %vehicle_id, error = %e, "Refresh after command failed")
            }
            None => {
                self.outstanding.lock().remove(&key);
                state_tx.send_replace(InvocationState::Cancelled);
                return;
            }
        }

        {
            let mut info = info.lock();
            info.status = terminal.status();
            info.detail = terminal.detail().map(String::from);
        }
        self.outstanding.lock().remove(&key);

        if terminal.is_success() {
            info!(vehicle = %vehicle_id, command = %kind, "Command successful");
        } else {
            warn!(vehicle = %vehicle_id, command = %kind, outcome = %terminal, "Command did not succeed");
        }
        state_tx.send_replace(InvocationState::Finished(terminal));
    }

    async fn poll_until_terminal(
        &self,
        status_url: &str,
        deadline: Instant,
        info: &Mutex<InvocationInfo>,
        state_tx: &watch::Sender<InvocationState>,
    ) -> TerminalStatus {
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            if Instant::now() >= deadline {
                return TerminalStatus::TimedOut;
            }

            let poll = tokio::time::timeout_at(
                deadline,
                self.registry.transport().service_status(status_url),
            )
            .await;
            let response = match poll {
                Err(_) => return TerminalStatus::TimedOut,
                Ok(Ok(response)) => response,
                Ok(Err(e)) => match classify_poll_error(e) {
                    Some(terminal) => return terminal,
                    None => continue,
                },
            };
            info.lock().last_polled_at = Some(Utc::now());

            match response.invocation_status() {
                Some(InvocationStatus::Queued) | Some(InvocationStatus::Running) => {
                    debug!(status = ?response.status, "Invocation pending");
                    info.lock().status = InvocationStatus::Running;
                    state_tx.send_if_modified(|state| {
                        let running = InvocationState::Active(InvocationStatus::Running);
                        if *state == running {
                            false
                        } else {
                            *state = running;
                            true
                        }
                    });
                }
                Some(InvocationStatus::Successful) => return TerminalStatus::Successful,
                Some(InvocationStatus::Failed) => {
                    return TerminalStatus::Failed(response.failure_reason)
                }
                _ => {
                    return TerminalStatus::Error(format!(
                        "unrecognised service status: {}",
                        response.status.as_deref().unwrap_or("<missing>")
                    ))
                }
            }
        }
    }
}

/// Map a status-poll failure to a terminal status, or `None` to retry
fn classify_poll_error(err: TransportError) -> Option<TerminalStatus> {
    if err.is_transient() {
        warn!(error = %err, "Status poll failed, retrying");
        return None;
    }
    Some(TerminalStatus::Error(err.to_string()))
}

/// Resolve once `true` is sent on the shutdown channel or its sender is gone
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use voc_client::Transport;

    fn invoker(config: InvokerConfig) -> Arc<CommandInvoker> {
        let transport = Transport::with_credentials("http://127.0.0.1:9/", "u", "p").unwrap();
        let registry = Arc::new(VehicleRegistry::new(Arc::new(transport)));
        registry.register(VehicleId::new("V1"), "http://127.0.0.1:9/vehicles/V1");
        Arc::new(CommandInvoker::new(registry, config))
    }

    #[tokio::test]
    async fn test_read_only_rejects_without_contacting_service() {
        let invoker = invoker(InvokerConfig {
            mutable: false,
            ..Default::default()
        });
        let err = invoker
            .submit(&VehicleId::new("V1"), CommandKind::Lock, None)
            .await
            .unwrap_err();
        assert_eq!(err, InvokerError::ReadOnly);
        assert_eq!(invoker.submitted_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_vehicle() {
        let invoker = invoker(InvokerConfig::default());
        let err = invoker
            .submit(&VehicleId::new("NOPE"), CommandKind::Lock, None)
            .await
            .unwrap_err();
        assert_eq!(err, InvokerError::UnknownVehicle(VehicleId::new("NOPE")));
    }

    #[test]
    fn test_reservation_conflict_and_release() {
        let invoker = invoker(InvokerConfig::default());
        let id = VehicleId::new("V1");

        let first = invoker.reserve(&id, &CommandKind::HeaterStart).unwrap();
        assert!(matches!(
            invoker.reserve(&id, &CommandKind::HeaterStart),
            Err(InvokerError::Conflict { .. })
        ));
        // Other commands for the same vehicle are independent
        let other = invoker.reserve(&id, &CommandKind::Lock).unwrap();

        drop(first);
        drop(other);
        assert!(invoker.reserve(&id, &CommandKind::HeaterStart).is_ok());
    }

    #[test]
    fn test_poll_error_classification() {
        assert_eq!(
            classify_poll_error(TransportError::Network("reset".into())),
            None
        );
        assert!(matches!(
            classify_poll_error(TransportError::Auth("denied".into())),
            Some(TerminalStatus::Error(_))
        ));
        assert!(matches!(
            classify_poll_error(TransportError::Protocol("not json".into())),
            Some(TerminalStatus::Error(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_cancelled() {
        let invoker = invoker(InvokerConfig::default());
        invoker.shutdown().await;
        assert_eq!(
            invoker
                .submit(&VehicleId::new("V1"), CommandKind::Lock, None)
                .await
                .unwrap_err(),
            InvokerError::Cancelled
        );
    }
}
