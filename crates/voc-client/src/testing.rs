//! Test utilities for voc-client
//!
//! Provides an in-process mock of the VOC customer API and a server handle
//! that runs it on an ephemeral port.
//!
//! ```ignore
//! use voc_client::testing::MockCloud;
//!
//! let cloud = MockCloud::new();
//! cloud.add_vehicle("ABC123", "ABC123", json!({}), json!({"carLocked": false}), None);
//! let server = cloud.serve().await?;
//! let transport = server.transport()?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;

use crate::{Result, Transport};

const SESSION_COOKIE: &str = "VOC_SESSION";

// =============================================================================
// Mock cloud
// =============================================================================

#[derive(Debug, Clone)]
struct MockVehicle {
    attributes: Value,
    status: Value,
    position: Option<Value>,
    trips: Value,
}

#[derive(Debug)]
struct MockService {
    vin: String,
    command: String,
    script: VecDeque<String>,
    applied: bool,
}

#[derive(Debug, Default)]
struct MockInner {
    base_url: String,
    session: Option<String>,
    session_counter: u64,
    vehicles: Vec<(String, MockVehicle)>,
    services: HashMap<String, MockService>,
    next_service: u64,
    script: Vec<String>,
    effects: HashMap<String, Value>,
    submit_failure: Option<u16>,
    last_bodies: HashMap<String, Value>,
    requests: HashMap<String, usize>,
    delay: Option<Duration>,
}

#[derive(Debug)]
struct MockState {
    inner: Mutex<MockInner>,
    accept_credentials: AtomicBool,
    logins: AtomicUsize,
}

/// In-process mock of the VOC customer API
///
/// Requests other than `customeraccounts` require the session cookie issued
/// by a Basic-authenticated `GET customeraccounts`; anything else gets 401.
/// Commands are answered with a status URL whose successive polls replay a
/// configurable status script. When a poll reports `Successful`, the effect
/// registered for that command is merged into the vehicle's status.
#[derive(Debug, Clone)]
pub struct MockCloud {
    state: Arc<MockState>,
}

impl Default for MockCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCloud {
    pub fn new() -> Self {
        let inner = MockInner {
            script: vec!["Successful".to_string()],
            ..Default::default()
        };
        Self {
            state: Arc::new(MockState {
                inner: Mutex::new(inner),
                accept_credentials: AtomicBool::new(true),
                logins: AtomicUsize::new(0),
            }),
        }
    }

    /// Register a vehicle; `registration` is merged into its attributes
    pub fn add_vehicle(
        &self,
        vin: &str,
        registration: &str,
        attributes: Value,
        status: Value,
        position: Option<Value>,
    ) {
        let mut attributes = match attributes {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        attributes.insert("VIN".into(), json!(vin));
        attributes.insert("registrationNumber".into(), json!(registration));

        let vehicle = MockVehicle {
            attributes: Value::Object(attributes),
            status,
            position,
            trips: json!({"trips": []}),
        };

        let mut inner = self.state.inner.lock();
        inner.vehicles.retain(|(id, _)| id != vin);
        inner.vehicles.push((vin.to_string(), vehicle));
    }

    /// Remove a vehicle from the account
    pub fn remove_vehicle(&self, vin: &str) {
        self.state.inner.lock().vehicles.retain(|(id, _)| id != vin);
    }

    /// Merge keys into a vehicle's status resource
    pub fn update_status(&self, vin: &str, patch: Value) {
        let mut inner = self.state.inner.lock();
        if let Some((_, vehicle)) = inner.vehicles.iter_mut().find(|(id, _)| id == vin) {
            merge(&mut vehicle.status, patch);
        }
    }

    /// Statuses returned by successive polls of a new invocation.
    /// The last entry repeats once the script is exhausted. The entry
    /// `"<garbage>"` answers with a body that is not JSON.
    pub fn set_status_script(&self, script: &[&str]) {
        self.state.inner.lock().script = script.iter().map(|s| s.to_string()).collect();
    }

    /// Status patch applied when the named command reports `Successful`
    pub fn on_success(&self, command: &str, patch: Value) {
        self.state
            .inner
            .lock()
            .effects
            .insert(command.to_string(), patch);
    }

    /// Make every command submission fail with the given HTTP status
    pub fn fail_submissions(&self, status: Option<u16>) {
        self.state.inner.lock().submit_failure = status;
    }

    /// Delay every vehicle resource response. The body still reflects the
    /// state at the time the request arrived.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.inner.lock().delay = delay;
    }

    /// Invalidate the current session so the next request gets 401
    pub fn expire_session(&self) {
        self.state.inner.lock().session = None;
    }

    /// Reject Basic credentials from now on
    pub fn reject_credentials(&self) {
        self.state.accept_credentials.store(false, Ordering::SeqCst);
    }

    /// Number of successful Basic logins
    pub fn login_count(&self) -> usize {
        self.state.logins.load(Ordering::SeqCst)
    }

    /// Number of requests served for `"{METHOD} {path}"`, e.g. `"GET /vehicles/V1/status"`
    pub fn request_count(&self, key: &str) -> usize {
        self.state
            .inner
            .lock()
            .requests
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Body of the last submission of a command
    pub fn last_body(&self, command: &str) -> Option<Value> {
        self.state.inner.lock().last_bodies.get(command).cloned()
    }

    /// Build the router serving this mock
    pub fn router(&self) -> Router {
        Router::new()
            .route("/customeraccounts", get(customer_accounts))
            .route("/vehicle-account-relations/{vin}", get(relation))
            .route(
                "/vehicles/{vin}/{*resource}",
                get(vehicle_resource).post(vehicle_command),
            )
            .route("/services/{id}", get(service_status))
            .with_state(self.state.clone())
    }

    /// Serve the mock on an ephemeral local port
    pub async fn serve(&self) -> std::io::Result<TestServer> {
        let server = TestServer::start(self.router()).await?;
        self.state.inner.lock().base_url = server.base_url();
        Ok(server)
    }
}

impl MockState {
    fn record(&self, key: String) {
        *self.inner.lock().requests.entry(key).or_insert(0) += 1;
    }

    fn session_valid(&self, headers: &HeaderMap) -> bool {
        let inner = self.inner.lock();
        let Some(token) = &inner.session else {
            return false;
        };
        let expected = format!("{}={}", SESSION_COOKIE, token);
        headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(|c| c.split(';').any(|part| part.trim() == expected))
            .unwrap_or(false)
    }

    fn delay(&self) -> Option<Duration> {
        self.inner.lock().delay
    }
}

fn merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                target.insert(key, value);
            }
        }
        (target, patch) => *target = patch,
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn customer_accounts(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.record("GET /customeraccounts".into());

    let has_basic = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("Basic "))
        .unwrap_or(false);

    let mut set_cookie = None;
    if !state.session_valid(&headers) {
        if !has_basic || !state.accept_credentials.load(Ordering::SeqCst) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let mut inner = state.inner.lock();
        inner.session_counter += 1;
        let token = format!("session-{}", inner.session_counter);
        inner.session = Some(token.clone());
        state.logins.fetch_add(1, Ordering::SeqCst);
        set_cookie = Some(format!("{}={}; Path=/; HttpOnly", SESSION_COOKIE, token));
    }

    let body = {
        let inner = state.inner.lock();
        let relations: Vec<String> = inner
            .vehicles
            .iter()
            .map(|(vin, _)| format!("{}vehicle-account-relations/{}", inner.base_url, vin))
            .collect();
        json!({
            "username": "test@example.com",
            "accountVehicleRelations": relations,
        })
    };

    match set_cookie {
        Some(cookie) => ([(header::SET_COOKIE, cookie)], Json(body)).into_response(),
        None => Json(body).into_response(),
    }
}

async fn relation(
    State(state): State<Arc<MockState>>,
    Path(vin): Path<String>,
    headers: HeaderMap,
) -> Response {
    state.record(format!("GET /vehicle-account-relations/{}", vin));
    if !state.session_valid(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let inner = state.inner.lock();
    if !inner.vehicles.iter().any(|(id, _)| *id == vin) {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({
        "vehicle": format!("{}vehicles/{}", inner.base_url, vin),
        "vehicleId": vin,
        "status": "Verified",
    }))
    .into_response()
}

async fn vehicle_resource(
    State(state): State<Arc<MockState>>,
    Path((vin, resource)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    state.record(format!("GET /vehicles/{}/{}", vin, resource));
    if !state.session_valid(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    // The answer reflects the state when the request arrived
    let body = {
        let inner = state.inner.lock();
        let Some((_, vehicle)) = inner.vehicles.iter().find(|(id, _)| *id == vin) else {
            return not_found("Vehicle not found");
        };
        match resource.as_str() {
            "attributes" => Some(vehicle.attributes.clone()),
            "status" => Some(vehicle.status.clone()),
            "position" => vehicle.position.clone(),
            "trips" => Some(vehicle.trips.clone()),
            _ => None,
        }
    };
    if let Some(delay) = state.delay() {
        tokio::time::sleep(delay).await;
    }
    match body {
        Some(body) => Json(body).into_response(),
        None => not_found("Resource not found"),
    }
}

async fn vehicle_command(
    State(state): State<Arc<MockState>>,
    Path((vin, command)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.record(format!("POST /vehicles/{}/{}", vin, command));
    if !state.session_valid(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let mut inner = state.inner.lock();
    if !inner.vehicles.iter().any(|(id, _)| *id == vin) {
        return not_found("Vehicle not found");
    }
    let params = serde_json::from_slice(&body).unwrap_or(Value::Null);
    inner.last_bodies.insert(command.clone(), params);

    if let Some(status) = inner.submit_failure {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (
            status,
            Json(json!({"errorLabel": "ServiceFailure", "errorDescription": "Submission rejected"})),
        )
            .into_response();
    }

    inner.next_service += 1;
    let id = format!("svc-{}", inner.next_service);
    let script: VecDeque<String> = inner.script.iter().cloned().collect();
    inner.services.insert(
        id.clone(),
        MockService {
            vin,
            command,
            script,
            applied: false,
        },
    );

    Json(json!({
        "service": format!("{}services/{}", inner.base_url, id),
        "status": "Queued",
        "customerServiceId": id,
        "serviceType": "RDL",
    }))
    .into_response()
}

async fn service_status(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    state.record(format!("GET /services/{}", id));
    if !state.session_valid(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let mut inner = state.inner.lock();
    let Some(service) = inner.services.get_mut(&id) else {
        return not_found("Service not found");
    };

    let status = if service.script.len() > 1 {
        service.script.pop_front().unwrap_or_default()
    } else {
        service.script.front().cloned().unwrap_or_default()
    };

    let mut effect = None;
    if status.eq_ignore_ascii_case("successful") && !service.applied {
        service.applied = true;
        effect = Some((service.vin.clone(), service.command.clone()));
    }

    if let Some((vin, command)) = effect {
        if let Some(patch) = inner.effects.get(&command).cloned() {
            if let Some((_, vehicle)) = inner.vehicles.iter_mut().find(|(v, _)| *v == vin) {
                merge(&mut vehicle.status, patch);
            }
        }
    }

    if status == "<garbage>" {
        return (StatusCode::OK, "this is not json").into_response();
    }

    Json(json!({
        "service": format!("{}services/{}", inner.base_url, id),
        "status": status,
        "customerServiceId": id,
    }))
    .into_response()
}

fn not_found(description: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"errorLabel": "NotFound", "errorDescription": description})),
    )
        .into_response()
}

// =============================================================================
// Test server
// =============================================================================

/// A test server that automatically shuts down when dropped
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    /// Serve an axum Router on an ephemeral local port
    pub async fn start(router: Router) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Base URL of the test server, with trailing slash
    pub fn base_url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Transport pointed at this server with short timeouts
    pub fn transport(&self) -> Result<Transport> {
        Transport::with_config(
            &self.base_url(),
            "test@example.com",
            "secret",
            Duration::from_secs(5),
            Duration::from_secs(2),
        )
    }

    /// Shutdown the server gracefully
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_patch() {
        let mut status = json!({"carLocked": false, "odometer": 10});
        merge(&mut status, json!({"carLocked": true}));
        assert_eq!(status, json!({"carLocked": true, "odometer": 10}));
    }

    #[tokio::test]
    async fn test_server_base_url() {
        let cloud = MockCloud::new();
        let server = cloud.serve().await.unwrap();
        assert!(server.base_url().starts_with("http://127.0.0.1:"));
        assert!(server.base_url().ends_with('/'));
        server.shutdown().await;
    }
}
