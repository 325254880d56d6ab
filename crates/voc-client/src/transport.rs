//! Authenticated HTTP transport for the VOC service

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE, SET_COOKIE};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use url::Url;
use voc_core::VocConfig;

use crate::error::{Result, TransportError};
use crate::types::*;

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default connection timeout
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed client identification headers expected by the service
const CLIENT_HEADERS: &[(&str, &str)] = &[
    ("X-Device-Id", "Device"),
    ("X-OS-Type", "Android"),
    ("X-Originator-Type", "App"),
    ("X-OS-Version", "22"),
];

/// Resource used to (re-)establish a session
const AUTH_RESOURCE: &str = "customeraccounts";

/// Join a sub-resource onto a vehicle or relation URL
///
/// ```
/// # use voc_client::join_url;
/// assert_eq!(join_url("https://h/vehicles/V1", "status"), "https://h/vehicles/V1/status");
/// assert_eq!(join_url("https://h/vehicles/V1/", "heater/start"), "https://h/vehicles/V1/heater/start");
/// ```
pub fn join_url(base: &str, sub: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        sub.trim_start_matches('/')
    )
}

#[derive(Debug, Default)]
struct SessionState {
    /// Bumped on every re-authentication attempt
    generation: u64,
    /// Session cookie captured from the last successful authentication
    cookie: Option<String>,
    /// Outcome of the last re-authentication attempt
    last_outcome: Option<TransportError>,
    /// Set once credentials have been rejected; every later call fails fast
    poisoned: bool,
}

/// HTTP transport holding the VOC session
///
/// Requests rejected with 401 trigger one shared re-authentication; callers
/// that hit the expired session concurrently wait on the same attempt and
/// observe its outcome, then retry their own request once.
#[derive(Debug)]
pub struct Transport {
    client: Client,
    base_url: Url,
    username: String,
    password: String,
    session: RwLock<SessionState>,
    refresh_gate: tokio::sync::Mutex<()>,
    reauth_count: AtomicU64,
}

impl Transport {
    /// Create a transport from the client configuration
    pub fn new(config: &VocConfig) -> Result<Self> {
        Self::with_config(
            &config.service_url(),
            &config.username,
            &config.password,
            config.timeout(),
            DEFAULT_CONNECT_TIMEOUT,
        )
    }

    /// Create a transport with default timeouts
    pub fn with_credentials(base_url: &str, username: &str, password: &str) -> Result<Self> {
        Self::with_config(
            base_url,
            username,
            password,
            DEFAULT_TIMEOUT,
            DEFAULT_CONNECT_TIMEOUT,
        )
    }

    /// Create a transport with custom timeouts
    pub fn with_config(
        base_url: &str,
        username: &str,
        password: &str,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in CLIENT_HEADERS {
            headers.insert(*name, HeaderValue::from_static(*value));
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .default_headers(headers)
            .build()?;

        let base_url = if base_url.ends_with('/') {
            Url::parse(base_url)?
        } else {
            Url::parse(&format!("{}/", base_url))?
        };
        debug!("User: <{}>", username);

        Ok(Self {
            client,
            base_url,
            username: username.to_string(),
            password: password.to_string(),
            session: RwLock::new(SessionState::default()),
            refresh_gate: tokio::sync::Mutex::new(()),
            reauth_count: AtomicU64::new(0),
        })
    }

    /// Get the service base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Number of re-authentication attempts made so far
    pub fn reauth_count(&self) -> u64 {
        self.reauth_count.load(Ordering::SeqCst)
    }

    /// Returns true once the credentials have been rejected
    pub fn is_poisoned(&self) -> bool {
        self.session.read().poisoned
    }

    // =========================================================================
    // Request primitive
    // =========================================================================

    /// Send a request and decode the JSON body
    ///
    /// `path` is resolved against the service URL unless it is already an
    /// absolute URL. An empty response body yields `Value::Null`.
    #[instrument(skip(self, body))]
    pub async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = self.resolve(path)?;

        let generation = {
            let session = self.session.read();
            if session.poisoned {
                return Err(poisoned_error(&session));
            }
            session.generation
        };

        let response = self.execute(method.clone(), url.clone(), body).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return self.handle_response(response).await;
        }

        debug!("Session rejected for {}, re-authenticating", url);
        self.reauthenticate(generation).await?;

        let response = self.execute(method, url, body).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Auth(
                "request rejected after re-authentication".to_string(),
            ));
        }
        self.handle_response(response).await
    }

    /// `GET` a resource
    pub async fn get(&self, path: &str) -> Result<Value> {
        self.send(Method::GET, path, None).await
    }

    /// `POST` a JSON body to a resource
    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(Method::POST, path, Some(body)).await
    }

    /// `GET` a resource and decode it into a typed value
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self.get(path).await?;
        serde_json::from_value(value).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    // =========================================================================
    // Customer API
    // =========================================================================

    /// Fetch the customer account with its vehicle relations
    #[instrument(skip(self))]
    pub async fn customer_account(&self) -> Result<CustomerAccount> {
        self.get_json(AUTH_RESOURCE).await
    }

    /// Fetch one account/vehicle relation
    #[instrument(skip(self))]
    pub async fn vehicle_relation(&self, url: &str) -> Result<VehicleRelation> {
        self.get_json(url).await
    }

    /// Fetch a sub-resource of a vehicle (`attributes`, `status`, `position`, `trips`)
    #[instrument(skip(self))]
    pub async fn vehicle_resource(&self, vehicle_url: &str, resource: &str) -> Result<Value> {
        self.get(&join_url(vehicle_url, resource)).await
    }

    /// Submit a command to a vehicle service
    #[instrument(skip(self, body))]
    pub async fn invoke_service(
        &self,
        vehicle_url: &str,
        service: &str,
        body: &Value,
    ) -> Result<ServiceResponse> {
        let value = self.post(&join_url(vehicle_url, service), body).await?;
        serde_json::from_value(value)
            .map_err(|e| TransportError::Protocol(format!("invalid service response: {}", e)))
    }

    /// Poll the status of a submitted command
    #[instrument(skip(self))]
    pub async fn service_status(&self, status_url: &str) -> Result<ServiceResponse> {
        let value = self.get(status_url).await?;
        serde_json::from_value(value)
            .map_err(|e| TransportError::Protocol(format!("invalid service status: {}", e)))
    }

    // =========================================================================
    // Session handling
    // =========================================================================

    /// Re-authenticate unless another caller already did so since
    /// `observed_generation` was read.
    async fn reauthenticate(&self, observed_generation: u64) -> Result<()> {
        let _gate = self.refresh_gate.lock().await;

        {
            let session = self.session.read();
            if session.poisoned {
                return Err(poisoned_error(&session));
            }
            if session.generation != observed_generation {
                debug!("Session already refreshed by another request");
                return match &session.last_outcome {
                    Some(err) => Err(err.clone()),
                    None => Ok(()),
                };
            }
        }

        self.reauth_count.fetch_add(1, Ordering::SeqCst);
        let outcome = self.login().await;

        let mut session = self.session.write();
        session.generation += 1;
        match outcome {
            Ok(cookie) => {
                info!("Session re-established");
                session.cookie = cookie;
                session.last_outcome = None;
                Ok(())
            }
            Err(err) => {
                if err.is_auth() {
                    warn!("Credentials rejected, session poisoned: {}", err);
                    session.poisoned = true;
                } else {
                    warn!("Re-authentication failed: {}", err);
                }
                session.last_outcome = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Authenticate with Basic credentials and capture the session cookie
    async fn login(&self) -> Result<Option<String>> {
        let url = self.base_url.join(AUTH_RESOURCE)?;
        let response = self
            .client
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TransportError::Auth(format!(
                "credentials rejected (HTTP {})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(self.extract_error(response).await);
        }

        let cookies: Vec<&str> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect();

        if cookies.is_empty() {
            Ok(None)
        } else {
            Ok(Some(cookies.join("; ")))
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn resolve(&self, path: &str) -> Result<Url> {
        match Url::parse(path) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Ok(self.base_url.join(path.trim_start_matches('/'))?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        debug!("{} {}", method, url);
        let mut request = self
            .client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password));

        let cookie = self.session.read().cookie.clone();
        if let Some(cookie) = cookie {
            request = request.header(COOKIE, cookie);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        Ok(request.send().await?)
    }

    /// Handle response and decode JSON
    async fn handle_response(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            return Err(self.extract_error(response).await);
        }

        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        let value: Value = serde_json::from_slice(&bytes)?;
        debug!("Received {}", value);
        Ok(value)
    }

    /// Extract error from failed response
    async fn extract_error(&self, response: reqwest::Response) -> TransportError {
        let status = response.status();
        let message = match response.json::<ErrorResponse>().await {
            Ok(err) => err.message().unwrap_or_else(|| format!("HTTP {}", status)),
            Err(_) => format!("HTTP {}", status),
        };
        TransportError::server_error(status.as_u16(), message)
    }
}

fn poisoned_error(session: &SessionState) -> TransportError {
    match &session.last_outcome {
        Some(err @ TransportError::Auth(_)) => err.clone(),
        _ => TransportError::Auth("session is no longer valid".to_string()),
    }
}
