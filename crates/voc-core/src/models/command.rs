//! Remote command kinds and invocation statuses

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::vehicle::VehicleId;

/// Default engine runtime in minutes for remote start
pub const DEFAULT_ENGINE_RUNTIME: u32 = 15;

/// A command that can be issued to a vehicle
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Lock,
    Unlock,
    HeaterStart,
    HeaterStop,
    EngineStart,
    EngineStop,
    HonkAndBlink,
    /// Arbitrary named service under the vehicle resource
    Call(String),
}

impl CommandKind {
    /// Build a command from a method name, mapping well-known names onto
    /// their dedicated variants.
    ///
    /// ```
    /// # use voc_core::CommandKind;
    /// assert_eq!(CommandKind::call("lock"), CommandKind::Lock);
    /// assert_eq!(CommandKind::call("start_heater"), CommandKind::HeaterStart);
    /// assert_eq!(CommandKind::call("preclimatization/start"),
    ///            CommandKind::Call("preclimatization/start".into()));
    /// ```
    pub fn call(name: &str) -> Self {
        match name.trim_matches('/') {
            "lock" => Self::Lock,
            "unlock" => Self::Unlock,
            "heater/start" | "start_heater" | "heater_start" => Self::HeaterStart,
            "heater/stop" | "stop_heater" | "heater_stop" => Self::HeaterStop,
            "engine/start" | "start_engine" | "engine_start" => Self::EngineStart,
            "engine/stop" | "stop_engine" | "engine_stop" => Self::EngineStop,
            "honkAndBlink" | "honk_and_blink" | "honk-and-blink" => Self::HonkAndBlink,
            other => Self::Call(other.to_string()),
        }
    }

    /// Service path under the vehicle URL
    pub fn service_path(&self) -> &str {
        match self {
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::HeaterStart => "heater/start",
            Self::HeaterStop => "heater/stop",
            Self::EngineStart => "engine/start",
            Self::EngineStop => "engine/stop",
            Self::HonkAndBlink => "honkAndBlink",
            Self::Call(name) => name,
        }
    }

    /// Request body used when the caller supplies no parameters
    pub fn default_params(&self) -> Value {
        match self {
            Self::EngineStart => json!({ "runtime": DEFAULT_ENGINE_RUNTIME }),
            _ => json!({}),
        }
    }

    /// Short name used in logs and outcome messages
    pub fn name(&self) -> &str {
        match self {
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::HeaterStart => "heater_start",
            Self::HeaterStop => "heater_stop",
            Self::EngineStart => "engine_start",
            Self::EngineStop => "engine_stop",
            Self::HonkAndBlink => "honk_and_blink",
            Self::Call(name) => name,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle status of a command invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Queued,
    Running,
    Successful,
    Failed,
    TimedOut,
    Error,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    /// Map a status string reported by the service, ignoring case.
    ///
    /// Returns `None` for statuses that are not recognised.
    pub fn from_service(status: &str) -> Option<Self> {
        match status.trim().to_ascii_lowercase().as_str() {
            "successful" => Some(Self::Successful),
            "failed" => Some(Self::Failed),
            "pending" | "queued" | "started" | "messagedelivered" | "running" | "sent"
            | "delivered" => Some(Self::Running),
            _ => None,
        }
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Final outcome of an invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TerminalStatus {
    Successful,
    Failed(Option<String>),
    TimedOut,
    Error(String),
}

impl TerminalStatus {
    pub fn status(&self) -> InvocationStatus {
        match self {
            Self::Successful => InvocationStatus::Successful,
            Self::Failed(_) => InvocationStatus::Failed,
            Self::TimedOut => InvocationStatus::TimedOut,
            Self::Error(_) => InvocationStatus::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Successful)
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Failed(detail) => detail.as_deref(),
            Self::Error(detail) => Some(detail),
            _ => None,
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{} ({})", self.status(), detail),
            None => write!(f, "{}", self.status()),
        }
    }
}

/// Snapshot of one tracked invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationInfo {
    pub vehicle_id: VehicleId,
    pub kind: CommandKind,
    /// Remote invocation id (`customerServiceId`)
    pub remote_id: String,
    /// Status-poll URL returned by the service
    pub status_url: String,
    pub status: InvocationStatus,
    pub submitted_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub detail: Option<String>,
}
