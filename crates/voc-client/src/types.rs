//! Wire types for the VOC customer API

use serde::{Deserialize, Serialize};
use voc_core::InvocationStatus;

/// `GET customeraccounts`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerAccount {
    #[serde(default)]
    pub username: Option<String>,
    /// URLs of the account/vehicle relations
    #[serde(default)]
    pub account_vehicle_relations: Vec<String>,
}

/// `GET {relation}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleRelation {
    /// Vehicle resource URL
    pub vehicle: String,
    /// VIN
    pub vehicle_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Response to a command submission or a status poll
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse {
    /// Status-poll URL
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub customer_service_id: Option<String>,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl ServiceResponse {
    /// Remote invocation id, falling back to the last segment of the status URL
    pub fn invocation_id(&self) -> Option<String> {
        self.customer_service_id.clone().or_else(|| {
            self.service.as_deref().and_then(|url| {
                url.trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .filter(|s| !s.is_empty())
                    .map(String::from)
            })
        })
    }

    /// Reported status mapped onto the invocation lifecycle
    pub fn invocation_status(&self) -> Option<InvocationStatus> {
        self.status.as_deref().and_then(InvocationStatus::from_service)
    }
}

/// Error body returned by the service
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ErrorResponse {
    #[serde(default)]
    pub error_label: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl ErrorResponse {
    pub(crate) fn message(self) -> Option<String> {
        match (self.error_label, self.error_description) {
            (Some(label), Some(desc)) => Some(format!("{}: {}", label, desc)),
            (Some(msg), None) | (None, Some(msg)) => Some(msg),
            (None, None) => None,
        }
    }
}
