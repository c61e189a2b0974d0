//! Already-parsed view of the broker API used by the reconcilers.
//!
//! The HTTP wire protocol lives behind [`BrokerClient`], a [`BrokerClientFactory`]
//! creates one client per broker from its URL and resolved credentials.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    /// Structured error response returned by the broker.
    #[error("Status: {status_code}; ErrorMessage: {error_message:?}; Description: {description:?}")]
    Http {
        status_code: u16,
        error_message: Option<String>,
        description: Option<String>,
    },
    /// Connection, timeout or decoding failure.
    #[error("{0}")]
    Transport(String),
}

impl BrokerError {
    pub fn is_http(&self) -> bool {
        matches!(self, BrokerError::Http { .. })
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, BrokerError::Http { status_code, .. } if *status_code == 410)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AuthConfig {
    Basic { username: String, password: String },
    Bearer { token: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfiguration {
    /// Name of the ServiceBroker, used for logging.
    pub name: String,
    pub url: String,
    pub auth_config: Option<AuthConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct CatalogResponse {
    pub services: Vec<Service>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub plan_updatable: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub plans: Vec<Plan>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub free: Option<bool>,
    #[serde(default)]
    pub bindable: Option<bool>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub schemas: Option<Schemas>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Schemas {
    #[serde(default)]
    pub instance_create: Option<Value>,
    #[serde(default)]
    pub instance_update: Option<Value>,
    #[serde(default)]
    pub binding_create: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ProvisionRequest {
    pub instance_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    pub parameters: Option<Map<String, Value>>,
    pub context: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ProvisionResponse {
    pub is_async: bool,
    pub dashboard_url: Option<String>,
    pub operation_key: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DeprovisionRequest {
    pub instance_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct DeprovisionResponse {
    pub is_async: bool,
    pub operation_key: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LastOperationRequest {
    pub instance_id: String,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation_key: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LastOperationState {
    InProgress,
    Succeeded,
    Failed,
    /// Anything else is a protocol violation.
    Unknown(String),
}

impl From<&str> for LastOperationState {
    fn from(s: &str) -> Self {
        match s {
            "in progress" => Self::InProgress,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            other => Self::Unknown(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LastOperationResponse {
    pub state: LastOperationState,
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BindRequest {
    pub binding_id: String,
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub parameters: Option<Map<String, Value>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct BindResponse {
    pub credentials: Option<Map<String, Value>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UnbindRequest {
    pub binding_id: String,
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn get_catalog(&self) -> Result<CatalogResponse, BrokerError>;
    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, BrokerError>;
    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, BrokerError>;
    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError>;
    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, BrokerError>;
    async fn unbind(&self, request: &UnbindRequest) -> Result<(), BrokerError>;
}

/// Creates a [`BrokerClient`] for a broker's URL and credentials.
pub trait BrokerClientFactory: Send + Sync {
    fn create(&self, config: &ClientConfiguration) -> Result<Arc<dyn BrokerClient>, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_operation_state() {
        assert_eq!(LastOperationState::InProgress, "in progress".into());
        assert_eq!(LastOperationState::Succeeded, "succeeded".into());
        assert_eq!(LastOperationState::Failed, "failed".into());
        assert_eq!(
            LastOperationState::Unknown("done".to_string()),
            "done".into()
        );
    }

    #[test]
    fn gone() {
        let gone = BrokerError::Http {
            status_code: 410,
            error_message: None,
            description: None,
        };
        assert!(gone.is_http());
        assert!(gone.is_gone());
        let transport = BrokerError::Transport("connection refused".to_string());
        assert!(!transport.is_http());
        assert!(!transport.is_gone());
    }

    #[test]
    fn catalog_defaults() {
        let catalog: CatalogResponse = serde_json::from_str(
            r#"{"services":[{"id":"s1","name":"mysql","plans":[{"id":"p1","name":"small"}]}]}"#,
        )
        .unwrap();
        let service = &catalog.services[0];
        assert!(!service.bindable);
        assert_eq!(None, service.plans[0].bindable);
    }
}
