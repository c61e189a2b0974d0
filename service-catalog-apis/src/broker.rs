use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Conditions;

/// A service broker, the external provider of the services in its catalog.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceBroker",
    derive = "PartialEq",
    status = "ServiceBrokerStatus",
    printcolumn = r#"{
        "name":"URL",
        "type": "string",
        "jsonPath": ".spec.url"
    }"#,
    printcolumn = r#"{
        "name":"Ready",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status",
        "description": "Whether the broker catalog was fetched successfully."
    }"#
)]
pub struct ServiceBrokerSpec {
    /// The URL of the broker API.
    pub url: String,
    /// Credentials used to talk to the broker.
    #[serde(rename = "authInfo", skip_serializing_if = "Option::is_none")]
    pub auth_info: Option<ServiceBrokerAuthInfo>,
    /// How the catalog is refreshed, defaults to `Duration`.
    #[serde(rename = "relistBehavior", default)]
    pub relist_behavior: RelistBehavior,
    /// Interval between catalog refreshes if `relistBehavior` is `Duration`.
    #[serde(
        rename = "relistDurationSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub relist_duration_seconds: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default, JsonSchema)]
pub enum RelistBehavior {
    /// Relist periodically, every `relistDurationSeconds`.
    #[default]
    Duration,
    /// Only relist when the broker spec changes.
    Manual,
}

/// Exactly one of `basic` and `bearer` is expected to be set.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct ServiceBrokerAuthInfo {
    /// Secret with `username` and `password` keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basic: Option<AuthSecretReference>,
    /// Secret with a `token` key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer: Option<AuthSecretReference>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct AuthSecretReference {
    #[serde(rename = "secretRef")]
    pub secret_ref: NamespacedSecretReference,
}

/// Brokers are cluster scoped, so their secret references carry a namespace.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct NamespacedSecretReference {
    pub namespace: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct ServiceBrokerStatus {
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
    /// The `metadata.generation` of the last successfully reconciled spec.
    #[serde(rename = "reconciledGeneration", default)]
    pub reconciled_generation: i64,
    /// Start of the current (failing) catalog fetch attempt series.
    #[serde(rename = "operationStartTime", skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<DateTime<Utc>>,
    /// When the catalog was last fetched successfully.
    #[serde(
        rename = "lastCatalogRetrievalTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_catalog_retrieval_time: Option<DateTime<Utc>>,
}

impl ServiceBroker {
    pub fn status_mut(&mut self) -> &mut ServiceBrokerStatus {
        self.status.get_or_insert_with(Default::default)
    }

    pub fn conditions(&self) -> Option<&Conditions> {
        self.status.as_ref().map(|s| &s.conditions)
    }
}
