use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Conditions, FAILED, ParametersFromSource, preserve_unknown_fields};

/// A provisioned instance of a broker's service class and plan.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceInstance",
    derive = "PartialEq",
    status = "ServiceInstanceStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Class",
        "type": "string",
        "jsonPath": ".spec.serviceClassName"
    }"#,
    printcolumn = r#"{
        "name":"Plan",
        "type": "string",
        "jsonPath": ".spec.planName"
    }"#,
    printcolumn = r#"{
        "name":"Ready",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status",
        "description": "Whether the instance was provisioned successfully."
    }"#
)]
pub struct ServiceInstanceSpec {
    /// Name of the ServiceClass to provision.
    #[serde(rename = "serviceClassName")]
    pub service_class_name: String,
    /// External name of the plan within the class.
    #[serde(rename = "planName")]
    pub plan_name: String,
    /// Inline parameters, must be a JSON object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub parameters: Option<serde_json::Value>,
    /// Additional parameters read from secrets.
    #[serde(rename = "parametersFrom", default, skip_serializing_if = "Vec::is_empty")]
    pub parameters_from: Vec<ParametersFromSource>,
    /// The identifier of this instance at the broker, immutable.
    #[serde(rename = "externalID")]
    pub external_id: String,
}

/// Kind of asynchronous broker operation in flight.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ServiceInstanceOperation {
    Provision,
    Deprovision,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct ServiceInstanceStatus {
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
    /// Whether an asynchronous broker operation is being polled.
    #[serde(rename = "asyncOpInProgress", default)]
    pub async_op_in_progress: bool,
    /// Operation key returned by the broker for the running operation.
    #[serde(rename = "lastOperation", skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<String>,
    #[serde(rename = "currentOperation", skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<ServiceInstanceOperation>,
    #[serde(rename = "operationStartTime", skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<DateTime<Utc>>,
    #[serde(rename = "dashboardURL", skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    /// Checksum of the spec last sent to the broker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ServiceInstance {
    pub fn status_mut(&mut self) -> &mut ServiceInstanceStatus {
        self.status.get_or_insert_with(Default::default)
    }

    pub fn is_async_op_in_progress(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.async_op_in_progress)
    }

    pub fn is_failed(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.is_true(FAILED))
    }

    pub fn checksum(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.checksum.as_deref())
    }

    pub fn conditions(&self) -> Option<&Conditions> {
        self.status.as_ref().map(|s| &s.conditions)
    }
}
