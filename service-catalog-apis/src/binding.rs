use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Conditions, LocalObjectReference, ParametersFromSource, preserve_unknown_fields};

/// Credentials for a [`crate::ServiceInstance`], injected into a Secret.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceBinding",
    derive = "PartialEq",
    status = "ServiceBindingStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Instance",
        "type": "string",
        "jsonPath": ".spec.instanceRef.name"
    }"#,
    printcolumn = r#"{
        "name":"Secret",
        "type": "string",
        "jsonPath": ".spec.secretName"
    }"#,
    printcolumn = r#"{
        "name":"Ready",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status",
        "description": "Whether the credentials were injected successfully."
    }"#
)]
pub struct ServiceBindingSpec {
    /// The ServiceInstance in the same namespace to bind to.
    #[serde(rename = "instanceRef")]
    pub instance_ref: LocalObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub parameters: Option<serde_json::Value>,
    #[serde(rename = "parametersFrom", default, skip_serializing_if = "Vec::is_empty")]
    pub parameters_from: Vec<ParametersFromSource>,
    /// Name of the Secret receiving the credentials, defaults to the binding's name.
    #[serde(rename = "secretName", default, skip_serializing_if = "String::is_empty")]
    pub secret_name: String,
    #[serde(rename = "externalID")]
    pub external_id: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct ServiceBindingStatus {
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
    /// Checksum of the spec last sent to the broker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Set once the broker accepted a Bind, cleared after Unbind.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bound: bool,
}

impl ServiceBinding {
    pub fn status_mut(&mut self) -> &mut ServiceBindingStatus {
        self.status.get_or_insert_with(Default::default)
    }

    pub fn checksum(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.checksum.as_deref())
    }

    pub fn conditions(&self) -> Option<&Conditions> {
        self.status.as_ref().map(|s| &s.conditions)
    }

    /// Whether the binding may exist at the broker and has to be unbound.
    pub fn is_bound(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.bound || s.checksum.is_some())
    }

    pub fn secret_name(&self) -> String {
        if self.spec.secret_name.is_empty() {
            self.metadata.name.clone().unwrap_or_default()
        } else {
            self.spec.secret_name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(secret_name: &str) -> ServiceBinding {
        ServiceBinding::new(
            "creds",
            ServiceBindingSpec {
                instance_ref: LocalObjectReference {
                    name: "db".to_string(),
                },
                parameters: None,
                parameters_from: vec![],
                secret_name: secret_name.to_string(),
                external_id: "b-id".to_string(),
            },
        )
    }

    #[test]
    fn bound_after_bind_or_checksum() {
        let mut b = binding("");
        assert!(!b.is_bound());
        b.status_mut().bound = true;
        assert!(b.is_bound());
        let mut b = binding("");
        b.status_mut().checksum = Some("abc".to_string());
        assert!(b.is_bound());
    }

    #[test]
    fn secret_name_defaults_to_binding_name() {
        assert_eq!("creds", binding("").secret_name());
        assert_eq!("other", binding("other").secret_name());
    }

    #[test]
    fn spec_serialization() {
        assert_eq!(
            r#"{"instanceRef":{"name":"db"},"secretName":"s","externalID":"b-id"}"#,
            serde_json::to_string(&binding("s").spec).unwrap()
        );
    }
}
