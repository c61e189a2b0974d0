use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::preserve_unknown_fields;

/// A service offered by a broker, created from the broker's catalog.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceClass",
    derive = "PartialEq",
    status = "ServiceClassStatus",
    printcolumn = r#"{
        "name":"External-Name",
        "type": "string",
        "jsonPath": ".spec.externalName"
    }"#,
    printcolumn = r#"{
        "name":"Broker",
        "type": "string",
        "jsonPath": ".spec.brokerName"
    }"#
)]
pub struct ServiceClassSpec {
    /// Name of the ServiceBroker owning this class.
    #[serde(rename = "brokerName")]
    pub broker_name: String,
    /// The broker's identifier for this service, immutable.
    #[serde(rename = "externalID")]
    pub external_id: String,
    #[serde(rename = "externalName")]
    pub external_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bindable: bool,
    #[serde(rename = "planUpdatable", default)]
    pub plan_updatable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    #[serde(
        rename = "externalMetadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub external_metadata: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct ServiceClassStatus {
    /// Set once the owning broker no longer lists this class.
    #[serde(rename = "removedFromBrokerCatalog", default)]
    pub removed_from_broker_catalog: bool,
}

/// A plan of a [`ServiceClass`], named `<class name>.<plan external name>`.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServicePlan",
    derive = "PartialEq",
    status = "ServicePlanStatus",
    printcolumn = r#"{
        "name":"External-Name",
        "type": "string",
        "jsonPath": ".spec.externalName"
    }"#,
    printcolumn = r#"{
        "name":"Class",
        "type": "string",
        "jsonPath": ".spec.serviceClassName"
    }"#
)]
pub struct ServicePlanSpec {
    #[serde(rename = "brokerName")]
    pub broker_name: String,
    /// Name of the ServiceClass this plan belongs to.
    #[serde(rename = "serviceClassName")]
    pub service_class_name: String,
    #[serde(rename = "externalID")]
    pub external_id: String,
    #[serde(rename = "externalName")]
    pub external_name: String,
    #[serde(default)]
    pub description: String,
    /// Overrides the bindable flag of the class if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bindable: Option<bool>,
    #[serde(default)]
    pub free: bool,
    #[serde(
        rename = "externalMetadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub external_metadata: Option<serde_json::Value>,
    #[serde(
        rename = "instanceCreateParameterSchema",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub instance_create_parameter_schema: Option<serde_json::Value>,
    #[serde(
        rename = "instanceUpdateParameterSchema",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub instance_update_parameter_schema: Option<serde_json::Value>,
    #[serde(
        rename = "serviceBindingCreateParameterSchema",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub service_binding_create_parameter_schema: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct ServicePlanStatus {
    #[serde(rename = "removedFromBrokerCatalog", default)]
    pub removed_from_broker_catalog: bool,
}

/// Object name of the plan `plan_external_name` of class `class_name`.
pub fn service_plan_name(class_name: &str, plan_external_name: &str) -> String {
    format!("{}.{}", class_name, plan_external_name)
}

impl ServiceClass {
    pub fn is_removed_from_broker_catalog(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.removed_from_broker_catalog)
    }
}

impl ServicePlan {
    pub fn is_removed_from_broker_catalog(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.removed_from_broker_catalog)
    }

    /// A plan's own `bindable` flag wins over the class's.
    pub fn is_bindable(&self, class: &ServiceClass) -> bool {
        self.spec.bindable.unwrap_or(class.spec.bindable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(bindable: bool) -> ServiceClass {
        ServiceClass::new(
            "class",
            ServiceClassSpec {
                broker_name: "b".to_string(),
                external_id: "c-id".to_string(),
                external_name: "class".to_string(),
                description: String::new(),
                bindable,
                plan_updatable: false,
                tags: vec![],
                requires: vec![],
                external_metadata: None,
            },
        )
    }

    fn plan(bindable: Option<bool>) -> ServicePlan {
        ServicePlan::new(
            &service_plan_name("class", "small"),
            ServicePlanSpec {
                broker_name: "b".to_string(),
                service_class_name: "class".to_string(),
                external_id: "p-id".to_string(),
                external_name: "small".to_string(),
                description: String::new(),
                bindable,
                free: true,
                external_metadata: None,
                instance_create_parameter_schema: None,
                instance_update_parameter_schema: None,
                service_binding_create_parameter_schema: None,
            },
        )
    }

    #[test]
    fn plan_bindable_overrides_class() {
        assert!(plan(None).is_bindable(&class(true)));
        assert!(!plan(None).is_bindable(&class(false)));
        assert!(!plan(Some(false)).is_bindable(&class(true)));
        assert!(plan(Some(true)).is_bindable(&class(false)));
    }

    #[test]
    fn plan_name() {
        assert_eq!(Some("class.small".to_string()), plan(None).metadata.name);
    }

    #[test]
    fn removed_from_catalog_defaults_to_false() {
        let mut c = class(true);
        assert!(!c.is_removed_from_broker_catalog());
        c.status = Some(ServiceClassStatus {
            removed_from_broker_catalog: true,
        });
        assert!(c.is_removed_from_broker_catalog());
    }
}
