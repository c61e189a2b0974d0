use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::{Resource, ResourceExt};
use service_catalog_apis::{
    ServiceBinding, ServiceBroker, ServiceClass, ServiceInstance, ServicePlan,
};

use crate::errors::StoreError;

/// Field paths understood by [`Selector`]s.
pub const FIELD_BROKER_NAME: &str = "spec.brokerName";
pub const FIELD_SERVICE_CLASS_NAME: &str = "spec.serviceClassName";
pub const FIELD_PLAN_NAME: &str = "spec.planName";
pub const FIELD_INSTANCE_REF_NAME: &str = "spec.instanceRef.name";

/// Typed access to the declarative resource store for one kind.
///
/// `update` writes metadata and spec, `update_status` writes the status only.
/// Both fail with [`StoreError::Conflict`] if the object's `resourceVersion`
/// is stale.
#[async_trait]
pub trait Store<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K, StoreError>;
    async fn list(&self, selector: &Selector) -> Result<Vec<K>, StoreError>;
    async fn create(&self, obj: &K) -> Result<K, StoreError>;
    async fn update(&self, obj: &K) -> Result<K, StoreError>;
    async fn update_status(&self, obj: &K) -> Result<K, StoreError>;
    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), StoreError>;
}

/// Objects which can be filtered by field selectors.
pub trait FieldSelectable {
    /// Value of the field at `path`, `None` if the kind has no such field.
    fn field(&self, path: &str) -> Option<String>;
}

/// Namespace and equality field selector used by [`Store::list`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Selector {
    pub namespace: Option<String>,
    pub fields: Vec<(String, String)>,
}

impl Selector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_namespace(namespace: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            fields: vec![],
        }
    }

    pub fn with_field(mut self, path: &str, value: &str) -> Self {
        self.fields.push((path.to_string(), value.to_string()));
        self
    }

    pub fn matches<K>(&self, obj: &K) -> bool
    where
        K: Resource + FieldSelectable,
    {
        if let Some(ns) = &self.namespace {
            if obj.meta().namespace.as_deref() != Some(ns.as_str()) {
                return false;
            }
        }
        self.fields
            .iter()
            .all(|(path, value)| obj.field(path).as_deref() == Some(value.as_str()))
    }
}

/// Queue key of an object, `namespace/name` or just `name` for cluster scoped objects.
pub fn object_key<K: Resource>(obj: &K) -> String {
    let name = obj.meta().name.as_deref().unwrap_or("");
    match obj.meta().namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Inverse of [`object_key`].
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}

fn metadata_field<K: Resource>(obj: &K, path: &str) -> Option<String> {
    match path {
        "metadata.name" => Some(obj.name_any()),
        "metadata.namespace" => obj.namespace(),
        _ => None,
    }
}

impl FieldSelectable for ServiceBroker {
    fn field(&self, path: &str) -> Option<String> {
        metadata_field(self, path)
    }
}

impl FieldSelectable for ServiceClass {
    fn field(&self, path: &str) -> Option<String> {
        match path {
            FIELD_BROKER_NAME => Some(self.spec.broker_name.clone()),
            _ => metadata_field(self, path),
        }
    }
}

impl FieldSelectable for ServicePlan {
    fn field(&self, path: &str) -> Option<String> {
        match path {
            FIELD_BROKER_NAME => Some(self.spec.broker_name.clone()),
            FIELD_SERVICE_CLASS_NAME => Some(self.spec.service_class_name.clone()),
            _ => metadata_field(self, path),
        }
    }
}

impl FieldSelectable for ServiceInstance {
    fn field(&self, path: &str) -> Option<String> {
        match path {
            FIELD_SERVICE_CLASS_NAME => Some(self.spec.service_class_name.clone()),
            FIELD_PLAN_NAME => Some(self.spec.plan_name.clone()),
            _ => metadata_field(self, path),
        }
    }
}

impl FieldSelectable for ServiceBinding {
    fn field(&self, path: &str) -> Option<String> {
        match path {
            FIELD_INSTANCE_REF_NAME => Some(self.spec.instance_ref.name.clone()),
            _ => metadata_field(self, path),
        }
    }
}

impl FieldSelectable for Secret {
    fn field(&self, path: &str) -> Option<String> {
        metadata_field(self, path)
    }
}

impl FieldSelectable for Namespace {
    fn field(&self, path: &str) -> Option<String> {
        metadata_field(self, path)
    }
}
