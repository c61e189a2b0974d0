use schemars::{
    r#gen::SchemaGenerator,
    schema::{InstanceType, Schema, SchemaObject},
};
use serde::{Deserialize, Serialize};

mod binding;
mod broker;
mod catalog;
pub mod checksum;
mod condition;
mod instance;

pub use binding::*;
pub use broker::*;
pub use catalog::*;
pub use condition::*;
pub use instance::*;

use schemars::JsonSchema;

/// Reference to a single key of a Secret in the namespace of the referencing object.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct SecretKeyReference {
    /// The name of the Secret.
    pub name: String,
    /// The key within the Secret holding a JSON object.
    pub key: String,
}

/// Source of additional parameters sent to the broker.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct ParametersFromSource {
    #[serde(rename = "secretKeyRef", skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeyReference>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
pub struct LocalObjectReference {
    pub name: String,
}

/// Schema for free-form JSON fields (parameters, broker metadata).
pub(crate) fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut obj = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_from() {
        let p = ParametersFromSource {
            secret_key_ref: Some(SecretKeyReference {
                name: "creds".to_string(),
                key: "params".to_string(),
            }),
        };
        assert_eq!(
            r#"{"secretKeyRef":{"name":"creds","key":"params"}}"#,
            serde_json::to_string(&p).unwrap()
        );
        let empty: ParametersFromSource = serde_json::from_str("{}").unwrap();
        assert!(empty.secret_key_ref.is_none());
    }
}
