//! Stable checksums over the spec fields which are sent to the broker.
//!
//! The checksum of the spec last sent to the broker is stored in the status,
//! reconciling an object whose checksum still matches is a no-op.

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::{ServiceBindingSpec, ServiceInstanceSpec};

pub fn instance_spec_checksum(spec: &ServiceInstanceSpec) -> String {
    checksum(&json!({
        "serviceClassName": spec.service_class_name,
        "planName": spec.plan_name,
        "parameters": spec.parameters,
        "parametersFrom": spec.parameters_from,
        "externalID": spec.external_id,
    }))
}

pub fn binding_spec_checksum(spec: &ServiceBindingSpec) -> String {
    checksum(&json!({
        "instanceRef": spec.instance_ref,
        "parameters": spec.parameters,
        "parametersFrom": spec.parameters_from,
        "secretName": spec.secret_name,
        "externalID": spec.external_id,
    }))
}

/// Hex encoded SHA-256 of the canonical (recursively key-sorted) JSON text.
pub fn checksum(value: &Value) -> String {
    let text = canonical(value).to_string();
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for k in keys {
                sorted.insert(k.clone(), canonical(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        v => v.clone(),
    }
}
