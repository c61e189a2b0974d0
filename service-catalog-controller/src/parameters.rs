use k8s_openapi::api::core::v1::Secret;
use serde_json::{Map, Value};
use service_catalog_apis::ParametersFromSource;

use crate::{errors::ControllerError, store::Store};

/// Merge the inline parameters with the ones read from secrets.
///
/// Every source must hold a JSON object and a parameter name may only be
/// given once across all sources. Returns `None` if there are no sources.
pub(crate) async fn build_parameters(
    secrets: &dyn Store<Secret>,
    namespace: &str,
    parameters: Option<&Value>,
    parameters_from: &[ParametersFromSource],
) -> Result<Option<Map<String, Value>>, ControllerError> {
    if parameters.is_none() && parameters_from.is_empty() {
        return Ok(None);
    }
    let mut merged = Map::new();
    for source in parameters_from {
        if let Some(secret_key_ref) = &source.secret_key_ref {
            let data = fetch_secret_key(
                secrets,
                namespace,
                &secret_key_ref.name,
                &secret_key_ref.key,
            )
            .await?;
            let params = to_object(
                serde_json::from_slice(&data).map_err(|e| {
                    ControllerError::Parameters(format!(
                        "failed to unmarshal parameters from secret {}/{} key {}: {}",
                        namespace, secret_key_ref.name, secret_key_ref.key, e
                    ))
                })?,
                &format!("secret {}/{} key {}", namespace, secret_key_ref.name, secret_key_ref.key),
            )?;
            merge(&mut merged, params)?;
        }
    }
    if let Some(parameters) = parameters {
        merge(&mut merged, to_object(parameters.clone(), "inline parameters")?)?;
    }
    Ok(Some(merged))
}

fn to_object(value: Value, source: &str) -> Result<Map<String, Value>, ControllerError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(ControllerError::Parameters(format!(
            "{} must be a JSON object",
            source
        ))),
    }
}

fn merge(into: &mut Map<String, Value>, from: Map<String, Value>) -> Result<(), ControllerError> {
    for (k, v) in from {
        if into.contains_key(&k) {
            return Err(ControllerError::Parameters(format!(
                "the parameter {} is specified more than once",
                k
            )));
        }
        into.insert(k, v);
    }
    Ok(())
}

/// Value of `key` in the secret `namespace/name`.
pub(crate) async fn fetch_secret_key(
    secrets: &dyn Store<Secret>,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<Vec<u8>, ControllerError> {
    let secret = secrets.get(Some(namespace), name).await.map_err(|e| {
        if e.is_not_found() {
            ControllerError::Reference(format!("secret {}/{} not found", namespace, name))
        } else {
            e.into()
        }
    })?;
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|v| v.0.clone())
        .ok_or_else(|| {
            ControllerError::Reference(format!(
                "secret {}/{} has no key {}",
                namespace, name, key
            ))
        })
}
