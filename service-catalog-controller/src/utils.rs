use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;

pub(crate) fn metric_name(name: &str) -> String {
    format!("service_catalog_{}", name)
}

/// Whether `secret` has a controller owner reference to the object with `uid`.
pub(crate) fn is_controlled_by(secret: &Secret, uid: &str) -> bool {
    secret
        .metadata
        .owner_references
        .iter()
        .flatten()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

/// Whether more than `retry_duration` has passed since `start`.
pub(crate) fn retry_window_elapsed(
    start: DateTime<Utc>,
    now: DateTime<Utc>,
    retry_duration: Duration,
) -> bool {
    chrono::Duration::from_std(retry_duration)
        .map(|d| now >= start + d)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    #[test]
    fn controller_reference() {
        let owner = |controller| OwnerReference {
            api_version: "servicecatalog.k8s.io/v1beta1".to_string(),
            kind: "ServiceBinding".to_string(),
            name: "b".to_string(),
            uid: "uid-1".to_string(),
            controller,
            block_owner_deletion: None,
        };
        let secret = |refs| Secret {
            metadata: ObjectMeta {
                owner_references: refs,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(is_controlled_by(&secret(Some(vec![owner(Some(true))])), "uid-1"));
        assert!(!is_controlled_by(&secret(Some(vec![owner(Some(true))])), "uid-2"));
        assert!(!is_controlled_by(&secret(Some(vec![owner(None)])), "uid-1"));
        assert!(!is_controlled_by(&secret(None), "uid-1"));
    }

    #[test]
    fn retry_window() {
        let start = Utc::now();
        let d = Duration::from_secs(60);
        assert!(!retry_window_elapsed(start, start, d));
        assert!(retry_window_elapsed(start, start + chrono::Duration::seconds(61), d));
    }
}
