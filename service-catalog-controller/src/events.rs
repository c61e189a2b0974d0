use k8s_openapi::api::core::v1::ObjectReference;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Sink for events about reconciled objects.
pub trait EventRecorder: Send + Sync {
    fn event(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str);
}

/// Writes events to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogEventRecorder;

impl EventRecorder for LogEventRecorder {
    fn event(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        let kind = object.kind.as_deref().unwrap_or("");
        let name = object.name.as_deref().unwrap_or("");
        match (event_type, object.namespace.as_deref()) {
            (EventType::Normal, Some(ns)) => {
                info!("{} \"{}/{}\": {}: {}", kind, ns, name, reason, message)
            }
            (EventType::Normal, None) => info!("{} \"{}\": {}: {}", kind, name, reason, message),
            (EventType::Warning, Some(ns)) => {
                warn!("{} \"{}/{}\": {}: {}", kind, ns, name, reason, message)
            }
            (EventType::Warning, None) => warn!("{} \"{}\": {}: {}", kind, name, reason, message),
        }
    }
}
