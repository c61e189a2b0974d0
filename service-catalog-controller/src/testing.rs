//! In-memory collaborators for reconciler tests.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use k8s_openapi::{
    ByteString,
    api::core::v1::{Namespace, Secret},
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
};
use kube::Resource;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use service_catalog_apis::{
    ConditionStatus, LocalObjectReference, READY, RelistBehavior, ServiceBinding,
    ServiceBindingSpec, ServiceBroker, ServiceBrokerSpec, ServiceClass, ServiceClassSpec,
    ServiceInstance, ServiceInstanceSpec, ServicePlan, ServicePlanSpec,
    checksum::instance_spec_checksum, service_plan_name,
};

use crate::{
    FINALIZER,
    brokerapi::*,
    config::ControllerConfig,
    controller::{Controller, ResourceKind, Stores},
    errors::{ControllerError, StoreError},
    events::{EventRecorder, EventType},
    store::{FieldSelectable, Selector, Store, object_key},
};

pub(crate) const BROKER_NAME: &str = "test-broker";
pub(crate) const BROKER_URL: &str = "https://broker.example.com";
pub(crate) const CLASS_NAME: &str = "test-service";
pub(crate) const CLASS_EXTERNAL_ID: &str = "12345";
pub(crate) const PLAN_NAME: &str = "test-plan";
pub(crate) const PLAN_EXTERNAL_ID: &str = "34567";
pub(crate) const NAMESPACE: &str = "test-ns";
pub(crate) const NAMESPACE_UID: &str = "test-ns-uid";
pub(crate) const INSTANCE_NAME: &str = "test-instance";
pub(crate) const INSTANCE_EXTERNAL_ID: &str = "9737b6ed-ca95-4439-8219-c53fcad118ab";
pub(crate) const BINDING_NAME: &str = "test-binding";
pub(crate) const BINDING_EXTERNAL_ID: &str = "b041db94-a5a0-41a2-87ae-1025ba760918";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Verb {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

struct FakeState<K> {
    objects: BTreeMap<String, K>,
    verbs: Vec<Verb>,
    failures: Vec<(Verb, StoreError)>,
    version: u64,
}

/// Store with optimistic concurrency and deletion by finalizers.
pub(crate) struct FakeStore<K> {
    state: Mutex<FakeState<K>>,
}

fn store_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// `obj` with the status of `from`.
fn with_status_of<K: Serialize + DeserializeOwned>(obj: &K, from: &K) -> K {
    let mut value = serde_json::to_value(obj).unwrap();
    let status = serde_json::to_value(from).unwrap().get("status").cloned();
    let map = value.as_object_mut().unwrap();
    match status {
        Some(status) => map.insert("status".to_string(), status),
        None => map.remove("status"),
    };
    serde_json::from_value(value).unwrap()
}

pub(crate) fn mark_deleted(meta: &mut ObjectMeta) {
    let time: Time = serde_json::from_value(json!("2024-01-01T00:00:00Z")).unwrap();
    meta.deletion_timestamp = Some(time);
}

impl<K> FakeStore<K>
where
    K: Resource<DynamicType = ()> + Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                objects: BTreeMap::new(),
                verbs: vec![],
                failures: vec![],
                version: 0,
            }),
        }
    }

    /// Seed an object without recording a write.
    pub(crate) fn insert(&self, mut obj: K) {
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        let meta = obj.meta_mut();
        meta.resource_version = Some(state.version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", meta.name.as_deref().unwrap_or_default()));
        }
        state.objects.insert(object_key(&obj), obj);
    }

    pub(crate) fn object(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let state = self.state.lock().unwrap();
        state.objects.get(&store_key(namespace, name)).cloned()
    }

    pub(crate) fn verbs(&self) -> Vec<Verb> {
        self.state.lock().unwrap().verbs.clone()
    }

    pub(crate) fn writes(&self) -> Vec<Verb> {
        self.verbs()
            .into_iter()
            .filter(|v| !matches!(v, Verb::Get | Verb::List))
            .collect()
    }

    /// Make the next call with `verb` fail with `error`.
    pub(crate) fn fail_next(&self, verb: Verb, error: StoreError) {
        self.state.lock().unwrap().failures.push((verb, error));
    }

    fn record(&self, verb: Verb) -> Result<std::sync::MutexGuard<'_, FakeState<K>>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.verbs.push(verb);
        if let Some(pos) = state.failures.iter().position(|(v, _)| *v == verb) {
            return Err(state.failures.remove(pos).1);
        }
        Ok(state)
    }
}

fn not_found<K: Resource<DynamicType = ()>>(key: &str) -> StoreError {
    StoreError::NotFound {
        kind: K::kind(&()).to_string(),
        key: key.to_string(),
    }
}

fn check_version<K: Resource<DynamicType = ()>>(
    obj: &K,
    stored: &K,
    key: &str,
) -> Result<(), StoreError> {
    if obj.meta().resource_version != stored.meta().resource_version {
        return Err(StoreError::Conflict {
            kind: K::kind(&()).to_string(),
            key: key.to_string(),
            message: "the object has been modified".to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl<K> Store<K> for FakeStore<K>
where
    K: Resource<DynamicType = ()>
        + FieldSelectable
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K, StoreError> {
        let state = self.record(Verb::Get)?;
        let key = store_key(namespace, name);
        state.objects.get(&key).cloned().ok_or_else(|| not_found::<K>(&key))
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<K>, StoreError> {
        let state = self.record(Verb::List)?;
        Ok(state
            .objects
            .values()
            .filter(|o| selector.matches(*o))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let mut state = self.record(Verb::Create)?;
        let key = object_key(obj);
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: K::kind(&()).to_string(),
                key,
            });
        }
        state.version += 1;
        let mut created = obj.clone();
        let meta = created.meta_mut();
        meta.resource_version = Some(state.version.to_string());
        meta.uid = Some(format!("uid-{}", state.version));
        state.objects.insert(key, created.clone());
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let mut state = self.record(Verb::Update)?;
        let key = object_key(obj);
        let stored = state.objects.get(&key).ok_or_else(|| not_found::<K>(&key))?;
        check_version(obj, stored, &key)?;
        let mut updated = with_status_of(obj, stored);
        updated.meta_mut().deletion_timestamp = stored.meta().deletion_timestamp.clone();
        state.version += 1;
        updated.meta_mut().resource_version = Some(state.version.to_string());
        let finalized = updated.meta().deletion_timestamp.is_some()
            && updated.meta().finalizers.as_ref().is_none_or(|f| f.is_empty());
        if finalized {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, updated.clone());
        }
        Ok(updated)
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let mut state = self.record(Verb::UpdateStatus)?;
        let key = object_key(obj);
        let stored = state.objects.get(&key).ok_or_else(|| not_found::<K>(&key))?;
        check_version(obj, stored, &key)?;
        let mut updated = with_status_of(stored, obj);
        state.version += 1;
        updated.meta_mut().resource_version = Some(state.version.to_string());
        state.objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        let mut state = self.record(Verb::Delete)?;
        let key = store_key(namespace, name);
        let Some(stored) = state.objects.get(&key).cloned() else {
            return Err(not_found::<K>(&key));
        };
        if stored.meta().finalizers.as_ref().is_none_or(|f| f.is_empty()) {
            state.objects.remove(&key);
        } else if stored.meta().deletion_timestamp.is_none() {
            let mut deleting = stored;
            mark_deleted(deleting.meta_mut());
            state.version += 1;
            deleting.meta_mut().resource_version = Some(state.version.to_string());
            state.objects.insert(key, deleting);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum BrokerAction {
    GetCatalog,
    Provision(ProvisionRequest),
    Deprovision(DeprovisionRequest),
    PollLastOperation(LastOperationRequest),
    Bind(BindRequest),
    Unbind(UnbindRequest),
}

/// Broker client returning scripted responses and recording every call.
pub(crate) struct FakeBrokerClient {
    catalog: Mutex<Result<CatalogResponse, BrokerError>>,
    provision: Mutex<Result<ProvisionResponse, BrokerError>>,
    deprovision: Mutex<Result<DeprovisionResponse, BrokerError>>,
    last_operation: Mutex<Result<LastOperationResponse, BrokerError>>,
    bind: Mutex<Result<BindResponse, BrokerError>>,
    unbind: Mutex<Result<(), BrokerError>>,
    actions: Mutex<Vec<BrokerAction>>,
}

impl FakeBrokerClient {
    pub(crate) fn new() -> Self {
        Self {
            catalog: Mutex::new(Ok(catalog())),
            provision: Mutex::new(Ok(ProvisionResponse::default())),
            deprovision: Mutex::new(Ok(DeprovisionResponse::default())),
            last_operation: Mutex::new(Ok(LastOperationResponse {
                state: LastOperationState::Succeeded,
                description: None,
            })),
            bind: Mutex::new(Ok(BindResponse {
                credentials: json!({"password": "s3cr3t"}).as_object().cloned(),
            })),
            unbind: Mutex::new(Ok(())),
            actions: Mutex::new(vec![]),
        }
    }

    pub(crate) fn actions(&self) -> Vec<BrokerAction> {
        self.actions.lock().unwrap().clone()
    }

    pub(crate) fn clear_actions(&self) {
        self.actions.lock().unwrap().clear();
    }

    pub(crate) fn set_catalog(&self, reaction: Result<CatalogResponse, BrokerError>) {
        *self.catalog.lock().unwrap() = reaction;
    }

    pub(crate) fn set_provision(&self, reaction: Result<ProvisionResponse, BrokerError>) {
        *self.provision.lock().unwrap() = reaction;
    }

    pub(crate) fn set_deprovision(&self, reaction: Result<DeprovisionResponse, BrokerError>) {
        *self.deprovision.lock().unwrap() = reaction;
    }

    pub(crate) fn set_last_operation(&self, reaction: Result<LastOperationResponse, BrokerError>) {
        *self.last_operation.lock().unwrap() = reaction;
    }

    pub(crate) fn set_bind(&self, reaction: Result<BindResponse, BrokerError>) {
        *self.bind.lock().unwrap() = reaction;
    }

    pub(crate) fn set_unbind(&self, reaction: Result<(), BrokerError>) {
        *self.unbind.lock().unwrap() = reaction;
    }

    fn record(&self, action: BrokerAction) {
        self.actions.lock().unwrap().push(action);
    }
}

#[async_trait]
impl BrokerClient for FakeBrokerClient {
    async fn get_catalog(&self) -> Result<CatalogResponse, BrokerError> {
        self.record(BrokerAction::GetCatalog);
        self.catalog.lock().unwrap().clone()
    }

    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, BrokerError> {
        self.record(BrokerAction::Provision(request.clone()));
        self.provision.lock().unwrap().clone()
    }

    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, BrokerError> {
        self.record(BrokerAction::Deprovision(request.clone()));
        self.deprovision.lock().unwrap().clone()
    }

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        self.record(BrokerAction::PollLastOperation(request.clone()));
        self.last_operation.lock().unwrap().clone()
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, BrokerError> {
        self.record(BrokerAction::Bind(request.clone()));
        self.bind.lock().unwrap().clone()
    }

    async fn unbind(&self, request: &UnbindRequest) -> Result<(), BrokerError> {
        self.record(BrokerAction::Unbind(request.clone()));
        self.unbind.lock().unwrap().clone()
    }
}

pub(crate) struct FakeBrokerClientFactory {
    client: Arc<FakeBrokerClient>,
    configs: Mutex<Vec<ClientConfiguration>>,
}

impl FakeBrokerClientFactory {
    pub(crate) fn new(client: Arc<FakeBrokerClient>) -> Self {
        Self {
            client,
            configs: Mutex::new(vec![]),
        }
    }

    pub(crate) fn last_config(&self) -> Option<ClientConfiguration> {
        self.configs.lock().unwrap().last().cloned()
    }
}

impl BrokerClientFactory for FakeBrokerClientFactory {
    fn create(&self, config: &ClientConfiguration) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        self.configs.lock().unwrap().push(config.clone());
        Ok(self.client.clone())
    }
}

#[derive(Default)]
pub(crate) struct RecordingEventRecorder {
    events: Mutex<Vec<(EventType, String, String)>>,
}

impl RecordingEventRecorder {
    pub(crate) fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }
}

impl EventRecorder for RecordingEventRecorder {
    fn event(
        &self,
        _object: &k8s_openapi::api::core::v1::ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((event_type, reason.to_string(), message.to_string()));
    }
}

/// A controller wired to fakes.
pub(crate) struct Fixture {
    pub controller: Arc<Controller>,
    pub brokers: Arc<FakeStore<ServiceBroker>>,
    pub classes: Arc<FakeStore<ServiceClass>>,
    pub plans: Arc<FakeStore<ServicePlan>>,
    pub instances: Arc<FakeStore<ServiceInstance>>,
    pub bindings: Arc<FakeStore<ServiceBinding>>,
    pub secrets: Arc<FakeStore<Secret>>,
    pub namespaces: Arc<FakeStore<Namespace>>,
    pub broker_client: Arc<FakeBrokerClient>,
    pub factory: Arc<FakeBrokerClientFactory>,
    pub recorder: Arc<RecordingEventRecorder>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub(crate) fn with_config(config: ControllerConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let brokers: Arc<FakeStore<ServiceBroker>> = Arc::new(FakeStore::new());
        let classes: Arc<FakeStore<ServiceClass>> = Arc::new(FakeStore::new());
        let plans: Arc<FakeStore<ServicePlan>> = Arc::new(FakeStore::new());
        let instances: Arc<FakeStore<ServiceInstance>> = Arc::new(FakeStore::new());
        let bindings: Arc<FakeStore<ServiceBinding>> = Arc::new(FakeStore::new());
        let secrets: Arc<FakeStore<Secret>> = Arc::new(FakeStore::new());
        let namespaces: Arc<FakeStore<Namespace>> = Arc::new(FakeStore::new());
        let broker_client = Arc::new(FakeBrokerClient::new());
        let factory = Arc::new(FakeBrokerClientFactory::new(broker_client.clone()));
        let recorder = Arc::new(RecordingEventRecorder::default());
        let stores = Stores {
            brokers: brokers.clone(),
            service_classes: classes.clone(),
            service_plans: plans.clone(),
            instances: instances.clone(),
            bindings: bindings.clone(),
            secrets: secrets.clone(),
            namespaces: namespaces.clone(),
        };
        let controller = Controller::new(
            stores,
            factory.clone(),
            recorder.clone(),
            config,
        );
        Self {
            controller,
            brokers,
            classes,
            plans,
            instances,
            bindings,
            secrets,
            namespaces,
            broker_client,
            factory,
            recorder,
        }
    }

    pub(crate) async fn reconcile_broker(&self) -> Result<(), ControllerError> {
        self.controller
            .reconcile_key(ResourceKind::ServiceBroker, BROKER_NAME)
            .await
    }

    pub(crate) async fn reconcile_instance(&self) -> Result<(), ControllerError> {
        self.controller
            .reconcile_key(
                ResourceKind::ServiceInstance,
                &store_key(Some(NAMESPACE), INSTANCE_NAME),
            )
            .await
    }

    pub(crate) async fn reconcile_binding(&self) -> Result<(), ControllerError> {
        self.controller
            .reconcile_key(
                ResourceKind::ServiceBinding,
                &store_key(Some(NAMESPACE), BINDING_NAME),
            )
            .await
    }
}

fn finalized_meta(namespace: Option<&str>, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        generation: Some(1),
        finalizers: Some(vec![FINALIZER.to_string()]),
        ..Default::default()
    }
}

pub(crate) fn secret(namespace: &str, name: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

pub(crate) fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(NAMESPACE_UID.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn catalog() -> CatalogResponse {
    CatalogResponse {
        services: vec![Service {
            id: CLASS_EXTERNAL_ID.to_string(),
            name: CLASS_NAME.to_string(),
            description: "a test service".to_string(),
            bindable: true,
            plans: vec![Plan {
                id: PLAN_EXTERNAL_ID.to_string(),
                name: PLAN_NAME.to_string(),
                description: "a test plan".to_string(),
                free: Some(true),
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

pub(crate) fn broker() -> ServiceBroker {
    let mut broker = ServiceBroker::new(
        BROKER_NAME,
        ServiceBrokerSpec {
            url: BROKER_URL.to_string(),
            auth_info: None,
            relist_behavior: RelistBehavior::Duration,
            relist_duration_seconds: Some(900),
        },
    );
    broker.metadata = finalized_meta(None, BROKER_NAME);
    broker
}

pub(crate) fn plan_name() -> String {
    service_plan_name(CLASS_NAME, PLAN_NAME)
}

pub(crate) fn service_class() -> ServiceClass {
    ServiceClass::new(
        CLASS_NAME,
        ServiceClassSpec {
            broker_name: BROKER_NAME.to_string(),
            external_id: CLASS_EXTERNAL_ID.to_string(),
            external_name: CLASS_NAME.to_string(),
            description: "a test service".to_string(),
            bindable: true,
            plan_updatable: false,
            tags: vec![],
            requires: vec![],
            external_metadata: None,
        },
    )
}

pub(crate) fn service_plan() -> ServicePlan {
    ServicePlan::new(
        &plan_name(),
        ServicePlanSpec {
            broker_name: BROKER_NAME.to_string(),
            service_class_name: CLASS_NAME.to_string(),
            external_id: PLAN_EXTERNAL_ID.to_string(),
            external_name: PLAN_NAME.to_string(),
            description: "a test plan".to_string(),
            bindable: None,
            free: true,
            external_metadata: None,
            instance_create_parameter_schema: None,
            instance_update_parameter_schema: None,
            service_binding_create_parameter_schema: None,
        },
    )
}

pub(crate) fn instance() -> ServiceInstance {
    let mut instance = ServiceInstance::new(
        INSTANCE_NAME,
        ServiceInstanceSpec {
            service_class_name: CLASS_NAME.to_string(),
            plan_name: PLAN_NAME.to_string(),
            parameters: None,
            parameters_from: vec![],
            external_id: INSTANCE_EXTERNAL_ID.to_string(),
        },
    );
    instance.metadata = finalized_meta(Some(NAMESPACE), INSTANCE_NAME);
    instance
}

/// A provisioned instance.
pub(crate) fn ready_instance() -> ServiceInstance {
    let mut instance = instance();
    let checksum = instance_spec_checksum(&instance.spec);
    let status = instance.status_mut();
    status.checksum = Some(checksum);
    status.conditions.set(
        READY,
        ConditionStatus::True,
        "ProvisionedSuccessfully",
        "The instance was provisioned successfully",
        chrono::Utc::now(),
    );
    instance
}

pub(crate) fn binding() -> ServiceBinding {
    let mut binding = ServiceBinding::new(
        BINDING_NAME,
        ServiceBindingSpec {
            instance_ref: LocalObjectReference {
                name: INSTANCE_NAME.to_string(),
            },
            parameters: None,
            parameters_from: vec![],
            secret_name: String::new(),
            external_id: BINDING_EXTERNAL_ID.to_string(),
        },
    );
    binding.metadata = finalized_meta(Some(NAMESPACE), BINDING_NAME);
    binding
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_store_optimistic_concurrency() {
        let store = FakeStore::<ServiceInstance>::new();
        store.insert(instance());
        let first = store.get(Some(NAMESPACE), INSTANCE_NAME).await.unwrap();
        let mut stale = first.clone();
        let mut fresh = first;
        fresh.status_mut().checksum = Some("a".to_string());
        store.update_status(&fresh).await.unwrap();
        stale.status_mut().checksum = Some("b".to_string());
        assert!(store.update_status(&stale).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn fake_store_delete_with_finalizer() {
        let store = FakeStore::<ServiceInstance>::new();
        store.insert(instance());
        store.delete(Some(NAMESPACE), INSTANCE_NAME).await.unwrap();
        let mut deleting = store.object(Some(NAMESPACE), INSTANCE_NAME).unwrap();
        assert!(deleting.metadata.deletion_timestamp.is_some());
        deleting.metadata.finalizers = Some(vec![]);
        store.update(&deleting).await.unwrap();
        assert!(store.object(Some(NAMESPACE), INSTANCE_NAME).is_none());
        assert_eq!(
            vec![Verb::Delete, Verb::Update],
            store.verbs()
        );
    }
}
