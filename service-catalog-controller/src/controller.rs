use std::{fmt, future::Future, sync::Arc};

use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::Resource;
use service_catalog_apis::{
    ServiceBinding, ServiceBroker, ServiceClass, ServiceInstance, ServicePlan,
};
use tokio::task::JoinHandle;

use crate::{
    brokerapi::BrokerClientFactory,
    config::ControllerConfig,
    errors::ControllerError,
    events::{EventRecorder, EventType},
    metrics::ControllerMetrics,
    queue::{WorkQueue, default_controller_rate_limiter, polling_rate_limiter},
    store::{Selector, Store, object_key, split_key},
    worker::{run_poller, run_worker},
};

/// The resource kinds reconciled by the [`Controller`], one queue each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ServiceBroker,
    ServiceClass,
    ServicePlan,
    ServiceInstance,
    ServiceBinding,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::ServiceBroker,
        ResourceKind::ServiceClass,
        ResourceKind::ServicePlan,
        ResourceKind::ServiceInstance,
        ResourceKind::ServiceBinding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ServiceBroker => "ServiceBroker",
            ResourceKind::ServiceClass => "ServiceClass",
            ResourceKind::ServicePlan => "ServicePlan",
            ResourceKind::ServiceInstance => "ServiceInstance",
            ResourceKind::ServiceBinding => "ServiceBinding",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store clients for every kind the controller reads or writes.
#[derive(Clone)]
pub struct Stores {
    pub brokers: Arc<dyn Store<ServiceBroker>>,
    pub service_classes: Arc<dyn Store<ServiceClass>>,
    pub service_plans: Arc<dyn Store<ServicePlan>>,
    pub instances: Arc<dyn Store<ServiceInstance>>,
    pub bindings: Arc<dyn Store<ServiceBinding>>,
    pub secrets: Arc<dyn Store<Secret>>,
    pub namespaces: Arc<dyn Store<Namespace>>,
}

/// Reconciles brokers, classes, plans, instances and bindings.
///
/// Watch callbacks are turned into queue adds by the `on_*` handlers,
/// [`Controller::run`] drives the workers until shutdown.
pub struct Controller {
    pub(crate) stores: Stores,
    pub(crate) broker_clients: Arc<dyn BrokerClientFactory>,
    pub(crate) recorder: Arc<dyn EventRecorder>,
    pub(crate) config: ControllerConfig,
    pub(crate) broker_queue: Arc<WorkQueue>,
    pub(crate) service_class_queue: Arc<WorkQueue>,
    pub(crate) service_plan_queue: Arc<WorkQueue>,
    pub(crate) instance_queue: Arc<WorkQueue>,
    pub(crate) binding_queue: Arc<WorkQueue>,
    /// Instances with an asynchronous operation in flight, handed back to
    /// the instance queue once their backoff expired.
    pub(crate) polling_queue: Arc<WorkQueue>,
    pub(crate) metrics: ControllerMetrics,
}

impl Controller {
    pub fn new(
        stores: Stores,
        broker_clients: Arc<dyn BrokerClientFactory>,
        recorder: Arc<dyn EventRecorder>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            stores,
            broker_clients,
            recorder,
            config,
            broker_queue: WorkQueue::new("service-broker", default_controller_rate_limiter()),
            service_class_queue: WorkQueue::new("service-class", default_controller_rate_limiter()),
            service_plan_queue: WorkQueue::new("service-plan", default_controller_rate_limiter()),
            instance_queue: WorkQueue::new("service-instance", default_controller_rate_limiter()),
            binding_queue: WorkQueue::new("service-binding", default_controller_rate_limiter()),
            polling_queue: WorkQueue::new("instance-poller", polling_rate_limiter()),
            metrics: ControllerMetrics::new(),
        })
    }

    pub fn queue(&self, kind: ResourceKind) -> &Arc<WorkQueue> {
        match kind {
            ResourceKind::ServiceBroker => &self.broker_queue,
            ResourceKind::ServiceClass => &self.service_class_queue,
            ResourceKind::ServicePlan => &self.service_plan_queue,
            ResourceKind::ServiceInstance => &self.instance_queue,
            ResourceKind::ServiceBinding => &self.binding_queue,
        }
    }

    pub fn polling_queue(&self) -> &Arc<WorkQueue> {
        &self.polling_queue
    }

    pub fn on_broker_added(&self, broker: &ServiceBroker) {
        self.broker_queue.add(&object_key(broker));
    }

    pub fn on_broker_updated(&self, _old: &ServiceBroker, new: &ServiceBroker) {
        self.on_broker_added(new);
    }

    pub fn on_broker_deleted(&self, broker: &ServiceBroker) {
        debug!("ServiceBroker \"{}\": received delete event", object_key(broker));
    }

    pub fn on_service_class_added(&self, class: &ServiceClass) {
        self.service_class_queue.add(&object_key(class));
    }

    pub fn on_service_class_updated(&self, _old: &ServiceClass, new: &ServiceClass) {
        self.on_service_class_added(new);
    }

    pub fn on_service_class_deleted(&self, class: &ServiceClass) {
        debug!("ServiceClass \"{}\": received delete event", object_key(class));
    }

    pub fn on_service_plan_added(&self, plan: &ServicePlan) {
        self.service_plan_queue.add(&object_key(plan));
    }

    pub fn on_service_plan_updated(&self, _old: &ServicePlan, new: &ServicePlan) {
        self.on_service_plan_added(new);
    }

    pub fn on_service_plan_deleted(&self, plan: &ServicePlan) {
        debug!("ServicePlan \"{}\": received delete event", object_key(plan));
    }

    pub fn on_instance_added(&self, instance: &ServiceInstance) {
        self.instance_queue.add(&object_key(instance));
    }

    /// Instances with an asynchronous operation in progress are requeued by
    /// the poller only, so that polling stays rate limited.
    pub fn on_instance_updated(&self, _old: &ServiceInstance, new: &ServiceInstance) {
        if new.is_async_op_in_progress() {
            debug!(
                "ServiceInstance \"{}\": ignoring update event, asynchronous operation in progress",
                object_key(new)
            );
            return;
        }
        self.on_instance_added(new);
    }

    pub fn on_instance_deleted(&self, instance: &ServiceInstance) {
        debug!("ServiceInstance \"{}\": received delete event", object_key(instance));
    }

    pub fn on_binding_added(&self, binding: &ServiceBinding) {
        self.binding_queue.add(&object_key(binding));
    }

    pub fn on_binding_updated(&self, _old: &ServiceBinding, new: &ServiceBinding) {
        self.on_binding_added(new);
    }

    pub fn on_binding_deleted(&self, binding: &ServiceBinding) {
        debug!("ServiceBinding \"{}\": received delete event", object_key(binding));
    }

    /// Re-add the keys of all objects of all kinds.
    pub async fn resync(&self) -> Result<(), ControllerError> {
        let all = Selector::all();
        for broker in self.stores.brokers.list(&all).await? {
            self.on_broker_added(&broker);
        }
        for class in self.stores.service_classes.list(&all).await? {
            self.on_service_class_added(&class);
        }
        for plan in self.stores.service_plans.list(&all).await? {
            self.on_service_plan_added(&plan);
        }
        for instance in self.stores.instances.list(&all).await? {
            if !instance.is_async_op_in_progress() {
                self.on_instance_added(&instance);
            }
        }
        for binding in self.stores.bindings.list(&all).await? {
            self.on_binding_added(&binding);
        }
        Ok(())
    }

    /// Run `config.workers` workers per queue, the poller and the periodic
    /// resync until `shutdown` resolves. In-flight reconciles are allowed to
    /// complete and already queued keys are drained.
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            "starting service catalog controller with {} workers per queue",
            self.config.workers
        );
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        for kind in ResourceKind::ALL {
            for _ in 0..self.config.workers {
                workers.push(tokio::spawn(run_worker(self.clone(), kind)));
            }
        }
        for _ in 0..self.config.workers {
            workers.push(tokio::spawn(run_poller(self.clone())));
        }
        let resync = {
            let controller = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(controller.config.resync_interval);
                loop {
                    interval.tick().await;
                    if let Err(e) = controller.resync().await {
                        warn!("periodic resync failed: {}", e);
                    }
                }
            })
        };

        shutdown.await;
        info!("shutting down service catalog controller");
        resync.abort();
        self.polling_queue.shut_down();
        for kind in ResourceKind::ALL {
            self.queue(kind).shut_down();
        }
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                error!("worker terminated abnormally: {}", e);
            }
        }
        info!("service catalog controller stopped");
    }

    /// Fetch the object behind `key` and reconcile it, deleted objects are ignored.
    pub(crate) async fn reconcile_key(
        &self,
        kind: ResourceKind,
        key: &str,
    ) -> Result<(), ControllerError> {
        let (namespace, name) = split_key(key);
        let deleted = || {
            info!("{} \"{}\": not doing work because it has been deleted", kind, key);
            Ok(())
        };
        match kind {
            ResourceKind::ServiceBroker => match self.stores.brokers.get(None, name).await {
                Ok(broker) => self.reconcile_broker(broker).await,
                Err(e) if e.is_not_found() => deleted(),
                Err(e) => Err(e)?,
            },
            ResourceKind::ServiceClass => match self.stores.service_classes.get(None, name).await {
                Ok(class) => self.reconcile_service_class(class).await,
                Err(e) if e.is_not_found() => deleted(),
                Err(e) => Err(e)?,
            },
            ResourceKind::ServicePlan => match self.stores.service_plans.get(None, name).await {
                Ok(plan) => self.reconcile_service_plan(plan).await,
                Err(e) if e.is_not_found() => deleted(),
                Err(e) => Err(e)?,
            },
            ResourceKind::ServiceInstance => {
                match self.stores.instances.get(namespace, name).await {
                    Ok(instance) => self.reconcile_instance(instance).await,
                    Err(e) if e.is_not_found() => deleted(),
                    Err(e) => Err(e)?,
                }
            }
            ResourceKind::ServiceBinding => match self.stores.bindings.get(namespace, name).await {
                Ok(binding) => self.reconcile_binding(binding).await,
                Err(e) if e.is_not_found() => deleted(),
                Err(e) => Err(e)?,
            },
        }
    }

    /// Start polling the asynchronous operation of `instance`.
    pub(crate) fn begin_polling(&self, instance: &ServiceInstance) {
        self.polling_queue.add_rate_limited(&object_key(instance));
    }

    pub(crate) fn continue_polling(&self, instance: &ServiceInstance) {
        self.begin_polling(instance);
    }

    pub(crate) fn finish_polling(&self, instance: &ServiceInstance) {
        self.polling_queue.forget(&object_key(instance));
    }

    pub(crate) fn event<K>(&self, obj: &K, event_type: EventType, reason: &str, message: &str)
    where
        K: Resource<DynamicType = ()>,
    {
        self.recorder
            .event(&obj.object_ref(&()), event_type, reason, message);
    }
}

/// Log prefix for an object, `Kind "namespace/name"`.
pub(crate) fn pretty<K>(obj: &K) -> String
where
    K: Resource<DynamicType = ()>,
{
    format!("{} \"{}\"", K::kind(&()), object_key(obj))
}
