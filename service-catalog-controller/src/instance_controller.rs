use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use serde_json::json;
use service_catalog_apis::{
    ConditionStatus, FAILED, READY, ServiceBroker, ServiceClass, ServiceInstance,
    ServiceInstanceOperation, ServicePlan, checksum::instance_spec_checksum, service_plan_name,
};

use crate::{
    broker_controller::{ERROR_AUTH_CREDENTIALS_REASON, ERROR_RECONCILIATION_RETRY_TIMEOUT_REASON},
    brokerapi::{
        BrokerClient, DeprovisionRequest, LastOperationRequest, LastOperationState,
        ProvisionRequest,
    },
    controller::{Controller, pretty},
    errors::ControllerError,
    events::EventType,
    modifications::Modifications,
    parameters::build_parameters,
    store::{FIELD_INSTANCE_REF_NAME, Selector},
    utils::retry_window_elapsed,
};

pub(crate) const ERROR_NONEXISTENT_SERVICE_CLASS_REASON: &str = "ReferencesNonexistentServiceClass";
pub(crate) const ERROR_NONEXISTENT_SERVICE_PLAN_REASON: &str = "ReferencesNonexistentServicePlan";
pub(crate) const ERROR_NONEXISTENT_BROKER_REASON: &str = "ReferencesNonexistentBroker";
pub(crate) const ERROR_WITH_PARAMETERS_REASON: &str = "ErrorWithParameters";
pub(crate) const ERROR_FINDING_NAMESPACE_REASON: &str = "ErrorFindingNamespaceForInstance";
const ERROR_PROVISION_CALL_FAILED_REASON: &str = "ProvisionCallFailed";
const ERROR_CALLING_PROVISION_REASON: &str = "ErrorCallingProvision";
const ERROR_DEPROVISION_CALL_FAILED_REASON: &str = "DeprovisionCallFailed";
const ERROR_DEPROVISION_BLOCKED_REASON: &str = "DeprovisionBlockedByExistingCredentials";
const ERROR_POLLING_LAST_OPERATION_REASON: &str = "ErrorPollingLastOperation";
const SUCCESS_PROVISION_REASON: &str = "ProvisionedSuccessfully";
const SUCCESS_PROVISION_MESSAGE: &str = "The instance was provisioned successfully";
const SUCCESS_DEPROVISION_REASON: &str = "DeprovisionedSuccessfully";
const SUCCESS_DEPROVISION_MESSAGE: &str = "The instance was deprovisioned successfully";
const ASYNC_PROVISIONING_REASON: &str = "Provisioning";
const ASYNC_PROVISIONING_MESSAGE: &str = "The instance is being provisioned asynchronously";
const ASYNC_DEPROVISIONING_REASON: &str = "Deprovisioning";
const ASYNC_DEPROVISIONING_MESSAGE: &str = "The instance is being deprovisioned asynchronously";
const RETRY_TIMEOUT_MESSAGE: &str = "Stopping reconciliation retries because too much time has elapsed";

/// The class, plan and broker an instance refers to, plus a client for the broker.
pub(crate) struct References {
    pub class: ServiceClass,
    pub plan: ServicePlan,
    pub broker: ServiceBroker,
    pub client: Arc<dyn BrokerClient>,
}

/// Why [`Controller::resolve_references`] failed, as condition reason and message.
pub(crate) struct ReferenceFailure {
    pub reason: &'static str,
    pub message: String,
    pub error: ControllerError,
}

impl ReferenceFailure {
    fn new(reason: &'static str, message: String) -> Self {
        Self {
            reason,
            error: ControllerError::Reference(message.clone()),
            message,
        }
    }
}

fn clear_async_operation(instance: &mut ServiceInstance) {
    let status = instance.status_mut();
    status.async_op_in_progress = false;
    status.last_operation = None;
    status.current_operation = None;
    status.operation_start_time = None;
}

impl Controller {
    /// Resolve class `class_name`, its plan `plan_name` and the owning broker.
    pub(crate) async fn resolve_references(
        &self,
        class_name: &str,
        plan_name: &str,
    ) -> Result<References, ReferenceFailure> {
        let class = self
            .stores
            .service_classes
            .get(None, class_name)
            .await
            .map_err(|e| {
                ReferenceFailure::new(
                    ERROR_NONEXISTENT_SERVICE_CLASS_REASON,
                    format!("References a non-existent ServiceClass \"{}\": {}", class_name, e),
                )
            })?;
        let plan_object_name = service_plan_name(&class.name_any(), plan_name);
        let plan = self
            .stores
            .service_plans
            .get(None, &plan_object_name)
            .await
            .map_err(|e| {
                ReferenceFailure::new(
                    ERROR_NONEXISTENT_SERVICE_PLAN_REASON,
                    format!(
                        "References a non-existent ServicePlan \"{}\" on ServiceClass \"{}\": {}",
                        plan_name, class_name, e
                    ),
                )
            })?;
        let broker = self
            .stores
            .brokers
            .get(None, &class.spec.broker_name)
            .await
            .map_err(|e| {
                ReferenceFailure::new(
                    ERROR_NONEXISTENT_BROKER_REASON,
                    format!(
                        "References a non-existent ServiceBroker \"{}\": {}",
                        class.spec.broker_name, e
                    ),
                )
            })?;
        let client = self
            .broker_client(&broker)
            .await
            .map_err(|e| ReferenceFailure {
                reason: ERROR_AUTH_CREDENTIALS_REASON,
                message: format!(
                    "Error getting broker auth credentials for {}: {}",
                    pretty(&broker),
                    e
                ),
                error: e,
            })?;
        Ok(References {
            class,
            plan,
            broker,
            client,
        })
    }

    pub(crate) async fn reconcile_instance(
        &self,
        instance: ServiceInstance,
    ) -> Result<(), ControllerError> {
        let now = Utc::now();
        let mut instance = Modifications::new(instance);
        let result = self.sync_instance(&mut instance, now).await;
        if let Err(e) = &result {
            // Instance events are ignored during an asynchronous operation,
            // only the polling queue brings the key back.
            if instance.is_async_op_in_progress() && !e.is_requeued_by_poller() {
                self.continue_polling(&instance);
            }
        }
        result
    }

    async fn sync_instance(
        &self,
        instance: &mut Modifications<ServiceInstance>,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let deleting = instance.is_deleted();
        let async_op = instance.is_async_op_in_progress();

        if instance.is_failed() && !deleting {
            debug!(
                "{}: not processing event because status showed that it has failed",
                pretty(&**instance)
            );
            return Ok(());
        }
        if !async_op && !deleting {
            let checksum = instance_spec_checksum(&instance.spec);
            if instance.checksum() == Some(checksum.as_str()) {
                debug!(
                    "{}: not processing event because checksum showed there is no work to do",
                    pretty(&**instance)
                );
                return Ok(());
            }
        }
        if deleting && !instance.has_finalizer() {
            return Ok(());
        }
        if deleting && !async_op && (instance.checksum().is_none() || instance.is_failed()) {
            info!(
                "{}: never provisioned successfully, removing finalizer",
                pretty(&**instance)
            );
            instance.remove_finalizer(self.stores.instances.as_ref()).await?;
            return Ok(());
        }

        let refs = match self
            .resolve_references(&instance.spec.service_class_name, &instance.spec.plan_name)
            .await
        {
            Ok(refs) => refs,
            Err(failure) => {
                warn!("{}: {}", pretty(&**instance), failure.message);
                self.event(&**instance, EventType::Warning, failure.reason, &failure.message);
                instance.status_mut().conditions.set(
                    READY,
                    ConditionStatus::False,
                    failure.reason,
                    &failure.message,
                    now,
                );
                instance.replace_status(self.stores.instances.as_ref()).await?;
                return Err(failure.error);
            }
        };

        if async_op {
            self.poll_instance(instance, &refs, now).await
        } else if deleting {
            self.deprovision_instance(instance, &refs, now).await
        } else {
            self.provision_instance(instance, &refs, now).await
        }
    }

    async fn provision_instance(
        &self,
        instance: &mut Modifications<ServiceInstance>,
        refs: &References,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let store = self.stores.instances.as_ref();
        let namespace = instance.namespace().unwrap_or_default();

        let parameters = match build_parameters(
            self.stores.secrets.as_ref(),
            &namespace,
            instance.spec.parameters.as_ref(),
            &instance.spec.parameters_from,
        )
        .await
        {
            Ok(parameters) => parameters,
            Err(e) => {
                let s = format!("Failed to prepare ServiceInstance parameters: {}", e);
                warn!("{}: {}", pretty(&**instance), s);
                self.event(&**instance, EventType::Warning, ERROR_WITH_PARAMETERS_REASON, &s);
                instance.status_mut().conditions.set(
                    READY,
                    ConditionStatus::False,
                    ERROR_WITH_PARAMETERS_REASON,
                    &s,
                    now,
                );
                instance.replace_status(store).await?;
                return Err(e);
            }
        };

        let namespace_uid = match self.stores.namespaces.get(None, &namespace).await {
            Ok(ns) => ns.metadata.uid.unwrap_or_default(),
            Err(e) => {
                let s = format!("Failed to get namespace \"{}\": {}", namespace, e);
                warn!("{}: {}", pretty(&**instance), s);
                self.event(&**instance, EventType::Warning, ERROR_FINDING_NAMESPACE_REASON, &s);
                instance.status_mut().conditions.set(
                    READY,
                    ConditionStatus::False,
                    ERROR_FINDING_NAMESPACE_REASON,
                    &s,
                    now,
                );
                instance.replace_status(store).await?;
                return Err(e.into());
            }
        };

        let request = ProvisionRequest {
            instance_id: instance.spec.external_id.clone(),
            accepts_incomplete: true,
            service_id: refs.class.spec.external_id.clone(),
            plan_id: refs.plan.spec.external_id.clone(),
            organization_guid: namespace_uid.clone(),
            space_guid: namespace_uid,
            parameters,
            context: self.config.osb_context_profile.then(|| {
                json!({
                    "platform": "kubernetes",
                    "namespace": namespace,
                })
            }),
        };
        let checksum = instance_spec_checksum(&instance.spec);
        debug!(
            "{}: provisioning a new ServiceInstance of {} at {}",
            pretty(&**instance),
            pretty(&refs.class),
            pretty(&refs.broker)
        );

        let response = match refs.client.provision_instance(&request).await {
            Ok(response) => response,
            Err(e) if e.is_http() => {
                let s = format!(
                    "Error provisioning ServiceInstance of {} at {}: {}",
                    pretty(&refs.class),
                    pretty(&refs.broker),
                    e
                );
                warn!("{}: {}", pretty(&**instance), s);
                self.event(&**instance, EventType::Warning, ERROR_PROVISION_CALL_FAILED_REASON, &s);
                let status = instance.status_mut();
                status.conditions.set(
                    FAILED,
                    ConditionStatus::True,
                    ERROR_PROVISION_CALL_FAILED_REASON,
                    &s,
                    now,
                );
                status.conditions.set(
                    READY,
                    ConditionStatus::False,
                    ERROR_PROVISION_CALL_FAILED_REASON,
                    &s,
                    now,
                );
                instance.replace_status(store).await?;
                return Ok(());
            }
            Err(e) => {
                let s = format!(
                    "The provision call failed and will be retried: Error communicating with broker for provisioning: {}",
                    e
                );
                warn!("{}: {}", pretty(&**instance), s);
                self.event(&**instance, EventType::Warning, ERROR_CALLING_PROVISION_REASON, &s);
                instance.status_mut().conditions.set(
                    READY,
                    ConditionStatus::False,
                    ERROR_CALLING_PROVISION_REASON,
                    &s,
                    now,
                );
                instance.replace_status(store).await?;
                return Err(e.into());
            }
        };

        let status = instance.status_mut();
        status.checksum = Some(checksum);
        if response.dashboard_url.is_some() {
            status.dashboard_url = response.dashboard_url;
        }
        if response.is_async {
            status.async_op_in_progress = true;
            status.last_operation = response.operation_key;
            status.current_operation = Some(ServiceInstanceOperation::Provision);
            status.operation_start_time = Some(now);
            status.conditions.set(
                READY,
                ConditionStatus::False,
                ASYNC_PROVISIONING_REASON,
                ASYNC_PROVISIONING_MESSAGE,
                now,
            );
            instance.replace_status(store).await?;
            self.begin_polling(instance);
            info!("{}: provisioning asynchronously", pretty(&**instance));
            self.event(
                &**instance,
                EventType::Normal,
                ASYNC_PROVISIONING_REASON,
                ASYNC_PROVISIONING_MESSAGE,
            );
        } else {
            status.conditions.set(
                READY,
                ConditionStatus::True,
                SUCCESS_PROVISION_REASON,
                SUCCESS_PROVISION_MESSAGE,
                now,
            );
            instance.replace_status(store).await?;
            info!("{}: provisioned successfully", pretty(&**instance));
            self.event(
                &**instance,
                EventType::Normal,
                SUCCESS_PROVISION_REASON,
                SUCCESS_PROVISION_MESSAGE,
            );
        }
        Ok(())
    }

    async fn deprovision_instance(
        &self,
        instance: &mut Modifications<ServiceInstance>,
        refs: &References,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let store = self.stores.instances.as_ref();
        let namespace = instance.namespace().unwrap_or_default();
        let selector = Selector::in_namespace(&namespace)
            .with_field(FIELD_INSTANCE_REF_NAME, &instance.name_any());
        let bindings = self.stores.bindings.list(&selector).await?;
        if !bindings.is_empty() {
            let s = format!(
                "All associated ServiceBindings must be removed before this ServiceInstance can be deleted, {} remaining",
                bindings.len()
            );
            info!("{}: {}", pretty(&**instance), s);
            self.event(&**instance, EventType::Warning, ERROR_DEPROVISION_BLOCKED_REASON, &s);
            instance.status_mut().conditions.set(
                READY,
                ConditionStatus::False,
                ERROR_DEPROVISION_BLOCKED_REASON,
                &s,
                now,
            );
            instance.replace_status(store).await?;
            return Err(ControllerError::NotReady(s));
        }

        let request = DeprovisionRequest {
            instance_id: instance.spec.external_id.clone(),
            accepts_incomplete: true,
            service_id: refs.class.spec.external_id.clone(),
            plan_id: refs.plan.spec.external_id.clone(),
        };
        debug!("{}: deprovisioning at {}", pretty(&**instance), pretty(&refs.broker));
        match refs.client.deprovision_instance(&request).await {
            Ok(response) if response.is_async => {
                let status = instance.status_mut();
                status.async_op_in_progress = true;
                status.last_operation = response.operation_key;
                status.current_operation = Some(ServiceInstanceOperation::Deprovision);
                status.operation_start_time = Some(now);
                status.conditions.set(
                    READY,
                    ConditionStatus::False,
                    ASYNC_DEPROVISIONING_REASON,
                    ASYNC_DEPROVISIONING_MESSAGE,
                    now,
                );
                instance.replace_status(store).await?;
                self.begin_polling(instance);
                info!("{}: deprovisioning asynchronously", pretty(&**instance));
                self.event(
                    &**instance,
                    EventType::Normal,
                    ASYNC_DEPROVISIONING_REASON,
                    ASYNC_DEPROVISIONING_MESSAGE,
                );
                Ok(())
            }
            Ok(_) => self.finish_deprovision(instance, now).await,
            Err(e) if e.is_gone() => {
                debug!("{}: already gone at the broker", pretty(&**instance));
                self.finish_deprovision(instance, now).await
            }
            Err(e) => {
                let s = format!(
                    "Error deprovisioning ServiceInstance of {} at {}: {}",
                    pretty(&refs.class),
                    pretty(&refs.broker),
                    e
                );
                warn!("{}: {}", pretty(&**instance), s);
                self.event(
                    &**instance,
                    EventType::Warning,
                    ERROR_DEPROVISION_CALL_FAILED_REASON,
                    &s,
                );
                instance.status_mut().conditions.set(
                    READY,
                    ConditionStatus::Unknown,
                    ERROR_DEPROVISION_CALL_FAILED_REASON,
                    &s,
                    now,
                );
                instance.replace_status(store).await?;
                Err(e.into())
            }
        }
    }

    async fn finish_deprovision(
        &self,
        instance: &mut Modifications<ServiceInstance>,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let store = self.stores.instances.as_ref();
        clear_async_operation(instance);
        instance.status_mut().conditions.set(
            READY,
            ConditionStatus::False,
            SUCCESS_DEPROVISION_REASON,
            SUCCESS_DEPROVISION_MESSAGE,
            now,
        );
        instance.replace_status(store).await?;
        instance.remove_finalizer(store).await?;
        info!("{}: deprovisioned successfully", pretty(&**instance));
        self.event(
            &**instance,
            EventType::Normal,
            SUCCESS_DEPROVISION_REASON,
            SUCCESS_DEPROVISION_MESSAGE,
        );
        Ok(())
    }

    /// Poll the broker for the outcome of the instance's asynchronous operation.
    async fn poll_instance(
        &self,
        instance: &mut Modifications<ServiceInstance>,
        refs: &References,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let store = self.stores.instances.as_ref();
        let deprovisioning = match instance.status.as_ref().and_then(|s| s.current_operation) {
            Some(operation) => operation == ServiceInstanceOperation::Deprovision,
            None => instance.is_deleted(),
        };
        let request = LastOperationRequest {
            instance_id: instance.spec.external_id.clone(),
            service_id: Some(refs.class.spec.external_id.clone()),
            plan_id: Some(refs.plan.spec.external_id.clone()),
            operation_key: instance.status.as_ref().and_then(|s| s.last_operation.clone()),
        };
        debug!("{}: polling last operation", pretty(&**instance));

        let response = match refs.client.poll_last_operation(&request).await {
            Ok(response) => response,
            Err(e) if deprovisioning && e.is_gone() => {
                self.finish_polling(instance);
                return self.finish_deprovision(instance, now).await;
            }
            Err(e) => {
                let s = format!("Error polling last operation: {}", e);
                warn!("{}: {}", pretty(&**instance), s);
                self.event(
                    &**instance,
                    EventType::Warning,
                    ERROR_POLLING_LAST_OPERATION_REASON,
                    &s,
                );
                if self.retry_window_elapsed(instance, now) {
                    return self.stop_polling(instance, deprovisioning, now).await;
                }
                return Err(e.into());
            }
        };

        match response.state {
            LastOperationState::InProgress => {
                if self.retry_window_elapsed(instance, now) {
                    return self.stop_polling(instance, deprovisioning, now).await;
                }
                if let Some(description) = &response.description {
                    let (reason, message) = if deprovisioning {
                        (ASYNC_DEPROVISIONING_REASON, ASYNC_DEPROVISIONING_MESSAGE)
                    } else {
                        (ASYNC_PROVISIONING_REASON, ASYNC_PROVISIONING_MESSAGE)
                    };
                    instance.status_mut().conditions.set(
                        READY,
                        ConditionStatus::False,
                        reason,
                        &format!("{} ({})", message, description),
                        now,
                    );
                    instance.replace_status(store).await?;
                }
                self.continue_polling(instance);
                Err(ControllerError::OperationInProgress(format!(
                    "last operation not completed (still in progress) for {}",
                    pretty(&**instance)
                )))
            }
            LastOperationState::Succeeded => {
                self.finish_polling(instance);
                if deprovisioning {
                    return self.finish_deprovision(instance, now).await;
                }
                clear_async_operation(instance);
                instance.status_mut().conditions.set(
                    READY,
                    ConditionStatus::True,
                    SUCCESS_PROVISION_REASON,
                    SUCCESS_PROVISION_MESSAGE,
                    now,
                );
                instance.replace_status(store).await?;
                info!("{}: provisioned successfully", pretty(&**instance));
                self.event(
                    &**instance,
                    EventType::Normal,
                    SUCCESS_PROVISION_REASON,
                    SUCCESS_PROVISION_MESSAGE,
                );
                Ok(())
            }
            LastOperationState::Failed => {
                self.finish_polling(instance);
                clear_async_operation(instance);
                let description = response.description.unwrap_or_default();
                if deprovisioning {
                    let s = format!("Deprovision call failed: {}", description);
                    warn!("{}: {}", pretty(&**instance), s);
                    self.event(
                        &**instance,
                        EventType::Warning,
                        ERROR_DEPROVISION_CALL_FAILED_REASON,
                        &s,
                    );
                    instance.status_mut().conditions.set(
                        READY,
                        ConditionStatus::Unknown,
                        ERROR_DEPROVISION_CALL_FAILED_REASON,
                        &s,
                        now,
                    );
                    instance.replace_status(store).await?;
                    Err(ControllerError::OperationFailed(s))
                } else {
                    let s = format!("Error provisioning ServiceInstance: {}", description);
                    warn!("{}: {}", pretty(&**instance), s);
                    self.event(
                        &**instance,
                        EventType::Warning,
                        ERROR_PROVISION_CALL_FAILED_REASON,
                        &s,
                    );
                    let status = instance.status_mut();
                    status.conditions.set(
                        FAILED,
                        ConditionStatus::True,
                        ERROR_PROVISION_CALL_FAILED_REASON,
                        &s,
                        now,
                    );
                    status.conditions.set(
                        READY,
                        ConditionStatus::False,
                        ERROR_PROVISION_CALL_FAILED_REASON,
                        &s,
                        now,
                    );
                    instance.replace_status(store).await?;
                    Ok(())
                }
            }
            LastOperationState::Unknown(state) => {
                let s = format!("Got invalid state in LastOperationResponse: {:?}", state);
                warn!("{}: {}", pretty(&**instance), s);
                self.event(
                    &**instance,
                    EventType::Warning,
                    ERROR_POLLING_LAST_OPERATION_REASON,
                    &s,
                );
                Err(ControllerError::Protocol(s))
            }
        }
    }

    fn retry_window_elapsed(&self, instance: &ServiceInstance, now: DateTime<Utc>) -> bool {
        instance
            .status
            .as_ref()
            .and_then(|s| s.operation_start_time)
            .is_some_and(|start| {
                retry_window_elapsed(start, now, self.config.reconciliation_retry_duration)
            })
    }

    /// Give up on an asynchronous operation which ran past the retry window.
    async fn stop_polling(
        &self,
        instance: &mut Modifications<ServiceInstance>,
        deprovisioning: bool,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        info!("{}: {}", pretty(&**instance), RETRY_TIMEOUT_MESSAGE);
        self.finish_polling(instance);
        clear_async_operation(instance);
        let status = instance.status_mut();
        if deprovisioning {
            status.conditions.set(
                READY,
                ConditionStatus::Unknown,
                ERROR_RECONCILIATION_RETRY_TIMEOUT_REASON,
                RETRY_TIMEOUT_MESSAGE,
                now,
            );
        } else {
            status.conditions.set(
                FAILED,
                ConditionStatus::True,
                ERROR_RECONCILIATION_RETRY_TIMEOUT_REASON,
                RETRY_TIMEOUT_MESSAGE,
                now,
            );
            status.conditions.set(
                READY,
                ConditionStatus::False,
                ERROR_RECONCILIATION_RETRY_TIMEOUT_REASON,
                RETRY_TIMEOUT_MESSAGE,
                now,
            );
        }
        instance.replace_status(self.stores.instances.as_ref()).await?;
        self.event(
            &**instance,
            EventType::Warning,
            ERROR_RECONCILIATION_RETRY_TIMEOUT_REASON,
            RETRY_TIMEOUT_MESSAGE,
        );
        Ok(())
    }
}
