use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::{
    ByteString, api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{Resource, ResourceExt};
use serde_json::{Map, Value};
use service_catalog_apis::{
    ConditionStatus, READY, ServiceBinding, ServiceInstance, checksum::binding_spec_checksum,
};

use crate::{
    brokerapi::{BindRequest, UnbindRequest},
    controller::{Controller, pretty},
    errors::ControllerError,
    events::EventType,
    instance_controller::{ERROR_WITH_PARAMETERS_REASON, References},
    modifications::Modifications,
    parameters::build_parameters,
    utils::is_controlled_by,
};

const ERROR_NONEXISTENT_INSTANCE_REASON: &str = "ReferencesNonexistentInstance";
const ERROR_ASYNC_OPERATION_IN_PROGRESS_REASON: &str = "ErrorAsyncOperationInProgress";
const ERROR_ASYNC_OPERATION_IN_PROGRESS_MESSAGE: &str =
    "Another operation for this service instance is in progress. ";
const ERROR_NONBINDABLE_SERVICE_CLASS_REASON: &str = "ErrorNonbindableServiceClass";
const ERROR_INSTANCE_NOT_READY_REASON: &str = "ErrorInstanceNotReady";
const ERROR_BIND_CALL_REASON: &str = "BindCallFailed";
const ERROR_INJECTING_BIND_RESULT_REASON: &str = "ErrorInjectingBindResult";
const ERROR_EJECTING_BINDING_REASON: &str = "ErrorEjectingServiceBinding";
const ERROR_EJECTING_BINDING_MESSAGE: &str = "Error ejecting binding.";
const ERROR_UNBIND_CALL_REASON: &str = "UnbindCallFailed";
const SUCCESS_INJECTED_BIND_RESULT_REASON: &str = "InjectedBindResult";
const SUCCESS_INJECTED_BIND_RESULT_MESSAGE: &str = "Injected bind result";
const SUCCESS_UNBOUND_REASON: &str = "UnboundSuccessfully";
const SUCCESS_UNBOUND_MESSAGE: &str = "The binding was deleted successfully";

/// Secret value of a credential: strings verbatim, everything else as JSON.
fn credential_bytes(value: Value) -> Result<ByteString, ControllerError> {
    match value {
        Value::String(s) => Ok(ByteString(s.into_bytes())),
        other => Ok(ByteString(serde_json::to_vec(&other)?)),
    }
}

impl Controller {
    pub(crate) async fn reconcile_binding(
        &self,
        binding: ServiceBinding,
    ) -> Result<(), ControllerError> {
        let now = Utc::now();
        let mut binding = Modifications::new(binding);
        let deleting = binding.is_deleted();

        if !deleting {
            let checksum = binding_spec_checksum(&binding.spec);
            if binding.checksum() == Some(checksum.as_str()) {
                debug!(
                    "{}: not processing event because checksum showed there is no work to do",
                    pretty(&*binding)
                );
                return Ok(());
            }
        }
        if deleting && !binding.has_finalizer() {
            return Ok(());
        }
        if deleting && !binding.is_bound() {
            info!("{}: never bound, removing finalizer", pretty(&*binding));
            if let Err(e) = self.eject_binding(&binding).await {
                let s = format!("{} {}", ERROR_EJECTING_BINDING_MESSAGE, e);
                self.report_binding_failure(
                    &mut binding,
                    ConditionStatus::Unknown,
                    ERROR_EJECTING_BINDING_REASON,
                    &s,
                    now,
                )
                .await?;
                return Err(e);
            }
            binding.remove_finalizer(self.stores.bindings.as_ref()).await?;
            return Ok(());
        }

        let namespace = binding.namespace().unwrap_or_default();
        let instance_name = binding.spec.instance_ref.name.clone();
        let instance = match self.stores.instances.get(Some(&namespace), &instance_name).await {
            Ok(instance) => instance,
            Err(e) => {
                let s = format!(
                    "References a non-existent ServiceInstance \"{}/{}\": {}",
                    namespace, instance_name, e
                );
                self.report_binding_failure(
                    &mut binding,
                    ConditionStatus::False,
                    ERROR_NONEXISTENT_INSTANCE_REASON,
                    &s,
                    now,
                )
                .await?;
                return Err(if e.is_not_found() {
                    ControllerError::Reference(s)
                } else {
                    e.into()
                });
            }
        };
        if instance.is_async_op_in_progress() {
            let s = format!(
                "{}Trying to operate on ServiceBinding of {} which has an asynchronous operation in progress",
                ERROR_ASYNC_OPERATION_IN_PROGRESS_MESSAGE,
                pretty(&instance)
            );
            self.report_binding_failure(
                &mut binding,
                ConditionStatus::False,
                ERROR_ASYNC_OPERATION_IN_PROGRESS_REASON,
                &s,
                now,
            )
            .await?;
            return Err(ControllerError::AsyncOperationInProgress(s));
        }

        let refs = match self
            .resolve_references(&instance.spec.service_class_name, &instance.spec.plan_name)
            .await
        {
            Ok(refs) => refs,
            Err(failure) => {
                self.report_binding_failure(
                    &mut binding,
                    ConditionStatus::False,
                    failure.reason,
                    &failure.message,
                    now,
                )
                .await?;
                return Err(failure.error);
            }
        };

        if deleting {
            self.unbind(&mut binding, &instance, &refs, now).await
        } else {
            self.bind(&mut binding, &instance, &refs, now).await
        }
    }

    /// Emit a warning event and set the binding's Ready condition.
    async fn report_binding_failure(
        &self,
        binding: &mut Modifications<ServiceBinding>,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        warn!("{}: {}", pretty(&**binding), message);
        self.event(&**binding, EventType::Warning, reason, message);
        binding
            .status_mut()
            .conditions
            .set(READY, status, reason, message, now);
        binding.replace_status(self.stores.bindings.as_ref()).await?;
        Ok(())
    }

    async fn bind(
        &self,
        binding: &mut Modifications<ServiceBinding>,
        instance: &ServiceInstance,
        refs: &References,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        if !refs.plan.is_bindable(&refs.class) {
            let s = format!(
                "References a non-bindable {} and {} combination",
                pretty(&refs.class),
                pretty(&refs.plan)
            );
            self.report_binding_failure(
                binding,
                ConditionStatus::False,
                ERROR_NONBINDABLE_SERVICE_CLASS_REASON,
                &s,
                now,
            )
            .await?;
            return Ok(());
        }
        if !instance.conditions().is_some_and(|c| c.is_true(READY)) {
            let s = format!(
                "Binding cannot begin because referenced {} is not ready",
                pretty(instance)
            );
            self.report_binding_failure(
                binding,
                ConditionStatus::False,
                ERROR_INSTANCE_NOT_READY_REASON,
                &s,
                now,
            )
            .await?;
            return Err(ControllerError::NotReady(s));
        }

        let namespace = binding.namespace().unwrap_or_default();
        let parameters = match build_parameters(
            self.stores.secrets.as_ref(),
            &namespace,
            binding.spec.parameters.as_ref(),
            &binding.spec.parameters_from,
        )
        .await
        {
            Ok(parameters) => parameters,
            Err(e) => {
                let s = format!("Failed to prepare ServiceBinding parameters: {}", e);
                self.report_binding_failure(
                    binding,
                    ConditionStatus::False,
                    ERROR_WITH_PARAMETERS_REASON,
                    &s,
                    now,
                )
                .await?;
                return Err(e);
            }
        };

        let request = BindRequest {
            binding_id: binding.spec.external_id.clone(),
            instance_id: instance.spec.external_id.clone(),
            service_id: refs.class.spec.external_id.clone(),
            plan_id: refs.plan.spec.external_id.clone(),
            parameters,
        };
        debug!("{}: binding at {}", pretty(&**binding), pretty(&refs.broker));
        let response = match refs.client.bind(&request).await {
            Ok(response) => response,
            Err(e) => {
                let s = format!(
                    "Error creating ServiceBinding for {}: {}",
                    pretty(instance),
                    e
                );
                self.report_binding_failure(
                    binding,
                    ConditionStatus::False,
                    ERROR_BIND_CALL_REASON,
                    &s,
                    now,
                )
                .await?;
                return Err(e.into());
            }
        };

        binding.status_mut().bound = true;
        binding
            .replace_status(self.stores.bindings.as_ref())
            .await?;

        if let Err(e) = self
            .inject_binding_result(binding, response.credentials.unwrap_or_default())
            .await
        {
            let s = format!("Error injecting bind result: {}", e);
            self.report_binding_failure(
                binding,
                ConditionStatus::False,
                ERROR_INJECTING_BIND_RESULT_REASON,
                &s,
                now,
            )
            .await?;
            return Err(e);
        }

        let checksum = binding_spec_checksum(&binding.spec);
        let status = binding.status_mut();
        status.checksum = Some(checksum);
        status.conditions.set(
            READY,
            ConditionStatus::True,
            SUCCESS_INJECTED_BIND_RESULT_REASON,
            SUCCESS_INJECTED_BIND_RESULT_MESSAGE,
            now,
        );
        binding
            .replace_status(self.stores.bindings.as_ref())
            .await?;
        info!("{}: injected bind result", pretty(&**binding));
        self.event(
            &**binding,
            EventType::Normal,
            SUCCESS_INJECTED_BIND_RESULT_REASON,
            SUCCESS_INJECTED_BIND_RESULT_MESSAGE,
        );
        Ok(())
    }

    /// Write the credentials to the binding's secret, creating it if needed.
    ///
    /// An existing secret is only overwritten if the binding is its controller.
    async fn inject_binding_result(
        &self,
        binding: &ServiceBinding,
        credentials: Map<String, Value>,
    ) -> Result<(), ControllerError> {
        let data = credentials
            .into_iter()
            .map(|(k, v)| Ok((k, credential_bytes(v)?)))
            .collect::<Result<BTreeMap<_, _>, ControllerError>>()?;
        let namespace = binding.namespace().unwrap_or_default();
        let secret_name = binding.secret_name();

        match self.stores.secrets.get(Some(&namespace), &secret_name).await {
            Ok(existing) => self.update_binding_secret(binding, existing, data).await,
            Err(e) if e.is_not_found() => {
                let owner = binding.controller_owner_ref(&()).ok_or_else(|| {
                    ControllerError::Injection(format!(
                        "{} has no uid to own Secret \"{}/{}\"",
                        pretty(binding),
                        namespace,
                        secret_name
                    ))
                })?;
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(secret_name.clone()),
                        namespace: Some(namespace.clone()),
                        owner_references: Some(vec![owner]),
                        ..Default::default()
                    },
                    data: Some(data.clone()),
                    ..Default::default()
                };
                match self.stores.secrets.create(&secret).await {
                    Ok(_) => Ok(()),
                    Err(e) if e.is_already_exists() => {
                        debug!(
                            "{}: Secret \"{}/{}\" was created concurrently",
                            pretty(binding),
                            namespace,
                            secret_name
                        );
                        let existing = self
                            .stores
                            .secrets
                            .get(Some(&namespace), &secret_name)
                            .await?;
                        self.update_binding_secret(binding, existing, data).await
                    }
                    Err(e) => Err(e)?,
                }
            }
            Err(e) => Err(e)?,
        }
    }

    /// Overwrite the data of an existing secret controlled by the binding.
    async fn update_binding_secret(
        &self,
        binding: &ServiceBinding,
        mut existing: Secret,
        data: BTreeMap<String, ByteString>,
    ) -> Result<(), ControllerError> {
        if !is_controlled_by(&existing, &binding.uid().unwrap_or_default()) {
            return Err(ControllerError::Injection(format!(
                "Secret \"{}/{}\" is not owned by {}",
                existing.namespace().unwrap_or_default(),
                existing.name_any(),
                pretty(binding)
            )));
        }
        existing.data = Some(data);
        self.stores.secrets.update(&existing).await?;
        Ok(())
    }

    /// Delete the binding's secret if the binding owns it.
    async fn eject_binding(&self, binding: &ServiceBinding) -> Result<(), ControllerError> {
        let namespace = binding.namespace().unwrap_or_default();
        let secret_name = binding.secret_name();
        let uid = binding.uid().unwrap_or_default();
        match self.stores.secrets.get(Some(&namespace), &secret_name).await {
            Ok(secret) if is_controlled_by(&secret, &uid) => {
                match self.stores.secrets.delete(Some(&namespace), &secret_name).await {
                    Err(e) if !e.is_not_found() => Err(e)?,
                    _ => Ok(()),
                }
            }
            Ok(_) => {
                debug!(
                    "{}: Secret \"{}/{}\" is not owned by the binding, leaving it",
                    pretty(binding),
                    namespace,
                    secret_name
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e)?,
        }
    }

    async fn unbind(
        &self,
        binding: &mut Modifications<ServiceBinding>,
        instance: &ServiceInstance,
        refs: &References,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        if let Err(e) = self.eject_binding(binding).await {
            let s = format!("{} {}", ERROR_EJECTING_BINDING_MESSAGE, e);
            self.report_binding_failure(
                binding,
                ConditionStatus::Unknown,
                ERROR_EJECTING_BINDING_REASON,
                &s,
                now,
            )
            .await?;
            return Err(e);
        }

        let request = UnbindRequest {
            binding_id: binding.spec.external_id.clone(),
            instance_id: instance.spec.external_id.clone(),
            service_id: refs.class.spec.external_id.clone(),
            plan_id: refs.plan.spec.external_id.clone(),
        };
        debug!("{}: unbinding at {}", pretty(&**binding), pretty(&refs.broker));
        match refs.client.unbind(&request).await {
            Ok(()) => (),
            Err(e) if e.is_gone() => debug!("{}: already gone at the broker", pretty(&**binding)),
            Err(e) => {
                let s = format!("Error unbinding from {}: {}", pretty(instance), e);
                self.report_binding_failure(
                    binding,
                    ConditionStatus::False,
                    ERROR_UNBIND_CALL_REASON,
                    &s,
                    now,
                )
                .await?;
                return Err(e.into());
            }
        }

        let store = self.stores.bindings.as_ref();
        let status = binding.status_mut();
        status.bound = false;
        status.conditions.set(
            READY,
            ConditionStatus::False,
            SUCCESS_UNBOUND_REASON,
            SUCCESS_UNBOUND_MESSAGE,
            now,
        );
        binding.replace_status(store).await?;
        binding.remove_finalizer(store).await?;
        info!("{}: unbound successfully", pretty(&**binding));
        self.event(
            &**binding,
            EventType::Normal,
            SUCCESS_UNBOUND_REASON,
            SUCCESS_UNBOUND_MESSAGE,
        );
        Ok(())
    }
}
