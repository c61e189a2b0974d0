use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use kube::{Resource, ResourceExt};
use service_catalog_apis::{
    ConditionStatus, FAILED, NamespacedSecretReference, READY, RelistBehavior, ServiceBroker,
    ServiceBrokerAuthInfo, ServiceClass, ServiceClassSpec, ServicePlan, ServicePlanSpec,
    service_plan_name,
};

use crate::{
    brokerapi::{AuthConfig, BrokerClient, CatalogResponse, ClientConfiguration},
    controller::{Controller, pretty},
    errors::ControllerError,
    events::EventType,
    modifications::{Modifications, StatusSubresource},
    parameters::fetch_secret_key,
    store::{FIELD_BROKER_NAME, Selector, Store},
    utils::retry_window_elapsed,
};

const ERROR_FETCHING_CATALOG_REASON: &str = "ErrorFetchingCatalog";
const ERROR_FETCHING_CATALOG_MESSAGE: &str = "Error fetching catalog. ";
const ERROR_SYNCING_CATALOG_REASON: &str = "ErrorSyncingCatalog";
const ERROR_SYNCING_CATALOG_MESSAGE: &str = "Error syncing catalog from ServiceBroker. ";
const ERROR_LISTING_SERVICE_CLASSES_REASON: &str = "ErrorListingServiceClasses";
const ERROR_LISTING_SERVICE_PLANS_REASON: &str = "ErrorListingServicePlans";
const ERROR_DELETING_SERVICE_CLASS_REASON: &str = "ErrorDeletingServiceClass";
const ERROR_DELETING_SERVICE_CLASS_MESSAGE: &str = "Error deleting service class. ";
const ERROR_DELETING_SERVICE_PLAN_REASON: &str = "ErrorDeletingServicePlan";
const ERROR_DELETING_SERVICE_PLAN_MESSAGE: &str = "Error deleting service plan. ";
pub(crate) const ERROR_AUTH_CREDENTIALS_REASON: &str = "ErrorGettingAuthCredentials";
pub(crate) const ERROR_RECONCILIATION_RETRY_TIMEOUT_REASON: &str =
    "ErrorReconciliationRetryTimeout";
const SUCCESS_FETCHED_CATALOG_REASON: &str = "FetchedCatalog";
const SUCCESS_FETCHED_CATALOG_MESSAGE: &str = "Successfully fetched catalog entries from broker.";
const SUCCESS_BROKER_DELETED_REASON: &str = "DeletedSuccessfully";

/// Whether `broker` needs to be reconciled at `now`.
///
/// Brokers are reconciled on spec changes, deletion and while not Ready.
/// Ready brokers are only relisted if their relist behavior is `Duration`
/// and the relist duration has passed since the last catalog fetch.
pub(crate) fn should_reconcile_broker(broker: &ServiceBroker, now: DateTime<Utc>) -> bool {
    let generation = broker.metadata.generation.unwrap_or(0);
    let status = broker.status.as_ref();
    if status.map_or(0, |s| s.reconciled_generation) != generation {
        return true;
    }
    if broker.metadata.deletion_timestamp.is_some() {
        return true;
    }
    let Some(ready) = status.and_then(|s| s.conditions.get(READY)) else {
        return true;
    };
    if ready.status != ConditionStatus::True {
        return true;
    }
    match broker.spec.relist_behavior {
        RelistBehavior::Manual => {
            trace!("{}: not processing because RelistBehavior is set to Manual", pretty(broker));
            false
        }
        RelistBehavior::Duration => match broker.spec.relist_duration_seconds {
            None => {
                error!(
                    "{}: unable to process because RelistBehavior is set to Duration with no relistDurationSeconds",
                    pretty(broker)
                );
                false
            }
            Some(seconds) => {
                let last_relist = status
                    .and_then(|s| s.last_catalog_retrieval_time)
                    .unwrap_or(ready.last_transition_time);
                let due = now > last_relist + chrono::Duration::seconds(seconds as i64);
                if !due {
                    trace!(
                        "{}: not processing because the relist duration has not elapsed",
                        pretty(broker)
                    );
                }
                due
            }
        },
    }
}

/// Convert the broker's catalog into the classes and plans it offers.
pub(crate) fn convert_catalog(
    broker_name: &str,
    catalog: &CatalogResponse,
) -> Result<(Vec<ServiceClass>, Vec<ServicePlan>), ControllerError> {
    let mut classes = Vec::with_capacity(catalog.services.len());
    let mut plans = Vec::new();
    for service in &catalog.services {
        if service.id.is_empty() || service.name.is_empty() {
            return Err(ControllerError::Catalog(format!(
                "service {:?} ({:?}) is missing its id or name",
                service.name, service.id
            )));
        }
        if classes
            .iter()
            .any(|c: &ServiceClass| c.spec.external_name == service.name)
        {
            return Err(ControllerError::Catalog(format!(
                "service name {:?} is used more than once",
                service.name
            )));
        }
        classes.push(ServiceClass::new(
            &service.name,
            ServiceClassSpec {
                broker_name: broker_name.to_string(),
                external_id: service.id.clone(),
                external_name: service.name.clone(),
                description: service.description.clone(),
                bindable: service.bindable,
                plan_updatable: service.plan_updatable,
                tags: service.tags.clone(),
                requires: service.requires.clone(),
                external_metadata: service.metadata.clone(),
            },
        ));
        for plan in &service.plans {
            if plan.id.is_empty() || plan.name.is_empty() {
                return Err(ControllerError::Catalog(format!(
                    "plan {:?} ({:?}) of service {:?} is missing its id or name",
                    plan.name, plan.id, service.name
                )));
            }
            let schemas = plan.schemas.clone().unwrap_or_default();
            plans.push(ServicePlan::new(
                &service_plan_name(&service.name, &plan.name),
                ServicePlanSpec {
                    broker_name: broker_name.to_string(),
                    service_class_name: service.name.clone(),
                    external_id: plan.id.clone(),
                    external_name: plan.name.clone(),
                    description: plan.description.clone(),
                    bindable: plan.bindable,
                    free: plan.free.unwrap_or(false),
                    external_metadata: plan.metadata.clone(),
                    instance_create_parameter_schema: schemas.instance_create,
                    instance_update_parameter_schema: schemas.instance_update,
                    service_binding_create_parameter_schema: schemas.binding_create,
                },
            ));
        }
    }
    Ok((classes, plans))
}

/// Classes and plans created from a broker catalog.
pub(crate) trait CatalogEntry:
    Resource<DynamicType = ()> + StatusSubresource + PartialEq + Clone + Send + Sync + 'static
{
    fn broker_name(&self) -> &str;
    fn external_id(&self) -> &str;
    /// Copy the fields a broker may change over time.
    fn update_mutable_fields(&mut self, from: &Self);
    fn is_removed(&self) -> bool;
    fn set_removed(&mut self, removed: bool);
}

impl CatalogEntry for ServiceClass {
    fn broker_name(&self) -> &str {
        &self.spec.broker_name
    }

    fn external_id(&self) -> &str {
        &self.spec.external_id
    }

    fn update_mutable_fields(&mut self, from: &Self) {
        self.spec.bindable = from.spec.bindable;
        self.spec.plan_updatable = from.spec.plan_updatable;
        self.spec.tags = from.spec.tags.clone();
        self.spec.description = from.spec.description.clone();
        self.spec.requires = from.spec.requires.clone();
        self.spec.external_name = from.spec.external_name.clone();
        self.spec.external_metadata = from.spec.external_metadata.clone();
    }

    fn is_removed(&self) -> bool {
        self.is_removed_from_broker_catalog()
    }

    fn set_removed(&mut self, removed: bool) {
        self.status
            .get_or_insert_with(Default::default)
            .removed_from_broker_catalog = removed;
    }
}

impl CatalogEntry for ServicePlan {
    fn broker_name(&self) -> &str {
        &self.spec.broker_name
    }

    fn external_id(&self) -> &str {
        &self.spec.external_id
    }

    fn update_mutable_fields(&mut self, from: &Self) {
        self.spec.description = from.spec.description.clone();
        self.spec.bindable = from.spec.bindable;
        self.spec.free = from.spec.free;
        self.spec.external_name = from.spec.external_name.clone();
        self.spec.external_metadata = from.spec.external_metadata.clone();
        self.spec.instance_create_parameter_schema =
            from.spec.instance_create_parameter_schema.clone();
        self.spec.instance_update_parameter_schema =
            from.spec.instance_update_parameter_schema.clone();
        self.spec.service_binding_create_parameter_schema =
            from.spec.service_binding_create_parameter_schema.clone();
    }

    fn is_removed(&self) -> bool {
        self.is_removed_from_broker_catalog()
    }

    fn set_removed(&mut self, removed: bool) {
        self.status
            .get_or_insert_with(Default::default)
            .removed_from_broker_catalog = removed;
    }
}

/// Create or update a single catalog entry of `broker_name`.
async fn sync_catalog_entry<K: CatalogEntry>(
    store: &dyn Store<K>,
    broker_name: &str,
    payload: K,
    existing: Option<K>,
) -> Result<(), ControllerError> {
    let existing = match existing {
        Some(existing) => existing,
        None => match store.get(None, &payload.name_any()).await {
            Ok(other) if other.broker_name() != broker_name => {
                return Err(ControllerError::Ownership(format!(
                    "{} already exists for ServiceBroker \"{}\"",
                    pretty(&payload),
                    other.broker_name()
                )));
            }
            Ok(other) => other,
            Err(e) if e.is_not_found() => {
                debug!("{}: fresh entry, creating", pretty(&payload));
                store.create(&payload).await?;
                return Ok(());
            }
            Err(e) => Err(e)?,
        },
    };
    if existing.external_id() != payload.external_id() {
        return Err(ControllerError::Ownership(format!(
            "{} already exists with external ID \"{}\", received different external ID \"{}\"",
            pretty(&payload),
            existing.external_id(),
            payload.external_id()
        )));
    }
    let mut updated = existing.clone();
    updated.update_mutable_fields(&payload);
    if updated != existing {
        debug!("{}: updating from catalog", pretty(&payload));
        updated = store.update(&updated).await?;
    }
    if updated.is_removed() {
        info!("{}: listed in the broker catalog again", pretty(&updated));
        let mut entry = Modifications::new(updated);
        entry.set_removed(false);
        entry.replace_status(store).await?;
    }
    Ok(())
}

/// Sync all catalog entries of one kind and mark the ones missing from the
/// payload as removed.
async fn sync_catalog_entries<K: CatalogEntry>(
    store: &dyn Store<K>,
    broker_name: &str,
    payload: Vec<K>,
    existing: Vec<K>,
) -> Result<(), ControllerError> {
    let mut existing: HashMap<String, K> =
        existing.into_iter().map(|e| (e.name_any(), e)).collect();
    for entry in payload {
        let current = existing.remove(&entry.name_any());
        sync_catalog_entry(store, broker_name, entry, current).await?;
    }
    for (_, entry) in existing {
        if entry.is_removed() {
            continue;
        }
        info!(
            "{}: has been removed from the broker catalog, marking",
            pretty(&entry)
        );
        let mut entry = Modifications::new(entry);
        entry.set_removed(true);
        entry.replace_status(store).await?;
    }
    Ok(())
}

impl Controller {
    pub(crate) async fn reconcile_broker(
        &self,
        broker: ServiceBroker,
    ) -> Result<(), ControllerError> {
        let now = Utc::now();
        if !should_reconcile_broker(&broker, now) {
            return Ok(());
        }
        let mut broker = Modifications::new(broker);
        debug!("{}: processing", pretty(&*broker));
        if broker.is_deleted() {
            self.finalize_broker(&mut broker, now).await
        } else {
            self.sync_broker_catalog(&mut broker, now).await
        }
    }

    /// Client for `broker`, configured with its resolved credentials.
    pub(crate) async fn broker_client(
        &self,
        broker: &ServiceBroker,
    ) -> Result<Arc<dyn BrokerClient>, ControllerError> {
        let auth_config = self.broker_auth_config(broker).await?;
        let config = ClientConfiguration {
            name: broker.name_any(),
            url: broker.spec.url.clone(),
            auth_config,
        };
        self.broker_clients.create(&config).map_err(|e| {
            ControllerError::AuthCredentials(format!(
                "error creating client for broker \"{}\": {}",
                config.name, e
            ))
        })
    }

    async fn broker_auth_config(
        &self,
        broker: &ServiceBroker,
    ) -> Result<Option<AuthConfig>, ControllerError> {
        match &broker.spec.auth_info {
            None => Ok(None),
            Some(ServiceBrokerAuthInfo {
                basic: Some(basic), ..
            }) => Ok(Some(AuthConfig::Basic {
                username: self.auth_secret_value(&basic.secret_ref, "username").await?,
                password: self.auth_secret_value(&basic.secret_ref, "password").await?,
            })),
            Some(ServiceBrokerAuthInfo {
                bearer: Some(bearer),
                ..
            }) => Ok(Some(AuthConfig::Bearer {
                token: self.auth_secret_value(&bearer.secret_ref, "token").await?,
            })),
            Some(_) => Err(ControllerError::AuthCredentials(
                "authInfo must specify either basic or bearer credentials".to_string(),
            )),
        }
    }

    async fn auth_secret_value(
        &self,
        secret_ref: &NamespacedSecretReference,
        key: &str,
    ) -> Result<String, ControllerError> {
        let value = fetch_secret_key(
            self.stores.secrets.as_ref(),
            &secret_ref.namespace,
            &secret_ref.name,
            key,
        )
        .await
        .map_err(|e| ControllerError::AuthCredentials(e.to_string()))?;
        String::from_utf8(value).map_err(|e| {
            ControllerError::AuthCredentials(format!(
                "secret {}/{} key {} is not valid UTF-8: {}",
                secret_ref.namespace, secret_ref.name, key, e
            ))
        })
    }

    async fn sync_broker_catalog(
        &self,
        broker: &mut Modifications<ServiceBroker>,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let store = self.stores.brokers.as_ref();
        let client = match self.broker_client(broker).await {
            Ok(client) => client,
            Err(e) => {
                let s = format!("Error getting broker auth credentials: {}", e);
                info!("{}: {}", pretty(&**broker), s);
                self.event(&**broker, EventType::Warning, ERROR_AUTH_CREDENTIALS_REASON, &s);
                broker.status_mut().conditions.set(
                    READY,
                    ConditionStatus::False,
                    ERROR_FETCHING_CATALOG_REASON,
                    &format!("{}{}", ERROR_FETCHING_CATALOG_MESSAGE, s),
                    now,
                );
                broker.replace_status(store).await?;
                return Err(e);
            }
        };

        let catalog = match client.get_catalog().await {
            Ok(catalog) => catalog,
            Err(e) => {
                let s = format!("Error getting broker catalog: {}", e);
                warn!("{}: {}", pretty(&**broker), s);
                self.event(&**broker, EventType::Warning, ERROR_FETCHING_CATALOG_REASON, &s);
                let generation = broker.metadata.generation.unwrap_or(0);
                let retry_duration = self.config.reconciliation_retry_duration;
                let status = broker.status_mut();
                status.conditions.set(
                    READY,
                    ConditionStatus::False,
                    ERROR_FETCHING_CATALOG_REASON,
                    &format!("{}{}", ERROR_FETCHING_CATALOG_MESSAGE, s),
                    now,
                );
                match status.operation_start_time {
                    None => status.operation_start_time = Some(now),
                    Some(start) if retry_window_elapsed(start, now, retry_duration) => {
                        let s = "Stopping reconciliation retries because too much time has elapsed";
                        status.operation_start_time = None;
                        status.reconciled_generation = generation;
                        status.conditions.set(
                            FAILED,
                            ConditionStatus::True,
                            ERROR_RECONCILIATION_RETRY_TIMEOUT_REASON,
                            s,
                            now,
                        );
                        info!("{}: {}", pretty(&**broker), s);
                        self.event(
                            &**broker,
                            EventType::Warning,
                            ERROR_RECONCILIATION_RETRY_TIMEOUT_REASON,
                            s,
                        );
                        broker.replace_status(store).await?;
                        return Ok(());
                    }
                    Some(_) => (),
                }
                broker.replace_status(store).await?;
                return Err(e.into());
            }
        };
        debug!(
            "{}: successfully fetched {} catalog entries",
            pretty(&**broker),
            catalog.services.len()
        );
        broker.status_mut().operation_start_time = None;

        if let Err(e) = self.sync_catalog(broker, &catalog).await {
            let s = e.to_string();
            warn!("{}: {}", pretty(&**broker), s);
            self.event(&**broker, EventType::Warning, ERROR_SYNCING_CATALOG_REASON, &s);
            broker.status_mut().conditions.set(
                READY,
                ConditionStatus::False,
                ERROR_SYNCING_CATALOG_REASON,
                &format!("{}{}", ERROR_SYNCING_CATALOG_MESSAGE, s),
                now,
            );
            broker.replace_status(store).await?;
            return Err(e);
        }

        let generation = broker.metadata.generation.unwrap_or(0);
        let status = broker.status_mut();
        status.conditions.set(
            READY,
            ConditionStatus::True,
            SUCCESS_FETCHED_CATALOG_REASON,
            SUCCESS_FETCHED_CATALOG_MESSAGE,
            now,
        );
        status.reconciled_generation = generation;
        status.last_catalog_retrieval_time = Some(now);
        broker.replace_status(store).await?;
        self.event(
            &**broker,
            EventType::Normal,
            SUCCESS_FETCHED_CATALOG_REASON,
            SUCCESS_FETCHED_CATALOG_MESSAGE,
        );
        Ok(())
    }

    async fn sync_catalog(
        &self,
        broker: &ServiceBroker,
        catalog: &CatalogResponse,
    ) -> Result<(), ControllerError> {
        let broker_name = broker.name_any();
        let (classes, plans) = convert_catalog(&broker_name, catalog)?;
        if classes.is_empty() {
            return Err(ControllerError::Catalog(format!(
                "Error getting catalog payload for broker \"{}\"; received zero services; at least one service is required",
                broker_name
            )));
        }
        let selector = Selector::all().with_field(FIELD_BROKER_NAME, &broker_name);
        let existing_classes = self.stores.service_classes.list(&selector).await?;
        let existing_plans = self.stores.service_plans.list(&selector).await?;
        sync_catalog_entries(
            self.stores.service_classes.as_ref(),
            &broker_name,
            classes,
            existing_classes,
        )
        .await?;
        sync_catalog_entries(
            self.stores.service_plans.as_ref(),
            &broker_name,
            plans,
            existing_plans,
        )
        .await
    }

    /// Delete all classes and plans of the broker, then release the finalizer.
    async fn finalize_broker(
        &self,
        broker: &mut Modifications<ServiceBroker>,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        if !broker.has_finalizer() {
            return Ok(());
        }
        let store = self.stores.brokers.as_ref();
        let broker_name = broker.name_any();
        let selector = Selector::all().with_field(FIELD_BROKER_NAME, &broker_name);

        let plans = match self.stores.service_plans.list(&selector).await {
            Ok(plans) => plans,
            Err(e) => {
                self.event(
                    &**broker,
                    EventType::Warning,
                    ERROR_LISTING_SERVICE_PLANS_REASON,
                    &e.to_string(),
                );
                Err(e)?
            }
        };
        let classes = match self.stores.service_classes.list(&selector).await {
            Ok(classes) => classes,
            Err(e) => {
                self.event(
                    &**broker,
                    EventType::Warning,
                    ERROR_LISTING_SERVICE_CLASSES_REASON,
                    &e.to_string(),
                );
                Err(e)?
            }
        };
        debug!(
            "{}: deleting {} ServiceClasses and {} ServicePlans",
            pretty(&**broker),
            classes.len(),
            plans.len()
        );

        for plan in plans {
            match self.stores.service_plans.delete(None, &plan.name_any()).await {
                Ok(()) => (),
                Err(e) if e.is_not_found() => (),
                Err(e) => {
                    let s = format!("Error deleting {}: {}", pretty(&plan), e);
                    warn!("{}: {}", pretty(&**broker), s);
                    self.event(
                        &**broker,
                        EventType::Warning,
                        ERROR_DELETING_SERVICE_PLAN_REASON,
                        &s,
                    );
                    broker.status_mut().conditions.set(
                        READY,
                        ConditionStatus::Unknown,
                        ERROR_DELETING_SERVICE_PLAN_REASON,
                        &format!("{}{}", ERROR_DELETING_SERVICE_PLAN_MESSAGE, s),
                        now,
                    );
                    broker.replace_status(store).await?;
                    Err(e)?
                }
            }
        }
        for class in classes {
            match self.stores.service_classes.delete(None, &class.name_any()).await {
                Ok(()) => (),
                Err(e) if e.is_not_found() => (),
                Err(e) => {
                    let s = format!("Error deleting {}: {}", pretty(&class), e);
                    warn!("{}: {}", pretty(&**broker), s);
                    self.event(
                        &**broker,
                        EventType::Warning,
                        ERROR_DELETING_SERVICE_CLASS_REASON,
                        &s,
                    );
                    broker.status_mut().conditions.set(
                        READY,
                        ConditionStatus::Unknown,
                        ERROR_DELETING_SERVICE_CLASS_REASON,
                        &format!("{}{}", ERROR_DELETING_SERVICE_CLASS_MESSAGE, s),
                        now,
                    );
                    broker.replace_status(store).await?;
                    Err(e)?
                }
            }
        }

        broker.status_mut().conditions.set(
            READY,
            ConditionStatus::False,
            SUCCESS_BROKER_DELETED_REASON,
            "The broker was deleted successfully",
            now,
        );
        broker.replace_status(store).await?;
        broker.remove_finalizer(store).await?;
        self.event(
            &**broker,
            EventType::Normal,
            SUCCESS_BROKER_DELETED_REASON,
            &format!("The broker {} was deleted successfully.", broker_name),
        );
        info!("{}: successfully deleted", pretty(&**broker));
        Ok(())
    }
}
