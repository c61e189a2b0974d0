use std::ops::{Deref, DerefMut};

use json_patch::diff;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use service_catalog_apis::{
    ServiceBinding, ServiceBroker, ServiceClass, ServiceInstance, ServicePlan,
};

use crate::{
    FINALIZER,
    errors::ControllerError,
    store::{Store, object_key},
};

/// Objects with a status sub-resource.
pub(crate) trait StatusSubresource {
    type Status: Serialize;

    fn status_ref(&self) -> Option<&Self::Status>;
}

macro_rules! status_subresource {
    ($($kind:ty => $status:ty),* $(,)?) => {
        $(
            impl StatusSubresource for $kind {
                type Status = $status;

                fn status_ref(&self) -> Option<&Self::Status> {
                    self.status.as_ref()
                }
            }
        )*
    };
}

status_subresource!(
    ServiceBroker => service_catalog_apis::ServiceBrokerStatus,
    ServiceClass => service_catalog_apis::ServiceClassStatus,
    ServicePlan => service_catalog_apis::ServicePlanStatus,
    ServiceInstance => service_catalog_apis::ServiceInstanceStatus,
    ServiceBinding => service_catalog_apis::ServiceBindingStatus,
);

/// Mutable copy of an object read from the store.
///
/// Store reads are immutable snapshots, reconcilers only edit the copy and
/// [`Modifications::replace_status`] writes it back if the status differs
/// from the snapshot.
pub(crate) struct Modifications<K> {
    original: K,
    pub modified: K,
}

impl<K> Deref for Modifications<K> {
    type Target = K;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl<K> DerefMut for Modifications<K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

impl<K> Modifications<K>
where
    K: Resource<DynamicType = ()> + StatusSubresource + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(original: K) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    pub(crate) fn key(&self) -> String {
        object_key(&self.original)
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.original.meta().deletion_timestamp.is_some()
    }

    pub(crate) fn has_finalizer(&self) -> bool {
        self.original.finalizers().iter().any(|f| f == FINALIZER)
    }

    fn get_status_patch(&self) -> Result<Option<json_patch::Patch>, ControllerError> {
        let patch = diff(
            &serde_json::to_value(self.original.status_ref())?,
            &serde_json::to_value(self.modified.status_ref())?,
        );
        if patch.0.is_empty() {
            Ok(None)
        } else {
            Ok(Some(patch))
        }
    }

    /// Write the status back if it was modified, returns whether a write happened.
    pub(crate) async fn replace_status(
        &mut self,
        store: &dyn Store<K>,
    ) -> Result<bool, ControllerError> {
        match self.get_status_patch()? {
            Some(patch) => {
                debug!(
                    "{} \"{}\": update status with {}",
                    K::kind(&()),
                    self.key(),
                    serde_json::to_string(&patch)?
                );
                self.modified = store.update_status(&self.modified).await?;
                self.original = self.modified.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove our finalizer from the latest revision of the object.
    pub(crate) async fn remove_finalizer(
        &mut self,
        store: &dyn Store<K>,
    ) -> Result<bool, ControllerError> {
        let namespace = self.original.namespace();
        let name = self.original.name_any();
        let mut latest = match store.get(namespace.as_deref(), name.as_str()).await {
            Ok(latest) => latest,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => Err(e)?,
        };
        let finalizers = latest.finalizers_mut();
        let len = finalizers.len();
        finalizers.retain(|f| f != FINALIZER);
        if finalizers.len() == len {
            return Ok(false);
        }
        match store.update(&latest).await {
            Ok(updated) => {
                debug!("{} \"{}\": removed finalizer", K::kind(&()), self.key());
                self.original = updated.clone();
                self.modified = updated;
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e)?,
        }
    }
}
