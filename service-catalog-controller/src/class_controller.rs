use kube::ResourceExt;
use service_catalog_apis::{ServiceClass, ServicePlan};

use crate::{
    controller::{Controller, pretty},
    errors::ControllerError,
    store::{FIELD_PLAN_NAME, FIELD_SERVICE_CLASS_NAME, Selector},
};

impl Controller {
    /// Delete a class its broker stopped listing once no instance uses it.
    pub(crate) async fn reconcile_service_class(
        &self,
        class: ServiceClass,
    ) -> Result<(), ControllerError> {
        if !class.is_removed_from_broker_catalog() {
            return Ok(());
        }
        let selector = Selector::all().with_field(FIELD_SERVICE_CLASS_NAME, &class.name_any());
        let instances = self.stores.instances.list(&selector).await?;
        if !instances.is_empty() {
            debug!(
                "{}: removed from the broker catalog, still used by {} instances",
                pretty(&class),
                instances.len()
            );
            return Ok(());
        }
        info!(
            "{}: removed from the broker catalog and unused, deleting",
            pretty(&class)
        );
        match self.stores.service_classes.delete(None, &class.name_any()).await {
            Err(e) if !e.is_not_found() => Err(e)?,
            _ => Ok(()),
        }
    }

    /// Delete a plan its broker stopped listing once no instance uses it.
    pub(crate) async fn reconcile_service_plan(
        &self,
        plan: ServicePlan,
    ) -> Result<(), ControllerError> {
        if !plan.is_removed_from_broker_catalog() {
            return Ok(());
        }
        let selector = Selector::all()
            .with_field(FIELD_SERVICE_CLASS_NAME, &plan.spec.service_class_name)
            .with_field(FIELD_PLAN_NAME, &plan.spec.external_name);
        let instances = self.stores.instances.list(&selector).await?;
        if !instances.is_empty() {
            debug!(
                "{}: removed from the broker catalog, still used by {} instances",
                pretty(&plan),
                instances.len()
            );
            return Ok(());
        }
        info!(
            "{}: removed from the broker catalog and unused, deleting",
            pretty(&plan)
        );
        match self.stores.service_plans.delete(None, &plan.name_any()).await {
            Err(e) if !e.is_not_found() => Err(e)?,
            _ => Ok(()),
        }
    }
}
