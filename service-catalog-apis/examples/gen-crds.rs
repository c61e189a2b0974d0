use kube::CustomResourceExt;
use service_catalog_apis::{ServiceBinding, ServiceBroker, ServiceClass, ServiceInstance, ServicePlan};
use serde_yaml;

pub fn main() {
    let crds = [
        ServiceBroker::crd(),
        ServiceClass::crd(),
        ServicePlan::crd(),
        ServiceInstance::crd(),
        ServiceBinding::crd(),
    ];
    for crd in crds {
        println!("---\n{}", serde_yaml::to_string(&crd).unwrap());
    }
}
