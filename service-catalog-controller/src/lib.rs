//! Reconciliation controller for service brokers, their catalogs, and the
//! instances and bindings provisioned from them.
//!
//! The resource store, the broker wire protocol and event delivery are
//! collaborators behind the [`Store`], [`BrokerClientFactory`] and
//! [`EventRecorder`] traits; the embedding process wires them up, feeds watch
//! callbacks into the `on_*` handlers of [`Controller`] and calls
//! [`Controller::run`].

#[macro_use]
extern crate log;

mod binding_controller;
mod broker_controller;
pub mod brokerapi;
mod class_controller;
pub mod config;
mod controller;
pub mod errors;
pub mod events;
mod instance_controller;
mod metrics;
mod modifications;
mod parameters;
pub mod queue;
pub mod store;
#[cfg(test)]
mod testing;
mod utils;
mod worker;

pub use brokerapi::{BrokerClient, BrokerClientFactory, BrokerError, ClientConfiguration};
pub use config::ControllerConfig;
pub use controller::{Controller, ResourceKind, Stores};
pub use errors::{ControllerError, StoreError};
pub use events::{EventRecorder, EventType, LogEventRecorder};
pub use store::{FieldSelectable, Selector, Store};

/// The finalizer guarding external cleanup of brokers, instances and bindings.
///
/// Renaming it strands objects carrying the old name, they would never be
/// released.
pub const FINALIZER: &str = "kubernetes-incubator/service-catalog";
