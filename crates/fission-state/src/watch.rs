//! Change notifications emitted by the catalog.

use fission_core::{ConfigMap, Environment, Function, HttpTrigger, Package, Secret};

/// One committed change to a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Added(T),
    Updated { old: T, new: T },
    Deleted(T),
}

impl<T> Change<T> {
    /// The resource as it is after the change (the last state for deletes).
    pub fn current(&self) -> &T {
        match self {
            Self::Added(obj) | Self::Deleted(obj) => obj,
            Self::Updated { new, .. } => new,
        }
    }
}

/// A catalog change, tagged by resource kind.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogEvent {
    Function(Change<Function>),
    Environment(Change<Environment>),
    Package(Change<Package>),
    HttpTrigger(Change<HttpTrigger>),
    ConfigMap(Change<ConfigMap>),
    Secret(Change<Secret>),
}
