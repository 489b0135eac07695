//! Lease module wiring.
//!
//! `types` defines the shared replica-set types and trait contracts, `local`
//! holds an in-process coordinator used by single-node deployments and tests.

mod local;
mod types;

pub use local::{CoordinatorCall, LocalCoordinator};
pub use types::{
    CellId, FileCredentials, LeaseCoordinator, LeaseState, ReplicaDescriptor, ReplicaPolicy,
    ViewListener, ViewState, CELL_PREFIX,
};
