//! Control plane abstraction for the rental marketplace.
//!
//! The job orchestration core only needs four things from the control plane:
//! a fresh snapshot of an instance, a way to request a state change, a way to
//! destroy an instance, and a way to rent a new one. [`ControlPlane`] captures
//! that contract so orchestration can be exercised against a fake, while
//! [`VastClient`] implements it over the REST API.

mod client;
mod error;
mod types;

use std::future::Future;
use std::pin::Pin;

pub use client::{DEFAULT_SERVER_URL, VastClient};
pub use error::ControlPlaneError;
pub use types::{
    CreateInstanceRequest, DEFAULT_DISK_GB, Endpoint, Instance, InstanceId, InstanceState,
    TargetState,
};

/// Future returned by control plane operations.
pub type ControlPlaneFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Operations the orchestrator consumes from the control plane.
pub trait ControlPlane {
    /// Provider specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetches the current snapshot of `id`.
    fn instance(&self, id: InstanceId) -> ControlPlaneFuture<'_, Instance, Self::Error>;

    /// Requests a state transition. The call returns once the request is
    /// accepted, not once the transition completes.
    fn set_state(
        &self,
        id: InstanceId,
        state: TargetState,
    ) -> ControlPlaneFuture<'_, (), Self::Error>;

    /// Irreversibly destroys `id`.
    fn destroy(&self, id: InstanceId) -> ControlPlaneFuture<'_, (), Self::Error>;

    /// Rents a new instance and returns its identifier.
    fn create<'a>(
        &'a self,
        request: &'a CreateInstanceRequest,
    ) -> ControlPlaneFuture<'a, InstanceId, Self::Error>;
}
