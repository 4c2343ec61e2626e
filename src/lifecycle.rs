//! Polling the control plane until an instance reports the running state.

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::control_plane::{ControlPlane, Instance, InstanceId};
use crate::deadline::{Deadline, DeadlineExceeded, WaitStage};

/// Interval between control plane lookups while waiting for an instance.
pub const RUNNING_POLL_INTERVAL: Duration = Duration::from_secs(45);

/// Errors raised while waiting for an instance to start.
#[derive(Debug, Error)]
pub enum WaitError<E>
where
    E: std::error::Error + 'static,
{
    /// The instance did not report running within the budget.
    #[error(transparent)]
    DeadlineExceeded(#[from] DeadlineExceeded),
    /// A lookup failed; lookups are not retried.
    #[error("instance lookup failed: {0}")]
    ControlPlane(#[source] E),
}

/// Polls the control plane for a fresh snapshot until the instance runs.
#[derive(Debug)]
pub struct InstanceLifecycleWaiter<'a, C> {
    control_plane: &'a C,
    poll_interval: Duration,
}

impl<'a, C> InstanceLifecycleWaiter<'a, C>
where
    C: ControlPlane,
{
    /// Creates a waiter polling at [`RUNNING_POLL_INTERVAL`].
    #[must_use]
    pub const fn new(control_plane: &'a C) -> Self {
        Self {
            control_plane,
            poll_interval: RUNNING_POLL_INTERVAL,
        }
    }

    /// Overrides the polling interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Waits until `id` is running and returns the snapshot that said so.
    ///
    /// The instance's state is never changed here; callers request a start
    /// before waiting. A zero `timeout` fails without polling.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::DeadlineExceeded`] when `timeout` elapses first,
    /// or [`WaitError::ControlPlane`] when a lookup fails.
    pub async fn wait_until_running(
        &self,
        id: InstanceId,
        timeout: Duration,
    ) -> Result<Instance, WaitError<C::Error>> {
        info!(instance = %id, budget = ?timeout, "waiting for instance to start");
        let deadline = Deadline::after(timeout);

        while !deadline.is_expired() {
            let instance = self
                .control_plane
                .instance(id)
                .await
                .map_err(WaitError::ControlPlane)?;
            debug!(instance = %id, state = %instance.state, elapsed = ?deadline.elapsed(), "polled instance");
            if instance.state.is_running() {
                return Ok(instance);
            }

            sleep(self.poll_interval.min(deadline.remaining())).await;
        }

        Err(deadline.exceeded(WaitStage::Running).into())
    }
}
