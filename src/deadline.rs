//! Overall job deadline and the budget threaded between wait stages.
//!
//! Time is read from `tokio::time::Instant`, so tests running on a paused
//! runtime drive every wait loop deterministically.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Point in time by which the unbounded-wait stages must have finished.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    /// Starts a deadline `budget` from now.
    #[must_use]
    pub fn after(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    /// Total budget the deadline was created with.
    #[must_use]
    pub const fn budget(&self) -> Duration {
        self.budget
    }

    /// Time spent since the deadline started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Budget left for the next stage. Never negative: an overspent deadline
    /// yields [`Duration::ZERO`].
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    /// Returns `true` once no budget remains.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Builds the error reported when `stage` runs out of budget.
    #[must_use]
    pub fn exceeded(&self, stage: WaitStage) -> DeadlineExceeded {
        DeadlineExceeded {
            stage,
            elapsed: self.elapsed(),
            budget: self.budget,
        }
    }
}

/// Wait stages that are bounded by the job deadline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitStage {
    /// Waiting for the control plane to report the instance running.
    Running,
    /// Waiting for the SSH endpoint to accept a session.
    Connectable,
}

impl fmt::Display for WaitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("instance start"),
            Self::Connectable => f.write_str("ssh connection"),
        }
    }
}

/// Raised when a wait stage exhausts the budget handed to it.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error(
    "{stage} did not complete in {secs:.1}s (budget {budget:?})",
    secs = .elapsed.as_secs_f64()
)]
pub struct DeadlineExceeded {
    /// Stage that ran out of time.
    pub stage: WaitStage,
    /// Time spent in the stage before giving up.
    pub elapsed: Duration,
    /// Budget the stage was given.
    pub budget: Duration,
}
