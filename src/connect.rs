//! Retrying login checks until an instance accepts SSH logins.

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::control_plane::Endpoint;
use crate::deadline::{Deadline, DeadlineExceeded, WaitStage};
use crate::ssh::{RemoteShell, Session};

/// Interval between session attempts while the endpoint refuses logins.
pub const CONNECT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// A session attempt failed in a way retrying cannot fix.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("ssh connection to {endpoint} failed: {message}")]
pub struct FatalConnectionError {
    /// Endpoint that rejected the session.
    pub endpoint: Endpoint,
    /// Reason reported by the transport.
    pub message: String,
}

/// Errors raised while waiting for an endpoint to accept sessions.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConnectError {
    /// No attempt succeeded within the budget.
    #[error(transparent)]
    DeadlineExceeded(#[from] DeadlineExceeded),
    /// An attempt failed fatally; no further attempts were made.
    #[error(transparent)]
    Fatal(#[from] FatalConnectionError),
}

/// Checks a session login at a fixed interval until one opens.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionEstablisher {
    poll_interval: Duration,
}

impl Default for ConnectionEstablisher {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionEstablisher {
    /// Creates an establisher attempting a login every [`CONNECT_POLL_INTERVAL`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            poll_interval: CONNECT_POLL_INTERVAL,
        }
    }

    /// Overrides the login retry interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Waits until `session` can be opened.
    ///
    /// Refused and unreachable endpoints are retried silently. A zero
    /// `timeout` fails without attempting a connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Fatal`] on the first non-retryable failure, or
    /// [`ConnectError::DeadlineExceeded`] when `timeout` elapses.
    pub async fn wait_for_connectable<S: RemoteShell>(
        &self,
        session: &Session<'_, S>,
        timeout: Duration,
    ) -> Result<(), ConnectError> {
        info!(endpoint = %session.endpoint(), budget = ?timeout, "waiting for ssh");
        let deadline = Deadline::after(timeout);
        let mut attempt = 0_u32;

        while !deadline.is_expired() {
            attempt = attempt.saturating_add(1);
            match session.check_login() {
                Ok(()) => {
                    info!(endpoint = %session.endpoint(), attempt, elapsed = ?deadline.elapsed(), "ssh is accepting sessions");
                    return Ok(());
                }
                Err(failure) if failure.is_retryable() => {
                    debug!(attempt, message = failure.message(), "ssh not reachable yet");
                }
                Err(failure) => {
                    return Err(FatalConnectionError {
                        endpoint: session.endpoint().clone(),
                        message: failure.message().to_owned(),
                    }
                    .into());
                }
            }

            sleep(self.poll_interval.min(deadline.remaining())).await;
        }

        Err(deadline.exceeded(WaitStage::Connectable).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::LoginFailure;
    use crate::test_support::FakeShell;
    use tokio::time::Instant;

    fn refused() -> LoginFailure {
        LoginFailure::Unreachable(String::from("Connection refused"))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_refusals_until_a_session_opens() {
        let shell = FakeShell::new();
        shell.push_login(Err(refused()));
        shell.push_login(Err(refused()));
        shell.push_login(Ok(()));
        let session = Session::new(&shell, Endpoint::new("ssh1.example", 2200));
        let started = Instant::now();

        ConnectionEstablisher::new()
            .wait_for_connectable(&session, Duration::from_secs(60))
            .await
            .unwrap_or_else(|err| panic!("third attempt should connect: {err}"));

        assert_eq!(shell.login_attempts(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failures_abort_immediately() {
        let shell = FakeShell::new();
        shell.push_login(Err(refused()));
        shell.push_login(Err(LoginFailure::Fatal(String::from(
            "Permission denied (publickey).",
        ))));
        shell.push_login(Ok(()));
        let session = Session::new(&shell, Endpoint::new("ssh1.example", 2200));

        let err = ConnectionEstablisher::new()
            .wait_for_connectable(&session, Duration::from_secs(60))
            .await
            .expect_err("auth failure is fatal");

        assert_eq!(
            err.to_string(),
            "ssh connection to ssh1.example:2200 failed: Permission denied (publickey)."
        );
        assert_eq!(shell.login_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_fails_without_a_login_attempt() {
        let shell = FakeShell::new();
        let session = Session::new(&shell, Endpoint::new("ssh1.example", 2200));

        let err = ConnectionEstablisher::new()
            .wait_for_connectable(&session, Duration::ZERO)
            .await
            .expect_err("no budget left");

        assert!(matches!(err, ConnectError::DeadlineExceeded(_)), "{err:?}");
        assert_eq!(shell.login_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_refusal_exhausts_the_budget() {
        let shell = FakeShell::new();
        for _ in 0..10 {
            shell.push_login(Err(refused()));
        }
        let session = Session::new(&shell, Endpoint::new("ssh1.example", 2200));

        let err = ConnectionEstablisher::new()
            .wait_for_connectable(&session, Duration::from_secs(7))
            .await
            .expect_err("endpoint never opens");

        let ConnectError::DeadlineExceeded(exceeded) = err else {
            panic!("expected deadline error, got {err:?}");
        };
        assert_eq!(exceeded.stage, WaitStage::Connectable);
        assert_eq!(exceeded.elapsed, Duration::from_secs(7));
        assert_eq!(shell.login_attempts(), 3);
    }
}
