//! Streaming a remote command's merged output to a local sink.
//!
//! Exit can be signalled before the last buffered output has been read, so
//! completion is decided by a small state machine rather than by the exit
//! signal alone.

use std::io::{self, Write};
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::ssh::{ExecutionStream, RemoteExit, RemoteShell, Session, SshError};

/// Delay between polls of the output channel.
pub const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Extra wait before concluding a command produced no output.
pub const SETTLE_INTERVAL: Duration = Duration::from_secs(1);

/// Errors raised while running a remote command.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The command could not be started.
    #[error("failed to start remote command: {0}")]
    Spawn(#[from] SshError),
    /// Reading from the output channel failed.
    #[error("remote output channel failed: {0}")]
    Channel(#[source] io::Error),
    /// Writing to the local sink failed.
    #[error("failed to forward remote output: {0}")]
    Sink(#[source] io::Error),
}

/// Result of a finished remote command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExecutionOutcome {
    /// Exit code reported by the remote side, if any.
    pub exit_code: Option<i32>,
    /// Bytes of output forwarded to the sink.
    pub bytes_forwarded: u64,
}

impl ExecutionOutcome {
    /// Returns `true` when the command exited with status zero.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DrainState {
    /// Exit not observed yet.
    Streaming,
    /// Exit observed; waiting for one poll cycle without new data.
    Draining(RemoteExit),
    /// Nothing was ever received; the settle interval has been waited out
    /// and one more check is due.
    Settled(RemoteExit),
    Done(RemoteExit),
}

/// Runs one command and forwards its output as it arrives.
#[derive(Clone, Copy, Debug)]
pub struct RemoteExecutor {
    poll_interval: Duration,
    settle_interval: Duration,
}

impl Default for RemoteExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteExecutor {
    /// Creates an executor with the standard poll and settle intervals.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            poll_interval: OUTPUT_POLL_INTERVAL,
            settle_interval: SETTLE_INTERVAL,
        }
    }

    /// Overrides the poll and settle intervals.
    #[must_use]
    pub const fn with_intervals(mut self, poll: Duration, settle: Duration) -> Self {
        self.poll_interval = poll;
        self.settle_interval = settle;
        self
    }

    /// Runs `command` in `session`, writing combined output to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] when the command cannot start, the channel
    /// fails, or the sink rejects a write. A non-zero remote exit is not an
    /// error; it is reported in the outcome.
    pub async fn run<S, W>(
        &self,
        session: &Session<'_, S>,
        command: &str,
        sink: &mut W,
    ) -> Result<ExecutionOutcome, ExecError>
    where
        S: RemoteShell,
        W: Write + ?Sized,
    {
        let mut stream = session.exec(command)?;
        self.drain(&mut stream, sink).await
    }

    /// Forwards everything `stream` produces until completion is confirmed.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Channel`] or [`ExecError::Sink`] on I/O failure.
    pub async fn drain<E, W>(
        &self,
        stream: &mut E,
        sink: &mut W,
    ) -> Result<ExecutionOutcome, ExecError>
    where
        E: ExecutionStream + ?Sized,
        W: Write + ?Sized,
    {
        let mut forwarded = 0_u64;
        let mut state = DrainState::Streaming;

        loop {
            let received = forward_available(stream, sink, &mut forwarded)?;
            state = match state {
                DrainState::Streaming => match stream.exit_status().map_err(ExecError::Channel)? {
                    Some(exit) => {
                        debug!(code = ?exit.code, "remote command exited");
                        DrainState::Draining(exit)
                    }
                    None => DrainState::Streaming,
                },
                DrainState::Draining(exit) | DrainState::Settled(exit) if received => {
                    DrainState::Draining(exit)
                }
                DrainState::Draining(exit) if forwarded == 0 => DrainState::Settled(exit),
                DrainState::Draining(exit) | DrainState::Settled(exit) | DrainState::Done(exit) => {
                    DrainState::Done(exit)
                }
            };

            match state {
                DrainState::Done(exit) => {
                    return Ok(ExecutionOutcome {
                        exit_code: exit.code,
                        bytes_forwarded: forwarded,
                    });
                }
                DrainState::Settled(_) => sleep(self.settle_interval).await,
                DrainState::Streaming | DrainState::Draining(_) => {
                    sleep(self.poll_interval).await;
                }
            }
        }
    }
}

/// Forwards every chunk that is ready now. Returns `true` if any arrived.
fn forward_available<E, W>(
    stream: &mut E,
    sink: &mut W,
    forwarded: &mut u64,
) -> Result<bool, ExecError>
where
    E: ExecutionStream + ?Sized,
    W: Write + ?Sized,
{
    let mut received = false;
    while let Some(chunk) = stream.try_next_chunk().map_err(ExecError::Channel)? {
        sink.write_all(&chunk).map_err(ExecError::Sink)?;
        *forwarded = forwarded.saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));
        received = true;
    }
    if received {
        sink.flush().map_err(ExecError::Sink)?;
    }
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::Endpoint;
    use crate::test_support::{FakeShell, ScriptedStream};
    use tokio::time::Instant;

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    async fn drain(mut stream: ScriptedStream) -> (ExecutionOutcome, String) {
        let mut sink = Vec::new();
        let outcome = RemoteExecutor::new()
            .drain(&mut stream, &mut sink)
            .await
            .unwrap_or_else(|err| panic!("drain should succeed: {err}"));
        (outcome, String::from_utf8(sink).expect("utf-8 output"))
    }

    #[tokio::test(start_paused = true)]
    async fn output_racing_the_exit_signal_is_delivered() {
        let stream = ScriptedStream::new()
            .output_at(Duration::ZERO, "line 1\n")
            .exit_at(Duration::ZERO, Some(0))
            .output_at(Duration::from_millis(1), "line 2\n");

        let (outcome, output) = drain(stream).await;

        assert_eq!(output, "line 1\nline 2\n");
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.bytes_forwarded, 14);
    }

    #[tokio::test(start_paused = true)]
    async fn output_before_exit_completes_without_settling() {
        let stream = ScriptedStream::new()
            .output_at(Duration::ZERO, "ok\n")
            .exit_at(Duration::from_millis(20), Some(0));
        let started = Instant::now();

        let (_, output) = drain(stream).await;

        assert_eq!(output, "ok\n");
        assert!(started.elapsed() < SETTLE_INTERVAL, "{:?}", started.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_command_completes_after_settle_interval() {
        let stream = ScriptedStream::new().exit_at(Duration::ZERO, Some(0));
        let started = Instant::now();

        let (outcome, output) = drain(stream).await;

        assert!(output.is_empty());
        assert_eq!(outcome.bytes_forwarded, 0);
        assert!(started.elapsed() >= SETTLE_INTERVAL, "{:?}", started.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn output_arriving_during_settle_is_captured() {
        let stream = ScriptedStream::new()
            .exit_at(Duration::ZERO, Some(0))
            .output_at(Duration::from_millis(500), "late\n");

        let (_, output) = drain(stream).await;

        assert_eq!(output, "late\n");
    }

    #[tokio::test(start_paused = true)]
    async fn non_zero_exit_is_reported_not_raised() {
        let stream = ScriptedStream::new()
            .output_at(Duration::ZERO, "Traceback\n")
            .exit_at(Duration::from_millis(3), Some(3));

        let (outcome, _) = drain(stream).await;

        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failures_abort_the_drain() {
        let mut stream = ScriptedStream::new()
            .output_at(Duration::ZERO, "ok\n")
            .exit_at(Duration::ZERO, Some(0));

        let err = RemoteExecutor::new()
            .drain(&mut stream, &mut BrokenSink)
            .await
            .expect_err("sink is closed");

        assert!(matches!(err, ExecError::Sink(_)), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn channel_failures_are_reported() {
        let mut stream = ScriptedStream::new().fail_at(Duration::ZERO, "connection reset");
        let mut sink = Vec::new();

        let err = RemoteExecutor::new()
            .drain(&mut stream, &mut sink)
            .await
            .expect_err("channel breaks");

        assert!(matches!(err, ExecError::Channel(_)), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn run_executes_command_through_the_session() {
        let shell = FakeShell::new();
        shell.push_stream(
            ScriptedStream::new()
                .output_at(Duration::ZERO, "ok\n")
                .exit_at(Duration::ZERO, Some(0)),
        );
        let session = Session::new(&shell, Endpoint::new("ssh1.example", 2200));
        let mut sink = Vec::new();

        let outcome = RemoteExecutor::new()
            .run(&session, "echo ok", &mut sink)
            .await
            .unwrap_or_else(|err| panic!("run should succeed: {err}"));

        assert!(outcome.succeeded());
        assert_eq!(sink, b"ok\n");
        assert_eq!(shell.exec_commands(), vec![String::from("echo ok")]);
    }
}
