//! Non-blocking view over a running remote command.
//!
//! [`ProcessStream`] wraps an `ssh` child process. Reader threads move
//! stdout and stderr into a channel in small chunks so the executor can poll
//! without blocking. Exit is reported only once both pipes are drained.

use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;

use super::SshError;

const READ_CHUNK: usize = 1024;

/// Exit information for a finished remote command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RemoteExit {
    /// Exit code, absent when the transport could not report one.
    pub code: Option<i32>,
}

/// Polled output and exit status of a remote command.
pub trait ExecutionStream {
    /// Returns the next chunk of output if one is ready, without blocking.
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised while reading the channel.
    fn try_next_chunk(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Returns the exit status once the command has finished.
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised while querying the channel.
    fn exit_status(&mut self) -> io::Result<Option<RemoteExit>>;
}

/// [`ExecutionStream`] backed by a local `ssh` child process.
#[derive(Debug)]
pub struct ProcessStream {
    child: Child,
    chunks: Receiver<io::Result<Vec<u8>>>,
    pipes_closed: bool,
    exit: Option<RemoteExit>,
}

impl ProcessStream {
    /// Spawns `command` with both output pipes captured.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Spawn`] when the process cannot be started.
    pub fn spawn(mut command: Command) -> Result<Self, SshError> {
        let program = command.get_program().to_string_lossy().into_owned();
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| SshError::Spawn {
                program,
                message: err.to_string(),
            })?;

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx);
        }

        Ok(Self {
            child,
            chunks: rx,
            pipes_closed: false,
            exit: None,
        })
    }
}

impl ExecutionStream for ProcessStream {
    fn try_next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self.chunks.try_recv() {
            Ok(Ok(chunk)) => Ok(Some(chunk)),
            Ok(Err(err)) => Err(err),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.pipes_closed = true;
                Ok(None)
            }
        }
    }

    fn exit_status(&mut self) -> io::Result<Option<RemoteExit>> {
        if self.exit.is_none()
            && let Some(status) = self.child.try_wait()?
        {
            self.exit = Some(RemoteExit {
                code: status.code(),
            });
        }

        if self.pipes_closed {
            Ok(self.exit)
        } else {
            Ok(None)
        }
    }
}

impl Drop for ProcessStream {
    fn drop(&mut self) {
        if self.exit.is_none() {
            self.child.kill().ok();
            self.child.wait().ok();
        }
    }
}

fn spawn_reader<R>(mut source: R, tx: Sender<io::Result<Vec<u8>>>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0_u8; READ_CHUNK];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => {
                    let Some(chunk) = buf.get(..read) else { break };
                    if tx.send(Ok(chunk.to_vec())).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    tx.send(Err(err)).ok();
                    break;
                }
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn drain(stream: &mut ProcessStream) -> (Vec<u8>, RemoteExit) {
        let started = Instant::now();
        let mut output = Vec::new();
        loop {
            assert!(
                started.elapsed() < Duration::from_secs(10),
                "process did not finish"
            );
            match stream.try_next_chunk() {
                Ok(Some(chunk)) => output.extend(chunk),
                Ok(None) => {
                    if let Ok(Some(exit)) = stream.exit_status() {
                        return (output, exit);
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("read failed: {err}"),
            }
        }
    }

    #[test]
    fn collects_output_and_exit_code() {
        let mut command = Command::new("sh");
        command.args(["-c", "printf hello; printf ' world' >&2; exit 3"]);
        let mut stream = ProcessStream::spawn(command)
            .unwrap_or_else(|err| panic!("sh should spawn: {err}"));

        let (output, exit) = drain(&mut stream);

        let mut text = String::from_utf8(output).expect("utf-8 output");
        text.retain(|c| c != ' ');
        assert!(text.contains("hello") && text.contains("world"), "got {text}");
        assert_eq!(exit.code, Some(3));
    }

    #[test]
    fn spawn_failure_names_program() {
        let err = ProcessStream::spawn(Command::new("/definitely/not/here"))
            .expect_err("missing binary should fail");
        assert!(
            matches!(err, SshError::Spawn { ref program, .. } if program == "/definitely/not/here"),
            "got {err:?}"
        );
    }
}
