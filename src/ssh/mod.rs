//! Remote shell access to rented instances over the system `ssh` and `scp`.
//!
//! [`RemoteShell`] is the seam every job stage talks through: checking an
//! endpoint, running short commands, streaming a long command, and moving
//! files. [`SshClient`] implements it by shelling out; tests substitute a
//! scripted double.

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};

use camino::Utf8Path;
use shell_escape::unix::escape;
use tracing::debug;

use crate::control_plane::Endpoint;

mod channel;
mod config;
mod error;
mod types;
mod util;

pub use channel::{ExecutionStream, ProcessStream, RemoteExit};
pub use config::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_SSH_USER, SshConfig};
pub use error::{LoginFailure, SSH_TRANSPORT_FAILURE, SshError, TransferError};
pub use types::{CommandOutput, CommandRunner, ProcessCommandRunner, TransferProgress};
pub use util::expand_tilde;

const UPLOAD_CHUNK: usize = 64 * 1024;

/// Operations a job needs from a remote host.
pub trait RemoteShell {
    /// Stream type returned by [`RemoteShell::exec`].
    type Stream: ExecutionStream;

    /// Attempts to open and immediately close a session.
    ///
    /// # Errors
    ///
    /// Returns a [`LoginFailure`] classifying why the session did not open.
    fn check_login(&self, endpoint: &Endpoint) -> Result<(), LoginFailure>;

    /// Runs `command` to completion and captures its output.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Spawn`] when the transport cannot be started.
    fn run(&self, endpoint: &Endpoint, command: &str) -> Result<CommandOutput, SshError>;

    /// Starts `command` and returns a stream over its combined output.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Spawn`] when the transport cannot be started.
    fn exec(&self, endpoint: &Endpoint, command: &str) -> Result<Self::Stream, SshError>;

    /// Copies the local file at `local` to `remote`, reporting progress.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] when reading or sending the file fails.
    fn upload(
        &self,
        endpoint: &Endpoint,
        local: &Utf8Path,
        remote: &str,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), TransferError>;

    /// Recursively copies `remote` into the local directory `local`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::NotFound`] when `remote` does not exist, or
    /// another [`TransferError`] when the copy fails.
    fn download(&self, endpoint: &Endpoint, remote: &str, local: &Utf8Path)
    -> Result<(), TransferError>;
}

/// A remote shell bound to one instance endpoint.
#[derive(Debug)]
pub struct Session<'a, S> {
    shell: &'a S,
    endpoint: Endpoint,
}

impl<'a, S: RemoteShell> Session<'a, S> {
    /// Binds `shell` to `endpoint`.
    #[must_use]
    pub const fn new(shell: &'a S, endpoint: Endpoint) -> Self {
        Self { shell, endpoint }
    }

    /// Endpoint this session talks to.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// See [`RemoteShell::check_login`].
    ///
    /// # Errors
    ///
    /// Propagates the login failure.
    pub fn check_login(&self) -> Result<(), LoginFailure> {
        self.shell.check_login(&self.endpoint)
    }

    /// See [`RemoteShell::run`].
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub fn run(&self, command: &str) -> Result<CommandOutput, SshError> {
        self.shell.run(&self.endpoint, command)
    }

    /// Runs `command` and treats a non-zero exit as an error.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::CommandFailure`] when the command exits non-zero.
    pub fn run_checked(&self, command: &str) -> Result<CommandOutput, SshError> {
        let output = self.run(command)?;
        if output.is_success() {
            return Ok(output);
        }
        Err(SshError::command_failure("ssh", output))
    }

    /// See [`RemoteShell::exec`].
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub fn exec(&self, command: &str) -> Result<S::Stream, SshError> {
        self.shell.exec(&self.endpoint, command)
    }

    /// See [`RemoteShell::upload`].
    ///
    /// # Errors
    ///
    /// Propagates transfer failures.
    pub fn upload(
        &self,
        local: &Utf8Path,
        remote: &str,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), TransferError> {
        self.shell.upload(&self.endpoint, local, remote, progress)
    }

    /// See [`RemoteShell::download`].
    ///
    /// # Errors
    ///
    /// Propagates transfer failures.
    pub fn download(&self, remote: &str, local: &Utf8Path) -> Result<(), TransferError> {
        self.shell.download(&self.endpoint, remote, local)
    }
}

/// [`RemoteShell`] that drives the system OpenSSH client.
#[derive(Clone, Debug)]
pub struct SshClient<R: CommandRunner = ProcessCommandRunner> {
    config: SshConfig,
    runner: R,
}

impl SshClient<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: SshConfig) -> Result<Self, SshError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SshClient<R> {
    /// Creates a client using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidConfig`] when configuration validation
    /// fails.
    pub fn new(config: SshConfig, runner: R) -> Result<Self, SshError> {
        config.validate()?;
        Ok(Self { config, runner })
    }

    /// Returns a reference to the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &SshConfig {
        &self.config
    }

    fn target(&self, endpoint: &Endpoint) -> String {
        format!("{}@{}", self.config.user, endpoint.host)
    }

    fn build_ssh_args(&self, endpoint: &Endpoint, remote_command: &str) -> Vec<OsString> {
        let mut args = self.common_ssh_options("-p", endpoint.port);
        args.push(OsString::from(self.target(endpoint)));
        args.push(OsString::from(remote_command));
        args
    }

    fn build_scp_args(&self, endpoint: &Endpoint, remote: &str, local: &Utf8Path) -> Vec<OsString> {
        let mut args = vec![OsString::from("-r"), OsString::from("-q")];
        args.extend(self.common_ssh_options("-P", endpoint.port));
        args.push(OsString::from(format!("{}:{remote}", self.target(endpoint))));
        args.push(OsString::from(local.as_str()));
        args
    }

    fn common_ssh_options(&self, port_flag: &str, port: u16) -> Vec<OsString> {
        let mut args = vec![OsString::from(port_flag), OsString::from(port.to_string())];

        if let Some(ref identity_file) = self.config.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        if self.config.batch_mode_enabled() {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.known_hosts_file
            )));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            self.config.connect_timeout_secs
        )));
        args.push(OsString::from("-o"));
        args.push(OsString::from("LogLevel=ERROR"));
        args
    }
}

impl<R: CommandRunner> RemoteShell for SshClient<R> {
    type Stream = ProcessStream;

    fn check_login(&self, endpoint: &Endpoint) -> Result<(), LoginFailure> {
        let args = self.build_ssh_args(endpoint, "true");
        let output = self
            .runner
            .run(&self.config.ssh_bin, &args)
            .map_err(|err| LoginFailure::Fatal(err.to_string()))?;
        if output.is_success() {
            return Ok(());
        }
        Err(LoginFailure::classify(&output))
    }

    fn run(&self, endpoint: &Endpoint, command: &str) -> Result<CommandOutput, SshError> {
        debug!(%endpoint, command, "running remote command");
        let args = self.build_ssh_args(endpoint, command);
        self.runner.run(&self.config.ssh_bin, &args)
    }

    fn exec(&self, endpoint: &Endpoint, command: &str) -> Result<Self::Stream, SshError> {
        debug!(%endpoint, command, "streaming remote command");
        let mut process = Command::new(&self.config.ssh_bin);
        process.args(self.build_ssh_args(endpoint, command));
        ProcessStream::spawn(process)
    }

    fn upload(
        &self,
        endpoint: &Endpoint,
        local: &Utf8Path,
        remote: &str,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), TransferError> {
        let io_error = |err: io::Error| TransferError::Io {
            path: local.to_path_buf(),
            message: err.to_string(),
        };
        let mut file = File::open(local).map_err(io_error)?;
        let total = file.metadata().map_err(io_error)?.len();

        let remote_command = format!("cat > {}", escape(remote.into()));
        let mut child = Command::new(&self.config.ssh_bin)
            .args(self.build_ssh_args(endpoint, &remote_command))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| TransferError::Upload {
                message: format!("failed to spawn {}: {err}", self.config.ssh_bin),
            })?;

        let written = child.stdin.take().map_or_else(
            || Err(io::Error::other("ssh stdin was not captured")),
            |mut stdin| copy_with_progress(&mut file, &mut stdin, total, progress),
        );
        let output = child
            .wait_with_output()
            .map_err(|err| TransferError::Upload {
                message: err.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            let message = if stderr.is_empty() {
                format!("ssh exited with status {}", output.status)
            } else {
                stderr
            };
            return Err(TransferError::Upload { message });
        }
        written.map(|_| ()).map_err(|err| TransferError::Upload {
            message: err.to_string(),
        })
    }

    fn download(
        &self,
        endpoint: &Endpoint,
        remote: &str,
        local: &Utf8Path,
    ) -> Result<(), TransferError> {
        let args = self.build_scp_args(endpoint, remote, local);
        let output = self
            .runner
            .run(&self.config.scp_bin, &args)
            .map_err(|err| TransferError::Download {
                message: err.to_string(),
            })?;
        if output.is_success() {
            return Ok(());
        }

        let stderr = output.stderr.trim();
        if stderr.contains("No such file or directory") {
            return Err(TransferError::NotFound {
                path: remote.to_owned(),
            });
        }
        Err(TransferError::Download {
            message: if stderr.is_empty() {
                format!("scp exited with status {}", output.status_text())
            } else {
                stderr.to_owned()
            },
        })
    }
}

/// Copies `reader` into `writer` in fixed-size chunks, calling `progress`
/// after every chunk. Returns the number of bytes copied.
fn copy_with_progress(
    reader: &mut impl Read,
    writer: &mut impl Write,
    total: u64,
    progress: &mut dyn FnMut(TransferProgress),
) -> io::Result<u64> {
    let mut buf = vec![0_u8; UPLOAD_CHUNK];
    let mut sent = 0_u64;
    progress(TransferProgress { sent, total });
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        let chunk = buf.get(..read).unwrap_or_default();
        writer.write_all(chunk)?;
        sent = sent.saturating_add(u64::try_from(read).unwrap_or(u64::MAX));
        progress(TransferProgress { sent, total });
    }
    writer.flush()?;
    Ok(sent)
}
