//! Errors raised by the remote shell layer.

use camino::Utf8PathBuf;
use thiserror::Error;

use super::CommandOutput;

/// Errors surfaced while running commands on the remote host.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// Raised when configuration is missing required values.
    #[error("missing {field}: set VAST_SSH_{env_suffix} or add {field} to the ssh configuration", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a remote command exits unsuccessfully.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Command name used for the attempted operation.
        program: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
}

impl SshError {
    /// Builds a [`SshError::CommandFailure`] from captured output.
    #[must_use]
    pub fn command_failure(program: &str, output: CommandOutput) -> Self {
        Self::CommandFailure {
            program: program.to_owned(),
            status: output.code,
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        }
    }
}

/// Outcome of a failed attempt to open a session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LoginFailure {
    /// The endpoint refused or could not be reached; worth retrying.
    Unreachable(String),
    /// Authentication, protocol, or local failures; retrying will not help.
    Fatal(String),
}

const RETRYABLE_MARKERS: &[&str] = &[
    "connection refused",
    "no route to host",
    "network is unreachable",
    "connection timed out",
];

impl LoginFailure {
    /// Classifies the output of a failed `ssh` invocation.
    #[must_use]
    pub fn classify(output: &CommandOutput) -> Self {
        let stderr = output.stderr.trim();
        let lowered = stderr.to_ascii_lowercase();
        if output.code == Some(SSH_TRANSPORT_FAILURE)
            && RETRYABLE_MARKERS.iter().any(|marker| lowered.contains(marker))
        {
            return Self::Unreachable(stderr.to_owned());
        }

        if stderr.is_empty() {
            return Self::Fatal(format!("ssh exited with status {}", output.status_text()));
        }
        Self::Fatal(stderr.to_owned())
    }

    /// Returns `true` when another attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    /// Message describing the failure.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Unreachable(message) | Self::Fatal(message) => message,
        }
    }
}

/// Exit status OpenSSH reserves for its own connection failures.
pub const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Errors raised while moving files to or from the remote host.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransferError {
    /// Building or reading the local archive failed.
    #[error("failed to build transfer archive: {message}")]
    Archive {
        /// Underlying error message.
        message: String,
    },
    /// Local file system access failed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Streaming the archive to the remote host failed.
    #[error("upload failed: {message}")]
    Upload {
        /// Error reported by the transport.
        message: String,
    },
    /// The remote side could not unpack the archive.
    #[error("remote extraction failed: {message}")]
    Extract {
        /// Error reported by the remote extraction command.
        message: String,
    },
    /// The requested remote path does not exist.
    #[error("remote path {path} does not exist")]
    NotFound {
        /// Remote path that was requested.
        path: String,
    },
    /// Downloading from the remote host failed.
    #[error("download failed: {message}")]
    Download {
        /// Error reported by the transport.
        message: String,
    },
}
