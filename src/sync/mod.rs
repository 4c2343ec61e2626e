//! Shipping a local workspace to the remote host as a single zip archive.
//!
//! Files are enumerated, filtered through `.vastignore` (or `.gitignore`),
//! packed into a temporary archive, streamed over SSH and unpacked in place.
//! The local archive is removed on every exit path.

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::info;

use crate::ssh::{RemoteShell, Session, TransferError, TransferProgress};

mod archive;
mod manifest;

pub use archive::TransferArchive;
pub use manifest::{GENERIC_IGNORE_FILE, IgnoreMatcher, TOOL_IGNORE_FILE, WorkspaceManifest};

/// Remote location the archive is uploaded to before extraction.
pub const REMOTE_ARCHIVE_PATH: &str = "/tmp/vast-upload.zip";

/// Errors surfaced while synchronising a workspace.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SyncError {
    /// Raised when the source directory does not exist.
    #[error("sync source directory missing: {path}")]
    MissingSource {
        /// Path that was expected to be synchronised.
        path: Utf8PathBuf,
    },
    /// Raised when the workspace cannot be enumerated.
    #[error("failed to enumerate {path}: {message}")]
    Walk {
        /// Workspace root being enumerated.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when an ignore file exists but cannot be loaded.
    #[error("failed to read ignore file {path}: {message}")]
    Ignore {
        /// Ignore file that failed to load.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when packing, uploading, or extracting fails.
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Counts describing a completed synchronisation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyncReport {
    /// Files packed and sent.
    pub transferred: usize,
    /// Files dropped by ignore patterns.
    pub excluded: usize,
    /// Size of the uploaded archive.
    pub archive_bytes: u64,
}

/// Packs, uploads, and unpacks a workspace.
#[derive(Clone, Debug)]
pub struct WorkspaceSynchronizer {
    remote_archive: String,
}

impl Default for WorkspaceSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceSynchronizer {
    /// Creates a synchroniser staging uploads at [`REMOTE_ARCHIVE_PATH`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            remote_archive: REMOTE_ARCHIVE_PATH.to_owned(),
        }
    }

    /// Mirrors the files under `local_root` into `remote_root`.
    ///
    /// Existing remote files with the same names are overwritten; remote
    /// files absent locally are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when enumeration, packing, upload, or remote
    /// extraction fails. The local archive is removed in every case.
    pub fn sync<S: RemoteShell>(
        &self,
        session: &Session<'_, S>,
        local_root: &Utf8Path,
        remote_root: &str,
        filter_enabled: bool,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<SyncReport, SyncError> {
        let manifest = WorkspaceManifest::collect(local_root, filter_enabled)?;
        info!(
            source = %local_root,
            files = manifest.len(),
            excluded = manifest.excluded().len(),
            "packing workspace"
        );

        let archive = TransferArchive::pack(&manifest)?;
        let report = SyncReport {
            transferred: archive.entries(),
            excluded: manifest.excluded().len(),
            archive_bytes: archive.bytes(),
        };

        session.upload(archive.path(), &self.remote_archive, progress)?;
        info!(destination = remote_root, bytes = report.archive_bytes, "unpacking workspace");
        session
            .run_checked(&extract_command(&self.remote_archive, remote_root))
            .map_err(|err| TransferError::Extract {
                message: err.to_string(),
            })?;
        archive.close()?;

        Ok(report)
    }
}

/// Shell command that unpacks `archive` into `destination`, installing
/// `unzip` first when the image lacks it.
#[must_use]
pub fn extract_command(archive: &str, destination: &str) -> String {
    let archive_arg = escape(archive.into());
    let destination_arg = escape(destination.into());
    format!(
        "(command -v unzip >/dev/null 2>&1 || \
         (apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq unzip)) && \
         mkdir -p {destination_arg} && \
         unzip -o -q {archive_arg} -d {destination_arg} && \
         rm -f {archive_arg}"
    )
}

#[cfg(test)]
mod tests;
