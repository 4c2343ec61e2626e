//! Pulling the remote artifacts directory back after a job.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;
use walkdir::WalkDir;

use crate::ssh::{RemoteShell, Session, TransferError};

/// Directory under the remote working directory that jobs write outputs to.
pub const ARTIFACTS_DIR: &str = "vast-artifacts";

/// Local copy of a downloaded artifacts directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArtifactBundle {
    root: Utf8PathBuf,
    files: Vec<Utf8PathBuf>,
}

impl ArtifactBundle {
    /// A bundle with no files rooted at `root`.
    #[must_use]
    pub fn empty(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: Vec::new(),
        }
    }

    /// Lists the regular files under `root`, sorted. A missing root yields
    /// an empty bundle.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] when the directory cannot be read.
    pub fn scan(root: &Utf8Path) -> Result<Self, TransferError> {
        if !root.is_dir() {
            return Ok(Self::empty(root));
        }

        let mut files = Vec::new();
        for item in WalkDir::new(root) {
            let entry = item.map_err(|err| TransferError::Io {
                path: root.to_path_buf(),
                message: err.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(relative) = Utf8Path::from_path(entry.path())
                .and_then(|path| path.strip_prefix(root).ok())
            {
                files.push(relative.to_path_buf());
            }
        }
        files.sort();
        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    /// Local directory holding the artifacts.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Retrieved files relative to [`ArtifactBundle::root`].
    #[must_use]
    pub fn files(&self) -> &[Utf8PathBuf] {
        &self.files
    }

    /// Returns `true` when nothing was retrieved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Downloads a remote directory, treating its absence as "no artifacts".
#[derive(Clone, Copy, Debug, Default)]
pub struct ArtifactCollector;

impl ArtifactCollector {
    /// Creates a collector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Copies `remote_path` into `local_dest`. Returns `false` when the
    /// remote directory does not exist.
    ///
    /// # Errors
    ///
    /// Returns any [`TransferError`] other than
    /// [`TransferError::NotFound`].
    pub fn collect<S: RemoteShell>(
        &self,
        session: &Session<'_, S>,
        remote_path: &str,
        local_dest: &Utf8Path,
    ) -> Result<bool, TransferError> {
        match session.download(remote_path, local_dest) {
            Ok(()) => {
                info!(source = remote_path, destination = %local_dest, "collected artifacts");
                Ok(true)
            }
            Err(TransferError::NotFound { .. }) => {
                info!(source = remote_path, "no artifacts produced");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Local directory a download of `remote_path` into `local_dest` lands
    /// in.
    #[must_use]
    pub fn landing_dir(remote_path: &str, local_dest: &Utf8Path) -> Utf8PathBuf {
        let name = Utf8Path::new(remote_path.trim_end_matches('/'))
            .file_name()
            .unwrap_or(ARTIFACTS_DIR);
        local_dest.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::Endpoint;
    use crate::test_support::FakeShell;
    use tempfile::TempDir;

    fn local_dir() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
        (dir, path)
    }

    #[test]
    fn missing_remote_directory_is_not_an_error() {
        let shell = FakeShell::new();
        let session = Session::new(&shell, Endpoint::new("ssh1.example", 2200));
        let (_dir, dest) = local_dir();

        let retrieved = ArtifactCollector::new()
            .collect(&session, "/app/vast-artifacts", &dest)
            .unwrap_or_else(|err| panic!("absence is not an error: {err}"));

        assert!(!retrieved);
        let bundle = ArtifactBundle::scan(&ArtifactCollector::landing_dir(
            "/app/vast-artifacts",
            &dest,
        ))
        .expect("scan");
        assert!(bundle.is_empty());
    }

    #[test]
    fn downloaded_files_appear_in_the_bundle() {
        let shell = FakeShell::new();
        shell.serve_download(&[("model.pt", "weights"), ("logs/train.txt", "loss 0.1")]);
        let session = Session::new(&shell, Endpoint::new("ssh1.example", 2200));
        let (_dir, dest) = local_dir();

        let retrieved = ArtifactCollector::new()
            .collect(&session, "/app/vast-artifacts", &dest)
            .unwrap_or_else(|err| panic!("download should succeed: {err}"));

        assert!(retrieved);
        let landing = ArtifactCollector::landing_dir("/app/vast-artifacts/", &dest);
        assert_eq!(landing, dest.join("vast-artifacts"));
        let bundle = ArtifactBundle::scan(&landing).expect("scan");
        let files: Vec<&str> = bundle.files().iter().map(|path| path.as_str()).collect();
        assert_eq!(files, vec!["logs/train.txt", "model.pt"]);
    }

    #[test]
    fn other_transfer_failures_are_reported() {
        let shell = FakeShell::new();
        shell.fail_downloads(TransferError::Download {
            message: String::from("lost connection"),
        });
        let session = Session::new(&shell, Endpoint::new("ssh1.example", 2200));
        let (_dir, dest) = local_dir();

        let err = ArtifactCollector::new()
            .collect(&session, "/app/vast-artifacts", &dest)
            .expect_err("transfer failure surfaces");

        assert!(matches!(err, TransferError::Download { .. }), "{err:?}");
    }
}
