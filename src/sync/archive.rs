//! Packing a manifest into a single temporary zip archive.

use std::fs::File;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempPath;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::ssh::TransferError;

use super::WorkspaceManifest;

/// A zip of the manifest's files in a temporary file.
///
/// The file is deleted when the archive is dropped, whatever happened to it
/// in between.
#[derive(Debug)]
pub struct TransferArchive {
    temp: TempPath,
    path: Utf8PathBuf,
    entries: usize,
    bytes: u64,
}

impl TransferArchive {
    /// Packs every manifest entry, named by its relative path.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Archive`] when writing the archive fails, or
    /// [`TransferError::Io`] when a workspace file cannot be read.
    pub fn pack(manifest: &WorkspaceManifest) -> Result<Self, TransferError> {
        let file = tempfile::Builder::new()
            .prefix("vast-")
            .suffix(".zip")
            .tempfile()
            .map_err(archive_error)?;
        let (handle, temp) = file.into_parts();
        let path = Utf8Path::from_path(&temp)
            .map(Utf8Path::to_path_buf)
            .ok_or_else(|| TransferError::Archive {
                message: format!("temporary path {} is not valid UTF-8", temp.display()),
            })?;

        let mut writer = ZipWriter::new(handle);
        for relative in manifest.entries() {
            let source = manifest.root().join(relative);
            add_file(&mut writer, &source, relative)?;
        }
        let finished = writer.finish().map_err(archive_error)?;
        let bytes = finished.metadata().map_err(archive_error)?.len();
        debug!(archive = %path, entries = manifest.len(), bytes, "packed workspace");

        Ok(Self {
            temp,
            path,
            entries: manifest.len(),
            bytes,
        })
    }

    /// Location of the archive on the local disk.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Number of files packed.
    #[must_use]
    pub const fn entries(&self) -> usize {
        self.entries
    }

    /// Size of the archive in bytes.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Deletes the archive now, reporting failures instead of ignoring them.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] when the file cannot be removed.
    pub fn close(self) -> Result<(), TransferError> {
        let path = self.path;
        self.temp.close().map_err(|err| TransferError::Io {
            path,
            message: err.to_string(),
        })
    }
}

fn add_file(
    writer: &mut ZipWriter<File>,
    source: &Utf8Path,
    relative: &Utf8Path,
) -> Result<(), TransferError> {
    let io_error = |err: io::Error| TransferError::Io {
        path: source.to_path_buf(),
        message: err.to_string(),
    };
    let mut input = File::open(source).map_err(io_error)?;
    let metadata = input.metadata().map_err(io_error)?;
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(file_mode(&metadata))
        .large_file(metadata.len() >= u64::from(u32::MAX));

    writer
        .start_file(entry_name(relative), options)
        .map_err(archive_error)?;
    io::copy(&mut input, writer).map_err(io_error)?;
    Ok(())
}

/// Archive entry names always use `/`, whatever the host separator.
fn entry_name(relative: &Utf8Path) -> String {
    relative
        .components()
        .map(|component| component.as_str())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

fn archive_error(err: impl std::fmt::Display) -> TransferError {
    TransferError::Archive {
        message: err.to_string(),
    }
}
