//! Persistent storage for the marketplace API key.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::config::VastConfig;
use crate::ssh::expand_tilde;

/// Errors raised while reading or writing the key file.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ApiKeyError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the key path does not name a file.
    #[error("api key path {path} is missing a filename")]
    InvalidPath {
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// Raised when an empty key is stored.
    #[error("refusing to store an empty api key")]
    EmptyKey,
}

/// Reads and writes the API key file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApiKeyStore {
    path: Utf8PathBuf,
}

impl ApiKeyStore {
    /// Store backed by `path`; a leading `~/` is expanded.
    #[must_use]
    pub fn new(path: &str) -> Self {
        Self {
            path: Utf8PathBuf::from(expand_tilde(path)),
        }
    }

    /// Store backed by the file named in `config`.
    #[must_use]
    pub fn from_config(config: &VastConfig) -> Self {
        Self::new(&config.api_key_file)
    }

    /// Location of the key file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns the stored key with surrounding whitespace removed, or `None`
    /// when the file does not exist or is blank.
    ///
    /// # Errors
    ///
    /// Returns [`ApiKeyError::Io`] when the file exists but cannot be read.
    pub fn read(&self) -> Result<Option<String>, ApiKeyError> {
        let (parent, file_name) = self.split()?;
        let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(&err)),
        };
        match dir.read_to_string(file_name) {
            Ok(contents) => {
                let key = contents.trim();
                Ok((!key.is_empty()).then(|| key.to_owned()))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_error(&err)),
        }
    }

    /// Writes `key`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`ApiKeyError::EmptyKey`] for a blank key, or
    /// [`ApiKeyError::Io`] when the file cannot be written.
    pub fn write(&self, key: &str) -> Result<(), ApiKeyError> {
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Err(ApiKeyError::EmptyKey);
        }
        let (parent, file_name) = self.split()?;
        Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| {
            ApiKeyError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
            ApiKeyError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        dir.write(file_name, trimmed)
            .map_err(|err| self.io_error(&err))
    }

    fn split(&self) -> Result<(&Utf8Path, &str), ApiKeyError> {
        let file_name = self.path.file_name().ok_or_else(|| ApiKeyError::InvalidPath {
            path: self.path.clone(),
        })?;
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        Ok((parent, file_name))
    }

    fn io_error(&self, err: &io::Error) -> ApiKeyError {
        ApiKeyError::Io {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }
}

/// Key to authenticate with: the configured value when set, otherwise the
/// stored one.
///
/// # Errors
///
/// Returns [`ApiKeyError`] when the key file exists but cannot be read.
pub fn resolve_api_key(config: &VastConfig) -> Result<Option<String>, ApiKeyError> {
    if let Some(key) = config
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
    {
        return Ok(Some(key.to_owned()));
    }
    ApiKeyStore::from_config(config).read()
}
