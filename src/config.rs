//! Configuration loading via `ortho-config`.
//!
//! Every section merges defaults, `vastrun.toml` discovered in the usual
//! locations, and environment variables, in that order of precedence. CLI
//! flags are applied on top by the binary.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::artifacts::ARTIFACTS_DIR;
use crate::control_plane::DEFAULT_SERVER_URL;
use crate::job::JobSettings;

/// Default file holding the marketplace API key.
pub const DEFAULT_API_KEY_FILE: &str = "~/.vast_api_key";

/// Default remote working directory jobs are synchronised into.
pub const DEFAULT_REMOTE_PATH: &str = "/app";

/// Default overall budget, in seconds, for an instance to become usable.
pub const DEFAULT_TIMEOUT_SECS: u64 = 512;

/// Control plane access settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VAST",
    discovery(
        app_name = "vastrun",
        env_var = "VASTRUN_CONFIG_PATH",
        config_file_name = "vastrun.toml",
        dotfile_name = ".vastrun.toml",
        project_file_name = "vastrun.toml"
    )
)]
pub struct VastConfig {
    /// API key; when unset the key is read from `api_key_file`.
    pub api_key: Option<String>,
    /// Base URL of the control plane.
    #[ortho_config(default = DEFAULT_SERVER_URL.to_owned())]
    pub server_url: String,
    /// File the API key is stored in. Supports `~/` expansion.
    #[ortho_config(default = DEFAULT_API_KEY_FILE.to_owned())]
    pub api_key_file: String,
}

/// Job orchestration settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VAST_JOB",
    discovery(
        app_name = "vastrun",
        env_var = "VASTRUN_CONFIG_PATH",
        config_file_name = "vastrun.toml",
        dotfile_name = ".vastrun.toml",
        project_file_name = "vastrun.toml"
    )
)]
pub struct JobConfig {
    /// Remote working directory the workspace is unpacked into.
    #[ortho_config(default = DEFAULT_REMOTE_PATH.to_owned())]
    pub remote_path: String,
    /// Artifacts directory, relative to `remote_path`.
    #[ortho_config(default = ARTIFACTS_DIR.to_owned())]
    pub artifacts_dir: String,
    /// Overall budget for the instance to start and accept SSH.
    #[ortho_config(default = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,
    /// Seconds between instance state lookups.
    #[ortho_config(default = 45)]
    pub running_poll_secs: u64,
    /// Seconds between SSH connection attempts.
    #[ortho_config(default = 3)]
    pub connect_poll_secs: u64,
    /// Milliseconds between polls of remote command output.
    #[ortho_config(default = 1)]
    pub output_poll_millis: u64,
    /// Milliseconds to wait before concluding a command printed nothing.
    #[ortho_config(default = 1000)]
    pub settle_millis: u64,
    /// Whether `.vastignore` or `.gitignore` patterns filter the upload.
    /// Unset means enabled.
    pub use_ignore_file: Option<bool>,
    /// Whether `requirements.txt` is installed before the job command.
    /// Unset means enabled.
    pub install_requirements: Option<bool>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(env_var: &'static str, toml_key: &'static str, section: &'static str) -> Self {
        Self {
            env_var,
            toml_key,
            section,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "{}: set {} or add {} to [{}] in vastrun.toml",
            self.toml_key, self.env_var, self.toml_key, self.section
        ))
    }

    fn zero(&self) -> ConfigError {
        ConfigError::InvalidValue(format!(
            "{} must be greater than zero: set {} or {} in [{}] of vastrun.toml",
            self.toml_key, self.env_var, self.toml_key, self.section
        ))
    }
}

fn require_text(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(metadata.missing());
    }
    Ok(())
}

fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(metadata.zero());
    }
    Ok(())
}

impl VastConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigLoadError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigLoadError> {
        Self::load_from_iter([std::ffi::OsString::from("vastrun")])
            .map_err(|err| ConfigLoadError::Parse(err.to_string()))
    }

    /// Ensures the server URL and key file location are present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a field is blank.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_text(
            &self.server_url,
            &FieldMetadata::new("VAST_SERVER_URL", "server_url", "vast"),
        )?;
        require_text(
            &self.api_key_file,
            &FieldMetadata::new("VAST_API_KEY_FILE", "api_key_file", "vast"),
        )
    }
}

impl JobConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigLoadError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigLoadError> {
        Self::load_from_iter([std::ffi::OsString::from("vastrun")])
            .map_err(|err| ConfigLoadError::Parse(err.to_string()))
    }

    /// Rejects blank paths and zero intervals.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_text(
            &self.remote_path,
            &FieldMetadata::new("VAST_JOB_REMOTE_PATH", "remote_path", "job"),
        )?;
        require_text(
            &self.artifacts_dir,
            &FieldMetadata::new("VAST_JOB_ARTIFACTS_DIR", "artifacts_dir", "job"),
        )?;
        require_positive(
            self.running_poll_secs,
            &FieldMetadata::new("VAST_JOB_RUNNING_POLL_SECS", "running_poll_secs", "job"),
        )?;
        require_positive(
            self.connect_poll_secs,
            &FieldMetadata::new("VAST_JOB_CONNECT_POLL_SECS", "connect_poll_secs", "job"),
        )?;
        require_positive(
            self.output_poll_millis,
            &FieldMetadata::new("VAST_JOB_OUTPUT_POLL_MILLIS", "output_poll_millis", "job"),
        )?;
        require_positive(
            self.settle_millis,
            &FieldMetadata::new("VAST_JOB_SETTLE_MILLIS", "settle_millis", "job"),
        )
    }

    /// Overall budget as a duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Converts the validated configuration into orchestrator settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn job_settings(&self) -> Result<JobSettings, ConfigError> {
        self.validate()?;
        let trimmed = self.remote_path.trim_end_matches('/');
        let remote_root = if trimmed.is_empty() { "/" } else { trimmed };
        Ok(JobSettings {
            remote_root: remote_root.to_owned(),
            artifacts_dir: self.artifacts_dir.trim_matches('/').to_owned(),
            running_poll_interval: Duration::from_secs(self.running_poll_secs),
            connect_poll_interval: Duration::from_secs(self.connect_poll_secs),
            output_poll_interval: Duration::from_millis(self.output_poll_millis),
            settle_interval: Duration::from_millis(self.settle_millis),
            use_ignore_file: self.use_ignore_file.unwrap_or(true),
            install_requirements: self.install_requirements.unwrap_or(true),
        })
    }
}

/// Errors raised when loading configuration from layered sources.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigLoadError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

/// Errors raised during configuration validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field {0}")]
    MissingField(String),
    /// Indicates a field holds a value outside its accepted range.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
}
