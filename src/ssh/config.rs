//! SSH client settings loaded through `ortho-config`.
//!
//! Values merge defaults, configuration files, and `VAST_SSH_*` environment
//! variables. The defaults suit ephemeral marketplace hosts: batch mode on,
//! host key checking off, and known hosts discarded.

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::ConfigLoadError;

use super::SshError;

/// Default remote account on marketplace images.
pub const DEFAULT_SSH_USER: &str = "root";

/// Default seconds `ssh` waits for the TCP handshake.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Settings controlling how `ssh` and `scp` are invoked.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VAST_SSH",
    discovery(
        app_name = "vastrun",
        env_var = "VASTRUN_CONFIG_PATH",
        config_file_name = "vastrun.toml",
        dotfile_name = ".vastrun.toml",
        project_file_name = "vastrun.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = DEFAULT_SSH_USER.to_owned())]
    pub user: String,
    /// Private key passed with `-i`. Supports `~/` expansion; when unset,
    /// `ssh` falls back to its default key locations.
    pub identity_file: Option<String>,
    /// Whether to force batch mode so a missing key fails instead of
    /// prompting for a password. Unset means enabled.
    pub batch_mode: Option<bool>,
    /// Whether to enforce host key checking.
    #[ortho_config(default = false)]
    pub strict_host_key_checking: bool,
    /// Known hosts file override; `/dev/null` forgets every host.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub known_hosts_file: String,
    /// Seconds `ssh` waits for the TCP handshake on each attempt.
    #[ortho_config(default = DEFAULT_CONNECT_TIMEOUT_SECS)]
    pub connect_timeout_secs: u64,
}

impl SshConfig {
    /// Batch mode setting with the unset case resolved to enabled.
    #[must_use]
    pub const fn batch_mode_enabled(&self) -> bool {
        !matches!(self.batch_mode, Some(false))
    }

    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidConfig`] when any required field is empty
    /// or the connect timeout is zero.
    pub fn validate(&self) -> Result<(), SshError> {
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.scp_bin, "scp_bin")?;
        Self::require_value(&self.user, "user")?;
        Self::require_optional_value(self.identity_file.as_deref(), "identity_file")?;
        if self.connect_timeout_secs == 0 {
            return Err(SshError::InvalidConfig {
                field: String::from("connect_timeout_secs"),
            });
        }
        Ok(())
    }

    /// Loads configuration from defaults, files, and environment variables
    /// without consulting the process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigLoadError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigLoadError> {
        Self::load_from_iter([std::ffi::OsString::from("vastrun")])
            .map_err(|err| ConfigLoadError::Parse(err.to_string()))
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), SshError> {
        match value {
            None => Ok(()),
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(SshError::InvalidConfig {
                field: field.to_owned(),
            }),
        }
    }

    fn require_value(value: &str, field: &str) -> Result<(), SshError> {
        Self::require_optional_value(Some(value), field)
    }
}

