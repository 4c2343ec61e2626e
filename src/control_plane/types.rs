//! Value types describing marketplace instances as reported by the control
//! plane.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::Serialize;

/// Numeric identifier assigned to a rented instance (a "contract").
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for InstanceId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl FromStr for InstanceId {
    type Err = ParseIntError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value.trim().parse().map(Self)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state observed for an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstanceState {
    /// The machine is being allocated, pulled, or booted.
    Provisioning,
    /// The container is up; SSH may still refuse connections for a while.
    Running,
    /// The instance exists but is not running.
    Stopped,
    /// Any status string the client does not recognise.
    Other(String),
}

impl InstanceState {
    /// Maps the control plane's `actual_status` field onto a state.
    #[must_use]
    pub fn from_status(status: Option<&str>) -> Self {
        match status.map(str::trim) {
            Some("running") => Self::Running,
            Some("loading" | "created" | "scheduling" | "provisioning") => Self::Provisioning,
            Some("stopped" | "exited" | "offline") => Self::Stopped,
            Some(other) => Self::Other(other.to_owned()),
            None => Self::Other(String::from("unknown")),
        }
    }

    /// Returns `true` when the instance reports the running state.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioning => f.write_str("provisioning"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Other(status) => f.write_str(status),
        }
    }
}

/// SSH endpoint advertised for an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    /// Hostname or IP address of the SSH gateway.
    pub host: String,
    /// TCP port forwarded to the instance's SSH daemon.
    pub port: u16,
}

impl Endpoint {
    /// Builds an endpoint from its parts.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Renders the endpoint as a URL for the given scheme, for example
    /// `ssh://root@host:port`.
    #[must_use]
    pub fn url(&self, scheme: &str, user: &str) -> String {
        format!("{scheme}://{user}@{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Point-in-time view of an instance. Never cached across polls.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Control plane identifier.
    pub id: InstanceId,
    /// Observed lifecycle state.
    pub state: InstanceState,
    /// SSH endpoint, absent until the control plane assigns one.
    pub endpoint: Option<Endpoint>,
    /// Free-form label attached by the owner.
    pub label: Option<String>,
}

/// State the caller asks the control plane to move an instance into.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    /// Start (or restart) the instance.
    Running,
    /// Stop the instance, keeping its disk.
    Stopped,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// Parameters for renting a new instance from a marketplace offer.
#[derive(Clone, Debug, PartialEq)]
pub struct CreateInstanceRequest {
    /// Offer (ask) identifier to rent.
    pub offer_id: u64,
    /// Docker image to launch.
    pub image: String,
    /// Local disk size in gigabytes.
    pub disk_gb: u32,
    /// Optional bid price in dollars per hour.
    pub price: Option<f64>,
    /// Optional label to attach to the instance.
    pub label: Option<String>,
    /// Optional onstart script contents.
    pub onstart: Option<String>,
}

impl CreateInstanceRequest {
    /// Starts a request for `offer_id` running `image` with the default disk
    /// size.
    #[must_use]
    pub fn new(offer_id: u64, image: impl Into<String>) -> Self {
        Self {
            offer_id,
            image: image.into(),
            disk_gb: DEFAULT_DISK_GB,
            price: None,
            label: None,
            onstart: None,
        }
    }
}

/// Disk size requested when the caller does not choose one.
pub const DEFAULT_DISK_GB: u32 = 10;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some("running"), InstanceState::Running)]
    #[case(Some("loading"), InstanceState::Provisioning)]
    #[case(Some("created"), InstanceState::Provisioning)]
    #[case(Some("exited"), InstanceState::Stopped)]
    #[case(Some("offline"), InstanceState::Stopped)]
    #[case(Some("rebooting"), InstanceState::Other(String::from("rebooting")))]
    #[case(None, InstanceState::Other(String::from("unknown")))]
    fn maps_actual_status(#[case] status: Option<&str>, #[case] expected: InstanceState) {
        assert_eq!(InstanceState::from_status(status), expected);
    }

    #[test]
    fn endpoint_renders_urls() {
        let endpoint = Endpoint::new("ssh4.vast.ai", 20_412);
        assert_eq!(endpoint.url("ssh", "root"), "ssh://root@ssh4.vast.ai:20412");
        assert_eq!(endpoint.to_string(), "ssh4.vast.ai:20412");
    }

    #[test]
    fn instance_id_parses_trimmed_input() {
        let id: InstanceId = " 42 ".parse().unwrap_or_else(|err| panic!("parse: {err}"));
        assert_eq!(id, InstanceId::new(42));
    }
}
