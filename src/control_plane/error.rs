//! Error types for the control plane client.

use thiserror::Error;

use super::InstanceId;

/// Errors raised while talking to the marketplace control plane.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ControlPlaneError {
    /// The API answered with a non-success HTTP status.
    #[error("control plane request failed with status {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Detail message from the response body, when supplied.
        message: String,
    },
    /// The request never produced a response.
    #[error("control plane request failed: {message}")]
    Transport {
        /// Message reported by the HTTP client.
        message: String,
    },
    /// The response body did not have the expected shape.
    #[error("unexpected control plane response: {message}")]
    Decode {
        /// Parser message.
        message: String,
    },
    /// The instance is not listed for the current account.
    #[error("no instance with id {id}")]
    NotFound {
        /// Identifier that was looked up.
        id: InstanceId,
    },
    /// The API accepted the request but reported `success: false`.
    #[error("control plane rejected the request: {message}")]
    Rejected {
        /// The `msg` field returned by the API.
        message: String,
    },
}

impl From<reqwest::Error> for ControlPlaneError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            return Self::Decode {
                message: value.to_string(),
            };
        }
        Self::Transport {
            message: value.to_string(),
        }
    }
}
