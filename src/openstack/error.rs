//! Error types for the OpenStack client.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by [`super::OpenStackClient`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OpenStackError {
    /// Raised when the identity configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when the identity service does not issue a token.
    #[error("authentication against {url} failed: {message}")]
    Authentication {
        /// Token endpoint that was called.
        url: String,
        /// Reason reported by the service or the client.
        message: String,
    },
    /// Raised when the catalog lacks an endpoint for a service.
    #[error("no {interface} endpoint for service '{service}' in the catalog")]
    MissingEndpoint {
        /// Catalog service type.
        service: String,
        /// Requested interface.
        interface: String,
    },
    /// Raised when a request cannot be sent or its body cannot be read.
    #[error("request to {url} failed: {message}")]
    Transport {
        /// Target URL.
        url: String,
        /// Message returned by the HTTP client.
        message: String,
    },
    /// Raised when a service answers with a non-success status.
    #[error("{method} {url} returned {status}: {message}")]
    Api {
        /// HTTP method.
        method: String,
        /// Target URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },
    /// Raised when an endpoint or pagination link is not a usable URL.
    #[error("invalid URL {url}: {message}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
        /// Parser message.
        message: String,
    },
    /// Raised when an instance has no port to bind a floating address to.
    #[error("instance {instance_id} has no network port")]
    NoPort {
        /// Instance identifier.
        instance_id: String,
    },
    /// Raised when a response body does not have the expected shape.
    #[error("unexpected response from {url}: {message}")]
    Decode {
        /// Target URL.
        url: String,
        /// Deserialisation error.
        message: String,
    },
}

impl OpenStackError {
    /// Returns `true` when the service rejected the token.
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Api { status: 401, .. })
    }
}

impl From<ConfigError> for OpenStackError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
