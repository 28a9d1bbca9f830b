//! Error types for the Scaleway provider.

use scaleway_rs::ScalewayError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::provider::ProviderError;

use super::PROVIDER_NAME;

/// Errors raised by the Scaleway provider.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayProviderError {
    /// Credentials or defaults are incomplete.
    #[error("scaleway is not configured: {0}")]
    Config(String),
    /// No image with the label is published for the zone and architecture.
    #[error("no {arch} image labelled '{label}' in {zone}")]
    ImageNotFound {
        /// Label from the create request or configuration.
        label: String,
        /// Architecture the image must match.
        arch: String,
        /// Zone searched.
        zone: String,
    },
    /// The zone does not offer the requested size.
    #[error("size '{instance_type}' is not offered in {zone}")]
    InstanceTypeUnavailable {
        /// Commercial type asked for.
        instance_type: String,
        /// Zone the server lives in.
        zone: String,
    },
    /// The server's state does not allow the `poweron` action.
    #[error("server {instance_id} cannot be booted from state {state}")]
    PowerOnNotAllowed {
        /// Scaleway server identifier.
        instance_id: String,
        /// State reported by the API.
        state: String,
    },
    /// The SDK or the HTTP layer failed.
    #[error("scaleway api: {message}")]
    Api {
        /// Underlying error text.
        message: String,
    },
}

impl From<ScalewayError> for ScalewayProviderError {
    fn from(value: ScalewayError) -> Self {
        Self::Api {
            message: value.to_string(),
        }
    }
}

impl From<reqwest::Error> for ScalewayProviderError {
    fn from(value: reqwest::Error) -> Self {
        Self::Api {
            message: value.to_string(),
        }
    }
}

impl From<ConfigError> for ScalewayProviderError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<ScalewayProviderError> for ProviderError {
    fn from(value: ScalewayProviderError) -> Self {
        match value {
            ScalewayProviderError::Config(message) => Self::Config(message),
            other => Self::Api {
                provider: PROVIDER_NAME.to_owned(),
                message: other.to_string(),
            },
        }
    }
}
