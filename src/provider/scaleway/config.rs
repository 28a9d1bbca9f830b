//! Scaleway credentials and defaults.

use std::collections::BTreeMap;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::{ConfigError, FieldMetadata};

/// Scaleway specific configuration derived from environment variables and
/// configuration files, with `variables.json` as the final fallback for
/// credentials.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Access key assigned to the Scaleway application. Captured for
    /// completeness; API calls only need the secret key.
    pub access_key: Option<String>,
    /// Secret key used for authentication.
    pub secret_key: Option<String>,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used for billing and resource scoping.
    pub default_project_id: Option<String>,
    /// Preferred availability zone. Defaults to `fr-par-1`.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Commercial type for new instances. Defaults to `DEV1-S`.
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub default_instance_type: String,
    /// Human-friendly image label (for example `Ubuntu 24.04 Noble Numbat`).
    #[ortho_config(default = "Ubuntu 24.04 Noble Numbat".to_owned())]
    pub default_image: String,
    /// CPU architecture used to select the correct image variant.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
}

impl Default for ScalewayConfig {
    fn default() -> Self {
        Self {
            access_key: None,
            secret_key: None,
            default_organization_id: None,
            default_project_id: None,
            default_zone: String::from("fr-par-1"),
            default_instance_type: String::from("DEV1-S"),
            default_image: String::from("Ubuntu 24.04 Noble Numbat"),
            default_architecture: String::from("x86_64"),
        }
    }
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("overcast")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Fills unset credentials from the store's variables document, which
    /// uses the environment variable names as keys.
    #[must_use]
    pub fn with_variables(mut self, variables: &BTreeMap<String, String>) -> Self {
        let lookup = |key: &str| variables.get(key).filter(|v| !v.trim().is_empty()).cloned();
        if self.access_key.is_none() {
            self.access_key = lookup("SCW_ACCESS_KEY");
        }
        if self.secret_key.is_none() {
            self.secret_key = lookup("SCW_SECRET_KEY");
        }
        if self.default_organization_id.is_none() {
            self.default_organization_id = lookup("SCW_DEFAULT_ORGANIZATION_ID");
        }
        if self.default_project_id.is_none() {
            self.default_project_id = lookup("SCW_DEFAULT_PROJECT_ID");
        }
        self
    }

    /// Returns the validated secret key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no secret key is set.
    pub fn secret_key(&self) -> Result<&str, ConfigError> {
        let value = self.secret_key.as_deref();
        FieldMetadata::new(
            "Scaleway API secret key",
            "SCW_SECRET_KEY",
            "secret_key",
            "scaleway",
        )
        .require(value)?;
        Ok(value.unwrap_or_default())
    }

    /// Returns the validated project identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no project is set.
    pub fn project_id(&self) -> Result<&str, ConfigError> {
        let value = self.default_project_id.as_deref();
        FieldMetadata::new(
            "Scaleway project ID",
            "SCW_DEFAULT_PROJECT_ID",
            "default_project_id",
            "scaleway",
        )
        .require(value)?;
        Ok(value.unwrap_or_default())
    }

    /// Performs semantic validation on required fields. Error messages
    /// include guidance on how to provide missing values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.secret_key()?;
        self.project_id()?;
        for (value, meta) in [
            (
                &self.default_image,
                FieldMetadata::new("VM image", "SCW_DEFAULT_IMAGE", "default_image", "scaleway"),
            ),
            (
                &self.default_instance_type,
                FieldMetadata::new(
                    "instance type",
                    "SCW_DEFAULT_INSTANCE_TYPE",
                    "default_instance_type",
                    "scaleway",
                ),
            ),
            (
                &self.default_zone,
                FieldMetadata::new(
                    "availability zone",
                    "SCW_DEFAULT_ZONE",
                    "default_zone",
                    "scaleway",
                ),
            ),
            (
                &self.default_architecture,
                FieldMetadata::new(
                    "CPU architecture",
                    "SCW_DEFAULT_ARCHITECTURE",
                    "default_architecture",
                    "scaleway",
                ),
            ),
        ] {
            meta.require(Some(value.as_str()))?;
        }
        Ok(())
    }
}
