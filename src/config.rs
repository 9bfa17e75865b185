//! Configuration loading via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::status::DEFAULT_STATUS_PORT;

/// Tool-wide configuration derived from environment variables,
/// configuration files, and CLI flags. CLI flags always win over these
/// defaults.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "BRKT")]
pub struct BrktConfig {
    /// Zone encryptor instances are launched into.
    #[ortho_config(default = "us-central1-a".to_owned())]
    pub default_zone: String,
    /// Network/VPC encryptor instances are launched into, when set.
    pub default_network: Option<String>,
    /// Subnet encryptor instances are launched into, when set.
    pub default_subnet: Option<String>,
    /// Machine type for encryptor and updater instances.
    #[ortho_config(default = "n1-standard-4".to_owned())]
    pub default_instance_type: String,
    /// Port the encryption agent serves status on.
    #[ortho_config(default = DEFAULT_STATUS_PORT)]
    pub status_port: u16,
    /// Total budget, in seconds, for retrying transient provider errors.
    #[ortho_config(default = 600)]
    pub retry_timeout_secs: u64,
    /// Identity token passed to the encryptor. Usually supplied via the
    /// `BRKT_TOKEN` environment variable rather than a file.
    pub token: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl BrktConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to the configuration file",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments.
    /// Values merge defaults, configuration files, and environment
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("brkt-imager")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is
    /// empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.default_zone,
            &FieldMetadata::new("availability zone", "BRKT_DEFAULT_ZONE", "default_zone"),
        )?;
        Self::require_field(
            &self.default_instance_type,
            &FieldMetadata::new(
                "instance type",
                "BRKT_DEFAULT_INSTANCE_TYPE",
                "default_instance_type",
            ),
        )?;
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BrktConfig {
        BrktConfig {
            default_zone: String::from("us-central1-a"),
            default_network: None,
            default_subnet: None,
            default_instance_type: String::from("n1-standard-4"),
            status_port: DEFAULT_STATUS_PORT,
            retry_timeout_secs: 600,
            token: None,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn blank_zone_is_rejected_with_guidance() {
        let bad = BrktConfig {
            default_zone: String::from("  "),
            ..config()
        };
        let err = bad.validate().expect_err("blank zone");
        assert!(err.to_string().contains("BRKT_DEFAULT_ZONE"), "got: {err}");
    }
}
