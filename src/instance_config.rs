//! Boot-time configuration delivered to the encryptor via user-data.
//!
//! The encryptor reads a JSON blob under the `brkt` key of its user-data at
//! first boot: identity token, crypto policy, service endpoints, and the
//! mode it should operate in. The payload is gzipped before hand-off since
//! providers cap user-data size.

use std::io::Write;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use thiserror::Error;

use crate::session::CryptoPolicy;

/// Role the launched instance plays.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceMode {
    /// Encrypting an unencrypted guest for the first time.
    Creator,
    /// Refreshing the metavisor on an already-encrypted guest.
    Updater,
    /// Booting an encrypted image as a regular metavisor instance.
    Metavisor,
}

/// Errors raised while assembling the boot configuration.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum InstanceConfigError {
    /// Raised when a referenced payload file cannot be read.
    #[error("failed to read {path}: {message}")]
    FileRead {
        /// Path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the payload cannot be serialised or compressed.
    #[error("failed to render user-data: {0}")]
    Render(String),
}

/// Install-time configuration serialised into the instance's user-data.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct InstanceConfig {
    /// Mode the instance boots in.
    pub mode: InstanceMode,
    /// Session the instance belongs to.
    pub session_id: String,
    /// JWT identifying the customer to the key management service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_token: Option<String>,
    /// Encryption algorithm selector.
    pub crypto_policy_type: String,
    /// Management service endpoint, `host:port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
    /// HSM proxy endpoint, `host:port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hsmproxy_endpoint: Option<String>,
    /// NTP servers the metavisor syncs against.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ntp_servers: Vec<String>,
    /// Proxy configuration document, verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_config: Option<String>,
    /// PEM CA certificate baked in for on-prem management services.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
}

impl InstanceConfig {
    /// Creates a configuration for the given mode and session.
    #[must_use]
    pub fn new(mode: InstanceMode, session_id: impl Into<String>, policy: CryptoPolicy) -> Self {
        Self {
            mode,
            session_id: session_id.into(),
            identity_token: None,
            crypto_policy_type: policy.as_str().to_owned(),
            api_endpoint: None,
            hsmproxy_endpoint: None,
            ntp_servers: Vec::new(),
            proxy_config: None,
            ca_cert: None,
        }
    }

    /// Sets the identity token.
    #[must_use]
    pub fn with_identity_token(mut self, token: Option<String>) -> Self {
        self.identity_token = token;
        self
    }

    /// Sets the NTP server list.
    #[must_use]
    pub fn with_ntp_servers(mut self, servers: Vec<String>) -> Self {
        self.ntp_servers = servers;
        self
    }

    /// Loads the proxy configuration document from a local file.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceConfigError::FileRead`] when the file is missing or
    /// unreadable.
    pub fn with_proxy_config_file(mut self, path: &str) -> Result<Self, InstanceConfigError> {
        self.proxy_config = Some(read_payload_file(path)?);
        Ok(self)
    }

    /// Loads the CA certificate from a local PEM file.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceConfigError::FileRead`] when the file is missing or
    /// unreadable.
    pub fn with_ca_cert_file(mut self, path: &str) -> Result<Self, InstanceConfigError> {
        self.ca_cert = Some(read_payload_file(path)?);
        Ok(self)
    }

    /// Renders the user-data JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceConfigError::Render`] when serialisation fails.
    pub fn make_userdata(&self) -> Result<String, InstanceConfigError> {
        #[derive(Serialize)]
        struct UserData<'a> {
            brkt: &'a InstanceConfig,
        }
        serde_json::to_string(&UserData { brkt: self })
            .map_err(|err| InstanceConfigError::Render(err.to_string()))
    }

    /// Renders and gzips the user-data for delivery to the provider.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceConfigError::Render`] when serialisation or
    /// compression fails.
    pub fn make_gzipped_userdata(&self) -> Result<Vec<u8>, InstanceConfigError> {
        let rendered = self.make_userdata()?;
        gzip_userdata(&rendered)
    }
}

/// Gzips a rendered user-data document.
///
/// # Errors
///
/// Returns [`InstanceConfigError::Render`] when compression fails.
pub fn gzip_userdata(payload: &str) -> Result<Vec<u8>, InstanceConfigError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(payload.as_bytes())
        .map_err(|err| InstanceConfigError::Render(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| InstanceConfigError::Render(err.to_string()))
}

/// Reads a local payload file (proxy config, CA certificate) for inclusion
/// in the boot configuration.
///
/// # Errors
///
/// Returns [`InstanceConfigError::FileRead`] when the file is missing or
/// unreadable.
pub fn read_payload_file(path: &str) -> Result<String, InstanceConfigError> {
    let path_buf = Utf8Path::new(path);
    let (dir_path, file_path) = if path_buf.is_absolute() {
        let parent = path_buf.parent().ok_or_else(|| InstanceConfigError::FileRead {
            path: path.to_owned(),
            message: String::from("path has no parent directory"),
        })?;
        let file_name = path_buf.file_name().ok_or_else(|| InstanceConfigError::FileRead {
            path: path.to_owned(),
            message: String::from("path has no file name"),
        })?;
        (parent, Utf8Path::new(file_name))
    } else {
        (Utf8Path::new("."), path_buf)
    };

    let dir = Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| {
        InstanceConfigError::FileRead {
            path: path.to_owned(),
            message: err.to_string(),
        }
    })?;
    dir.read_to_string(file_path)
        .map_err(|err| InstanceConfigError::FileRead {
            path: path.to_owned(),
            message: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn userdata_carries_mode_and_policy() {
        let config = InstanceConfig::new(InstanceMode::Creator, "s1", CryptoPolicy::Gcm)
            .with_identity_token(Some(String::from("not-a-jwt")));
        let rendered = config.make_userdata().expect("render");
        let value: serde_json::Value = serde_json::from_str(&rendered).expect("json");
        assert_eq!(value["brkt"]["mode"], "creator");
        assert_eq!(value["brkt"]["crypto_policy_type"], "gcm");
        assert_eq!(value["brkt"]["session_id"], "s1");
        assert_eq!(value["brkt"]["identity_token"], "not-a-jwt");
    }

    #[test]
    fn optional_fields_are_omitted() {
        let config = InstanceConfig::new(InstanceMode::Updater, "s1", CryptoPolicy::Xts);
        let rendered = config.make_userdata().expect("render");
        assert!(!rendered.contains("identity_token"));
        assert!(!rendered.contains("ntp_servers"));
        assert!(rendered.contains("updater"));
    }

    #[test]
    fn gzip_round_trips() {
        let config = InstanceConfig::new(InstanceMode::Creator, "s1", CryptoPolicy::Gcm);
        let compressed = config.make_gzipped_userdata().expect("gzip");
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).expect("decode");
        assert_eq!(decompressed, config.make_userdata().expect("render"));
    }

    #[test]
    fn missing_payload_file_is_reported() {
        let err = InstanceConfig::new(InstanceMode::Creator, "s1", CryptoPolicy::Gcm)
            .with_proxy_config_file("/definitely/not/here.yaml")
            .expect_err("missing file");
        assert!(matches!(err, InstanceConfigError::FileRead { .. }));
    }
}
