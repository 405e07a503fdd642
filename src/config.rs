//! Configuration of the TLS identity bootstrap.
//!
//! [`Config`] mirrors the environment-driven settings of the admission webhook deployment. Every
//! field has a default, so a partial document deserializes into a usable configuration:
//!
//! ```
//! use admission_tls::{Config, Mode};
//!
//! let config = Config::default()
//!     .with_service_name("nsm-admission-webhook-svc")
//!     .with_namespace("nsm-system")
//!     .with_webhook_mode("selfregister");
//!
//! assert_eq!(config.mode()?, Mode::Static);
//! assert_eq!(
//!     config.dns_names(),
//!     ["nsm-admission-webhook-svc.nsm-system", "nsm-admission-webhook-svc.nsm-system.svc"]
//! );
//! # Ok::<(), admission_tls::ModeError>(())
//! ```

use crate::mode::{Mode, ModeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings recognized by the identity bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Name of this admission webhook instance.
    pub name: String,

    /// Name of the service fronting the webhook; used for certificate SANs.
    pub service_name: String,

    /// Namespace of the webhook deployment; used for certificate SANs and secret lookups.
    pub namespace: String,

    /// Acquisition mode: `selfregister`, `spire` or `secret`.
    pub webhook_mode: String,

    /// Name of the TLS secret read in `secret` mode.
    pub secret_name: Option<String>,

    /// PEM certificate chain used in `selfregister` mode instead of a generated identity.
    pub cert_file_path: Option<PathBuf>,

    /// PEM private key matching `cert_file_path`.
    pub key_file_path: Option<PathBuf>,

    /// PEM trust bundle presented for webhook registration.
    pub ca_bundle_file_path: Option<PathBuf>,

    /// Directory where `spire` mode keeps `tls.crt` and `tls.key` up to date.
    pub cert_dir: PathBuf,

    /// Lowest TLS protocol version accepted by the server.
    pub min_tls_version: TlsVersion,

    /// ALPN protocols advertised by the server, most preferred first.
    pub alpn_protocols: Vec<String>,

    /// OpenTelemetry collector endpoint. Not consumed by this crate.
    pub open_telemetry_endpoint: String,

    /// Interval between metric exports. Not consumed by this crate.
    #[serde(with = "duration_secs")]
    pub metrics_export_interval: Duration,
}

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TlsVersion {
    /// TLS 1.2 and later.
    #[default]
    #[serde(rename = "1.2")]
    Tls12,

    /// TLS 1.3 only.
    #[serde(rename = "1.3")]
    Tls13,
}

/// Certificate and key file locations of a statically configured identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairPaths {
    /// PEM certificate chain.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "admission-webhook-k8s".into(),
            service_name: "default".into(),
            namespace: "default".into(),
            webhook_mode: Mode::default().as_str().into(),
            secret_name: None,
            cert_file_path: None,
            key_file_path: None,
            ca_bundle_file_path: None,
            cert_dir: PathBuf::from("/run/admission-webhook/certs"),
            min_tls_version: TlsVersion::default(),
            alpn_protocols: vec!["h2".into(), "http/1.1".into()],
            open_telemetry_endpoint: "otel-collector.observability.svc.cluster.local:4317".into(),
            metrics_export_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Parses [`Config::webhook_mode`].
    ///
    /// # Errors
    ///
    /// Returns [`ModeError::Unknown`] if the value does not name a mode.
    pub fn mode(&self) -> Result<Mode, ModeError> {
        self.webhook_mode.parse()
    }

    /// DNS names a generated certificate must cover: `{service}.{namespace}` and
    /// `{service}.{namespace}.svc`.
    pub fn dns_names(&self) -> [String; 2] {
        let base = format!("{}.{}", self.service_name, self.namespace);
        let svc = format!("{base}.svc");
        [base, svc]
    }

    /// Certificate and key paths, when both are configured.
    pub fn key_pair_paths(&self) -> Option<KeyPairPaths> {
        match (non_empty_path(&self.cert_file_path), non_empty_path(&self.key_file_path)) {
            (Some(cert), Some(key)) => Some(KeyPairPaths {
                cert: cert.to_path_buf(),
                key: key.to_path_buf(),
            }),
            _ => None,
        }
    }

    /// Trust bundle path, when configured.
    pub fn ca_bundle_path(&self) -> Option<&Path> {
        non_empty_path(&self.ca_bundle_file_path)
    }

    /// Secret name, when configured and non-empty.
    pub fn secret_name(&self) -> Option<&str> {
        self.secret_name.as_deref().filter(|name| !name.is_empty())
    }

    /// Sets the instance name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the service name.
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Sets the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the acquisition mode string.
    pub fn with_webhook_mode(mut self, mode: impl Into<String>) -> Self {
        self.webhook_mode = mode.into();
        self
    }

    /// Sets the secret name used in `secret` mode.
    pub fn with_secret_name(mut self, secret_name: impl Into<String>) -> Self {
        self.secret_name = Some(secret_name.into());
        self
    }

    /// Sets the certificate and key file paths.
    pub fn with_key_pair_files(
        mut self,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
    ) -> Self {
        self.cert_file_path = Some(cert.into());
        self.key_file_path = Some(key.into());
        self
    }

    /// Sets the trust bundle file path.
    pub fn with_ca_bundle_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_bundle_file_path = Some(path.into());
        self
    }

    /// Sets the directory managed in `spire` mode.
    pub fn with_cert_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cert_dir = dir.into();
        self
    }

    /// Sets the minimum TLS version.
    pub fn with_min_tls_version(mut self, version: TlsVersion) -> Self {
        self.min_tls_version = version;
        self
    }

    /// Sets the advertised ALPN protocols.
    pub fn with_alpn_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alpn_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }
}

fn non_empty_path(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref().filter(|p| !p.as_os_str().is_empty())
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
