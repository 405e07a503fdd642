//! Resolution of a [`Config`] into the acquisition plan for the active [`Mode`].

use crate::config::{Config, KeyPairPaths};
use crate::error::{Error, Result};
use crate::mode::Mode;
use std::path::{Path, PathBuf};

/// How the server identity is obtained, with the inputs each mode needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Load `key_pair` when configured, otherwise generate a self-signed identity.
    Static {
        /// Certificate and key files.
        key_pair: Option<KeyPairPaths>,
        /// Trust bundle file, required when `key_pair` is set.
        ca_bundle: Option<PathBuf>,
    },

    /// Read `tls.crt` and `tls.key` from a named secret.
    SecretStore {
        /// Name of the secret.
        secret_name: String,
        /// Trust bundle file.
        ca_bundle: Option<PathBuf>,
    },

    /// Follow the workload identity service and keep `cert_dir` current.
    WorkloadIdentity {
        /// Directory holding `tls.crt` and `tls.key`.
        cert_dir: PathBuf,
    },
}

impl Strategy {
    /// Resolves the mode and its required inputs from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mode`] for an unknown mode string and [`Error::MissingSecretName`] when
    /// `secret` mode has no secret name.
    pub fn resolve(config: &Config) -> Result<Self> {
        let ca_bundle = config.ca_bundle_path().map(Path::to_path_buf);

        match config.mode()? {
            Mode::Static => Ok(Strategy::Static {
                key_pair: config.key_pair_paths(),
                ca_bundle,
            }),
            Mode::SecretStore => {
                let secret_name = config.secret_name().ok_or(Error::MissingSecretName)?;
                Ok(Strategy::SecretStore {
                    secret_name: secret_name.to_owned(),
                    ca_bundle,
                })
            }
            Mode::WorkloadIdentity => Ok(Strategy::WorkloadIdentity {
                cert_dir: config.cert_dir.clone(),
            }),
        }
    }

    /// Returns the mode this strategy implements.
    pub fn mode(&self) -> Mode {
        match self {
            Strategy::Static { .. } => Mode::Static,
            Strategy::SecretStore { .. } => Mode::SecretStore,
            Strategy::WorkloadIdentity { .. } => Mode::WorkloadIdentity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::ModeError;

    #[test]
    fn static_without_files_generates() {
        let config = Config::default().with_webhook_mode("selfregister");
        assert_eq!(
            Strategy::resolve(&config).unwrap(),
            Strategy::Static {
                key_pair: None,
                ca_bundle: None
            }
        );
    }

    #[test]
    fn static_with_files() {
        let config = Config::default()
            .with_webhook_mode("selfregister")
            .with_key_pair_files("/tls/tls.crt", "/tls/tls.key")
            .with_ca_bundle_file("/tls/ca.crt");

        let strategy = Strategy::resolve(&config).unwrap();
        assert_eq!(strategy.mode(), Mode::Static);
        assert_eq!(
            strategy,
            Strategy::Static {
                key_pair: Some(KeyPairPaths {
                    cert: "/tls/tls.crt".into(),
                    key: "/tls/tls.key".into(),
                }),
                ca_bundle: Some("/tls/ca.crt".into()),
            }
        );
    }

    #[test]
    fn secret_requires_name() {
        let config = Config::default().with_webhook_mode("secret");
        assert!(matches!(
            Strategy::resolve(&config),
            Err(Error::MissingSecretName)
        ));

        let config = config.with_secret_name("webhook-tls");
        assert_eq!(
            Strategy::resolve(&config).unwrap(),
            Strategy::SecretStore {
                secret_name: "webhook-tls".into(),
                ca_bundle: None
            }
        );
    }

    #[test]
    fn workload_identity_uses_cert_dir() {
        let config = Config::default().with_cert_dir("/run/certs");
        assert_eq!(
            Strategy::resolve(&config).unwrap(),
            Strategy::WorkloadIdentity {
                cert_dir: "/run/certs".into()
            }
        );
    }

    #[test]
    fn unknown_mode_fails() {
        let config = Config::default().with_webhook_mode("vault");
        match Strategy::resolve(&config) {
            Err(Error::Mode(ModeError::Unknown(value))) => assert_eq!(value, "vault"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
