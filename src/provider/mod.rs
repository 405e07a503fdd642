//! The Credential Provider.
//!
//! A [`CredentialProvider`] owns the server identity and trust bundle of the static and secret
//! modes. Both are produced by a single initialization that runs on first access and at most
//! once per provider, no matter how many tasks race for it:
//!
//! * `selfregister` with a configured file pair loads and validates the pair, then reads the CA
//!   bundle file.
//! * `selfregister` without files generates a self-signed identity; its certificate is the trust
//!   bundle.
//! * `secret` fetches the configured secret and reads its `tls.crt` and `tls.key` fields, then
//!   reads the CA bundle file.
//!
//! In `spire` mode the identity is owned by the watcher and the accessors fail with
//! [`Error::UnsupportedInMode`] and [`Error::TrustBundleUnavailable`].

mod secret_store;
pub mod self_signed;

pub use secret_store::{
    BoxError, BoxFuture, SecretData, SecretStore, SecretStoreError, StaticSecretStore,
};

#[cfg(feature = "kube")]
pub use secret_store::KubeSecretStore;

use crate::config::{Config, KeyPairPaths};
use crate::constants::{CERT_FILE_NAME, KEY_FILE_NAME};
use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::mode::Mode;
use crate::strategy::Strategy;
use log::{debug, info};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;

#[derive(Debug)]
struct Resolved {
    credential: Arc<Credential>,
    ca_bundle: Arc<[u8]>,
}

/// Lazily initialized owner of the server credential and trust bundle.
pub struct CredentialProvider {
    config: Config,
    strategy: Strategy,
    secret_store: Option<Arc<dyn SecretStore>>,
    resolved: OnceCell<std::result::Result<Resolved, Arc<Error>>>,
}

impl fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("strategy", &self.strategy)
            .field("secret_store", &self.secret_store.as_ref().map(|_| "<store>"))
            .field("initialized", &self.resolved.initialized())
            .finish()
    }
}

impl CredentialProvider {
    /// Creates a provider for `config`.
    ///
    /// The mode is resolved immediately; nothing is read or generated until the first call to
    /// [`certificate`](Self::certificate) or [`ca_bundle`](Self::ca_bundle).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mode`] for an unknown mode and [`Error::MissingSecretName`] when `secret`
    /// mode has no secret name.
    pub fn new(config: Config) -> Result<Self> {
        let strategy = Strategy::resolve(&config)?;
        debug!("credential provider using mode '{}'", strategy.mode());
        Ok(Self {
            config,
            strategy,
            secret_store: None,
            resolved: OnceCell::new(),
        })
    }

    /// Sets the store queried in `secret` mode.
    pub fn with_secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secret_store = Some(store);
        self
    }

    /// Returns the active mode.
    pub fn mode(&self) -> Mode {
        self.strategy.mode()
    }

    /// Returns the resolved acquisition strategy.
    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// Returns the configuration this provider was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the server credential, initializing the provider on first use.
    ///
    /// Concurrent first callers wait for a single initialization and all receive the same
    /// credential. A failed initialization is cached as well: it is never retried, and every
    /// caller receives the same failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedInMode`] in `spire` mode, otherwise
    /// [`Error::Initialization`] wrapping the acquisition error (see [`Error::root`]).
    pub async fn certificate(&self) -> Result<Arc<Credential>> {
        if let Strategy::WorkloadIdentity { .. } = self.strategy {
            return Err(Error::UnsupportedInMode(self.mode()));
        }
        Ok(self.resolved().await?.credential.clone())
    }

    /// Returns the PEM trust bundle used to register the webhook, initializing the provider on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrustBundleUnavailable`] in `spire` mode, otherwise
    /// [`Error::Initialization`] wrapping the acquisition error.
    pub async fn ca_bundle(&self) -> Result<Arc<[u8]>> {
        if let Strategy::WorkloadIdentity { .. } = self.strategy {
            return Err(Error::TrustBundleUnavailable(self.mode()));
        }
        Ok(self.resolved().await?.ca_bundle.clone())
    }

    async fn resolved(&self) -> Result<&Resolved> {
        self.resolved
            .get_or_init(|| async { self.initialize().await.map_err(Arc::new) })
            .await
            .as_ref()
            .map_err(|e| Error::Initialization(e.clone()))
    }

    async fn initialize(&self) -> Result<Resolved> {
        let resolved = match &self.strategy {
            Strategy::Static {
                key_pair: Some(paths),
                ca_bundle,
            } => {
                let credential = load_key_pair(paths).await?;
                let ca_bundle = read_ca_bundle(ca_bundle.as_deref(), Mode::Static).await?;
                info!(
                    "loaded certificate from {} (expires {})",
                    paths.cert.display(),
                    credential.not_after()
                );
                Resolved {
                    credential: Arc::new(credential),
                    ca_bundle,
                }
            }
            Strategy::Static { key_pair: None, .. } => {
                let generated = self_signed::generate(&self.config)?;
                info!(
                    "generated self-signed certificate for {} (expires {})",
                    self.config.dns_names().join(", "),
                    generated.credential.not_after()
                );
                Resolved {
                    credential: Arc::new(generated.credential),
                    ca_bundle: Arc::from(generated.cert_pem.into_bytes()),
                }
            }
            Strategy::SecretStore {
                secret_name,
                ca_bundle,
            } => {
                let store = self.secret_store.as_ref().ok_or(Error::MissingSecretStore)?;
                let credential = fetch_secret(store.as_ref(), secret_name).await?;
                let ca_bundle = read_ca_bundle(ca_bundle.as_deref(), Mode::SecretStore).await?;
                info!(
                    "loaded certificate from secret '{}' (expires {})",
                    secret_name,
                    credential.not_after()
                );
                Resolved {
                    credential: Arc::new(credential),
                    ca_bundle,
                }
            }
            Strategy::WorkloadIdentity { .. } => {
                return Err(Error::UnsupportedInMode(Mode::WorkloadIdentity))
            }
        };

        resolved
            .credential
            .certified_key(&crate::crypto::provider())?;
        Ok(resolved)
    }
}

async fn load_key_pair(paths: &KeyPairPaths) -> Result<Credential> {
    let cert = read_file(&paths.cert).await?;
    let key = zeroize::Zeroizing::new(read_file(&paths.key).await?);
    Ok(Credential::from_pem(&cert, &key)?)
}

async fn fetch_secret(store: &dyn SecretStore, name: &str) -> Result<Credential> {
    let mut data = store.get(name).await?;

    let mut field = |field: &'static str| {
        data.remove(field)
            .ok_or_else(|| SecretStoreError::MissingField {
                secret: name.to_owned(),
                field,
            })
    };
    let cert = field(CERT_FILE_NAME)?;
    let key = zeroize::Zeroizing::new(field(KEY_FILE_NAME)?);

    Ok(Credential::from_pem(&cert, &key)?)
}

async fn read_ca_bundle(path: Option<&Path>, mode: Mode) -> Result<Arc<[u8]>> {
    let path = path.ok_or(Error::MissingCaBundlePath(mode))?;
    Ok(Arc::from(read_file(path).await?))
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}
