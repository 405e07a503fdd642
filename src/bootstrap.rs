//! End-to-end startup sequence: mode, credential, watcher, TLS configuration.

use crate::config::Config;
use crate::error::Result;
use crate::mode::Mode;
use crate::provider::{CredentialProvider, SecretStore};
use crate::strategy::Strategy;
use crate::tls::{CertificateSource, ServerConfigBuilder};
use crate::watcher::{
    wait_for_certificates_until, CertificateWatcher, IdentityService, WaitPolicy, WatcherHandle,
    WatcherError, WorkloadApiService,
};
use log::info;
use rustls::ServerConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Composes the provider, the watcher and the TLS builder for one configuration.
///
/// ```no_run
/// use admission_tls::{Config, TlsBootstrap};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> admission_tls::Result<()> {
/// let config = Config::default().with_webhook_mode("selfregister");
/// let identity = TlsBootstrap::new(config).start(CancellationToken::new()).await?;
/// let _acceptor = tokio_rustls::TlsAcceptor::from(identity.server_config.clone());
/// # Ok(())
/// # }
/// ```
pub struct TlsBootstrap {
    config: Config,
    secret_store: Option<Arc<dyn SecretStore>>,
    identity_service: Option<Arc<dyn IdentityService>>,
    wait_policy: WaitPolicy,
}

impl std::fmt::Debug for TlsBootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsBootstrap")
            .field("config", &self.config)
            .field("secret_store", &self.secret_store.is_some())
            .field("identity_service", &self.identity_service.is_some())
            .field("wait_policy", &self.wait_policy)
            .finish()
    }
}

/// Result of a successful bootstrap.
#[derive(Debug)]
pub struct ServingIdentity {
    /// Configuration to hand to the TLS acceptor.
    pub server_config: Arc<ServerConfig>,
    /// Active mode.
    pub mode: Mode,
    /// Provider of the static and secret modes. Holds the CA bundle.
    pub provider: CredentialProvider,
    /// Running watcher in `spire` mode. Dropping it stops certificate rotation.
    pub watcher: Option<WatcherHandle>,
}

impl TlsBootstrap {
    /// Creates a bootstrap for `config` using the SPIRE agent at its well-known socket.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            secret_store: None,
            identity_service: None,
            wait_policy: WaitPolicy::default(),
        }
    }

    /// Sets the store used in `secret` mode.
    pub fn with_secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secret_store = Some(store);
        self
    }

    /// Replaces the workload identity service used in `spire` mode.
    pub fn with_identity_service(mut self, service: Arc<dyn IdentityService>) -> Self {
        self.identity_service = Some(service);
        self
    }

    /// Sets the budget of the startup wait in `spire` mode.
    pub fn with_wait_policy(mut self, policy: WaitPolicy) -> Self {
        self.wait_policy = policy;
        self
    }

    /// Resolves the mode, obtains the identity and builds the server configuration.
    ///
    /// In `spire` mode this starts the watcher under `cancel` and blocks until the first pair
    /// is on disk, the wait budget runs out or the watcher stops.
    ///
    /// # Errors
    ///
    /// Any configuration or acquisition error, [`crate::WatcherError::Timeout`] when no identity
    /// arrives in time, or the watcher's own error when it fails before the first write.
    pub async fn start(self, cancel: CancellationToken) -> Result<ServingIdentity> {
        let mut provider = CredentialProvider::new(self.config)?;
        if let Some(store) = self.secret_store {
            provider = provider.with_secret_store(store);
        }
        let mode = provider.mode();
        info!("starting TLS bootstrap in mode '{mode}'");

        let (source, watcher) = match provider.strategy() {
            Strategy::WorkloadIdentity { cert_dir } => {
                let service = self
                    .identity_service
                    .unwrap_or_else(|| Arc::new(WorkloadApiService::default()));
                let mut watcher =
                    CertificateWatcher::start(service, cert_dir.clone(), cancel.clone()).await?;
                let mut updates = watcher.updates();
                let policy = self.wait_policy;

                let first_rotation = async {
                    wait_for_certificates_until(cert_dir, policy, &cancel).await?;

                    // Files may be left over from a previous run; serve only what this
                    // watcher wrote.
                    match tokio::time::timeout(policy.budget(), updates.ready()).await {
                        Ok(rotation) => rotation.map(drop),
                        Err(_) => Err(WatcherError::Timeout {
                            dir: cert_dir.clone(),
                            attempts: policy.attempts,
                        }),
                    }
                };

                tokio::select! {
                    ready = first_rotation => ready?,
                    stopped = watcher.stopped() => {
                        stopped?;
                        return Err(WatcherError::Stopped.into());
                    }
                }

                (CertificateSource::Live(updates), Some(watcher))
            }
            Strategy::Static { .. } | Strategy::SecretStore { .. } => {
                let credential = provider.certificate().await?;
                (CertificateSource::Frozen(credential), None)
            }
        };

        let server_config = ServerConfigBuilder::from_config(source, provider.config()).build()?;

        Ok(ServingIdentity {
            server_config: Arc::new(server_config),
            mode,
            provider,
            watcher,
        })
    }
}
