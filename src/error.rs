//! Error types for identity acquisition and TLS configuration.

use crate::credential::CredentialError;
use crate::mode::{Mode, ModeError};
use crate::provider::SecretStoreError;
use crate::watcher::WatcherError;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by `admission-tls`.
///
/// Every variant is fatal for startup except [`WatcherError::Timeout`], which a caller may
/// choose to retry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The configured mode string is invalid.
    #[error(transparent)]
    Mode(#[from] ModeError),

    /// `secret` mode was selected without a secret name.
    #[error("webhook mode 'secret' requires a non-empty secret name")]
    MissingSecretName,

    /// A trust bundle is required but no file path is configured.
    #[error("webhook mode '{0}' requires a CA bundle file path")]
    MissingCaBundlePath(Mode),

    /// `secret` mode was selected but no secret store was supplied.
    #[error("webhook mode 'secret' requires a secret store")]
    MissingSecretStore,

    /// The accessor is not available in the active mode.
    #[error("operation is not available in webhook mode '{0}'")]
    UnsupportedInMode(Mode),

    /// The trust bundle is provided by the identity system in the active mode.
    #[error("no static trust bundle in webhook mode '{0}'")]
    TrustBundleUnavailable(Mode),

    /// A live TLS configuration was requested before the first credential was written.
    #[error("no workload identity credential has been written yet")]
    NotReady,

    /// The one-time initialization of a credential provider failed. The same failure is returned
    /// to every caller, then and later.
    #[error(transparent)]
    Initialization(Arc<Error>),

    /// A configured file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    ReadFile {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Certificate or key material is invalid.
    #[error("invalid credential: {0}")]
    Credential(#[from] CredentialError),

    /// The self-signed identity could not be generated.
    #[error("failed to generate self-signed certificate: {0}")]
    SelfSigned(#[from] rcgen::Error),

    /// The secret store lookup failed.
    #[error(transparent)]
    SecretStore(#[from] SecretStoreError),

    /// The workload identity watcher failed.
    #[error(transparent)]
    Watcher(#[from] WatcherError),

    /// A rustls configuration error occurred.
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),
}

impl Error {
    /// Returns the failure behind an [`Error::Initialization`], or `self` for any other variant.
    pub fn root(&self) -> &Error {
        match self {
            Error::Initialization(inner) => inner.root(),
            other => other,
        }
    }
}
