#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # admission-tls
//!
//! TLS identity bootstrap and rotation for Kubernetes admission webhooks.
//!
//! The server identity is obtained in one of three modes:
//!
//! * `selfregister`: a certificate/key file pair, or a self-signed certificate generated in
//!   memory that also serves as the CA bundle registered with the API server.
//! * `secret`: the `tls.crt` and `tls.key` fields of a secret.
//! * `spire` (default): short-lived X.509 SVIDs streamed from the SPIFFE Workload API, written
//!   to a directory as an atomic pair and served to **new TLS handshakes without a restart**.
//!
//! [`TlsBootstrap`] runs the whole sequence and returns a ready [`rustls::ServerConfig`]:
//!
//! ```no_run
//! use admission_tls::{Config, TlsBootstrap};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default()
//!     .with_service_name("nsm-admission-webhook-svc")
//!     .with_namespace("nsm-system")
//!     .with_cert_dir("/run/admission-webhook/certs");
//!
//! let identity = TlsBootstrap::new(config)
//!     .start(CancellationToken::new())
//!     .await?;
//! println!("serving in mode {}", identity.mode);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! Exactly **one** `rustls` crypto provider must be enabled:
//!
//! * `ring` (default)
//! * `aws-lc-rs`
//!
//! `kube` enables [`KubeSecretStore`], which reads secrets through the Kubernetes API.

#[cfg(all(feature = "ring", feature = "aws-lc-rs"))]
compile_error!("Enable only one crypto provider feature: `ring` or `aws-lc-rs`.");

#[cfg(not(any(feature = "ring", feature = "aws-lc-rs")))]
compile_error!("Enable one crypto provider feature: `ring` (default) or `aws-lc-rs`.");

pub mod constants;
pub mod crypto;
pub mod provider;
pub mod tls;
pub mod watcher;

mod bootstrap;
mod config;
mod credential;
mod error;
mod mode;
mod strategy;

pub use bootstrap::{ServingIdentity, TlsBootstrap};
pub use config::{Config, KeyPairPaths, TlsVersion};
pub use credential::{Credential, CredentialError};
pub use error::{Error, Result};
pub use mode::{Mode, ModeError};
pub use provider::{CredentialProvider, SecretStore, SecretStoreError, StaticSecretStore};
pub use strategy::Strategy;
pub use tls::{CertificateSource, LiveCertResolver, ServerConfigBuilder};
pub use watcher::{
    wait_for_certificates, CertificateWatcher, CredentialUpdates, IdentityService,
    IdentityStreamError, WaitPolicy, WatcherError, WatcherHandle, WorkloadApiService,
};

#[cfg(feature = "kube")]
pub use provider::KubeSecretStore;
