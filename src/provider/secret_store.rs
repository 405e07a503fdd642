//! Boundary to the remote key/value store holding TLS secrets.
//!
//! The provider only needs one operation, fetching a named secret as a map of fields. The
//! Kubernetes implementation is available behind the `kube` feature; [`StaticSecretStore`]
//! serves fixed data for tests and local runs.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by [`SecretStore`] implementations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Boxed error carried by store failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Field names and raw values of a secret.
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Errors produced by a [`SecretStore`] or while reading its data.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SecretStoreError {
    /// The secret does not exist.
    #[error("secret '{0}' not found")]
    NotFound(String),

    /// The store could not be reached or refused the request.
    #[error("failed to fetch secret '{name}': {source}")]
    Fetch {
        /// Requested secret.
        name: String,
        /// Underlying client error.
        #[source]
        source: BoxError,
    },

    /// A required field is absent from the secret.
    #[error("secret '{secret}' has no field '{field}'")]
    MissingField {
        /// Secret that was read.
        secret: String,
        /// Missing field name.
        field: &'static str,
    },
}

/// A source of named secrets.
pub trait SecretStore: Send + Sync {
    /// Fetches the secret called `name`.
    fn get<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<SecretData, SecretStoreError>>;
}

/// In-memory secret store.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    secrets: BTreeMap<String, SecretData>,
}

impl StaticSecretStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a secret.
    pub fn with_secret<I, K, V>(mut self, name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let data = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.secrets.insert(name.into(), data);
        self
    }
}

impl SecretStore for StaticSecretStore {
    fn get<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<SecretData, SecretStoreError>> {
        Box::pin(async move {
            self.secrets
                .get(name)
                .cloned()
                .ok_or_else(|| SecretStoreError::NotFound(name.to_owned()))
        })
    }
}

#[cfg(feature = "kube")]
pub use self::kubernetes::KubeSecretStore;

#[cfg(feature = "kube")]
mod kubernetes {
    use super::{BoxFuture, SecretData, SecretStore, SecretStoreError};
    use k8s_openapi::api::core::v1::Secret;
    use kube::{Api, Client};
    use log::debug;

    /// Reads secrets from one Kubernetes namespace.
    #[derive(Clone)]
    pub struct KubeSecretStore {
        api: Api<Secret>,
        namespace: String,
    }

    impl std::fmt::Debug for KubeSecretStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("KubeSecretStore")
                .field("namespace", &self.namespace)
                .finish_non_exhaustive()
        }
    }

    impl KubeSecretStore {
        /// Creates a store using an existing client.
        pub fn new(client: Client, namespace: &str) -> Self {
            Self {
                api: Api::namespaced(client, namespace),
                namespace: namespace.to_owned(),
            }
        }

        /// Creates a store from the in-cluster service account (or the local kubeconfig).
        ///
        /// # Errors
        ///
        /// Returns [`SecretStoreError::Fetch`] if no client configuration can be inferred.
        pub async fn infer(namespace: &str) -> Result<Self, SecretStoreError> {
            let client = Client::try_default()
                .await
                .map_err(|e| SecretStoreError::Fetch {
                    name: format!("{namespace}/*"),
                    source: Box::new(e),
                })?;
            Ok(Self::new(client, namespace))
        }
    }

    impl SecretStore for KubeSecretStore {
        fn get<'a>(
            &'a self,
            name: &'a str,
        ) -> BoxFuture<'a, Result<SecretData, SecretStoreError>> {
            Box::pin(async move {
                debug!("fetching secret {}/{}", self.namespace, name);
                let secret = match self.api.get(name).await {
                    Ok(secret) => secret,
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {
                        return Err(SecretStoreError::NotFound(name.to_owned()))
                    }
                    Err(e) => {
                        return Err(SecretStoreError::Fetch {
                            name: name.to_owned(),
                            source: Box::new(e),
                        })
                    }
                };

                Ok(secret
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(key, value)| (key, value.0))
                    .collect())
            })
        }
    }
}
