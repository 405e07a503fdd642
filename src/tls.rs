//! TLS Config Builder.
//!
//! Produces the [`rustls::ServerConfig`] handed to the HTTP server. A frozen credential is
//! attached once; a live credential is served through [`LiveCertResolver`], which always returns
//! the latest rotation so new connections pick it up without restarting the listener.

use crate::config::{Config, TlsVersion};
use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::watcher::CredentialUpdates;
use log::{debug, error, info};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ServerConfig, SupportedProtocolVersion};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Where the server certificate comes from.
#[derive(Debug, Clone)]
pub enum CertificateSource {
    /// One certificate for the lifetime of the configuration.
    Frozen(Arc<Credential>),
    /// The latest credential written by the identity watcher.
    Live(CredentialUpdates),
}

/// Builds a [`ServerConfig`] from a [`CertificateSource`].
///
/// Client certificates are never requested; callers are authenticated by the API server.
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    source: CertificateSource,
    min_version: TlsVersion,
    alpn_protocols: Vec<String>,
}

impl ServerConfigBuilder {
    /// Creates a builder with TLS 1.2 as minimum version and no ALPN protocols.
    pub fn new(source: CertificateSource) -> Self {
        Self {
            source,
            min_version: TlsVersion::Tls12,
            alpn_protocols: Vec::new(),
        }
    }

    /// Creates a builder using the TLS settings of `config`.
    pub fn from_config(source: CertificateSource, config: &Config) -> Self {
        Self::new(source)
            .with_min_tls_version(config.min_tls_version)
            .with_alpn_protocols(config.alpn_protocols.clone())
    }

    /// Sets the minimum protocol version.
    pub fn with_min_tls_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    /// Sets the ALPN protocols, most preferred first.
    pub fn with_alpn_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alpn_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Builds the configuration.
    ///
    /// A live source spawns a background task and therefore needs a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] for a live source without a credential, and
    /// [`Error::Credential`] or [`Error::Rustls`] for unusable material.
    pub fn build(self) -> Result<ServerConfig> {
        let provider = crate::crypto::provider();
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(protocol_versions(self.min_version))?
            .with_no_client_auth();

        let mut config = match self.source {
            CertificateSource::Frozen(credential) => {
                // Fails early on a key that does not match the leaf.
                let certified_key = credential.certified_key(&provider)?;
                builder.with_cert_resolver(Arc::new(FrozenCertResolver(certified_key)))
            }
            CertificateSource::Live(updates) => {
                builder.with_cert_resolver(Arc::new(LiveCertResolver::new(updates)?))
            }
        };

        config.alpn_protocols = self
            .alpn_protocols
            .into_iter()
            .map(String::into_bytes)
            .collect();
        Ok(config)
    }
}

static TLS12_AND_LATER: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

fn protocol_versions(min: TlsVersion) -> &'static [&'static SupportedProtocolVersion] {
    match min {
        TlsVersion::Tls12 => TLS12_AND_LATER,
        TlsVersion::Tls13 => TLS13_ONLY,
    }
}

#[derive(Debug)]
struct FrozenCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for FrozenCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Serves the most recent credential published by the identity watcher.
///
/// Each rotation is converted once into a rustls signing key by a background task. A rotation
/// whose key cannot be loaded is logged and the previous key keeps being served.
#[derive(Debug, Clone)]
pub struct LiveCertResolver {
    rx: watch::Receiver<Arc<CertifiedKey>>,
    _guard: Arc<ResolverGuard>,
}

#[derive(Debug)]
struct ResolverGuard {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for ResolverGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

impl LiveCertResolver {
    /// Creates a resolver following `updates`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] if no credential was written yet and [`Error::Credential`] if
    /// the current one is unusable.
    pub fn new(mut updates: CredentialUpdates) -> Result<Self> {
        let provider = crate::crypto::provider();
        let current = updates.current().ok_or(Error::NotReady)?;
        let (tx, rx) = watch::channel(current.certified_key(&provider)?);

        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                let rotation = tokio::select! {
                    _ = token.cancelled() => {
                        debug!("certificate resolver cancelled; stopping");
                        break;
                    }
                    rotation = updates.changed() => rotation,
                };

                let Ok(rotation) = rotation else {
                    info!("identity watcher stopped; serving last certificate");
                    break;
                };

                match rotation.credential.certified_key(&provider) {
                    Ok(key) => {
                        tx.send_replace(key);
                        debug!("serving identity generation {}", rotation.generation);
                    }
                    Err(e) => {
                        error!(
                            "failed loading identity generation {}; keeping previous: {e}",
                            rotation.generation
                        );
                    }
                }
            }
        });

        Ok(Self {
            rx,
            _guard: Arc::new(ResolverGuard { cancel, task }),
        })
    }

    /// The key currently served.
    pub fn current(&self) -> Arc<CertifiedKey> {
        self.rx.borrow().clone()
    }
}

impl ResolvesServerCert for LiveCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
    use rustls::pki_types::{CertificateDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    struct Issued {
        ca: CertificateDer<'static>,
        credential: Credential,
    }

    fn issue(dns_name: &str) -> Issued {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let leaf = CertificateParams::new(vec![dns_name.to_owned()])
            .unwrap()
            .signed_by(&leaf_key, &ca, &ca_key)
            .unwrap();

        Issued {
            ca: ca.der().clone(),
            credential: Credential::from_pem(
                leaf.pem().as_bytes(),
                leaf_key.serialize_pem().as_bytes(),
            )
            .unwrap(),
        }
    }

    fn client(ca: &CertificateDer<'static>, alpn: &[&str]) -> ClientConfig {
        let mut roots = RootCertStore::empty();
        roots.add(ca.clone()).unwrap();
        let mut config = ClientConfig::builder_with_provider(crate::crypto::provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        config
    }

    async fn handshake(
        server: ServerConfig,
        client: ClientConfig,
        name: &str,
    ) -> (Option<Vec<u8>>, CertificateDer<'static>) {
        let (client_io, server_io) = duplex(64 * 1024);
        let acceptor = TlsAcceptor::from(Arc::new(server));
        let connector = TlsConnector::from(Arc::new(client));
        let name = ServerName::try_from(name).unwrap().to_owned();

        let server_task = tokio::spawn(async move {
            let mut stream = acceptor.accept(server_io).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut stream = connector.connect(name, client_io).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server_task.await.unwrap();

        let (_, conn) = stream.get_ref();
        let alpn = conn.alpn_protocol().map(<[u8]>::to_vec);
        let leaf = conn.peer_certificates().unwrap()[0].clone();
        (alpn, leaf)
    }

    #[tokio::test]
    async fn frozen_credential_is_served() {
        let issued = issue("webhook.nsm.svc");
        let server = ServerConfigBuilder::new(CertificateSource::Frozen(Arc::new(
            issued.credential.clone(),
        )))
        .with_alpn_protocols(["h2", "http/1.1"])
        .build()
        .unwrap();

        let (alpn, leaf) = handshake(
            server,
            client(&issued.ca, &["http/1.1"]),
            "webhook.nsm.svc",
        )
        .await;

        assert_eq!(alpn.as_deref(), Some(&b"http/1.1"[..]));
        assert_eq!(&leaf, issued.credential.leaf());
    }

    #[tokio::test]
    async fn tls13_minimum_rejects_tls12_client() {
        let issued = issue("webhook.nsm.svc");
        let server = ServerConfigBuilder::new(CertificateSource::Frozen(Arc::new(
            issued.credential.clone(),
        )))
        .with_min_tls_version(TlsVersion::Tls13)
        .build()
        .unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(issued.ca.clone()).unwrap();
        let client = ClientConfig::builder_with_provider(crate::crypto::provider())
            .with_protocol_versions(&[&rustls::version::TLS12])
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let (client_io, server_io) = duplex(64 * 1024);
        let acceptor = TlsAcceptor::from(Arc::new(server));
        let server_task = tokio::spawn(async move { acceptor.accept(server_io).await });

        let connector = TlsConnector::from(Arc::new(client));
        let name = ServerName::try_from("webhook.nsm.svc").unwrap().to_owned();
        assert!(connector.connect(name, client_io).await.is_err());
        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn mismatched_key_is_rejected() {
        let first = issue("a.example");
        let second = issue("b.example");
        let broken = Credential::from_der(
            first.credential.cert_chain().to_vec(),
            second.credential.private_key().clone_key(),
        )
        .unwrap();

        let err = ServerConfigBuilder::new(CertificateSource::Frozen(Arc::new(broken)))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Credential(_)));
    }
}
