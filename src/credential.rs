//! The server identity: a certificate chain and its private key.
//!
//! A [`Credential`] is validated at construction time, so holding one means the chain is
//! non-empty and the leaf certificate is parseable. Whether the key belongs to the leaf is
//! checked when the credential is turned into a rustls [`CertifiedKey`].

use pem::{EncodeConfig, LineEnding, Pem};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use zeroize::Zeroizing;

const CERTIFICATE_TAG: &str = "CERTIFICATE";

/// Errors produced while building or converting a [`Credential`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CredentialError {
    /// The certificate chain is empty.
    #[error("no certificates found in chain")]
    EmptyChain,

    /// The key material does not contain a private key.
    #[error("no private key found")]
    MissingPrivateKey,

    /// PEM data could not be decoded.
    #[error("failed to decode PEM {kind}: {reason}")]
    Pem {
        /// What was being decoded (`certificate` or `private key`).
        kind: &'static str,
        /// Decoder message.
        reason: String,
    },

    /// The leaf certificate is not a valid X.509 certificate.
    #[error("failed to parse leaf certificate: {0}")]
    ParseCertificate(String),

    /// The private key could not be loaded by the crypto provider.
    #[error("failed to load private key: {0}")]
    PrivateKey(String),

    /// The private key does not belong to the leaf certificate.
    #[error("private key does not match the leaf certificate: {0}")]
    KeyMismatch(String),
}

/// A certificate chain (leaf first) and the private key of the leaf.
///
/// Credentials are immutable; a rotation replaces the whole value.
pub struct Credential {
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl Credential {
    /// Creates a credential from DER-encoded certificates and a private key.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::EmptyChain`] for an empty chain and
    /// [`CredentialError::ParseCertificate`] if the leaf is not valid X.509.
    pub fn from_der(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self, CredentialError> {
        let leaf = cert_chain.first().ok_or(CredentialError::EmptyChain)?;
        let (not_before, not_after) = validity(leaf)?;

        Ok(Self {
            cert_chain,
            private_key,
            not_before,
            not_after,
        })
    }

    /// Creates a credential from PEM-encoded certificates and a PEM-encoded private key.
    ///
    /// The key may be PKCS#8 (`PRIVATE KEY`), PKCS#1 (`RSA PRIVATE KEY`) or SEC1
    /// (`EC PRIVATE KEY`).
    ///
    /// # Errors
    ///
    /// Fails if either input is not valid PEM, contains no certificate or no key, or if the
    /// leaf certificate cannot be parsed.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, CredentialError> {
        let cert_chain = CertificateDer::pem_slice_iter(cert_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CredentialError::Pem {
                kind: "certificate",
                reason: format!("{e:?}"),
            })?;

        let private_key = PrivateKeyDer::from_pem_slice(key_pem).map_err(|e| match e {
            rustls::pki_types::pem::Error::NoItemsFound => CredentialError::MissingPrivateKey,
            other => CredentialError::Pem {
                kind: "private key",
                reason: format!("{other:?}"),
            },
        })?;

        Self::from_der(cert_chain, private_key)
    }

    /// Returns the certificate chain; the first certificate is the leaf.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// Returns the leaf certificate.
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.cert_chain[0]
    }

    /// Returns the private key of the leaf certificate.
    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }

    /// Start of the leaf certificate validity window.
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    /// End of the leaf certificate validity window.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Encodes the certificate chain as concatenated PEM `CERTIFICATE` blocks.
    pub fn cert_chain_pem(&self) -> String {
        let blocks: Vec<Pem> = self
            .cert_chain
            .iter()
            .map(|cert| Pem::new(CERTIFICATE_TAG, cert.as_ref().to_vec()))
            .collect();
        pem::encode_many_config(&blocks, encode_config())
    }

    /// Encodes the private key as a PEM block. The returned buffer is zeroized on drop.
    pub fn private_key_pem(&self) -> Zeroizing<String> {
        let der = Zeroizing::new(self.private_key.secret_der().to_vec());
        let block = Pem::new(private_key_tag(&self.private_key), der.as_slice());
        Zeroizing::new(pem::encode_config(&block, encode_config()))
    }

    /// Builds a rustls [`CertifiedKey`] and checks that the key belongs to the leaf.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::PrivateKey`] if the provider cannot load the key and
    /// [`CredentialError::KeyMismatch`] if the key does not match the leaf public key.
    pub fn certified_key(
        &self,
        provider: &CryptoProvider,
    ) -> Result<Arc<CertifiedKey>, CredentialError> {
        let signing_key = provider
            .key_provider
            .load_private_key(self.private_key.clone_key())
            .map_err(|e| CredentialError::PrivateKey(e.to_string()))?;

        let certified_key = CertifiedKey::new(self.cert_chain.clone(), signing_key);
        certified_key
            .keys_match()
            .map_err(|e| CredentialError::KeyMismatch(e.to_string()))?;

        Ok(Arc::new(certified_key))
    }
}

impl Clone for Credential {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
            not_before: self.not_before,
            not_after: self.not_after,
        }
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.cert_chain == other.cert_chain
            && self.private_key.secret_der() == other.private_key.secret_der()
    }
}

impl Eq for Credential {}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("chain_len", &self.cert_chain.len())
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

fn validity(
    leaf: &CertificateDer<'_>,
) -> Result<(OffsetDateTime, OffsetDateTime), CredentialError> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| CredentialError::ParseCertificate(e.to_string()))?;
    let validity = cert.validity();
    Ok((
        validity.not_before.to_datetime(),
        validity.not_after.to_datetime(),
    ))
}

fn private_key_tag(key: &PrivateKeyDer<'_>) -> &'static str {
    match key {
        PrivateKeyDer::Pkcs1(_) => "RSA PRIVATE KEY",
        PrivateKeyDer::Sec1(_) => "EC PRIVATE KEY",
        _ => "PRIVATE KEY",
    }
}

fn encode_config() -> EncodeConfig {
    EncodeConfig::new().set_line_ending(LineEnding::LF)
}
