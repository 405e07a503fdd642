//! In-memory self-signed identity used when no certificate files are configured.
//!
//! The certificate is its own CA so it can double as the trust bundle registered with the API
//! server. Its common name is `networkservicemesh.{service}-ca`. It covers `{service}.{namespace}`
//! and `{service}.{namespace}.svc`, is valid for one year from generation and uses an ECDSA P-256
//! key (stronger than RSA-2048).

use crate::config::Config;
use crate::credential::Credential;
use crate::error::Result;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};

/// A generated identity and its PEM certificate, which is also the trust bundle.
#[derive(Debug, Clone)]
pub struct SelfSigned {
    /// Certificate and key.
    pub credential: Credential,
    /// PEM encoding of the certificate.
    pub cert_pem: String,
}

/// Generates a self-signed CA certificate for the service described by `config`.
///
/// # Errors
///
/// Returns [`crate::Error::SelfSigned`] if key generation or signing fails.
pub fn generate(config: &Config) -> Result<SelfSigned> {
    let now = OffsetDateTime::now_utc();

    let mut params = CertificateParams::new(config.dns_names().to_vec())?;
    params
        .distinguished_name
        .push(DnType::CommonName, format!("networkservicemesh.{}-ca", config.service_name));
    params.serial_number = Some(SerialNumber::from(now.unix_timestamp().unsigned_abs()));
    params.not_before = now;
    params.not_after = one_year_after(now);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let credential = Credential::from_der(vec![cert.der().clone()], private_key)?;

    Ok(SelfSigned {
        credential,
        cert_pem: cert.pem(),
    })
}

fn one_year_after(start: OffsetDateTime) -> OffsetDateTime {
    // Feb 29 has no counterpart next year.
    start
        .replace_year(start.year() + 1)
        .unwrap_or(start + Duration::days(365))
}
