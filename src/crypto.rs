//! Selection of the rustls crypto provider.
//!
//! The provider is chosen at compile time through the `ring` (default) or `aws-lc-rs` feature and
//! passed explicitly to every rustls builder, so the crate works whether or not the application
//! installed a process-wide default.

use rustls::crypto::CryptoProvider;
use std::sync::{Arc, OnceLock};

/// Returns the crypto provider used for key loading and TLS configuration.
///
/// The process default is preferred when the application installed one.
pub fn provider() -> Arc<CryptoProvider> {
    static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    PROVIDER
        .get_or_init(|| {
            CryptoProvider::get_default()
                .cloned()
                .unwrap_or_else(|| Arc::new(builtin_provider()))
        })
        .clone()
}

#[cfg(feature = "ring")]
fn builtin_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

#[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
fn builtin_provider() -> CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}
