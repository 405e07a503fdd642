use admission_tls::provider::{BoxFuture, SecretData};
use admission_tls::{
    Config, CredentialProvider, Error, Mode, SecretStore, SecretStoreError, StaticSecretStore,
};
use rcgen::{CertificateParams, KeyPair};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

struct Pair {
    cert: String,
    key: String,
}

fn pair(name: &str) -> Pair {
    let key = KeyPair::generate().unwrap();
    let cert = CertificateParams::new(vec![name.to_owned()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    Pair {
        cert: cert.pem(),
        key: key.serialize_pem(),
    }
}

/// Serves one secret slowly and counts fetches.
struct CountingStore {
    inner: StaticSecretStore,
    fetches: AtomicUsize,
}

impl SecretStore for CountingStore {
    fn get<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<SecretData, SecretStoreError>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.get(name).await
        })
    }
}

fn secret_config(ca_bundle: &std::path::Path) -> Config {
    Config::default()
        .with_webhook_mode("secret")
        .with_secret_name("webhook-tls")
        .with_ca_bundle_file(ca_bundle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_access_initializes_once() {
    let tmp = tempdir().unwrap();
    let ca_path = tmp.path().join("ca.crt");
    let issued = pair("webhook.nsm.svc");
    std::fs::write(&ca_path, &issued.cert).unwrap();

    let store = Arc::new(CountingStore {
        inner: StaticSecretStore::new().with_secret(
            "webhook-tls",
            [("tls.crt", issued.cert.clone()), ("tls.key", issued.key.clone())],
        ),
        fetches: AtomicUsize::new(0),
    });
    let provider = Arc::new(
        CredentialProvider::new(secret_config(&ca_path))
            .unwrap()
            .with_secret_store(store.clone()),
    );

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let provider = provider.clone();
            tokio::spawn(async move { provider.certificate().await.unwrap() })
        })
        .collect();

    let mut credentials = Vec::new();
    for task in tasks {
        credentials.push(task.await.unwrap());
    }

    assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
    assert!(credentials.iter().all(|c| Arc::ptr_eq(c, &credentials[0])));

    provider.ca_bundle().await.unwrap();
    assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failed_initialization_runs_once() {
    let tmp = tempdir().unwrap();
    let store = Arc::new(CountingStore {
        inner: StaticSecretStore::new(),
        fetches: AtomicUsize::new(0),
    });
    let provider = Arc::new(
        CredentialProvider::new(secret_config(&tmp.path().join("ca.crt")))
            .unwrap()
            .with_secret_store(store.clone()),
    );

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let provider = provider.clone();
            tokio::spawn(async move { provider.certificate().await.unwrap_err() })
        })
        .collect();

    let mut causes = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Error::Initialization(cause) => causes.push(cause),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
    assert!(causes.iter().all(|c| Arc::ptr_eq(c, &causes[0])));
    assert!(matches!(
        *causes[0],
        Error::SecretStore(SecretStoreError::NotFound(_))
    ));

    // Later accessors replay the cached failure.
    let err = provider.ca_bundle().await.unwrap_err();
    assert!(matches!(err.root(), Error::SecretStore(SecretStoreError::NotFound(_))));
    assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn secret_fields_are_extracted_by_name() {
    let tmp = tempdir().unwrap();
    let ca_path = tmp.path().join("ca.crt");
    std::fs::write(&ca_path, b"ca-bundle").unwrap();

    let issued = pair("webhook.nsm.svc");
    let store = StaticSecretStore::new().with_secret(
        "webhook-tls",
        [
            ("ca.crt", "unrelated".to_owned()),
            ("tls.crt", issued.cert.clone()),
            ("tls.key", issued.key.clone()),
        ],
    );

    let provider = CredentialProvider::new(secret_config(&ca_path))
        .unwrap()
        .with_secret_store(Arc::new(store));
    assert_eq!(provider.mode(), Mode::SecretStore);

    let credential = provider.certificate().await.unwrap();
    let expected =
        admission_tls::Credential::from_pem(issued.cert.as_bytes(), issued.key.as_bytes()).unwrap();
    assert_eq!(*credential, expected);
    assert_eq!(&*provider.ca_bundle().await.unwrap(), b"ca-bundle");
}

#[tokio::test]
async fn secret_missing_key_field_fails() {
    let tmp = tempdir().unwrap();
    let ca_path = tmp.path().join("ca.crt");
    std::fs::write(&ca_path, b"ca-bundle").unwrap();

    let issued = pair("webhook.nsm.svc");
    let store = StaticSecretStore::new().with_secret("webhook-tls", [("tls.crt", issued.cert)]);

    let provider = CredentialProvider::new(secret_config(&ca_path))
        .unwrap()
        .with_secret_store(Arc::new(store));

    let err = provider.certificate().await.unwrap_err();
    match err.root() {
        Error::SecretStore(SecretStoreError::MissingField { field, .. }) => {
            assert_eq!(*field, "tls.key");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn secret_missing_cert_field_fails() {
    let tmp = tempdir().unwrap();
    let ca_path = tmp.path().join("ca.crt");
    std::fs::write(&ca_path, b"ca-bundle").unwrap();

    let issued = pair("webhook.nsm.svc");
    let store = StaticSecretStore::new().with_secret("webhook-tls", [("tls.key", issued.key)]);

    let provider = CredentialProvider::new(secret_config(&ca_path))
        .unwrap()
        .with_secret_store(Arc::new(store));

    let err = provider.certificate().await.unwrap_err();
    match err.root() {
        Error::SecretStore(SecretStoreError::MissingField { field, .. }) => {
            assert_eq!(*field, "tls.crt");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn secret_not_found_fails() {
    let tmp = tempdir().unwrap();
    let provider = CredentialProvider::new(secret_config(&tmp.path().join("ca.crt")))
        .unwrap()
        .with_secret_store(Arc::new(StaticSecretStore::new()));

    let err = provider.certificate().await.unwrap_err();
    assert!(matches!(
        err.root(),
        Error::SecretStore(SecretStoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn secret_with_mismatched_pair_fails() {
    let tmp = tempdir().unwrap();
    let ca_path = tmp.path().join("ca.crt");
    std::fs::write(&ca_path, b"ca-bundle").unwrap();

    let first = pair("a.example");
    let second = pair("b.example");
    let store = StaticSecretStore::new().with_secret(
        "webhook-tls",
        [("tls.crt", first.cert), ("tls.key", second.key)],
    );

    let provider = CredentialProvider::new(secret_config(&ca_path))
        .unwrap()
        .with_secret_store(Arc::new(store));

    let err = provider.certificate().await.unwrap_err();
    assert!(matches!(err.root(), Error::Credential(_)));
}

#[test]
fn secret_mode_without_name_is_rejected() {
    let config = Config::default().with_webhook_mode("Secret");
    let err = CredentialProvider::new(config).unwrap_err();
    assert_eq!(
        err.to_string(),
        "webhook mode 'secret' requires a non-empty secret name"
    );
}

#[tokio::test]
async fn static_file_pair_is_loaded() {
    let tmp = tempdir().unwrap();
    let issued = pair("webhook.nsm.svc");
    let cert_path = tmp.path().join("tls.crt");
    let key_path = tmp.path().join("tls.key");
    let ca_path = tmp.path().join("ca.crt");
    std::fs::write(&cert_path, &issued.cert).unwrap();
    std::fs::write(&key_path, &issued.key).unwrap();
    std::fs::write(&ca_path, &issued.cert).unwrap();

    let config = Config::default()
        .with_webhook_mode("selfregister")
        .with_key_pair_files(&cert_path, &key_path)
        .with_ca_bundle_file(&ca_path);
    let provider = CredentialProvider::new(config).unwrap();

    let credential = provider.certificate().await.unwrap();
    assert_eq!(credential.cert_chain_pem(), issued.cert);
    assert_eq!(&*provider.ca_bundle().await.unwrap(), issued.cert.as_bytes());
}

#[tokio::test]
async fn static_file_pair_requires_ca_bundle() {
    let tmp = tempdir().unwrap();
    let issued = pair("webhook.nsm.svc");
    let cert_path = tmp.path().join("tls.crt");
    let key_path = tmp.path().join("tls.key");
    std::fs::write(&cert_path, &issued.cert).unwrap();
    std::fs::write(&key_path, &issued.key).unwrap();

    let config = Config::default()
        .with_webhook_mode("selfregister")
        .with_key_pair_files(&cert_path, &key_path);
    let provider = CredentialProvider::new(config).unwrap();

    let err = provider.certificate().await.unwrap_err();
    assert!(matches!(err.root(), Error::MissingCaBundlePath(Mode::Static)));
}

#[tokio::test]
async fn static_garbage_files_are_fatal() {
    let tmp = tempdir().unwrap();
    let cert_path = tmp.path().join("tls.crt");
    let key_path = tmp.path().join("tls.key");
    let ca_path = tmp.path().join("ca.crt");
    std::fs::write(&cert_path, b"not a certificate").unwrap();
    std::fs::write(&key_path, b"not a key").unwrap();
    std::fs::write(&ca_path, b"ca").unwrap();

    let config = Config::default()
        .with_webhook_mode("selfregister")
        .with_key_pair_files(&cert_path, &key_path)
        .with_ca_bundle_file(&ca_path);
    let provider = CredentialProvider::new(config).unwrap();

    let err = provider.certificate().await.unwrap_err();
    assert!(matches!(err.root(), Error::Credential(_)));
}
