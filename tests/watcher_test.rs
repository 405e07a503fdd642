use admission_tls::provider::BoxFuture;
use admission_tls::watcher::{read_pair, IdentityStream};
use admission_tls::{
    wait_for_certificates, CertificateWatcher, Credential, IdentityService, IdentityStreamError,
    WaitPolicy,
};
use rcgen::{CertificateParams, KeyPair};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

type Update = Result<Credential, IdentityStreamError>;

struct ScriptedService {
    stream: Mutex<Option<mpsc::Receiver<Update>>>,
}

fn scripted() -> (Arc<ScriptedService>, mpsc::Sender<Update>) {
    let (tx, rx) = mpsc::channel(1);
    let service = ScriptedService {
        stream: Mutex::new(Some(rx)),
    };
    (Arc::new(service), tx)
}

impl IdentityService for ScriptedService {
    fn subscribe(&self) -> BoxFuture<'_, Result<IdentityStream, IdentityStreamError>> {
        let rx = self.stream.lock().unwrap().take();
        Box::pin(async move {
            let rx = rx.ok_or_else(|| IdentityStreamError::Connect("already subscribed".into()))?;
            Ok(Box::pin(ReceiverStream::new(rx)) as IdentityStream)
        })
    }
}

fn credential(serial: usize) -> Credential {
    let key = KeyPair::generate().unwrap();
    let cert = CertificateParams::new(vec![format!("rotation-{serial}.example")])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    Credential::from_pem(cert.pem().as_bytes(), key.serialize_pem().as_bytes()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readers_never_observe_a_mixed_pair() {
    const ROTATIONS: usize = 20;

    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("certs");
    let (service, tx) = scripted();
    let handle = CertificateWatcher::start(service, &dir, CancellationToken::new())
        .await
        .unwrap();
    let mut updates = handle.updates();

    let credentials: Vec<Credential> = (0..ROTATIONS).map(credential).collect();
    tx.send(Ok(credentials[0].clone())).await.unwrap();
    updates.ready().await.unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reader = std::thread::spawn({
        let dir = dir.clone();
        let done = done.clone();
        let provider = admission_tls::crypto::provider();
        move || {
            let mut reads = 0usize;
            while !done.load(Ordering::SeqCst) {
                let (cert, key) = read_pair(&dir).unwrap().expect("pair published");
                let credential = Credential::from_pem(&cert, &key).unwrap();
                credential
                    .certified_key(&provider)
                    .expect("certificate and key from the same rotation");
                reads += 1;
            }
            reads
        }
    });

    for credential in &credentials[1..] {
        tx.send(Ok(credential.clone())).await.unwrap();
        let rotation = updates.changed().await.unwrap();
        assert_eq!(*rotation.credential, *credential);
    }

    done.store(true, Ordering::SeqCst);
    assert!(reader.join().unwrap() > 0);

    let last = updates.latest().unwrap();
    assert_eq!(last.generation, ROTATIONS as u64);
    let (cert, key) = read_pair(&dir).unwrap().unwrap();
    assert_eq!(
        Credential::from_pem(&cert, &key).unwrap(),
        credentials[ROTATIONS - 1]
    );

    handle.cancel();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn bounded_wait_sees_first_rotation() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("certs");
    let (service, tx) = scripted();
    let handle = CertificateWatcher::start(service, &dir, CancellationToken::new())
        .await
        .unwrap();

    let policy = WaitPolicy {
        interval: Duration::from_millis(10),
        attempts: 500,
    };
    let wait = tokio::spawn({
        let dir = dir.clone();
        async move { wait_for_certificates(&dir, policy).await }
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    tx.send(Ok(credential(0))).await.unwrap();

    wait.await.unwrap().unwrap();
    assert!(dir.join("tls.crt").is_file());
    assert!(dir.join("tls.key").is_file());

    drop(handle);
}
