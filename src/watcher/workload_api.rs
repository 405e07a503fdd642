use super::{IdentityService, IdentityStream, IdentityStreamError};
use crate::constants::WORKLOAD_API_SOCKET;
use crate::credential::Credential;
use crate::provider::BoxFuture;
use log::{debug, info};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use spiffe::{WorkloadApiClient, X509Context};
use std::error::Error as StdError;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

/// [`IdentityService`] backed by the SPIFFE Workload API of a local SPIRE agent.
#[derive(Debug, Clone)]
pub struct WorkloadApiService {
    socket_path: String,
}

impl Default for WorkloadApiService {
    fn default() -> Self {
        Self::new(WORKLOAD_API_SOCKET)
    }
}

impl WorkloadApiService {
    /// Creates a service talking to the agent at `socket_path` (`unix:` URI or plain path).
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Agent socket address.
    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }
}

impl IdentityService for WorkloadApiService {
    fn subscribe(&self) -> BoxFuture<'_, Result<IdentityStream, IdentityStreamError>> {
        Box::pin(async move {
            let mut client = WorkloadApiClient::new_from_path(&self.socket_path)
                .await
                .map_err(|e| IdentityStreamError::Connect(Box::new(e)))?;

            let (tx, rx) = mpsc::channel(1);
            let (opened_tx, opened_rx) = oneshot::channel();

            // The client owns the gRPC channel; keep it alive for as long as the stream runs.
            tokio::spawn(async move {
                let stream = match client.stream_x509_contexts().await {
                    Ok(stream) => {
                        let _ = opened_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = opened_tx.send(Err(IdentityStreamError::Connect(Box::new(e))));
                        return;
                    }
                };
                forward(Box::pin(stream), tx).await;
            });

            opened_rx.await.map_err(|_| {
                IdentityStreamError::Connect("workload api subscription task ended".into())
            })??;
            info!("subscribed to x509 contexts at {}", self.socket_path);

            Ok(Box::pin(ReceiverStream::new(rx)) as IdentityStream)
        })
    }
}

/// Relays Workload API updates to the subscriber until either side ends. A dropped subscriber
/// releases the gRPC stream right away instead of at the next update.
async fn forward<S, E>(mut stream: S, tx: mpsc::Sender<Result<Credential, IdentityStreamError>>)
where
    S: Stream<Item = Result<X509Context, E>> + Unpin,
    E: StdError + Send + Sync + 'static,
{
    loop {
        let update = tokio::select! {
            () = tx.closed() => {
                debug!("identity subscriber went away; closing workload api stream");
                return;
            }
            update = stream.next() => match update {
                Some(update) => update,
                None => return,
            },
        };

        let item = match update {
            Ok(context) => credential_from_context(&context),
            Err(e) if is_cancelled(&e) => Err(IdentityStreamError::Cancelled),
            Err(e) => Err(IdentityStreamError::Stream(Box::new(e))),
        };
        if tx.send(item).await.is_err() {
            debug!("identity subscriber went away; closing workload api stream");
            return;
        }
    }
}

fn credential_from_context(context: &X509Context) -> Result<Credential, IdentityStreamError> {
    let svid = context
        .default_svid()
        .ok_or(IdentityStreamError::NoDefaultIdentity)?;

    let chain = svid
        .cert_chain()
        .iter()
        .map(|cert| {
            let der: &[u8] = cert.as_ref();
            CertificateDer::from(der.to_vec())
        })
        .collect();

    let key: &[u8] = svid.private_key().as_ref();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.to_vec()));

    Ok(Credential::from_der(chain, key)?)
}

/// Whether a gRPC `CANCELLED` status sits anywhere in the error chain.
fn is_cancelled(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(status) = e.downcast_ref::<tonic::Status>() {
            if status.code() == tonic::Code::Cancelled {
                return true;
            }
        }
        current = e.source();
    }
    false
}
