//! Workload Identity Watcher.
//!
//! Bridges the push-based identity stream of the workload identity service to a certificate
//! directory and to in-process subscribers:
//!
//! 1. [`CertificateWatcher::start`] opens the subscription and spawns the listener.
//! 2. Each update is written to the directory as an atomic pair (see [`read_pair`]) and then
//!    published on a [`CredentialUpdates`] channel.
//! 3. [`wait_for_certificates`] gates startup until a pair exists on disk.
//!
//! A stream error caused by cancellation ends the listener quietly. Any other stream error is
//! logged and ends it with an error that [`WatcherHandle::join`] returns.

mod wait;
mod workload_api;
mod writer;

pub use wait::{wait_for_certificates, wait_for_certificates_until, WaitPolicy};
pub use workload_api::WorkloadApiService;
pub use writer::read_pair;

use crate::credential::{Credential, CredentialError};
use crate::provider::{BoxError, BoxFuture};
use log::{debug, error, info};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use writer::PairWriter;

/// Stream of identity updates delivered by an [`IdentityService`].
pub type IdentityStream =
    Pin<Box<dyn Stream<Item = Result<Credential, IdentityStreamError>> + Send + 'static>>;

/// Errors delivered by an [`IdentityService`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdentityStreamError {
    /// The subscription was cancelled by its owner.
    #[error("identity stream cancelled")]
    Cancelled,

    /// The service could not be reached.
    #[error("failed to connect to the workload identity service: {0}")]
    Connect(#[source] BoxError),

    /// The service reported an error on an open subscription.
    #[error("identity stream error: {0}")]
    Stream(#[source] BoxError),

    /// An update carried no default identity.
    #[error("identity update has no default identity")]
    NoDefaultIdentity,

    /// An update carried unusable material.
    #[error("identity update is invalid: {0}")]
    Credential(#[from] CredentialError),
}

/// Errors of the identity watcher and the bounded wait.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WatcherError {
    /// The subscription could not be opened.
    #[error("failed to subscribe to identity updates: {0}")]
    Connect(#[source] IdentityStreamError),

    /// The subscription delivered a fatal error.
    #[error("identity stream failed: {0}")]
    Stream(#[source] IdentityStreamError),

    /// The subscription ended while the watcher was still running.
    #[error("identity stream ended unexpectedly")]
    StreamEnded,

    /// Writing a pair to the certificate directory failed.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        /// Path being written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The bounded wait gave up.
    #[error("timed out waiting for trust bundle")]
    Timeout {
        /// Directory that was polled.
        dir: PathBuf,
        /// Number of checks performed.
        attempts: u32,
    },

    /// The watcher stopped before publishing a credential.
    #[error("identity watcher stopped before the first credential was written")]
    Stopped,

    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The listener task panicked or was aborted.
    #[error("identity watcher task failed: {0}")]
    TaskFailed(String),
}

/// A source of identity updates, such as the SPIRE Workload API.
pub trait IdentityService: Send + Sync {
    /// Opens a subscription. Each stream item is the current default identity.
    fn subscribe(&self) -> BoxFuture<'_, Result<IdentityStream, IdentityStreamError>>;
}

/// One written rotation.
#[derive(Debug, Clone)]
pub struct Rotation {
    /// The credential now on disk.
    pub credential: Arc<Credential>,
    /// Sequence number of the rotation, starting at 1.
    pub generation: u64,
    /// When the pair was published.
    pub written_at: OffsetDateTime,
}

/// Receiver side of the watcher's rotation channel.
#[derive(Debug, Clone)]
pub struct CredentialUpdates {
    rx: watch::Receiver<Option<Arc<Rotation>>>,
}

impl CredentialUpdates {
    /// Returns the current credential, if one was written.
    pub fn current(&self) -> Option<Arc<Credential>> {
        self.rx.borrow().as_ref().map(|r| r.credential.clone())
    }

    /// Returns the latest rotation, if any.
    pub fn latest(&self) -> Option<Arc<Rotation>> {
        self.rx.borrow().clone()
    }

    /// Whether at least one pair was written.
    pub fn is_ready(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Waits for the next rotation after the last one seen through this receiver.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::Stopped`] once the watcher has terminated.
    pub async fn changed(&mut self) -> Result<Arc<Rotation>, WatcherError> {
        loop {
            self.rx.changed().await.map_err(|_| WatcherError::Stopped)?;
            if let Some(rotation) = self.rx.borrow_and_update().clone() {
                return Ok(rotation);
            }
        }
    }

    /// Waits until at least one pair was written.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::Stopped`] if the watcher terminates first.
    pub async fn ready(&mut self) -> Result<Arc<Rotation>, WatcherError> {
        let rotation = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| WatcherError::Stopped)?;
        rotation.clone().ok_or(WatcherError::Stopped)
    }
}

/// Starts identity watchers.
#[derive(Debug, Clone, Copy)]
pub struct CertificateWatcher;

impl CertificateWatcher {
    /// Subscribes to `service` and keeps `dir` populated with its latest identity until
    /// `cancel` fires or the subscription fails.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::Connect`] if the subscription cannot be opened.
    pub async fn start(
        service: Arc<dyn IdentityService>,
        dir: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Result<WatcherHandle, WatcherError> {
        let dir = dir.into();
        let stream = service.subscribe().await.map_err(WatcherError::Connect)?;
        info!("watching identity updates into {}", dir.display());

        let (tx, rx) = watch::channel(None);
        let listener = Listener {
            writer: PairWriter::new(dir.clone()),
            tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(listener.run(stream));

        Ok(WatcherHandle {
            dir,
            updates: CredentialUpdates { rx },
            cancel,
            task: Some(task),
        })
    }
}

/// Running watcher. Dropping the handle cancels the watcher.
#[derive(Debug)]
pub struct WatcherHandle {
    dir: PathBuf,
    updates: CredentialUpdates,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<(), WatcherError>>>,
}

impl WatcherHandle {
    /// Directory kept up to date.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns a receiver of rotations.
    pub fn updates(&self) -> CredentialUpdates {
        self.updates.clone()
    }

    /// Whether the first pair was written.
    pub fn is_ready(&self) -> bool {
        self.updates.is_ready()
    }

    /// Time of the last successful write.
    pub fn last_write(&self) -> Option<OffsetDateTime> {
        self.updates.latest().map(|r| r.written_at)
    }

    /// Stops the listener.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the listener to finish while keeping the handle.
    ///
    /// Cancel safe: if the returned future is dropped, the listener can still be awaited later.
    /// Once it has completed, further calls return `Ok(())`.
    ///
    /// # Errors
    ///
    /// Same as [`join`](Self::join).
    pub async fn stopped(&mut self) -> Result<(), WatcherError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let outcome = task.await;
        self.task = None;
        outcome.map_err(|e| WatcherError::TaskFailed(e.to_string()))?
    }

    /// Waits for the listener to finish.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the listener, or [`WatcherError::TaskFailed`] if the
    /// task panicked.
    pub async fn join(mut self) -> Result<(), WatcherError> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| WatcherError::TaskFailed(e.to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Listener {
    writer: PairWriter,
    tx: watch::Sender<Option<Arc<Rotation>>>,
    cancel: CancellationToken,
}

impl Listener {
    async fn run(self, mut stream: IdentityStream) -> Result<(), WatcherError> {
        let mut generation = 0u64;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("identity watcher cancelled; stopping");
                    return Ok(());
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(credential)) => {
                    generation += 1;
                    self.write(credential, generation).await;
                }
                Some(Err(IdentityStreamError::Cancelled)) => {
                    debug!("identity stream cancelled; stopping");
                    return Ok(());
                }
                Some(Err(_)) | None if self.cancel.is_cancelled() => return Ok(()),
                Some(Err(e)) => {
                    error!("identity stream failed: {e}");
                    return Err(WatcherError::Stream(e));
                }
                None => {
                    error!("identity stream ended unexpectedly");
                    return Err(WatcherError::StreamEnded);
                }
            }
        }
    }

    async fn write(&self, credential: Credential, generation: u64) {
        match self.writer.publish(&credential, generation).await {
            Ok(()) => {
                info!(
                    "wrote identity generation {} to {} (expires {})",
                    generation,
                    self.writer.dir().display(),
                    credential.not_after()
                );
                self.tx.send_replace(Some(Arc::new(Rotation {
                    credential: Arc::new(credential),
                    generation,
                    written_at: OffsetDateTime::now_utc(),
                })));
            }
            Err(failure) => {
                let err = WatcherError::Write {
                    path: failure.path,
                    source: failure.source,
                };
                error!("failed to write identity generation {generation}; keeping previous: {err}");
            }
        }
    }
}
