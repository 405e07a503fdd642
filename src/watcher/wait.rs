//! Bounded wait for the first certificate pair.

use super::WatcherError;
use crate::constants::{CERT_FILE_NAME, KEY_FILE_NAME, WAIT_ATTEMPTS, WAIT_INTERVAL};
use log::debug;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Polling budget of [`wait_for_certificates`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Delay between two checks.
    pub interval: Duration,
    /// Number of checks before giving up.
    pub attempts: u32,
}

impl WaitPolicy {
    /// Total time covered by the policy, saturating at [`Duration::MAX`].
    pub fn budget(&self) -> Duration {
        self.interval
            .checked_mul(self.attempts)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: WAIT_INTERVAL,
            attempts: WAIT_ATTEMPTS,
        }
    }
}

/// Waits until both `tls.crt` and `tls.key` exist in `dir`.
///
/// The first check happens immediately; each further check follows `policy.interval` later.
///
/// # Errors
///
/// Returns [`WatcherError::Timeout`] after `policy.attempts` unsuccessful checks.
pub async fn wait_for_certificates(dir: &Path, policy: WaitPolicy) -> Result<(), WatcherError> {
    wait_for_certificates_until(dir, policy, &CancellationToken::new()).await
}

/// Like [`wait_for_certificates`], but gives up with [`WatcherError::Cancelled`] as soon as
/// `cancel` fires.
///
/// # Errors
///
/// Returns [`WatcherError::Timeout`] when the budget is exhausted and [`WatcherError::Cancelled`]
/// on cancellation.
pub async fn wait_for_certificates_until(
    dir: &Path,
    policy: WaitPolicy,
    cancel: &CancellationToken,
) -> Result<(), WatcherError> {
    for attempt in 0..policy.attempts {
        if attempt > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return Err(WatcherError::Cancelled),
                _ = tokio::time::sleep(policy.interval) => {}
            }
        }

        if pair_exists(dir) {
            debug!("certificates present in {} after {} checks", dir.display(), attempt + 1);
            return Ok(());
        }
    }

    Err(WatcherError::Timeout {
        dir: dir.to_path_buf(),
        attempts: policy.attempts,
    })
}

fn pair_exists(dir: &Path) -> bool {
    dir.join(CERT_FILE_NAME).is_file() && dir.join(KEY_FILE_NAME).is_file()
}
