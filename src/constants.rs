//! Well-known names, paths and timing constants shared across the crate.

use std::time::Duration;

/// Name of the PEM certificate chain file, both on disk and inside a TLS secret.
pub const CERT_FILE_NAME: &str = "tls.crt";

/// Name of the PEM private key file, both on disk and inside a TLS secret.
pub const KEY_FILE_NAME: &str = "tls.key";

/// Permission bits of the certificate file.
pub const CERT_FILE_MODE: u32 = 0o644;

/// Permission bits of the private key file.
pub const KEY_FILE_MODE: u32 = 0o600;

/// Address of the workload identity service (SPIRE agent Workload API).
pub const WORKLOAD_API_SOCKET: &str = "unix:///run/spire/sockets/agent.sock";

/// Delay between two checks of the bounded wait.
pub const WAIT_INTERVAL: Duration = Duration::from_millis(500);

/// Number of checks performed by the bounded wait before giving up (~3 minutes).
pub const WAIT_ATTEMPTS: u32 = 360;

/// Name of the symlink that points at the currently published generation directory.
pub(crate) const DATA_DIR_LINK: &str = "..data";

/// Prefix of hidden per-rotation generation directories.
pub(crate) const GENERATION_DIR_PREFIX: &str = "..gen-";
