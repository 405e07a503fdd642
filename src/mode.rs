//! Certificate acquisition modes.
//!
//! A [`Mode`] is parsed once from the `webhook-mode` configuration value. Parsing is
//! case-insensitive and unknown values are rejected, never defaulted.
//!
//! ```
//! use admission_tls::Mode;
//!
//! let mode: Mode = "SPIRE".parse()?;
//! assert_eq!(mode, Mode::WorkloadIdentity);
//! assert_eq!(mode.to_string(), "spire");
//! # Ok::<(), admission_tls::ModeError>(())
//! ```

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Strategy used to obtain the TLS server identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Certificate and key loaded from files, or a self-signed identity generated in memory.
    ///
    /// Canonical name: `selfregister`.
    Static,

    /// Short-lived identity obtained from the SPIFFE Workload API and rotated on disk.
    ///
    /// Canonical name: `spire`.
    #[default]
    WorkloadIdentity,

    /// Certificate and key read from a Kubernetes TLS secret.
    ///
    /// Canonical name: `secret`.
    SecretStore,
}

/// Errors produced while resolving a [`Mode`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ModeError {
    /// The configured string does not name a mode.
    #[error("not a valid webhook mode: {0}")]
    Unknown(String),

    /// The numeric discriminant does not name a mode.
    #[error("not a valid webhook mode value: {0}")]
    UnknownValue(u32),
}

impl Mode {
    /// All modes, in discriminant order.
    pub const ALL: [Mode; 3] = [Mode::Static, Mode::WorkloadIdentity, Mode::SecretStore];

    /// Returns the canonical configuration string of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Static => "selfregister",
            Mode::WorkloadIdentity => "spire",
            Mode::SecretStore => "secret",
        }
    }

    /// Returns the numeric discriminant used by older deployments.
    pub fn as_u32(self) -> u32 {
        match self {
            Mode::Static => 0,
            Mode::WorkloadIdentity => 1,
            Mode::SecretStore => 2,
        }
    }
}

impl FromStr for Mode {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "selfregister" => Ok(Mode::Static),
            "spire" => Ok(Mode::WorkloadIdentity),
            "secret" => Ok(Mode::SecretStore),
            _ => Err(ModeError::Unknown(s.to_owned())),
        }
    }
}

impl TryFrom<u32> for Mode {
    type Error = ModeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Mode::ALL
            .into_iter()
            .find(|mode| mode.as_u32() == value)
            .ok_or(ModeError::UnknownValue(value))
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
