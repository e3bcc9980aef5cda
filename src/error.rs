//! Error types for security-context negotiation

use crate::auth::ntlm::NtlmError;
use std::fmt;
use thiserror::Error;

/// Result type for security-context operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by an [`Initiator`](crate::auth::Initiator)
///
/// Messages never carry credential material; engine diagnostics are kept
/// behind [`Error::Engine`] so callers can decide what to expose.
#[derive(Debug, Error)]
pub enum Error {
    /// Credential material is missing or unusable
    #[error("Security context initialization failed: {0}")]
    Initialization(String),

    /// Peer token is malformed, truncated or of the wrong type
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Exchange completed without producing a secure session
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Operation called out of order
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Capability not offered by this mechanism
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// Any other failure reported by the authentication engine
    #[error("Authentication engine error while {context}: {source}")]
    Engine {
        context: &'static str,
        #[source]
        source: NtlmError,
    },
}

impl Error {
    /// Status the session-setup layer should report for this error
    pub fn status(&self) -> NtStatus {
        match self {
            Error::Initialization(_) | Error::AuthenticationFailed(_) => NtStatus::LogonFailure,
            Error::Protocol(_) | Error::InvalidState(_) => NtStatus::InvalidParameter,
            Error::Unsupported(_) => NtStatus::NotSupported,
            Error::Engine { .. } => NtStatus::InternalError,
        }
    }
}

/// Session-setup status codes (subset of NTSTATUS) reported for a failed context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NtStatus {
    /// The parameter is incorrect
    InvalidParameter = 0xC000000D,
    /// The user name or password is incorrect
    LogonFailure = 0xC000006D,
    /// The request is not supported
    NotSupported = 0xC00000BB,
    /// An internal error occurred
    InternalError = 0xC00000E5,
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            NtStatus::InvalidParameter => "Invalid parameter",
            NtStatus::LogonFailure => "Logon failure",
            NtStatus::NotSupported => "Not supported",
            NtStatus::InternalError => "Internal error",
        };
        write!(f, "{} (0x{:08X})", msg, *self as u32)
    }
}
