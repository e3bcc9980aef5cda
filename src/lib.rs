//! GSS-style security contexts for SMB session setup
//!
//! A synchronous, sans-io NTLMv2 initiator: it turns credentials and server
//! tokens into outbound tokens, a session key and message signatures. Token
//! transport and SPNEGO wrapping are left to the caller.

#![allow(missing_docs)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod error;

#[cfg(test)]
pub mod e2e_tests;

pub use auth::{
    ContextFlags, ContextState, Initiator, NtlmConfig, NtlmsspInitiator, Oid, TargetInfo,
    NTLMSSP_OID,
};
pub use error::{Error, NtStatus, Result};
