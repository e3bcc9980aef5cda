//! Security-context negotiation for SMB session setup
//!
//! An [`Initiator`] drives one token exchange for one session. The session
//! setup layer calls [`Initiator::init_sec_context`] to get the first token,
//! feeds the server's reply to [`Initiator::accept_sec_context`], and once the
//! context is [`ContextState::Established`] uses [`Initiator::session_key`] and
//! [`Initiator::sum`] to key and sign the session.

pub mod av_pair;
pub mod ntlm;
pub mod ntlm_crypto;
pub mod ntlmssp;
pub mod target_info;

pub use ntlm::{Credentials, NtlmClient, Secret};
pub use ntlmssp::{DelegatedSession, EngineBinding, NtlmConfig, NtlmsspInitiator, OwnedCredentials};
pub use target_info::{TargetInfo, TargetInfoField};

use crate::error::{Error, Result};
use bitflags::bitflags;
use std::fmt;

/// NTLMSSP mechanism, 1.3.6.1.4.1.311.2.2.10
pub const NTLMSSP_OID: Oid = Oid::from_arcs(&[1, 3, 6, 1, 4, 1, 311, 2, 2, 10]);

/// ASN.1 object identifier naming a security mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid {
    arcs: &'static [u64],
}

impl Oid {
    pub const fn from_arcs(arcs: &'static [u64]) -> Self {
        Self { arcs }
    }

    /// DER encoding (tag, length, content) as carried in SPNEGO mechanism lists
    pub fn to_der(&self) -> Vec<u8> {
        let mut content = Vec::new();
        if let [first, second, rest @ ..] = self.arcs {
            push_base128(&mut content, first * 40 + second);
            for arc in rest {
                push_base128(&mut content, *arc);
            }
        }

        let mut der = Vec::with_capacity(content.len() + 2);
        der.push(0x06);
        // Mechanism OIDs are always short enough for the short length form
        der.push(content.len() as u8);
        der.extend_from_slice(&content);
        der
    }
}

fn push_base128(out: &mut Vec<u8>, mut value: u64) {
    let mut groups = vec![(value & 0x7f) as u8];
    value >>= 7;
    while value > 0 {
        groups.push(((value & 0x7f) as u8) | 0x80);
        value >>= 7;
    }
    out.extend(groups.iter().rev());
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arc) in self.arcs.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", arc)?;
        }
        Ok(())
    }
}

/// Lifecycle of a security context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Nothing sent yet
    Uninitialized,
    /// Initial token produced, waiting for the peer's reply
    TokenSent,
    /// Handshake complete, session key and signing available
    Established,
    /// Terminal failure, the context cannot be reused
    Failed,
}

bitflags! {
    /// What an established context can do for its caller
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlags: u32 {
        /// `sum` produces real message signatures
        const INTEGRITY = 0x00000001;
        /// `session_key` exports a symmetric key
        const SESSION_KEY = 0x00000002;
    }
}

/// Mechanism-independent security context contract
///
/// Each instance handles exactly one handshake. Call order is
/// `init_sec_context` once, `accept_sec_context` once, then `sum` and
/// `session_key` any number of times. Any failure during the exchange
/// leaves the context [`ContextState::Failed`]; create a new one to retry.
pub trait Initiator: Send {
    /// Mechanism identifier, valid in every state
    fn mechanism_id(&self) -> Oid;

    /// Produce the first outbound token
    fn init_sec_context(&mut self) -> Result<Vec<u8>>;

    /// Consume the peer's token and produce the response token
    fn accept_sec_context(&mut self, peer_token: &[u8]) -> Result<Vec<u8>>;

    /// Message integrity code over `message`. Advances the sequence number, so
    /// repeated calls with the same input give different output.
    fn sum(&mut self, message: &[u8]) -> Result<Vec<u8>>;

    /// Exported session key
    fn session_key(&self) -> Result<&[u8]>;

    fn state(&self) -> ContextState;

    /// Capabilities available in the current state
    fn capabilities(&self) -> ContextFlags;
}

/// Fails with [`Error::InvalidState`] unless the context is established
pub(crate) fn require_established(state: ContextState, operation: &str) -> Result<()> {
    if state != ContextState::Established {
        return Err(Error::InvalidState(format!(
            "{} requires an established context, state is {:?}",
            operation, state
        )));
    }
    Ok(())
}

/// Fails with [`Error::Unsupported`] when `required` is not offered
pub(crate) fn require_capability(
    offered: ContextFlags,
    required: ContextFlags,
    operation: &str,
) -> Result<()> {
    if !offered.contains(required) {
        return Err(Error::Unsupported(format!(
            "{} needs {:?}, context offers {:?}",
            operation, required, offered
        )));
    }
    Ok(())
}
