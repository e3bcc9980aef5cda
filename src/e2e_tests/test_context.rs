//! Fixtures for handshake tests
//!
//! Reference values are the MS-NLMP NTLMv2 sample: user `User`, domain
//! `Domain`, password `Password`, server challenge `0123456789abcdef`, client
//! challenge `aa..`, random session key `55..`, time zero.

use super::acceptor::TestAcceptor;
use crate::auth::av_pair::{AvId, AvPair, AvPairs};
use crate::auth::ntlm::{Credentials, NtlmClient, NtlmFlags, Secret};
use crate::auth::{DelegatedSession, Initiator, NtlmsspInitiator};
use crate::error::Result;
use rand::RngCore;

pub const USER: &str = "User";
pub const DOMAIN: &str = "Domain";
pub const PASSWORD: &str = "Password";
pub const CLIENT_CHALLENGE: [u8; 8] = [0xaa; 8];
pub const RANDOM_SESSION_KEY: [u8; 16] = [0x55; 16];

/// Replays a fixed byte script, wrapping around when exhausted
pub struct ScriptedRng {
    script: Vec<u8>,
    pos: usize,
}

impl ScriptedRng {
    pub fn new(parts: &[&[u8]]) -> Self {
        Self {
            script: parts.concat(),
            pos: 0,
        }
    }
}

impl RngCore for ScriptedRng {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.fill_bytes(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.fill_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for byte in dest {
            *byte = self.script[self.pos % self.script.len()];
            self.pos += 1;
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// Server flags of the MS-NLMP sample, minus version and key exchange
pub fn reference_flags() -> NtlmFlags {
    NtlmFlags::NEGOTIATE_UNICODE
        | NtlmFlags::REQUEST_TARGET
        | NtlmFlags::NEGOTIATE_SIGN
        | NtlmFlags::NEGOTIATE_NTLM
        | NtlmFlags::NEGOTIATE_ALWAYS_SIGN
        | NtlmFlags::NEGOTIATE_EXTENDED_SECURITY
        | NtlmFlags::NEGOTIATE_TARGET_INFO
        | NtlmFlags::NEGOTIATE_128
        | NtlmFlags::NEGOTIATE_56
}

pub fn reference_target_info() -> AvPairs {
    [
        AvPair::from_text(AvId::NbDomainName, "Domain"),
        AvPair::from_text(AvId::NbComputerName, "Server"),
    ]
    .into_iter()
    .collect()
}

pub fn credentials(password: &str) -> Credentials {
    Credentials {
        username: USER.into(),
        secret: Secret::Password(password.into()),
        domain: DOMAIN.into(),
        workstation: "COMPUTER".into(),
    }
}

/// Engine with scripted randomness and a clock stuck at zero
pub fn scripted_client(password: &str, rng: ScriptedRng) -> NtlmClient {
    NtlmClient::new(credentials(password))
        .unwrap()
        .with_rng(rng)
        .with_clock(|| 0)
}

/// A delegated initiator paired with an acceptor
pub struct TestContext {
    pub acceptor: TestAcceptor,
    pub initiator: NtlmsspInitiator<DelegatedSession>,
}

impl TestContext {
    pub fn new(acceptor: TestAcceptor, client: NtlmClient) -> Self {
        Self {
            acceptor,
            initiator: NtlmsspInitiator::delegated(client),
        }
    }

    /// MS-NLMP sample without key exchange
    pub fn reference() -> Self {
        Self::new(
            TestAcceptor::new(PASSWORD, reference_flags(), reference_target_info()),
            scripted_client(PASSWORD, ScriptedRng::new(&[&CLIENT_CHALLENGE])),
        )
    }

    /// MS-NLMP sample with a random session key exchanged
    pub fn key_exchange() -> Self {
        Self::new(
            TestAcceptor::new(
                PASSWORD,
                reference_flags() | NtlmFlags::NEGOTIATE_KEY_EXCHANGE,
                reference_target_info(),
            ),
            scripted_client(
                PASSWORD,
                ScriptedRng::new(&[&CLIENT_CHALLENGE, &RANDOM_SESSION_KEY]),
            ),
        )
    }

    /// Run init and accept, returning the AUTHENTICATE token
    pub fn handshake(&mut self) -> Result<Vec<u8>> {
        let negotiate = self.initiator.init_sec_context()?;
        let challenge = self.acceptor.challenge(&negotiate);
        self.initiator.accept_sec_context(&challenge)
    }
}
