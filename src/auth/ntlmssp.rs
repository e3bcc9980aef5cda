//! NTLMSSP security context
//!
//! [`NtlmsspInitiator`] sequences the NEGOTIATE / CHALLENGE / AUTHENTICATE
//! exchange over an [`NtlmClient`] and maps engine failures onto the crate
//! error taxonomy. How the engine is obtained is up to the [`EngineBinding`]:
//! [`OwnedCredentials`] builds one from an [`NtlmConfig`], [`DelegatedSession`]
//! takes a handle that was built elsewhere.

use super::ntlm::{Credentials, NtlmClient, NtlmError, Secret};
use super::target_info::TargetInfo;
use super::{
    require_capability, require_established, ContextFlags, ContextState, Initiator, Oid,
    NTLMSSP_OID,
};
use crate::error::{Error, Result};
use std::fmt;
use tracing::{debug, warn};
use zeroize::Zeroize;

/// Credential configuration for an NTLMSSP context
#[derive(Debug, Clone)]
pub struct NtlmConfig {
    pub username: String,
    pub secret: Secret,
    pub domain: String,
    pub workstation: String,
    /// Service principal name of the server, e.g. `cifs/fs01.corp.example.com`
    pub target_spn: Option<String>,
}

impl Default for NtlmConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            secret: Secret::default(),
            domain: String::new(),
            workstation: String::from("RUST-SMB-CLIENT"),
            target_spn: None,
        }
    }
}

impl NtlmConfig {
    fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            secret: self.secret.clone(),
            domain: self.domain.clone(),
            workstation: self.workstation.clone(),
        }
    }
}

/// Supplies the engine handle a context runs its exchange on
pub trait EngineBinding: Send {
    /// Hand over the engine. Called once, from `init_sec_context`.
    fn bind(&mut self) -> Result<NtlmClient>;
}

/// Builds its own engine from owned credential material
#[derive(Debug)]
pub struct OwnedCredentials {
    config: NtlmConfig,
}

impl EngineBinding for OwnedCredentials {
    fn bind(&mut self) -> Result<NtlmClient> {
        let client = NtlmClient::new(self.config.credentials())
            .map_err(engine_error("building the NTLM engine"))?;
        Ok(match &self.config.target_spn {
            Some(spn) => client.with_target_spn(spn.clone()),
            None => client,
        })
    }
}

/// Wraps an engine handle constructed by the caller
#[derive(Debug)]
pub struct DelegatedSession {
    client: Option<NtlmClient>,
}

impl EngineBinding for DelegatedSession {
    fn bind(&mut self) -> Result<NtlmClient> {
        let client = self.client.take().ok_or_else(|| {
            Error::Initialization("delegated engine handle already consumed".into())
        })?;
        if !client.is_fresh() {
            return Err(Error::Initialization(
                "delegated engine handle has already started an exchange".into(),
            ));
        }
        Ok(client)
    }
}

/// Translate an engine failure into the contract error for `context`
fn engine_error(context: &'static str) -> impl FnOnce(NtlmError) -> Error {
    move |source| match source {
        NtlmError::Credentials(msg) => Error::Initialization(msg),
        NtlmError::Parse(_) | NtlmError::Io(_) | NtlmError::Downgrade(_) => {
            Error::Protocol(format!("{} failed: {}", context, source))
        }
        NtlmError::Crypto(_) | NtlmError::OutOfOrder(_) => Error::Engine { context, source },
    }
}

/// NTLMv2 security context
pub struct NtlmsspInitiator<B: EngineBinding> {
    binding: B,
    engine: Option<NtlmClient>,
    state: ContextState,
    target_info: Option<TargetInfo>,
    session_key: Option<[u8; 16]>,
}

impl NtlmsspInitiator<OwnedCredentials> {
    /// Context that builds its engine from `config` on `init_sec_context`
    pub fn with_credentials(config: NtlmConfig) -> Self {
        Self::new(OwnedCredentials { config })
    }
}

impl NtlmsspInitiator<DelegatedSession> {
    /// Context that runs its exchange on `client`, which must not have
    /// produced a NEGOTIATE yet
    pub fn delegated(client: NtlmClient) -> Self {
        Self::new(DelegatedSession {
            client: Some(client),
        })
    }
}

impl<B: EngineBinding> NtlmsspInitiator<B> {
    fn new(binding: B) -> Self {
        Self {
            binding,
            engine: None,
            state: ContextState::Uninitialized,
            target_info: None,
            session_key: None,
        }
    }

    /// Server identity from the CHALLENGE, once established
    pub fn target_info(&self) -> Option<&TargetInfo> {
        self.target_info.as_ref()
    }

    /// Sequence number the next `sum` will use, once established
    pub fn sequence_number(&self) -> Option<u32> {
        if self.state != ContextState::Established {
            return None;
        }
        self.engine.as_ref().and_then(NtlmClient::send_sequence)
    }

    fn fail(&mut self) {
        self.state = ContextState::Failed;
        self.engine = None;
    }

    fn complete_exchange(&mut self, peer_token: &[u8]) -> Result<Vec<u8>> {
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| Error::InvalidState("NTLM engine not initialized".into()))?;

        let token = engine
            .authenticate(peer_token)
            .map_err(engine_error("processing the challenge"))?;

        let details = engine.session_details().ok_or_else(|| Error::Engine {
            context: "reading session details",
            source: NtlmError::OutOfOrder("exchange produced no session details".into()),
        })?;
        let target_info = TargetInfo::from_av_pairs(&details.target_info);
        let session_key = details.exported_session_key;
        let negotiated = details.negotiated_flags;

        if !engine.has_security_session() {
            return Err(Error::AuthenticationFailed(format!(
                "no secure session established (negotiated {:?})",
                negotiated
            )));
        }

        self.target_info = Some(target_info);
        self.session_key = Some(session_key);
        Ok(token)
    }
}

impl<B: EngineBinding> Initiator for NtlmsspInitiator<B> {
    fn mechanism_id(&self) -> Oid {
        NTLMSSP_OID
    }

    fn init_sec_context(&mut self) -> Result<Vec<u8>> {
        if self.state != ContextState::Uninitialized {
            return Err(Error::InvalidState(format!(
                "init_sec_context called in state {:?}",
                self.state
            )));
        }

        let token = self.binding.bind().and_then(|mut engine| {
            let token = engine
                .negotiate()
                .map_err(engine_error("producing the negotiate token"))?;
            self.engine = Some(engine);
            Ok(token)
        });

        match token {
            Ok(token) => {
                debug!(len = token.len(), "NTLMSSP: negotiate token produced");
                self.state = ContextState::TokenSent;
                Ok(token)
            }
            Err(e) => {
                warn!("NTLMSSP: context initialization failed: {}", e);
                self.fail();
                Err(e)
            }
        }
    }

    fn accept_sec_context(&mut self, peer_token: &[u8]) -> Result<Vec<u8>> {
        if self.state != ContextState::TokenSent {
            return Err(Error::InvalidState(format!(
                "accept_sec_context called in state {:?}",
                self.state
            )));
        }

        let result = if peer_token.is_empty() {
            Err(Error::Protocol("empty challenge token".into()))
        } else {
            self.complete_exchange(peer_token)
        };

        match result {
            Ok(token) => {
                debug!(len = token.len(), "NTLMSSP: context established");
                self.state = ContextState::Established;
                Ok(token)
            }
            Err(e) => {
                warn!("NTLMSSP: challenge rejected: {}", e);
                self.fail();
                Err(e)
            }
        }
    }

    fn sum(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        require_established(self.state, "sum")?;
        require_capability(self.capabilities(), ContextFlags::INTEGRITY, "sum")?;

        let session = self
            .engine
            .as_mut()
            .and_then(NtlmClient::security_session)
            .ok_or_else(|| Error::Unsupported("context has no signing session".into()))?;
        let signature = session
            .mac(message)
            .map_err(engine_error("signing a message"))?;
        Ok(signature.to_vec())
    }

    fn session_key(&self) -> Result<&[u8]> {
        require_established(self.state, "session_key")?;
        self.session_key
            .as_ref()
            .map(|key| key.as_slice())
            .ok_or_else(|| Error::Unsupported("context exported no session key".into()))
    }

    fn state(&self) -> ContextState {
        self.state
    }

    fn capabilities(&self) -> ContextFlags {
        match self.state {
            ContextState::Established => {
                let mut flags = ContextFlags::empty();
                if self
                    .engine
                    .as_ref()
                    .map_or(false, NtlmClient::has_security_session)
                {
                    flags |= ContextFlags::INTEGRITY;
                }
                if self.session_key.is_some() {
                    flags |= ContextFlags::SESSION_KEY;
                }
                flags
            }
            _ => ContextFlags::empty(),
        }
    }
}

impl<B: EngineBinding> Drop for NtlmsspInitiator<B> {
    fn drop(&mut self) {
        if let Some(key) = self.session_key.as_mut() {
            key.zeroize();
        }
    }
}

impl<B: EngineBinding> fmt::Debug for NtlmsspInitiator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NtlmsspInitiator")
            .field("mechanism", &NTLMSSP_OID.to_string())
            .field("state", &self.state)
            .field("target_info", &self.target_info)
            .finish_non_exhaustive()
    }
}
