//! Server side of the NTLM exchange, for tests
//!
//! Issues CHALLENGE messages with chosen flags and target info, then checks
//! an AUTHENTICATE message against a known password: NTLMv2 proof, exported
//! session key, MIC. A successful check yields the server-role
//! [`SecuritySession`] used to verify client signatures.

use crate::auth::av_pair::{AvId, AvPair, AvPairs, AV_FLAG_MIC_PROVIDED};
use crate::auth::ntlm::{
    NtlmAuthenticateMessage, NtlmChallengeMessage, NtlmFlags, NtlmNegotiateMessage, NtlmRole,
    AUTHENTICATE_MIC_OFFSET,
};
use crate::auth::ntlm_crypto::{
    compute_mic, nt_hash, ntlmv2_response, ntlmv2_session_key, ntowf_v2, rc4, NtlmV2Blob,
    SecuritySession,
};

/// Blob header before the AV pairs: type, reserved, timestamp, challenge, reserved
const BLOB_HEADER_LEN: usize = 28;

pub struct TestAcceptor {
    password: String,
    flags: NtlmFlags,
    server_challenge: [u8; 8],
    target_info: AvPairs,
    negotiate: Vec<u8>,
    challenge: Vec<u8>,
}

/// What the acceptor learned from a valid AUTHENTICATE message
pub struct AcceptedSession {
    pub user: String,
    pub domain: String,
    pub workstation: String,
    pub lm_response: Vec<u8>,
    pub nt_proof: [u8; 16],
    pub encrypted_session_key: Vec<u8>,
    pub exported_session_key: [u8; 16],
    /// AV pairs the client put in its NTLMv2 blob
    pub blob_target_info: AvPairs,
    pub mic_verified: bool,
    pub session: SecuritySession,
}

impl TestAcceptor {
    pub fn new(password: &str, flags: NtlmFlags, target_info: AvPairs) -> Self {
        Self {
            password: password.to_string(),
            flags,
            server_challenge: [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef],
            target_info,
            negotiate: Vec::new(),
            challenge: Vec::new(),
        }
    }

    /// Advertise `MsvAvTimestamp`, which obliges the client to send a MIC
    pub fn with_timestamp(mut self, filetime: u64) -> Self {
        self.target_info
            .push(AvPair::new(AvId::Timestamp, filetime.to_le_bytes().to_vec()));
        self
    }

    /// Omit target info entirely, as an NTLMv1 server would
    pub fn without_target_info(mut self) -> Self {
        self.target_info = AvPairs::new();
        self
    }

    pub fn challenge(&mut self, negotiate: &[u8]) -> Vec<u8> {
        NtlmNegotiateMessage::parse(negotiate).expect("client sent a valid NEGOTIATE");
        self.negotiate = negotiate.to_vec();

        let mut message =
            NtlmChallengeMessage::new("Domain".into(), self.server_challenge, self.flags);
        if !self.target_info.is_empty() {
            message = message
                .with_target_info(self.target_info.clone())
                .expect("target info encodes");
        }
        self.challenge = message.serialize().expect("challenge encodes");
        self.challenge.clone()
    }

    pub fn accept(&self, authenticate: &[u8]) -> Result<AcceptedSession, String> {
        let auth = NtlmAuthenticateMessage::parse(authenticate).map_err(|e| e.to_string())?;

        if auth.nt_response.len() < 16 + BLOB_HEADER_LEN + 4 {
            return Err("NT response is not an NTLMv2 response".into());
        }
        let blob = &auth.nt_response[16..];
        let timestamp = u64::from_le_bytes(blob[8..16].try_into().map_err(|_| "timestamp")?);
        let client_challenge: [u8; 8] = blob[16..24].try_into().map_err(|_| "challenge")?;
        let blob_info_bytes = blob[BLOB_HEADER_LEN..blob.len() - 4].to_vec();

        let ntowf = ntowf_v2(&nt_hash(&self.password), &auth.user_name, &auth.domain_name)
            .map_err(|e| e.to_string())?;
        let expected = ntlmv2_response(
            &ntowf,
            &self.server_challenge,
            &NtlmV2Blob::new(timestamp, client_challenge, blob_info_bytes.clone()),
        )
        .map_err(|e| e.to_string())?;
        if expected != auth.nt_response {
            return Err("NTLMv2 response does not match the password".into());
        }

        let key_exchange_key =
            ntlmv2_session_key(&ntowf, &auth.nt_response).map_err(|e| e.to_string())?;
        let exported_session_key: [u8; 16] = if auth.flags.contains(NtlmFlags::NEGOTIATE_KEY_EXCHANGE) {
            rc4(&key_exchange_key, &auth.encrypted_session_key)
                .try_into()
                .map_err(|_| "encrypted session key must be 16 bytes".to_string())?
        } else {
            key_exchange_key
        };

        let blob_target_info = AvPairs::parse(&blob_info_bytes).map_err(|e| e.to_string())?;
        let mic_flagged = blob_target_info
            .get(AvId::Flags)
            .and_then(|value| value.try_into().ok())
            .map_or(false, |bytes: [u8; 4]| {
                u32::from_le_bytes(bytes) & AV_FLAG_MIC_PROVIDED != 0
            });

        if mic_flagged {
            let mut zeroed = authenticate.to_vec();
            zeroed[AUTHENTICATE_MIC_OFFSET..AUTHENTICATE_MIC_OFFSET + 16].fill(0);
            let mic = compute_mic(&exported_session_key, &self.negotiate, &self.challenge, &zeroed)
                .map_err(|e| e.to_string())?;
            if mic != auth.mic {
                return Err("MIC does not match".into());
            }
        }

        let session = SecuritySession::new(NtlmRole::Server, &exported_session_key, auth.flags)
            .map_err(|e| e.to_string())?;

        let mut nt_proof = [0u8; 16];
        nt_proof.copy_from_slice(&auth.nt_response[..16]);

        Ok(AcceptedSession {
            user: auth.user_name,
            domain: auth.domain_name,
            workstation: auth.workstation,
            lm_response: auth.lm_response,
            nt_proof,
            encrypted_session_key: auth.encrypted_session_key,
            exported_session_key,
            blob_target_info,
            mic_verified: mic_flagged,
            session,
        })
    }
}
