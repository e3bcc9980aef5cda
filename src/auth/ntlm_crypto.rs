//! NTLM cryptographic functions

use super::av_pair::encode_utf16le;
use super::ntlm::{NtlmError, NtlmFlags, NtlmRole};
use byteorder::{LittleEndian, WriteBytesExt};
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use rand::RngCore;
use rc4::consts::U16;
use rc4::{KeyInit, Rc4, StreamCipher};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

type Result<T> = std::result::Result<T, NtlmError>;

const CLIENT_SIGNING_MAGIC: &[u8] = b"session key to client-to-server signing key magic constant\0";
const SERVER_SIGNING_MAGIC: &[u8] = b"session key to server-to-client signing key magic constant\0";
const CLIENT_SEALING_MAGIC: &[u8] = b"session key to client-to-server sealing key magic constant\0";
const SERVER_SEALING_MAGIC: &[u8] = b"session key to server-to-client sealing key magic constant\0";

/// Version field of an NTLMSSP_MESSAGE_SIGNATURE
const SIGNATURE_VERSION: u32 = 1;

/// Length of an NTLMSSP_MESSAGE_SIGNATURE
pub const SIGNATURE_LEN: usize = 16;

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16]> {
    let mut mac = <Hmac<Md5> as Mac>::new_from_slice(key)
        .map_err(|e| NtlmError::Crypto(format!("HMAC error: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// One-shot RC4 with a 16-byte key
pub fn rc4(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    SealingHandle::new(key).apply(&mut out);
    out
}

/// Convert password to NT hash (MD4 of UTF-16LE password)
pub fn nt_hash(password: &str) -> [u8; 16] {
    let mut pwd_utf16 = encode_utf16le(password);
    let mut hasher = Md4::new();
    hasher.update(&pwd_utf16);
    pwd_utf16.zeroize();
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

/// NTOWFv2: HMAC-MD5 keyed by the NT hash over `Uppercase(user) || domain`
pub fn ntowf_v2(nt_hash: &[u8; 16], username: &str, domain: &str) -> Result<[u8; 16]> {
    let user_domain = format!("{}{}", username.to_uppercase(), domain);
    hmac_md5(nt_hash, &[&encode_utf16le(&user_domain)])
}

/// Calculate LMv2 response
pub fn lmv2_response(
    ntowf_v2: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
) -> Result<Vec<u8>> {
    let mut response = hmac_md5(ntowf_v2, &[server_challenge, client_challenge])?.to_vec();
    response.extend_from_slice(client_challenge);
    Ok(response)
}

/// NTLMv2 blob structure
#[derive(Debug, Clone)]
pub struct NtlmV2Blob {
    pub timestamp: u64,
    pub client_challenge: [u8; 8],
    /// Serialized AV pairs including the terminating `MsvAvEOL`
    pub target_info: Vec<u8>,
}

impl NtlmV2Blob {
    /// Create a new NTLMv2 blob
    pub fn new(timestamp: u64, client_challenge: [u8; 8], target_info: Vec<u8>) -> Self {
        Self {
            timestamp,
            client_challenge,
            target_info,
        }
    }

    /// Serialize the blob
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut blob = Vec::with_capacity(32 + self.target_info.len());

        // RespType, HiRespType, Reserved1
        blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00]);

        // Reserved2
        blob.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

        blob.write_u64::<LittleEndian>(self.timestamp)?;
        blob.extend_from_slice(&self.client_challenge);

        // Reserved3
        blob.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

        blob.extend_from_slice(&self.target_info);

        // Trailing padding
        blob.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

        Ok(blob)
    }
}

/// Calculate NTLMv2 response: `NTProofStr || blob`
pub fn ntlmv2_response(
    ntowf_v2: &[u8; 16],
    server_challenge: &[u8; 8],
    blob: &NtlmV2Blob,
) -> Result<Vec<u8>> {
    let blob_bytes = blob.to_bytes()?;
    let mut response = hmac_md5(ntowf_v2, &[server_challenge, &blob_bytes])?.to_vec();
    response.extend_from_slice(&blob_bytes);
    Ok(response)
}

/// SessionBaseKey: HMAC-MD5 over the NTProofStr (first 16 bytes of the NT response)
pub fn ntlmv2_session_key(ntowf_v2: &[u8; 16], nt_response: &[u8]) -> Result<[u8; 16]> {
    if nt_response.len() < 16 {
        return Err(NtlmError::Crypto("NTLMv2 response shorter than NTProofStr".into()));
    }
    hmac_md5(ntowf_v2, &[&nt_response[..16]])
}

/// MIC over the three handshake messages, the AUTHENTICATE MIC field zeroed
pub fn compute_mic(
    exported_session_key: &[u8; 16],
    negotiate: &[u8],
    challenge: &[u8],
    authenticate: &[u8],
) -> Result<[u8; 16]> {
    hmac_md5(exported_session_key, &[negotiate, challenge, authenticate])
}

/// SIGNKEY for one direction
pub fn signing_key(exported_session_key: &[u8; 16], client_to_server: bool) -> [u8; 16] {
    let magic = if client_to_server {
        CLIENT_SIGNING_MAGIC
    } else {
        SERVER_SIGNING_MAGIC
    };
    md5(&[exported_session_key, magic])
}

/// SEALKEY for one direction, weakened according to the negotiated key strength
pub fn sealing_key(
    exported_session_key: &[u8; 16],
    flags: NtlmFlags,
    client_to_server: bool,
) -> [u8; 16] {
    let key_len = if flags.contains(NtlmFlags::NEGOTIATE_128) {
        16
    } else if flags.contains(NtlmFlags::NEGOTIATE_56) {
        7
    } else {
        5
    };
    let magic = if client_to_server {
        CLIENT_SEALING_MAGIC
    } else {
        SERVER_SEALING_MAGIC
    };
    md5(&[&exported_session_key[..key_len], magic])
}

/// Generate random client challenge
pub fn generate_client_challenge(rng: &mut dyn RngCore) -> [u8; 8] {
    let mut challenge = [0u8; 8];
    rng.fill_bytes(&mut challenge);
    challenge
}

/// Get current Windows timestamp (100ns intervals since 1601-01-01)
pub fn get_windows_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    // Windows epoch is 1601-01-01, Unix epoch is 1970-01-01
    const WINDOWS_EPOCH_DIFF: u64 = 116444736000000000;

    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    (duration.as_secs() * 10_000_000 + duration.subsec_nanos() as u64 / 100) + WINDOWS_EPOCH_DIFF
}

/// Persistent RC4 keystream. Each use advances the stream.
pub struct SealingHandle(Rc4<U16>);

impl SealingHandle {
    pub fn new(key: &[u8; 16]) -> Self {
        Self(Rc4::new(key.into()))
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

/// Signing state established by a completed handshake with extended session
/// security. Holds per-direction keys and sequence numbers.
pub struct SecuritySession {
    role: NtlmRole,
    send_signing_key: [u8; 16],
    recv_signing_key: [u8; 16],
    send_sealing: Option<SealingHandle>,
    recv_sealing: Option<SealingHandle>,
    send_seq: u32,
    recv_seq: u32,
}

impl SecuritySession {
    pub fn new(
        role: NtlmRole,
        exported_session_key: &[u8; 16],
        flags: NtlmFlags,
    ) -> Result<Self> {
        if !flags.contains(NtlmFlags::NEGOTIATE_EXTENDED_SECURITY) {
            return Err(NtlmError::Downgrade(
                "signing without extended session security is not supported".into(),
            ));
        }

        let client = role == NtlmRole::Client;
        let send_signing_key = signing_key(exported_session_key, client);
        let recv_signing_key = signing_key(exported_session_key, !client);

        // The checksum is only RC4-transformed when a random session key was exchanged
        let (send_sealing, recv_sealing) = if flags.contains(NtlmFlags::NEGOTIATE_KEY_EXCHANGE) {
            (
                Some(SealingHandle::new(&sealing_key(exported_session_key, flags, client))),
                Some(SealingHandle::new(&sealing_key(exported_session_key, flags, !client))),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            role,
            send_signing_key,
            recv_signing_key,
            send_sealing,
            recv_sealing,
            send_seq: 0,
            recv_seq: 0,
        })
    }

    /// Sequence number the next outbound signature will carry
    pub fn send_sequence(&self) -> u32 {
        self.send_seq
    }

    /// Sign an outbound message, advancing the send sequence
    pub fn mac(&mut self, message: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
        let seq = self.send_seq;
        let signature = Self::signature(
            &self.send_signing_key,
            self.send_sealing.as_mut(),
            seq,
            message,
        )?;
        self.send_seq = seq.wrapping_add(1);
        Ok(signature)
    }

    /// Check a signature produced by the peer, advancing the receive sequence
    pub fn verify_mac(&mut self, message: &[u8], signature: &[u8]) -> Result<bool> {
        if signature.len() != SIGNATURE_LEN {
            return Err(NtlmError::Parse(format!(
                "message signature must be {} bytes, got {}",
                SIGNATURE_LEN,
                signature.len()
            )));
        }
        let seq = self.recv_seq;
        let expected = Self::signature(
            &self.recv_signing_key,
            self.recv_sealing.as_mut(),
            seq,
            message,
        )?;
        self.recv_seq = seq.wrapping_add(1);
        Ok(bool::from(expected[..].ct_eq(signature)))
    }

    fn signature(
        signing_key: &[u8; 16],
        sealing: Option<&mut SealingHandle>,
        seq: u32,
        message: &[u8],
    ) -> Result<[u8; SIGNATURE_LEN]> {
        let digest = hmac_md5(signing_key, &[&seq.to_le_bytes(), message])?;
        let mut checksum = [0u8; 8];
        checksum.copy_from_slice(&digest[..8]);
        if let Some(handle) = sealing {
            handle.apply(&mut checksum);
        }

        let mut signature = [0u8; SIGNATURE_LEN];
        signature[..4].copy_from_slice(&SIGNATURE_VERSION.to_le_bytes());
        signature[4..12].copy_from_slice(&checksum);
        signature[12..].copy_from_slice(&seq.to_le_bytes());
        Ok(signature)
    }
}

impl Drop for SecuritySession {
    fn drop(&mut self) {
        self.send_signing_key.zeroize();
        self.recv_signing_key.zeroize();
    }
}

impl fmt::Debug for SecuritySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecuritySession")
            .field("role", &self.role)
            .field("sealed_checksum", &self.send_sealing.is_some())
            .field("send_seq", &self.send_seq)
            .field("recv_seq", &self.recv_seq)
            .finish_non_exhaustive()
    }
}
