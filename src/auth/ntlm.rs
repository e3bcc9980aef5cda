//! NTLM authentication engine
//!
//! Message codec for the three NTLMSSP messages plus [`NtlmClient`], the
//! client-side engine handle that turns credentials and a server CHALLENGE
//! into an AUTHENTICATE message, an exported session key and, when signing was
//! negotiated, a [`SecuritySession`].
//!
//! Only NTLMv2 is implemented. There is no LM or NTLMv1 response path.

use super::av_pair::{decode_utf16le, encode_utf16le, AvId, AvPair, AvPairs, AV_FLAG_MIC_PROVIDED};
use super::ntlm_crypto::{
    compute_mic, generate_client_challenge, get_windows_timestamp, lmv2_response, nt_hash,
    ntlmv2_response, ntlmv2_session_key, ntowf_v2, rc4, NtlmV2Blob, SecuritySession,
};
use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::RngCore;
use std::convert::TryFrom;
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroize;

/// NTLM signature - "NTLMSSP\0"
pub const NTLMSSP_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_FIXED_LEN: usize = 32;
const CHALLENGE_FIXED_LEN: usize = 48;
const AUTHENTICATE_FIXED_LEN: usize = 64;
const VERSION_LEN: usize = 8;
const MIC_LEN: usize = 16;

/// Offset of the MIC inside an AUTHENTICATE message
pub const AUTHENTICATE_MIC_OFFSET: usize = AUTHENTICATE_FIXED_LEN + VERSION_LEN;

/// Errors raised by the engine
#[derive(Debug, Error)]
pub enum NtlmError {
    /// Truncated input while decoding
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Structurally invalid message
    #[error("Malformed NTLM message: {0}")]
    Parse(String),

    /// Credential material cannot be used
    #[error("Invalid credentials: {0}")]
    Credentials(String),

    /// Peer asked for something weaker than NTLMv2 with extended session security
    #[error("NTLMv2 requirement not met: {0}")]
    Downgrade(String),

    /// Primitive failure
    #[error("Cryptographic failure: {0}")]
    Crypto(String),

    /// Engine operation called in the wrong order
    #[error("Out of sequence: {0}")]
    OutOfOrder(String),
}

type Result<T> = std::result::Result<T, NtlmError>;

/// NTLM message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NtlmMessageType {
    /// Type 1: Negotiate message (client -> server)
    Negotiate = 0x00000001,
    /// Type 2: Challenge message (server -> client)
    Challenge = 0x00000002,
    /// Type 3: Authenticate message (client -> server)
    Authenticate = 0x00000003,
}

impl TryFrom<u32> for NtlmMessageType {
    type Error = NtlmError;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00000001 => Ok(Self::Negotiate),
            0x00000002 => Ok(Self::Challenge),
            0x00000003 => Ok(Self::Authenticate),
            _ => Err(NtlmError::Parse(format!(
                "Invalid NTLM message type: {}",
                value
            ))),
        }
    }
}

bitflags! {
    /// NTLM negotiation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NtlmFlags: u32 {
        /// Negotiate Unicode encoding
        const NEGOTIATE_UNICODE = 0x00000001;
        /// Negotiate OEM encoding
        const NEGOTIATE_OEM = 0x00000002;
        /// Request target name from server
        const REQUEST_TARGET = 0x00000004;
        /// Sign messages
        const NEGOTIATE_SIGN = 0x00000010;
        /// Seal (encrypt) messages
        const NEGOTIATE_SEAL = 0x00000020;
        /// Use datagram style authentication
        const NEGOTIATE_DATAGRAM = 0x00000040;
        /// Use LAN Manager session key
        const NEGOTIATE_LAN_MANAGER_KEY = 0x00000080;
        /// NTLM authentication (set for NTLMv2 too)
        const NEGOTIATE_NTLM = 0x00000200;
        /// Anonymous connection
        const NEGOTIATE_ANONYMOUS = 0x00000800;
        /// Domain name supplied
        const NEGOTIATE_DOMAIN_SUPPLIED = 0x00001000;
        /// Workstation name supplied
        const NEGOTIATE_WORKSTATION_SUPPLIED = 0x00002000;
        /// Always sign messages
        const NEGOTIATE_ALWAYS_SIGN = 0x00008000;
        /// Target type is domain
        const TARGET_TYPE_DOMAIN = 0x00010000;
        /// Target type is server
        const TARGET_TYPE_SERVER = 0x00020000;
        /// Extended session security
        const NEGOTIATE_EXTENDED_SECURITY = 0x00080000;
        /// Identify level security
        const NEGOTIATE_IDENTIFY = 0x00100000;
        /// Request non-NT session key
        const REQUEST_NON_NT_SESSION_KEY = 0x00400000;
        /// Target info present
        const NEGOTIATE_TARGET_INFO = 0x00800000;
        /// Version info present
        const NEGOTIATE_VERSION = 0x02000000;
        /// 128-bit encryption
        const NEGOTIATE_128 = 0x20000000;
        /// Explicit key exchange
        const NEGOTIATE_KEY_EXCHANGE = 0x40000000;
        /// 56-bit encryption
        const NEGOTIATE_56 = 0x80000000;
    }
}

/// Flags offered in the NEGOTIATE message. `NEGOTIATE_LAN_MANAGER_KEY` is
/// never offered.
pub const CLIENT_FLAGS: NtlmFlags = NtlmFlags::NEGOTIATE_UNICODE
    .union(NtlmFlags::NEGOTIATE_OEM)
    .union(NtlmFlags::REQUEST_TARGET)
    .union(NtlmFlags::NEGOTIATE_SIGN)
    .union(NtlmFlags::NEGOTIATE_NTLM)
    .union(NtlmFlags::NEGOTIATE_ALWAYS_SIGN)
    .union(NtlmFlags::NEGOTIATE_EXTENDED_SECURITY)
    .union(NtlmFlags::NEGOTIATE_TARGET_INFO)
    .union(NtlmFlags::NEGOTIATE_VERSION)
    .union(NtlmFlags::NEGOTIATE_128)
    .union(NtlmFlags::NEGOTIATE_KEY_EXCHANGE)
    .union(NtlmFlags::NEGOTIATE_56);

/// Client or server side of the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtlmRole {
    Client,
    Server,
}

fn check_header(cursor: &mut io::Cursor<&[u8]>, expected: NtlmMessageType) -> Result<()> {
    let mut signature = [0u8; 8];
    cursor.read_exact(&mut signature)?;
    if &signature != NTLMSSP_SIGNATURE {
        return Err(NtlmError::Parse("Invalid NTLM signature".into()));
    }

    let message_type = NtlmMessageType::try_from(cursor.read_u32::<LittleEndian>()?)?;
    if message_type != expected {
        return Err(NtlmError::Parse(format!(
            "Expected {:?} message, got {:?}",
            expected, message_type
        )));
    }
    Ok(())
}

fn encode_string(text: &str, flags: NtlmFlags) -> Vec<u8> {
    if flags.contains(NtlmFlags::NEGOTIATE_UNICODE) {
        encode_utf16le(text)
    } else {
        text.as_bytes().to_vec()
    }
}

fn decode_string(bytes: &[u8], flags: NtlmFlags) -> String {
    if flags.contains(NtlmFlags::NEGOTIATE_UNICODE) {
        decode_utf16le(bytes)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Security buffer descriptor for NTLM messages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityBuffer {
    /// Length of the buffer data
    pub length: u16,
    /// Maximum length of the buffer
    pub max_length: u16,
    /// Offset from the beginning of the NTLM message
    pub offset: u32,
}

impl SecurityBuffer {
    pub fn with_data(data_len: usize, offset: usize) -> Result<Self> {
        let length = u16::try_from(data_len)
            .map_err(|_| NtlmError::Parse("Security buffer payload too long".into()))?;
        Ok(Self {
            length,
            max_length: length,
            offset: offset as u32,
        })
    }

    pub fn parse(cursor: &mut io::Cursor<&[u8]>) -> Result<Self> {
        let length = cursor.read_u16::<LittleEndian>()?;
        let max_length = cursor.read_u16::<LittleEndian>()?;
        let offset = cursor.read_u32::<LittleEndian>()?;

        Ok(Self {
            length,
            max_length,
            offset,
        })
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u16::<LittleEndian>(self.length)?;
        buf.write_u16::<LittleEndian>(self.max_length)?;
        buf.write_u32::<LittleEndian>(self.offset)?;
        Ok(())
    }

    pub fn extract_data<'a>(&self, message: &'a [u8]) -> Result<&'a [u8]> {
        let start = self.offset as usize;
        match start.checked_add(self.length as usize) {
            Some(end) if end <= message.len() => Ok(&message[start..end]),
            _ => Err(NtlmError::Parse(
                "Security buffer extends beyond message".into(),
            )),
        }
    }
}

/// Lays out variable-length fields after a fixed header
struct PayloadWriter {
    offset: usize,
    payload: Vec<u8>,
}

impl PayloadWriter {
    fn new(fixed_len: usize) -> Self {
        Self {
            offset: fixed_len,
            payload: Vec::new(),
        }
    }

    fn add(&mut self, data: &[u8]) -> Result<SecurityBuffer> {
        if data.is_empty() {
            return Ok(SecurityBuffer {
                offset: self.offset as u32,
                ..SecurityBuffer::default()
            });
        }
        let buffer = SecurityBuffer::with_data(data.len(), self.offset)?;
        self.offset += data.len();
        self.payload.extend_from_slice(data);
        Ok(buffer)
    }
}

/// NTLM version information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtlmVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
    pub ntlm_revision: u8,
}

impl NtlmVersion {
    /// NTLMSSP_REVISION_W2K3
    pub const NTLM_REVISION_CURRENT: u8 = 0x0F;

    pub fn client_default() -> Self {
        Self {
            major: 10,
            minor: 0,
            build: 19041,
            ntlm_revision: Self::NTLM_REVISION_CURRENT,
        }
    }

    pub fn parse(cursor: &mut io::Cursor<&[u8]>) -> Result<Self> {
        let major = cursor.read_u8()?;
        let minor = cursor.read_u8()?;
        let build = cursor.read_u16::<LittleEndian>()?;
        let mut reserved = [0u8; 3];
        cursor.read_exact(&mut reserved)?;
        let ntlm_revision = cursor.read_u8()?;
        Ok(Self {
            major,
            minor,
            build,
            ntlm_revision,
        })
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u8(self.major)?;
        buf.write_u8(self.minor)?;
        buf.write_u16::<LittleEndian>(self.build)?;
        buf.write_all(&[0, 0, 0])?;
        buf.write_u8(self.ntlm_revision)?;
        Ok(())
    }
}

/// NTLM Type 1 Message - Negotiate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtlmNegotiateMessage {
    pub flags: NtlmFlags,
    pub domain_name: String,
    pub workstation_name: String,
    pub version: Option<NtlmVersion>,
}

impl NtlmNegotiateMessage {
    /// Negotiate message offering `flags`. Domain and workstation are left
    /// out; they travel in the AUTHENTICATE message.
    pub fn new(flags: NtlmFlags) -> Self {
        let version = flags
            .contains(NtlmFlags::NEGOTIATE_VERSION)
            .then(NtlmVersion::client_default);
        Self {
            flags,
            domain_name: String::new(),
            workstation_name: String::new(),
            version,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < NEGOTIATE_FIXED_LEN {
            return Err(NtlmError::Parse("NTLM negotiate message too short".into()));
        }

        let mut cursor = io::Cursor::new(data);
        check_header(&mut cursor, NtlmMessageType::Negotiate)?;

        let flags = NtlmFlags::from_bits_retain(cursor.read_u32::<LittleEndian>()?);
        let domain = SecurityBuffer::parse(&mut cursor)?;
        let workstation = SecurityBuffer::parse(&mut cursor)?;

        let version = if flags.contains(NtlmFlags::NEGOTIATE_VERSION) {
            Some(NtlmVersion::parse(&mut cursor)?)
        } else {
            None
        };

        // Domain and workstation are always OEM in this message
        let domain_name = String::from_utf8_lossy(domain.extract_data(data)?).into_owned();
        let workstation_name =
            String::from_utf8_lossy(workstation.extract_data(data)?).into_owned();

        Ok(Self {
            flags,
            domain_name,
            workstation_name,
            version,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let fixed_len = NEGOTIATE_FIXED_LEN + self.version.map_or(0, |_| VERSION_LEN);
        let mut payload = PayloadWriter::new(fixed_len);

        let domain = payload.add(self.domain_name.as_bytes())?;
        let workstation = payload.add(self.workstation_name.as_bytes())?;

        buf.write_all(NTLMSSP_SIGNATURE)?;
        buf.write_u32::<LittleEndian>(NtlmMessageType::Negotiate as u32)?;
        buf.write_u32::<LittleEndian>(self.flags.bits())?;
        domain.serialize(&mut buf)?;
        workstation.serialize(&mut buf)?;
        if let Some(version) = &self.version {
            version.serialize(&mut buf)?;
        }
        buf.extend_from_slice(&payload.payload);

        Ok(buf)
    }
}

/// NTLM Type 2 Message - Challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtlmChallengeMessage {
    pub flags: NtlmFlags,
    pub challenge: [u8; 8],
    pub target_name: String,
    pub target_info: AvPairs,
    /// Target-info buffer as it appeared on the wire
    pub target_info_data: Vec<u8>,
    pub version: Option<NtlmVersion>,
}

impl NtlmChallengeMessage {
    pub fn new(target_name: String, challenge: [u8; 8], flags: NtlmFlags) -> Self {
        Self {
            flags,
            challenge,
            target_name,
            target_info: AvPairs::new(),
            target_info_data: Vec::new(),
            version: None,
        }
    }

    pub fn with_target_info(mut self, target_info: AvPairs) -> Result<Self> {
        self.target_info_data = target_info.serialize()?;
        self.target_info = target_info;
        self.flags |= NtlmFlags::NEGOTIATE_TARGET_INFO;
        Ok(self)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < CHALLENGE_FIXED_LEN {
            return Err(NtlmError::Parse("NTLM challenge message too short".into()));
        }

        let mut cursor = io::Cursor::new(data);
        check_header(&mut cursor, NtlmMessageType::Challenge)?;

        let target_name_buffer = SecurityBuffer::parse(&mut cursor)?;
        let flags = NtlmFlags::from_bits_retain(cursor.read_u32::<LittleEndian>()?);

        let mut challenge = [0u8; 8];
        cursor.read_exact(&mut challenge)?;

        // Reserved context
        let _context = cursor.read_u64::<LittleEndian>()?;

        let target_info_buffer = SecurityBuffer::parse(&mut cursor)?;

        let version = if flags.contains(NtlmFlags::NEGOTIATE_VERSION) {
            Some(NtlmVersion::parse(&mut cursor)?)
        } else {
            None
        };

        let target_name = decode_string(target_name_buffer.extract_data(data)?, flags);
        let target_info_data = target_info_buffer.extract_data(data)?.to_vec();
        let target_info = AvPairs::parse(&target_info_data)?;

        Ok(Self {
            flags,
            challenge,
            target_name,
            target_info,
            target_info_data,
            version,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let fixed_len = CHALLENGE_FIXED_LEN + self.version.map_or(0, |_| VERSION_LEN);
        let mut payload = PayloadWriter::new(fixed_len);

        let target_name = payload.add(&encode_string(&self.target_name, self.flags))?;
        let target_info = payload.add(&self.target_info_data)?;

        buf.write_all(NTLMSSP_SIGNATURE)?;
        buf.write_u32::<LittleEndian>(NtlmMessageType::Challenge as u32)?;
        target_name.serialize(&mut buf)?;
        buf.write_u32::<LittleEndian>(self.flags.bits())?;
        buf.write_all(&self.challenge)?;
        buf.write_u64::<LittleEndian>(0)?;
        target_info.serialize(&mut buf)?;
        if let Some(version) = &self.version {
            version.serialize(&mut buf)?;
        }
        buf.extend_from_slice(&payload.payload);

        Ok(buf)
    }
}

/// NTLM Type 3 Message - Authenticate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtlmAuthenticateMessage {
    pub flags: NtlmFlags,
    pub lm_response: Vec<u8>,
    pub nt_response: Vec<u8>,
    pub domain_name: String,
    pub user_name: String,
    pub workstation: String,
    pub encrypted_session_key: Vec<u8>,
    pub version: Option<NtlmVersion>,
    pub mic: [u8; MIC_LEN],
}

impl NtlmAuthenticateMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < AUTHENTICATE_FIXED_LEN {
            return Err(NtlmError::Parse(
                "NTLM authenticate message too short".into(),
            ));
        }

        let mut cursor = io::Cursor::new(data);
        check_header(&mut cursor, NtlmMessageType::Authenticate)?;

        let lm_response = SecurityBuffer::parse(&mut cursor)?;
        let nt_response = SecurityBuffer::parse(&mut cursor)?;
        let domain = SecurityBuffer::parse(&mut cursor)?;
        let user = SecurityBuffer::parse(&mut cursor)?;
        let workstation = SecurityBuffer::parse(&mut cursor)?;
        let session_key = SecurityBuffer::parse(&mut cursor)?;
        let flags = NtlmFlags::from_bits_retain(cursor.read_u32::<LittleEndian>()?);

        // Version and MIC are present when the payload starts after them
        let payload_start = [&lm_response, &nt_response, &domain, &user, &workstation, &session_key]
            .iter()
            .filter(|buffer| buffer.length > 0)
            .map(|buffer| buffer.offset as usize)
            .min()
            .unwrap_or(data.len());

        let mut version = None;
        let mut mic = [0u8; MIC_LEN];
        if payload_start >= AUTHENTICATE_MIC_OFFSET + MIC_LEN
            && data.len() >= AUTHENTICATE_MIC_OFFSET + MIC_LEN
        {
            let parsed = NtlmVersion::parse(&mut cursor)?;
            if flags.contains(NtlmFlags::NEGOTIATE_VERSION) {
                version = Some(parsed);
            }
            cursor.read_exact(&mut mic)?;
        }

        Ok(Self {
            flags,
            lm_response: lm_response.extract_data(data)?.to_vec(),
            nt_response: nt_response.extract_data(data)?.to_vec(),
            domain_name: decode_string(domain.extract_data(data)?, flags),
            user_name: decode_string(user.extract_data(data)?, flags),
            workstation: decode_string(workstation.extract_data(data)?, flags),
            encrypted_session_key: session_key.extract_data(data)?.to_vec(),
            version,
            mic,
        })
    }

    /// Serialize with Version and MIC fields always reserved, so the MIC
    /// can be patched in at [`AUTHENTICATE_MIC_OFFSET`].
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut payload = PayloadWriter::new(AUTHENTICATE_MIC_OFFSET + MIC_LEN);

        let domain_bytes = encode_string(&self.domain_name, self.flags);
        let user_bytes = encode_string(&self.user_name, self.flags);
        let workstation_bytes = encode_string(&self.workstation, self.flags);

        let domain = payload.add(&domain_bytes)?;
        let user = payload.add(&user_bytes)?;
        let workstation = payload.add(&workstation_bytes)?;
        let lm_response = payload.add(&self.lm_response)?;
        let nt_response = payload.add(&self.nt_response)?;
        let session_key = payload.add(&self.encrypted_session_key)?;

        buf.write_all(NTLMSSP_SIGNATURE)?;
        buf.write_u32::<LittleEndian>(NtlmMessageType::Authenticate as u32)?;
        lm_response.serialize(&mut buf)?;
        nt_response.serialize(&mut buf)?;
        domain.serialize(&mut buf)?;
        user.serialize(&mut buf)?;
        workstation.serialize(&mut buf)?;
        session_key.serialize(&mut buf)?;
        buf.write_u32::<LittleEndian>(self.flags.bits())?;
        match &self.version {
            Some(version) => version.serialize(&mut buf)?,
            None => buf.write_all(&[0u8; VERSION_LEN])?,
        }
        buf.write_all(&self.mic)?;
        buf.extend_from_slice(&payload.payload);

        Ok(buf)
    }
}

/// Password or precomputed NT hash
#[derive(Clone)]
pub enum Secret {
    Password(String),
    NtHash([u8; 16]),
}

impl Secret {
    /// Parse a 32 hex digit NT hash
    pub fn nt_hash_from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|_| NtlmError::Credentials("NT hash is not valid hex".into()))?;
        let hash: [u8; 16] = bytes
            .try_into()
            .map_err(|_| NtlmError::Credentials("NT hash must be 16 bytes".into()))?;
        Ok(Secret::NtHash(hash))
    }

    fn nt_hash(&self) -> [u8; 16] {
        match self {
            Secret::Password(password) => nt_hash(password),
            Secret::NtHash(hash) => *hash,
        }
    }
}

impl Default for Secret {
    fn default() -> Self {
        Secret::Password(String::new())
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        match self {
            Secret::Password(password) => password.zeroize(),
            Secret::NtHash(hash) => hash.zeroize(),
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Password(_) => f.write_str("Password(<redacted>)"),
            Secret::NtHash(_) => f.write_str("NtHash(<redacted>)"),
        }
    }
}

/// Static credential material an engine is bound to
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub secret: Secret,
    pub domain: String,
    pub workstation: String,
}

impl Credentials {
    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() && !matches!(self.secret, Secret::NtHash(_)) {
            return Err(NtlmError::Credentials(
                "username is required unless an NT hash is supplied".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a completed exchange
pub struct SessionDetails {
    pub negotiated_flags: NtlmFlags,
    pub target_name: String,
    pub target_info: AvPairs,
    pub exported_session_key: [u8; 16],
}

impl Drop for SessionDetails {
    fn drop(&mut self) {
        self.exported_session_key.zeroize();
    }
}

impl fmt::Debug for SessionDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDetails")
            .field("negotiated_flags", &self.negotiated_flags)
            .field("target_name", &self.target_name)
            .field("target_info", &self.target_info)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum ClientState {
    Initial,
    NegotiateSent { negotiate: Vec<u8> },
    Completed,
    Failed,
}

/// Client-side NTLMv2 engine handle. Bound to one set of credentials for one
/// exchange.
pub struct NtlmClient {
    credentials: Credentials,
    target_spn: Option<String>,
    rng: Box<dyn RngCore + Send>,
    clock: fn() -> u64,
    state: ClientState,
    details: Option<SessionDetails>,
    security: Option<SecuritySession>,
}

impl NtlmClient {
    /// Create a client engine. Fails if the credentials cannot authenticate.
    pub fn new(credentials: Credentials) -> Result<Self> {
        credentials.validate()?;
        Ok(Self {
            credentials,
            target_spn: None,
            rng: Box::new(rand::rngs::OsRng),
            clock: get_windows_timestamp,
            state: ClientState::Initial,
            details: None,
            security: None,
        })
    }

    /// Service principal name sent as `MsvAvTargetName`
    pub fn with_target_spn(mut self, spn: impl Into<String>) -> Self {
        let spn = spn.into();
        self.target_spn = (!spn.is_empty()).then_some(spn);
        self
    }

    /// Randomness for the client challenge and exported session key
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    /// FILETIME source used when the server sends no `MsvAvTimestamp`
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// True until [`negotiate`](Self::negotiate) has been called
    pub fn is_fresh(&self) -> bool {
        matches!(self.state, ClientState::Initial)
    }

    /// Produce the NEGOTIATE message
    pub fn negotiate(&mut self) -> Result<Vec<u8>> {
        if !self.is_fresh() {
            return Err(NtlmError::OutOfOrder("NEGOTIATE already produced".into()));
        }
        let negotiate = NtlmNegotiateMessage::new(CLIENT_FLAGS).serialize()?;
        debug!(flags = ?CLIENT_FLAGS, len = negotiate.len(), "NTLM: built negotiate message");
        self.state = ClientState::NegotiateSent {
            negotiate: negotiate.clone(),
        };
        Ok(negotiate)
    }

    /// Consume the server CHALLENGE and produce the AUTHENTICATE message.
    /// Any failure leaves the engine unusable.
    pub fn authenticate(&mut self, challenge_data: &[u8]) -> Result<Vec<u8>> {
        let negotiate = match std::mem::replace(&mut self.state, ClientState::Failed) {
            ClientState::NegotiateSent { negotiate } => negotiate,
            other => {
                self.state = other;
                return Err(NtlmError::OutOfOrder(
                    "CHALLENGE received before NEGOTIATE was produced".into(),
                ));
            }
        };

        let challenge = NtlmChallengeMessage::parse(challenge_data)?;
        if challenge.target_info_data.is_empty() {
            return Err(NtlmError::Downgrade(
                "server sent no target info, refusing NTLMv1".into(),
            ));
        }

        let flags = challenge.flags & CLIENT_FLAGS;
        let server_timestamp = challenge.target_info.timestamp();
        let send_mic = server_timestamp.is_some();
        let timestamp = server_timestamp.unwrap_or_else(self.clock);
        let client_challenge = generate_client_challenge(self.rng.as_mut());

        let blob_info = self.blob_target_info(&challenge.target_info, send_mic)?;
        let blob = NtlmV2Blob::new(timestamp, client_challenge, blob_info.serialize()?);

        let mut nt_hash = self.credentials.secret.nt_hash();
        let ntowf = ntowf_v2(&nt_hash, &self.credentials.username, &self.credentials.domain);
        nt_hash.zeroize();
        let mut ntowf = ntowf?;

        let nt_response = ntlmv2_response(&ntowf, &challenge.challenge, &blob)?;
        let lm_response = if send_mic {
            vec![0u8; 24]
        } else {
            lmv2_response(&ntowf, &challenge.challenge, &client_challenge)?
        };
        let mut key_exchange_key = ntlmv2_session_key(&ntowf, &nt_response)?;
        ntowf.zeroize();

        let (exported_session_key, encrypted_session_key) =
            if flags.contains(NtlmFlags::NEGOTIATE_KEY_EXCHANGE) {
                let mut exported = [0u8; 16];
                self.rng.fill_bytes(&mut exported);
                let encrypted = rc4(&key_exchange_key, &exported);
                (exported, encrypted)
            } else {
                (key_exchange_key, Vec::new())
            };
        key_exchange_key.zeroize();

        let message = NtlmAuthenticateMessage {
            flags,
            lm_response,
            nt_response,
            domain_name: self.credentials.domain.clone(),
            user_name: self.credentials.username.clone(),
            workstation: self.credentials.workstation.clone(),
            encrypted_session_key,
            version: flags
                .contains(NtlmFlags::NEGOTIATE_VERSION)
                .then(NtlmVersion::client_default),
            mic: [0u8; MIC_LEN],
        };
        let mut authenticate = message.serialize()?;

        if send_mic {
            let mic = compute_mic(
                &exported_session_key,
                &negotiate,
                challenge_data,
                &authenticate,
            )?;
            authenticate[AUTHENTICATE_MIC_OFFSET..AUTHENTICATE_MIC_OFFSET + MIC_LEN]
                .copy_from_slice(&mic);
        }

        self.security = if flags.contains(
            NtlmFlags::NEGOTIATE_SIGN | NtlmFlags::NEGOTIATE_EXTENDED_SECURITY,
        ) {
            Some(SecuritySession::new(
                NtlmRole::Client,
                &exported_session_key,
                flags,
            )?)
        } else {
            None
        };

        debug!(
            negotiated = ?flags,
            mic = send_mic,
            secure_session = self.security.is_some(),
            len = authenticate.len(),
            "NTLM: built authenticate message"
        );

        self.details = Some(SessionDetails {
            negotiated_flags: flags,
            target_name: challenge.target_name,
            target_info: challenge.target_info,
            exported_session_key,
        });
        self.state = ClientState::Completed;

        Ok(authenticate)
    }

    /// Server pairs, MsvAvFlags updated for the MIC, then our SPN
    fn blob_target_info(&self, server: &AvPairs, send_mic: bool) -> Result<AvPairs> {
        let mut pairs = AvPairs::new();
        let mut flags_seen = false;

        for pair in server.iter() {
            match pair.kind() {
                Some(AvId::Flags) if send_mic => {
                    let bytes: [u8; 4] = pair.value.as_slice().try_into().map_err(|_| {
                        NtlmError::Parse("MsvAvFlags must be 4 bytes".into())
                    })?;
                    let value = u32::from_le_bytes(bytes) | AV_FLAG_MIC_PROVIDED;
                    pairs.push(AvPair::new(AvId::Flags, value.to_le_bytes().to_vec()));
                    flags_seen = true;
                }
                // The client supplies its own target name
                Some(AvId::TargetName) => {}
                _ => pairs.push(pair.clone()),
            }
        }

        if send_mic && !flags_seen {
            pairs.push(AvPair::new(
                AvId::Flags,
                AV_FLAG_MIC_PROVIDED.to_le_bytes().to_vec(),
            ));
        }
        if let Some(spn) = &self.target_spn {
            pairs.push(AvPair::from_text(AvId::TargetName, spn));
        }

        Ok(pairs)
    }

    pub fn session_details(&self) -> Option<&SessionDetails> {
        self.details.as_ref()
    }

    /// Signing state, present only when the exchange negotiated signing with
    /// extended session security
    pub fn security_session(&mut self) -> Option<&mut SecuritySession> {
        self.security.as_mut()
    }

    /// Next outbound signature sequence number, when signing was negotiated
    pub fn send_sequence(&self) -> Option<u32> {
        self.security.as_ref().map(SecuritySession::send_sequence)
    }

    pub fn has_security_session(&self) -> bool {
        self.security.is_some()
    }
}

impl fmt::Debug for NtlmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NtlmClient")
            .field("credentials", &self.credentials)
            .field("target_spn", &self.target_spn)
            .field("state", &self.state)
            .field("secure_session", &self.security.is_some())
            .finish_non_exhaustive()
    }
}
