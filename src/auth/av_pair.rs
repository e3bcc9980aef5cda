//! NTLM AV_PAIR lists
//!
//! The CHALLENGE message carries its target info as a sequence of
//! `(AvId: u16, AvLen: u16, Value)` entries terminated by `MsvAvEOL`. The same
//! structure, extended by the client, is embedded in the NTLMv2 blob.

use super::ntlm::NtlmError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// MsvAvFlags bit: the AUTHENTICATE message carries a MIC
pub const AV_FLAG_MIC_PROVIDED: u32 = 0x00000002;

/// Known attribute identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum AvId {
    Eol = 0x0000,
    NbComputerName = 0x0001,
    NbDomainName = 0x0002,
    DnsComputerName = 0x0003,
    DnsDomainName = 0x0004,
    DnsTreeName = 0x0005,
    Flags = 0x0006,
    Timestamp = 0x0007,
    SingleHost = 0x0008,
    TargetName = 0x0009,
    ChannelBindings = 0x000A,
}

impl AvId {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Eol),
            0x0001 => Some(Self::NbComputerName),
            0x0002 => Some(Self::NbDomainName),
            0x0003 => Some(Self::DnsComputerName),
            0x0004 => Some(Self::DnsDomainName),
            0x0005 => Some(Self::DnsTreeName),
            0x0006 => Some(Self::Flags),
            0x0007 => Some(Self::Timestamp),
            0x0008 => Some(Self::SingleHost),
            0x0009 => Some(Self::TargetName),
            0x000A => Some(Self::ChannelBindings),
            _ => None,
        }
    }
}

/// A single attribute. Unknown ids are preserved so the list can be echoed
/// back verbatim in the NTLMv2 blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvPair {
    pub id: u16,
    pub value: Vec<u8>,
}

impl AvPair {
    pub fn new(id: AvId, value: Vec<u8>) -> Self {
        Self {
            id: id as u16,
            value,
        }
    }

    pub fn from_text(id: AvId, text: &str) -> Self {
        Self::new(id, encode_utf16le(text))
    }

    pub fn kind(&self) -> Option<AvId> {
        AvId::from_u16(self.id)
    }
}

/// Ordered AV_PAIR list, without the terminating `MsvAvEOL`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvPairs {
    pairs: Vec<AvPair>,
}

impl AvPairs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a target-info buffer. Parsing stops at `MsvAvEOL` or at the
    /// end of the buffer; an entry that overruns the buffer is an error.
    pub fn parse(data: &[u8]) -> Result<Self, NtlmError> {
        let mut cursor = io::Cursor::new(data);
        let mut pairs = Vec::new();

        while (cursor.position() as usize) < data.len() {
            let id = cursor.read_u16::<LittleEndian>()?;
            let len = cursor.read_u16::<LittleEndian>()? as usize;

            if id == AvId::Eol as u16 {
                if len != 0 {
                    return Err(NtlmError::Parse("MsvAvEOL with non-zero length".into()));
                }
                break;
            }

            let start = cursor.position() as usize;
            let end = match start.checked_add(len) {
                Some(end) if end <= data.len() => end,
                _ => {
                    return Err(NtlmError::Parse(format!(
                        "AV pair 0x{:04x} extends beyond target info",
                        id
                    )))
                }
            };
            pairs.push(AvPair {
                id,
                value: data[start..end].to_vec(),
            });
            cursor.set_position(end as u64);
        }

        Ok(Self { pairs })
    }

    /// Encode the list followed by `MsvAvEOL`
    pub fn serialize(&self) -> Result<Vec<u8>, NtlmError> {
        let mut buf = Vec::new();
        for pair in &self.pairs {
            let len = u16::try_from(pair.value.len())
                .map_err(|_| NtlmError::Parse("AV pair value too long".into()))?;
            buf.write_u16::<LittleEndian>(pair.id)?;
            buf.write_u16::<LittleEndian>(len)?;
            buf.extend_from_slice(&pair.value);
        }
        buf.write_u16::<LittleEndian>(AvId::Eol as u16)?;
        buf.write_u16::<LittleEndian>(0)?;
        Ok(buf)
    }

    pub fn push(&mut self, pair: AvPair) {
        self.pairs.push(pair);
    }

    pub fn get(&self, id: AvId) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|pair| pair.id == id as u16)
            .map(|pair| pair.value.as_slice())
    }

    /// Decode a UTF-16LE valued attribute
    pub fn get_string(&self, id: AvId) -> Option<String> {
        self.get(id).map(decode_utf16le)
    }

    /// FILETIME carried in `MsvAvTimestamp`
    pub fn timestamp(&self) -> Option<u64> {
        let value = self.get(AvId::Timestamp)?;
        let bytes: [u8; 8] = value.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AvPair> {
        self.pairs.iter()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl FromIterator<AvPair> for AvPairs {
    fn from_iter<I: IntoIterator<Item = AvPair>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}

pub(crate) fn encode_utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

/// UTF-16LE to `String`. A dangling odd byte is dropped and unpaired
/// surrogates are replaced.
pub(crate) fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}
