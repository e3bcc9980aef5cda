//! Server identity attributes taken from the CHALLENGE target info

use super::av_pair::{AvId, AvPairs};

/// The identity attributes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetInfoField {
    NbComputerName,
    NbDomainName,
    DnsComputerName,
    DnsDomainName,
    DnsTreeName,
}

impl TargetInfoField {
    pub const ALL: [Self; 5] = [
        Self::NbComputerName,
        Self::NbDomainName,
        Self::DnsComputerName,
        Self::DnsDomainName,
        Self::DnsTreeName,
    ];

    pub fn av_id(self) -> AvId {
        match self {
            Self::NbComputerName => AvId::NbComputerName,
            Self::NbDomainName => AvId::NbDomainName,
            Self::DnsComputerName => AvId::DnsComputerName,
            Self::DnsDomainName => AvId::DnsDomainName,
            Self::DnsTreeName => AvId::DnsTreeName,
        }
    }
}

/// Read-only snapshot of the server's identity. Attributes the server did
/// not send are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetInfo {
    nb_computer_name: String,
    nb_domain_name: String,
    dns_computer_name: String,
    dns_domain_name: String,
    dns_tree_name: String,
}

impl TargetInfo {
    pub fn from_av_pairs(pairs: &AvPairs) -> Self {
        let mut info = Self::default();
        for field in TargetInfoField::ALL {
            if let Some(value) = pairs.get_string(field.av_id()) {
                *info.slot_mut(field) = value.trim_end_matches('\0').to_string();
            }
        }
        info
    }

    fn slot_mut(&mut self, field: TargetInfoField) -> &mut String {
        match field {
            TargetInfoField::NbComputerName => &mut self.nb_computer_name,
            TargetInfoField::NbDomainName => &mut self.nb_domain_name,
            TargetInfoField::DnsComputerName => &mut self.dns_computer_name,
            TargetInfoField::DnsDomainName => &mut self.dns_domain_name,
            TargetInfoField::DnsTreeName => &mut self.dns_tree_name,
        }
    }

    pub fn get(&self, field: TargetInfoField) -> &str {
        match field {
            TargetInfoField::NbComputerName => &self.nb_computer_name,
            TargetInfoField::NbDomainName => &self.nb_domain_name,
            TargetInfoField::DnsComputerName => &self.dns_computer_name,
            TargetInfoField::DnsDomainName => &self.dns_domain_name,
            TargetInfoField::DnsTreeName => &self.dns_tree_name,
        }
    }

    pub fn nb_computer_name(&self) -> &str {
        &self.nb_computer_name
    }

    pub fn nb_domain_name(&self) -> &str {
        &self.nb_domain_name
    }

    pub fn dns_computer_name(&self) -> &str {
        &self.dns_computer_name
    }

    pub fn dns_domain_name(&self) -> &str {
        &self.dns_domain_name
    }

    pub fn dns_tree_name(&self) -> &str {
        &self.dns_tree_name
    }
}
