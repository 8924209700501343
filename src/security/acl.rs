//! Client access lists.
//!
//! Entries are single addresses or CIDR blocks. Matching is a masked
//! comparison, IPv4 and IPv6 never match each other.

use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid ACL entry: {0}")]
pub struct AclParseError(String);

/// One address or network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRule {
    network: IpAddr,
    prefix: u8,
}

impl IpRule {
    pub fn matches(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = match self.prefix {
                    0 => 0,
                    p => u32::MAX << (32 - u32::from(p)),
                };
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = match self.prefix {
                    0 => 0,
                    p => u128::MAX << (128 - u32::from(p)),
                };
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpRule {
    type Err = AclParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let network: IpAddr = addr.trim().parse().map_err(|_| AclParseError(s.to_string()))?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| AclParseError(s.to_string()))?,
            None => max,
        };
        Ok(Self { network, prefix })
    }
}

/// An ordered list of rules.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    rules: Vec<IpRule>,
}

impl Acl {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, AclParseError> {
        let rules = entries
            .iter()
            .map(|e| e.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.rules.iter().any(|r| r.matches(addr))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
