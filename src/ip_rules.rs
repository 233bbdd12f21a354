use std::error::Error as StdError;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use serde::{Deserialize, Serialize};

use crate::license::Licenser;

/// An address range in CIDR notation. A bare address is a /32 or /128.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix.min(128)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrParseError(String);

impl fmt::Display for CidrParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid CIDR range: {}", self.0)
    }
}

impl StdError for CidrParseError {}

impl FromStr for Cidr {
    type Err = CidrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let network: IpAddr = addr.parse().map_err(|_| CidrParseError(s.to_string()))?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| CidrParseError(s.to_string()))?,
            None => max,
        };

        Ok(Self { network, prefix })
    }
}

/// Allow/deny ranges as they appear in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpRulesConfig {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

/// Parsed destination rules.
///
/// A deny match always rejects. When the allow list is non-empty an
/// address must match it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpRules {
    allow: Vec<Cidr>,
    deny: Vec<Cidr>,
}

impl IpRules {
    pub fn from_config(config: &IpRulesConfig) -> Result<Self, CidrParseError> {
        Ok(Self {
            allow: parse_all(&config.allow)?,
            deny: parse_all(&config.deny)?,
        })
    }

    pub fn permits(&self, addr: IpAddr) -> bool {
        if self.deny.iter().any(|c| c.contains(addr)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|c| c.contains(addr))
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

fn parse_all(ranges: &[String]) -> Result<Vec<Cidr>, CidrParseError> {
    ranges.iter().map(|r| r.parse()).collect()
}

/// DNS resolver that drops addresses the rules refuse.
///
/// Installed on the HTTP client so the address actually connected to is
/// the one that was checked. The licence is read on every lookup.
pub(crate) struct RuleResolver {
    pub(crate) rules: Arc<IpRules>,
    pub(crate) licenser: Arc<dyn Licenser>,
}

#[derive(Debug)]
pub(crate) struct BlockedHost(pub String);

impl fmt::Display for BlockedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "every address of {} is blocked by IP rules", self.0)
    }
}

impl StdError for BlockedHost {}

impl Resolve for RuleResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let rules = self.rules.clone();
        let enforce = self.licenser.ip_rules();
        let host = name.as_str().to_string();

        Box::pin(async move {
            let resolved = tokio::net::lookup_host((host.as_str(), 0)).await?;
            let addrs: Vec<SocketAddr> = resolved
                .filter(|addr| !enforce || rules.permits(addr.ip()))
                .collect();

            if addrs.is_empty() {
                let err: Box<dyn StdError + Send + Sync> = Box::new(BlockedHost(host));
                return Err(err);
            }

            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok(addrs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn cidr_matches_v4_ranges() {
        let c: Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(c.contains(ip("10.1.2.3")));
        assert!(!c.contains(ip("11.0.0.1")));

        let single: Cidr = "192.168.1.5".parse().unwrap();
        assert!(single.contains(ip("192.168.1.5")));
        assert!(!single.contains(ip("192.168.1.6")));

        let everything: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(everything.contains(ip("8.8.8.8")));
    }

    #[test]
    fn cidr_matches_v6_and_mapped_v4() {
        let c: Cidr = "fd00::/8".parse().unwrap();
        assert!(c.contains(ip("fd12::1")));
        assert!(!c.contains(ip("2001:db8::1")));

        let v4: Cidr = "127.0.0.0/8".parse().unwrap();
        assert!(v4.contains(ip("::ffff:127.0.0.1")));
    }

    #[test]
    fn rejects_malformed_ranges() {
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("not-an-ip".parse::<Cidr>().is_err());
        assert!("::/129".parse::<Cidr>().is_err());
    }

    #[test]
    fn deny_wins_over_allow() {
        let rules = IpRules::from_config(&IpRulesConfig {
            allow: vec!["10.0.0.0/8".into()],
            deny: vec!["10.0.0.1".into()],
        })
        .unwrap();

        assert!(rules.permits(ip("10.0.0.2")));
        assert!(!rules.permits(ip("10.0.0.1")));
        assert!(!rules.permits(ip("172.16.0.1")));
    }

    #[test]
    fn empty_rules_permit_everything() {
        let rules = IpRules::default();
        assert!(rules.is_empty());
        assert!(rules.permits(ip("127.0.0.1")));
    }
}
