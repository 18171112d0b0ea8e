//! Address patterns shared by bans and address filters.
//!
//! A pattern is an exact IP, a CIDR block or an inclusive range. IPv4-mapped
//! IPv6 peers (`::ffff:a.b.c.d`) are canonicalized before matching so a dual
//! stack listener does not bypass IPv4 rules.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::ProtocolError;

/// A literal address or address set to match peers against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddressPattern {
    Exact(IpAddr),
    Cidr { network: IpAddr, prefix: u8 },
    Range { start: IpAddr, end: IpAddr },
}

impl AddressPattern {
    /// Build a CIDR pattern, validating the prefix length for the family.
    pub fn cidr(network: IpAddr, prefix: u8) -> Result<Self, ProtocolError> {
        let max = if network.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(ProtocolError::InvalidAddress(format!(
                "{network}/{prefix}: prefix exceeds {max}"
            )));
        }
        Ok(AddressPattern::Cidr {
            network: network.to_canonical(),
            prefix,
        })
    }

    /// Build an inclusive range; both ends must share an address family.
    pub fn range(start: IpAddr, end: IpAddr) -> Result<Self, ProtocolError> {
        let (start, end) = (start.to_canonical(), end.to_canonical());
        if start.is_ipv4() != end.is_ipv4() || start > end {
            return Err(ProtocolError::InvalidAddress(format!("{start}-{end}")));
        }
        Ok(AddressPattern::Range { start, end })
    }

    pub fn matches(&self, addr: IpAddr) -> bool {
        let addr = addr.to_canonical();
        match self {
            AddressPattern::Exact(ip) => ip.to_canonical() == addr,
            AddressPattern::Cidr { network, prefix } => match (network, addr) {
                (IpAddr::V4(net), IpAddr::V4(ip)) => {
                    let mask = u32::MAX.checked_shl(32 - u32::from(*prefix)).unwrap_or(0);
                    u32::from(*net) & mask == u32::from(ip) & mask
                }
                (IpAddr::V6(net), IpAddr::V6(ip)) => {
                    let mask = u128::MAX.checked_shl(128 - u32::from(*prefix)).unwrap_or(0);
                    u128::from(*net) & mask == u128::from(ip) & mask
                }
                _ => false,
            },
            AddressPattern::Range { start, end } => {
                start.is_ipv4() == addr.is_ipv4() && *start <= addr && addr <= *end
            }
        }
    }
}

impl From<IpAddr> for AddressPattern {
    fn from(ip: IpAddr) -> Self {
        AddressPattern::Exact(ip.to_canonical())
    }
}

impl FromStr for AddressPattern {
    type Err = ProtocolError;

    /// Accepts `1.2.3.4`, `10.0.0.0/8` and `10.0.0.1-10.0.0.9`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidAddress(s.to_string());
        let s = s.trim();

        if let Some((net, prefix)) = s.split_once('/') {
            let network = net.parse::<IpAddr>().map_err(|_| invalid())?;
            let prefix = prefix.parse::<u8>().map_err(|_| invalid())?;
            return AddressPattern::cidr(network, prefix);
        }

        if let Some((start, end)) = s.split_once('-') {
            let start = start.trim().parse::<IpAddr>().map_err(|_| invalid())?;
            let end = end.trim().parse::<IpAddr>().map_err(|_| invalid())?;
            return AddressPattern::range(start, end);
        }

        s.parse::<IpAddr>()
            .map(AddressPattern::from)
            .map_err(|_| invalid())
    }
}

impl fmt::Display for AddressPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressPattern::Exact(ip) => write!(f, "{ip}"),
            AddressPattern::Cidr { network, prefix } => write!(f, "{network}/{prefix}"),
            AddressPattern::Range { start, end } => write!(f, "{start}-{end}"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_exact_match() {
        let p: AddressPattern = "192.168.1.10".parse().unwrap();
        assert!(p.matches(ip("192.168.1.10")));
        assert!(!p.matches(ip("192.168.1.11")));
    }

    #[test]
    fn test_cidr_match() {
        let p: AddressPattern = "10.0.0.0/8".parse().unwrap();
        assert!(p.matches(ip("10.200.3.4")));
        assert!(!p.matches(ip("11.0.0.1")));

        let all: AddressPattern = "0.0.0.0/0".parse().unwrap();
        assert!(all.matches(ip("203.0.113.7")));
        assert!(!all.matches(ip("::1")));
    }

    #[test]
    fn test_ipv6_cidr() {
        let p: AddressPattern = "2001:db8::/32".parse().unwrap();
        assert!(p.matches(ip("2001:db8:1::5")));
        assert!(!p.matches(ip("2001:db9::1")));
    }

    #[test]
    fn test_range_match() {
        let p: AddressPattern = "10.0.0.5-10.0.0.9".parse().unwrap();
        assert!(p.matches(ip("10.0.0.5")));
        assert!(p.matches(ip("10.0.0.9")));
        assert!(!p.matches(ip("10.0.0.10")));
    }

    #[test]
    fn test_ipv4_mapped_peer_matches_ipv4_rule() {
        let p = AddressPattern::from(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let mapped = IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped());
        assert!(p.matches(mapped));
        assert!(!p.matches(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!("not-an-ip".parse::<AddressPattern>().is_err());
        assert!("10.0.0.0/33".parse::<AddressPattern>().is_err());
        assert!("10.0.0.9-10.0.0.1".parse::<AddressPattern>().is_err());
        assert!("10.0.0.1-::1".parse::<AddressPattern>().is_err());
    }
}
