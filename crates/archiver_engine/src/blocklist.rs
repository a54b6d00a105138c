use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A CIDR range such as `10.0.0.0/8` or `fe80::/10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpRange {
    network: IpAddr,
    prefix: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid ip range `{0}`")]
pub struct InvalidRange(pub String);

impl IpRange {
    pub fn new(network: IpAddr, prefix: u8) -> Result<Self, InvalidRange> {
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(InvalidRange(format!("{network}/{prefix}")));
        }
        Ok(Self { network, prefix })
    }

    const fn v4(a: u8, b: u8, c: u8, d: u8, prefix: u8) -> Self {
        Self {
            network: IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            prefix,
        }
    }

    const fn v6(first_segment: u16, last_segment: u16, prefix: u8) -> Self {
        Self {
            network: IpAddr::V6(Ipv6Addr::new(first_segment, 0, 0, 0, 0, 0, 0, last_segment)),
            prefix,
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix);
                net.to_bits() & mask == ip.to_bits() & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix);
                net.to_bits() & mask == ip.to_bits() & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for IpRange {
    type Err = InvalidRange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidRange(s.to_string());
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let network: IpAddr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        IpRange::new(network, prefix).map_err(|_| invalid())
    }
}

impl TryFrom<String> for IpRange {
    type Error = InvalidRange;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IpRange> for String {
    fn from(range: IpRange) -> Self {
        range.to_string()
    }
}

/// Loopback, private and link-local ranges that archival must never reach,
/// plus unspecified, shared (CGNAT) and multicast space. `0.0.0.0` and `::`
/// reach the local host on most stacks.
pub const DEFAULT_BLOCKED_RANGES: [IpRange; 13] = [
    IpRange::v4(10, 0, 0, 0, 8),
    IpRange::v4(127, 0, 0, 0, 8),
    IpRange::v4(172, 16, 0, 0, 12),
    IpRange::v4(192, 168, 0, 0, 16),
    IpRange::v4(169, 254, 0, 0, 16),
    IpRange::v6(0, 1, 128),
    IpRange::v6(0xfc00, 0, 7),
    IpRange::v6(0xfe80, 0, 10),
    IpRange::v4(0, 0, 0, 0, 8),
    IpRange::v6(0, 0, 128),
    IpRange::v4(100, 64, 0, 0, 10),
    IpRange::v4(224, 0, 0, 0, 4),
    IpRange::v6(0xff00, 0, 8),
];

/// Immutable set of blocked ranges shared by the validator and the fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockList {
    ranges: Vec<IpRange>,
}

impl BlockList {
    pub fn new(ranges: Vec<IpRange>) -> Self {
        Self { ranges }
    }

    /// Blocks nothing. Meant for tests against local fixtures.
    pub fn permissive() -> Self {
        Self::new(Vec::new())
    }

    pub fn ranges(&self) -> &[IpRange] {
        &self.ranges
    }

    /// IPv4-mapped IPv6 addresses are checked against the IPv4 ranges too.
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        let mapped = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4),
            IpAddr::V4(_) => None,
        };
        self.ranges
            .iter()
            .any(|range| range.contains(ip) || mapped.is_some_and(|v4| range.contains(v4)))
    }

    pub fn first_blocked<'a>(&self, ips: impl IntoIterator<Item = &'a IpAddr>) -> Option<IpAddr> {
        ips.into_iter().copied().find(|ip| self.is_blocked(*ip))
    }
}

impl Default for BlockList {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKED_RANGES.to_vec())
    }
}
