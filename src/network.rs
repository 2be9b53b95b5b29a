//! IP address and prefix helpers.
//!
//! Wire messages carry addresses in binary form (4 or 16 bytes); the rest of
//! the daemon works with `std::net` and `ipnet` types. Conversions here are
//! total in one direction and validated in the other.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A v4 or v6 CIDR prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IpPrefix {
    V4(Ipv4Net),
    V6(Ipv6Net),
}

impl IpPrefix {
    pub fn is_v4(&self) -> bool {
        matches!(self, IpPrefix::V4(_))
    }

    pub fn prefix_len(&self) -> u8 {
        match self {
            IpPrefix::V4(n) => n.prefix_len(),
            IpPrefix::V6(n) => n.prefix_len(),
        }
    }

    /// The address the prefix was written with (host bits intact, so an
    /// interface address like `fe80::12/64` yields `fe80::12`).
    pub fn addr(&self) -> IpAddr {
        match self {
            IpPrefix::V4(n) => IpAddr::V4(n.addr()),
            IpPrefix::V6(n) => IpAddr::V6(n.addr()),
        }
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self, addr) {
            (IpPrefix::V4(n), IpAddr::V4(a)) => n.contains(a),
            (IpPrefix::V6(n), IpAddr::V6(a)) => n.contains(a),
            _ => false,
        }
    }

    /// Canonical form with host bits cleared: `10.1.2.3/24` -> `10.1.2.0/24`.
    ///
    /// Idempotent; applied to every prefix before it enters a database.
    pub fn trimmed(&self) -> IpPrefix {
        match self {
            IpPrefix::V4(n) => IpPrefix::V4(n.trunc()),
            IpPrefix::V6(n) => IpPrefix::V6(n.trunc()),
        }
    }

    /// Host prefix (/32 or /128) for a bare address.
    pub fn host(addr: IpAddr) -> IpPrefix {
        match addr {
            IpAddr::V4(a) => IpPrefix::V4(Ipv4Net::new(a, 32).unwrap()),
            IpAddr::V6(a) => IpPrefix::V6(Ipv6Net::new(a, 128).unwrap()),
        }
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpPrefix::V4(n) => write!(f, "{}", n),
            IpPrefix::V6(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for IpPrefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(n) = s.parse::<Ipv4Net>() {
            return Ok(IpPrefix::V4(n));
        }
        if let Ok(n) = s.parse::<Ipv6Net>() {
            return Ok(IpPrefix::V6(n));
        }
        Err(Error::InvalidAddressFormat(s.to_string()))
    }
}

impl From<Ipv4Net> for IpPrefix {
    fn from(n: Ipv4Net) -> Self {
        IpPrefix::V4(n)
    }
}

impl From<Ipv6Net> for IpPrefix {
    fn from(n: Ipv6Net) -> Self {
        IpPrefix::V6(n)
    }
}

/// Serialize an address to its binary wire form.
pub fn to_binary(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}

/// Parse an address from its binary wire form. Length determines family.
pub fn from_binary(bytes: &[u8]) -> Result<IpAddr, Error> {
    match bytes.len() {
        4 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(bytes);
            Ok(IpAddr::V4(Ipv4Addr::from(b)))
        }
        16 => {
            let mut b = [0u8; 16];
            b.copy_from_slice(bytes);
            Ok(IpAddr::V6(Ipv6Addr::from(b)))
        }
        n => Err(Error::InvalidAddressFormat(format!(
            "binary address must be 4 or 16 bytes, got {}",
            n
        ))),
    }
}

/// True for fe80::/10 addresses. Spark only speaks on link-local v6.
pub fn is_link_local_v6(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V6(a) => (a.segments()[0] & 0xffc0) == 0xfe80,
        IpAddr::V4(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_parse_display_roundtrip() {
        for s in ["10.0.0.0/24", "192.168.1.0/31", "fc00:cafe:babe::/64", "::/0"] {
            let p: IpPrefix = s.parse().unwrap();
            assert_eq!(p.to_string(), s);
            let again: IpPrefix = p.to_string().parse().unwrap();
            assert_eq!(p, again);
        }
    }

    #[test]
    fn test_prefix_parse_invalid() {
        assert!("fc00:cafe:babe:/64".parse::<IpPrefix>().is_err());
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("not-a-prefix".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_binary_roundtrip() {
        for s in ["192.168.0.1", "fe80::1", "::", "255.255.255.255"] {
            let addr: IpAddr = s.parse().unwrap();
            let bin = to_binary(&addr);
            assert_eq!(from_binary(&bin).unwrap(), addr);
        }
        assert!(from_binary(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_trimmed_is_idempotent() {
        let p: IpPrefix = "10.1.2.3/24".parse().unwrap();
        let t = p.trimmed();
        assert_eq!(t.to_string(), "10.1.2.0/24");
        assert_eq!(t.trimmed(), t);
    }

    #[test]
    fn test_link_local_v6() {
        assert!(is_link_local_v6(&"fe80::1".parse().unwrap()));
        assert!(!is_link_local_v6(&"fc00::1".parse().unwrap()));
        assert!(!is_link_local_v6(&"169.254.0.1".parse().unwrap()));
    }
}
