//! Family-tagged network prefixes and the scalar types carried by BGP
//! messages: wide AS numbers and communities.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnet::IpNet;

use crate::error::AddrError;

/// Wildcard atom in AS-path patterns: matches any AS number.
pub const AS_ANY: i64 = -1;

/// The 16-bit-transition placeholder AS (RFC 6793); ignored by loop
/// detection.
pub const AS_TRANS: u32 = 23456;

/// A wide AS number: any 32-bit AS value, or the [`AS_ANY`] sentinel.
pub type WideAs = i64;

/// An opaque 32-bit community value; equality only.
pub type Community = u32;

/// Address family of a [`NetAddr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Afi {
    Ipv4,
    Ipv6,
}

impl Afi {
    /// Width of a host address in this family, in bits.
    pub fn max_bitlen(self) -> u8 {
        match self {
            Afi::Ipv4 => 32,
            Afi::Ipv6 => 128,
        }
    }

    /// Width of a host address in this family, in bytes.
    pub fn octet_len(self) -> usize {
        match self {
            Afi::Ipv4 => 4,
            Afi::Ipv6 => 16,
        }
    }
}

/// A network prefix: address family, prefix length in bits, and the
/// address octets.
///
/// The representation is normalized: bits past `bitlen` are always zero,
/// as are octets past the family width. Prefix length 32 (v4) or 128 (v6)
/// denotes a host address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetAddr {
    afi: Afi,
    bitlen: u8,
    octets: [u8; 16],
}

impl NetAddr {
    /// Build a prefix from an address and a prefix length, zeroing any
    /// host bits past the prefix.
    pub fn new(ip: IpAddr, bitlen: u8) -> Result<Self, AddrError> {
        let (afi, octets) = match ip {
            IpAddr::V4(v4) => {
                let mut o = [0u8; 16];
                o[..4].copy_from_slice(&v4.octets());
                (Afi::Ipv4, o)
            }
            IpAddr::V6(v6) => (Afi::Ipv6, v6.octets()),
        };
        if bitlen > afi.max_bitlen() {
            return Err(AddrError::InvalidBitlen {
                bitlen,
                what: match afi {
                    Afi::Ipv4 => "IPv4",
                    Afi::Ipv6 => "IPv6",
                },
            });
        }
        let mut addr = NetAddr { afi, bitlen, octets };
        addr.mask_tail();
        Ok(addr)
    }

    /// Build a host address (full prefix length).
    pub fn host(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => {
                let mut octets = [0u8; 16];
                octets[..4].copy_from_slice(&v4.octets());
                NetAddr {
                    afi: Afi::Ipv4,
                    bitlen: 32,
                    octets,
                }
            }
            IpAddr::V6(v6) => NetAddr {
                afi: Afi::Ipv6,
                bitlen: 128,
                octets: v6.octets(),
            },
        }
    }

    /// Rebuild a prefix from wire form: family, prefix length, and the
    /// `(bitlen + 7) / 8` packed octets.
    pub fn from_packed(afi: Afi, bitlen: u8, packed: &[u8]) -> Result<Self, AddrError> {
        if bitlen > afi.max_bitlen() {
            return Err(AddrError::InvalidBitlen {
                bitlen,
                what: match afi {
                    Afi::Ipv4 => "IPv4",
                    Afi::Ipv6 => "IPv6",
                },
            });
        }
        let nbytes = usize::from(bitlen).div_ceil(8);
        let mut octets = [0u8; 16];
        octets[..nbytes.min(packed.len())].copy_from_slice(&packed[..nbytes.min(packed.len())]);
        let mut addr = NetAddr { afi, bitlen, octets };
        addr.mask_tail();
        Ok(addr)
    }

    fn mask_tail(&mut self) {
        let bitlen = usize::from(self.bitlen);
        let full = bitlen / 8;
        let rem = bitlen % 8;
        if rem != 0 {
            self.octets[full] &= 0xffu8 << (8 - rem);
        }
        let start = full + usize::from(rem != 0);
        for b in &mut self.octets[start..] {
            *b = 0;
        }
    }

    pub fn afi(&self) -> Afi {
        self.afi
    }

    pub fn bitlen(&self) -> u8 {
        self.bitlen
    }

    pub fn is_host(&self) -> bool {
        self.bitlen == self.afi.max_bitlen()
    }

    /// The address octets, at the family's width.
    pub fn octets(&self) -> &[u8] {
        &self.octets[..self.afi.octet_len()]
    }

    /// Bit `i` of the address, most-significant first. `i` must be below
    /// the family width.
    pub fn bit(&self, i: u8) -> bool {
        let byte = usize::from(i) / 8;
        let shift = 7 - (i % 8);
        (self.octets[byte] >> shift) & 1 != 0
    }

    pub fn ip(&self) -> IpAddr {
        match self.afi {
            Afi::Ipv4 => {
                let mut o = [0u8; 4];
                o.copy_from_slice(&self.octets[..4]);
                IpAddr::V4(Ipv4Addr::from(o))
            }
            Afi::Ipv6 => IpAddr::V6(Ipv6Addr::from(self.octets)),
        }
    }

    /// Prefix equality: same family, same prefix length, and the prefix
    /// bits agree.
    pub fn prefix_eq(&self, other: &NetAddr) -> bool {
        self.afi == other.afi
            && self.bitlen == other.bitlen
            && self.octets() == other.octets()
    }

    /// Full (naddr) equality: family, prefix length, and every address
    /// bit agree.
    pub fn naddr_eq(&self, other: &NetAddr) -> bool {
        self == other
    }

    /// True iff `self` covers `other`: same family, `self` is no longer
    /// than `other`, and they agree on the first `bitlen(self)` bits.
    pub fn covers(&self, other: &NetAddr) -> bool {
        if self.afi != other.afi || self.bitlen > other.bitlen {
            return false;
        }
        let bitlen = usize::from(self.bitlen);
        let full = bitlen / 8;
        if self.octets[..full] != other.octets[..full] {
            return false;
        }
        let rem = bitlen % 8;
        if rem == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - rem);
        (self.octets[full] & mask) == (other.octets[full] & mask)
    }

    /// Wire form used by NLRI fields: length byte followed by the packed
    /// prefix octets.
    pub fn to_wire(&self) -> Vec<u8> {
        let nbytes = usize::from(self.bitlen).div_ceil(8);
        let mut out = Vec::with_capacity(1 + nbytes);
        out.push(self.bitlen);
        out.extend_from_slice(&self.octets[..nbytes]);
        out
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip(), self.bitlen)
    }
}

impl fmt::Debug for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetAddr({self})")
    }
}

impl FromStr for NetAddr {
    type Err = AddrError;

    /// Accepts CIDR notation (`10.0.0.0/8`, `2001:db8::/32`) or a bare
    /// address, which parses as a host prefix.
    fn from_str(s: &str) -> Result<Self, AddrError> {
        if let Ok(net) = s.parse::<IpNet>() {
            return NetAddr::new(net.addr(), net.prefix_len());
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(NetAddr::host(ip));
        }
        Err(AddrError::Parse(s.to_string()))
    }
}
