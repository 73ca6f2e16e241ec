//! Tunnel Network Allocation
//!
//! A tunnel network is the CIDR block both ends of a tunnel derive their
//! interface addresses from. The local tunnel address keeps the network's
//! prefix segments and the host segments of the local physical address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::Family;

/// A tunnel network in CIDR form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TunnelNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl TunnelNetwork {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self> {
        let family = Family::of(&addr);
        if prefix_len > family.address_bits() {
            return Err(Error::Config(format!(
                "prefix length {} is too long for a {} network",
                prefix_len, family
            )));
        }
        Ok(Self { addr, prefix_len })
    }

    /// 10.0.0.0/8 for V4, fc00::/64 for V6
    pub fn default_for(family: Family) -> Self {
        match family {
            Family::V4 => Self {
                addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)),
                prefix_len: 8,
            },
            Family::V6 => Self {
                addr: IpAddr::V6(Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0)),
                prefix_len: 64,
            },
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn family(&self) -> Family {
        Family::of(&self.addr)
    }

    /// Prefix length actually used for address derivation.
    ///
    /// Prefixes outside the family's accepted bounds fall back to one segment.
    pub fn effective_prefix_len(&self) -> u8 {
        let family = self.family();
        let (min, max) = family.prefix_bounds();
        if self.prefix_len < min || self.prefix_len > max {
            family.segment_bits()
        } else {
            self.prefix_len
        }
    }

    /// Number of leading segments taken from the network
    fn prefix_segments(&self) -> usize {
        (self.effective_prefix_len() / self.family().segment_bits()) as usize
    }

    /// Derive the tunnel host address for a physical address.
    ///
    /// The leading prefix segments come from the network, the remaining
    /// segments from `phys`.
    pub fn host_address(&self, phys: IpAddr) -> Result<IpAddr> {
        if Family::of(&phys) != self.family() {
            return Err(Error::Protocol(format!(
                "cannot derive a {} tunnel address from {}",
                self.family(),
                phys
            )));
        }

        let n = self.prefix_segments();
        let mut host = segments(phys);
        host[..n].copy_from_slice(&segments(self.addr)[..n]);
        Ok(from_segments(self.family(), &host))
    }

    /// Host prefix length for a tunnel address of this family (/32 or /128)
    pub fn host_prefix_len(&self) -> u8 {
        self.family().address_bits()
    }

    /// Whether `addr` lies inside this network
    pub fn contains(&self, addr: IpAddr) -> bool {
        if Family::of(&addr) != self.family() {
            return false;
        }
        let n = self.prefix_segments();
        segments(addr)[..n] == segments(self.addr)[..n]
    }

    /// Next candidate network after a collision.
    ///
    /// Increments the first prefix segment that is not saturated and extends
    /// the prefix by one segment, capped at the family maximum. The sequence
    /// is strictly increasing; `None` once every prefix segment is saturated.
    pub fn next_candidate(&self) -> Option<TunnelNetwork> {
        let family = self.family();
        let seg_max: u32 = (1u32 << family.segment_bits()) - 1;
        let (_, max_prefix) = family.prefix_bounds();

        let n = self.prefix_segments();
        let mut segs = segments(self.addr);
        let index = segs[..n].iter().position(|s| *s < seg_max)?;
        segs[index] += 1;

        let prefix_len = (self.effective_prefix_len() + family.segment_bits()).min(max_prefix);
        Some(TunnelNetwork {
            addr: from_segments(family, &segs),
            prefix_len,
        })
    }

    /// Walk the candidate sequence until `is_taken` accepts one
    pub fn next_free<F>(&self, mut is_taken: F) -> Result<TunnelNetwork>
    where
        F: FnMut(&TunnelNetwork) -> bool,
    {
        let mut candidate = *self;
        loop {
            candidate = candidate
                .next_candidate()
                .ok_or_else(|| Error::Exhausted(self.to_string()))?;
            if !is_taken(&candidate) {
                return Ok(candidate);
            }
            tracing::debug!("Tunnel network candidate {} is taken, skipping", candidate);
        }
    }
}

fn segments(addr: IpAddr) -> Vec<u32> {
    match addr {
        IpAddr::V4(v4) => v4.octets().iter().map(|o| *o as u32).collect(),
        IpAddr::V6(v6) => v6.segments().iter().map(|s| *s as u32).collect(),
    }
}

fn from_segments(family: Family, segs: &[u32]) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::new(
            segs[0] as u8,
            segs[1] as u8,
            segs[2] as u8,
            segs[3] as u8,
        )),
        Family::V6 => {
            let mut words = [0u16; 8];
            for (w, s) in words.iter_mut().zip(segs) {
                *w = *s as u16;
            }
            IpAddr::V6(Ipv6Addr::from(words))
        }
    }
}

impl FromStr for TunnelNetwork {
    type Err = Error;

    /// Parse `addr/prefix`; a bare address gets a one-segment prefix
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| Error::Config(format!("invalid tunnel network address: {}", s)))?;
        let prefix_len = match prefix {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| Error::Config(format!("invalid tunnel network prefix: {}", s)))?,
            None => Family::of(&addr).segment_bits(),
        };
        TunnelNetwork::new(addr, prefix_len)
    }
}

impl std::fmt::Display for TunnelNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl TryFrom<String> for TunnelNetwork {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TunnelNetwork> for String {
    fn from(net: TunnelNetwork) -> Self {
        net.to_string()
    }
}
