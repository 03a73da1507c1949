//! Flow match keys.
//!
//! A [`FlowMatch`] is the identity of a network flow as seen by the
//! datapath: an ordered list of [`FlowKey`] fields. It is also the
//! addressing key for per-flow NAT state, so its textual form
//! ([`fmt::Display`]) must be deterministic. Independent agents that build
//! the same ordered key list compute the same cache key.

use crate::{MacAddress, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// IANA protocol numbers used by the L4 helpers.
const IPPROTO_ICMP: u8 = 1;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Discriminant of a [`FlowKey`], ordered the way the datapath numbers its
/// key attributes. [`FlowMatch::canonical`] sorts by this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlowKeyKind {
    InPort,
    Tunnel,
    Ethernet,
    Vlan,
    EtherType,
    Ipv4,
    Ipv6,
    Tcp,
    Udp,
    Icmp,
}

/// A single typed match field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKey {
    InPort(u32),
    Tunnel { id: u64 },
    Ethernet { src: MacAddress, dst: MacAddress },
    Vlan(u16),
    EtherType(u16),
    Ipv4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        tos: u8,
        ttl: u8,
    },
    Ipv6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        protocol: u8,
        hop_limit: u8,
    },
    Tcp { src: u16, dst: u16 },
    Udp { src: u16, dst: u16 },
    Icmp { icmp_type: u8, code: u8 },
}

impl FlowKey {
    /// IPv4 key with default TOS and TTL, which is what most producers match on.
    pub fn ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8) -> Self {
        FlowKey::Ipv4 {
            src,
            dst,
            protocol,
            tos: 0,
            ttl: 0,
        }
    }

    /// Creates a VLAN key, rejecting IDs outside 0..=4095.
    pub fn vlan(id: u16) -> Result<Self, ParseError> {
        if id > 0x0fff {
            return Err(ParseError::InvalidFlowKey(format!("vlan id {id} exceeds 12 bits")));
        }
        Ok(FlowKey::Vlan(id))
    }

    pub fn kind(&self) -> FlowKeyKind {
        match self {
            FlowKey::InPort(_) => FlowKeyKind::InPort,
            FlowKey::Tunnel { .. } => FlowKeyKind::Tunnel,
            FlowKey::Ethernet { .. } => FlowKeyKind::Ethernet,
            FlowKey::Vlan(_) => FlowKeyKind::Vlan,
            FlowKey::EtherType(_) => FlowKeyKind::EtherType,
            FlowKey::Ipv4 { .. } => FlowKeyKind::Ipv4,
            FlowKey::Ipv6 { .. } => FlowKeyKind::Ipv6,
            FlowKey::Tcp { .. } => FlowKeyKind::Tcp,
            FlowKey::Udp { .. } => FlowKeyKind::Udp,
            FlowKey::Icmp { .. } => FlowKeyKind::Icmp,
        }
    }

    /// L4 protocol number implied by this key, if it carries one.
    pub fn ip_protocol(&self) -> Option<u8> {
        match self {
            FlowKey::Ipv4 { protocol, .. } | FlowKey::Ipv6 { protocol, .. } => Some(*protocol),
            FlowKey::Tcp { .. } => Some(IPPROTO_TCP),
            FlowKey::Udp { .. } => Some(IPPROTO_UDP),
            FlowKey::Icmp { .. } => Some(IPPROTO_ICMP),
            _ => None,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKey::InPort(port) => write!(f, "in_port({port})"),
            FlowKey::Tunnel { id } => write!(f, "tunnel(id={id})"),
            FlowKey::Ethernet { src, dst } => write!(f, "eth(src={src},dst={dst})"),
            FlowKey::Vlan(id) => write!(f, "vlan({id})"),
            FlowKey::EtherType(t) => write!(f, "eth_type(0x{t:04x})"),
            FlowKey::Ipv4 {
                src,
                dst,
                protocol,
                tos,
                ttl,
            } => write!(f, "ipv4(src={src},dst={dst},proto={protocol},tos={tos},ttl={ttl})"),
            FlowKey::Ipv6 {
                src,
                dst,
                protocol,
                hop_limit,
            } => write!(f, "ipv6(src={src},dst={dst},proto={protocol},hlimit={hop_limit})"),
            FlowKey::Tcp { src, dst } => write!(f, "tcp(src={src},dst={dst})"),
            FlowKey::Udp { src, dst } => write!(f, "udp(src={src},dst={dst})"),
            FlowKey::Icmp { icmp_type, code } => write!(f, "icmp(type={icmp_type},code={code})"),
        }
    }
}

/// Ordered, appendable sequence of flow keys.
///
/// Equality and hashing cover the full ordered sequence:
///
/// ```
/// use netvirt_types::{FlowKey, FlowMatch};
///
/// let a = FlowMatch::new().add_key(FlowKey::InPort(1)).add_key(FlowKey::EtherType(0x0800));
/// let b = FlowMatch::new().add_key(FlowKey::EtherType(0x0800)).add_key(FlowKey::InPort(1));
/// assert_ne!(a, b);
/// assert_eq!(a.canonical(), b.canonical());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowMatch {
    keys: Vec<FlowKey>,
}

impl FlowMatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a key, builder style.
    pub fn add_key(mut self, key: FlowKey) -> Self {
        self.keys.push(key);
        self
    }

    /// Appends a key in place and returns `self` for chaining.
    pub fn push_key(&mut self, key: FlowKey) -> &mut Self {
        self.keys.push(key);
        self
    }

    /// Replaces the whole key list.
    pub fn set_keys(mut self, keys: Vec<FlowKey>) -> Self {
        self.keys = keys;
        self
    }

    pub fn keys(&self) -> &[FlowKey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Returns a copy with keys stably sorted by [`FlowKeyKind`].
    ///
    /// Keys of the same kind keep their relative order.
    pub fn canonical(&self) -> FlowMatch {
        let mut keys = self.keys.clone();
        keys.sort_by_key(FlowKey::kind);
        FlowMatch { keys }
    }

    /// Protocol number of the first key that carries one.
    pub fn ip_protocol(&self) -> Option<u8> {
        self.keys.iter().find_map(FlowKey::ip_protocol)
    }
}

impl From<Vec<FlowKey>> for FlowMatch {
    fn from(keys: Vec<FlowKey>) -> Self {
        FlowMatch { keys }
    }
}

impl FromIterator<FlowKey> for FlowMatch {
    fn from_iter<I: IntoIterator<Item = FlowKey>>(iter: I) -> Self {
        FlowMatch {
            keys: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, key) in self.keys.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            fmt::Display::fmt(key, f)?;
        }
        Ok(())
    }
}
