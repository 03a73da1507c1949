use crate::error::{Result, StateError};
use chrono::{DateTime, Utc};
use netvirt_types::FlowMatch;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Range of translated (address, port) slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NatPool {
    addr_start: Ipv4Addr,
    addr_end: Ipv4Addr,
    port_start: u16,
    port_end: u16,
}

impl NatPool {
    /// Both ranges are inclusive. Port 0 is never handed out.
    pub fn new(
        addr_start: Ipv4Addr,
        addr_end: Ipv4Addr,
        port_start: u16,
        port_end: u16,
    ) -> Result<Self> {
        if addr_start > addr_end {
            return Err(StateError::invalid_config(
                "pool.addr",
                format!("start address {addr_start} > end address {addr_end}"),
            ));
        }
        if port_start > port_end {
            return Err(StateError::invalid_config(
                "pool.port",
                format!("start port {port_start} > end port {port_end}"),
            ));
        }
        if port_start == 0 {
            return Err(StateError::invalid_config("pool.port", "port 0 is reserved"));
        }
        Ok(Self {
            addr_start,
            addr_end,
            port_start,
            port_end,
        })
    }

    pub fn addr_range(&self) -> (Ipv4Addr, Ipv4Addr) {
        (self.addr_start, self.addr_end)
    }

    pub fn port_range(&self) -> (u16, u16) {
        (self.port_start, self.port_end)
    }

    fn ports_per_addr(&self) -> u64 {
        u64::from(self.port_end - self.port_start) + 1
    }

    /// Number of (address, port) slots.
    pub fn size(&self) -> u64 {
        let addrs = u64::from(u32::from(self.addr_end) - u32::from(self.addr_start)) + 1;
        addrs * self.ports_per_addr()
    }

    /// Slot `n` (modulo [`size`](Self::size)), ports varying fastest.
    pub fn slot(&self, n: u64) -> (Ipv4Addr, u16) {
        let n = n % self.size();
        let ports = self.ports_per_addr();
        // Both offsets are bounded by the ranges validated in `new`.
        let addr = u32::from(self.addr_start) + (n / ports) as u32;
        let port = self.port_start + (n % ports) as u16;
        (Ipv4Addr::from(addr), port)
    }

    pub fn contains(&self, addr: Ipv4Addr, port: u16) -> bool {
        (self.addr_start..=self.addr_end).contains(&addr)
            && (self.port_start..=self.port_end).contains(&port)
    }
}

/// A translation held by one flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatBinding {
    /// Cache key of the original flow
    pub forward_key: String,
    /// Cache key of the translated (protocol, address, port)
    pub reverse_key: String,
    pub translated_addr: Ipv4Addr,
    pub translated_port: u16,
    /// IP protocol number, 0 when the flow carries none
    pub protocol: u8,
    pub lease_expires_at: DateTime<Utc>,
}

impl NatBinding {
    /// True when both bindings name the same translation, whatever their
    /// lease expiry.
    pub fn same_translation(&self, other: &NatBinding) -> bool {
        self.forward_key == other.forward_key
            && self.reverse_key == other.reverse_key
            && self.translated_addr == other.translated_addr
            && self.translated_port == other.translated_port
            && self.protocol == other.protocol
    }
}

/// Value stored under a reverse key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseEntry {
    pub flow: FlowMatch,
    pub reserved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pool_validation() {
        let a = Ipv4Addr::new(192, 0, 2, 1);
        let b = Ipv4Addr::new(192, 0, 2, 4);
        assert!(NatPool::new(a, b, 1024, 2047).is_ok());
        assert!(NatPool::new(b, a, 1024, 2047).is_err());
        assert!(NatPool::new(a, b, 2048, 1024).is_err());
        assert!(NatPool::new(a, b, 0, 10).is_err());
    }

    #[test]
    fn test_pool_slots() {
        let pool = NatPool::new(
            Ipv4Addr::new(192, 0, 2, 1),
            Ipv4Addr::new(192, 0, 2, 2),
            5000,
            5002,
        )
        .unwrap();

        assert_eq!(pool.size(), 6);
        assert_eq!(pool.slot(0), (Ipv4Addr::new(192, 0, 2, 1), 5000));
        assert_eq!(pool.slot(2), (Ipv4Addr::new(192, 0, 2, 1), 5002));
        assert_eq!(pool.slot(3), (Ipv4Addr::new(192, 0, 2, 2), 5000));
        assert_eq!(pool.slot(6), pool.slot(0));
        assert!(pool.contains(Ipv4Addr::new(192, 0, 2, 2), 5001));
        assert!(!pool.contains(Ipv4Addr::new(192, 0, 2, 3), 5001));
    }

    #[test]
    fn test_full_range_pool() {
        let pool = NatPool::new(Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST, 1, u16::MAX).unwrap();
        assert_eq!(pool.size(), (1u64 << 32) * 65535);
        assert_eq!(pool.slot(pool.size() - 1), (Ipv4Addr::BROADCAST, u16::MAX));
    }
}
