//! Entity configs stored as node data in the topology namespace.

use crate::error::{Result, StateError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Data of `<root>/routers/<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub tenant_id: Uuid,
    pub name: String,
}

/// Data of `<root>/bridges/<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub tenant_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Router,
    Bridge,
}

/// Data of `<root>/ports/<id>`; points back at the owning device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub device_id: Uuid,
    pub device_kind: DeviceKind,
}

/// Data of `<root>/routers/<router>/routes/<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub dst_network: Ipv4Addr,
    pub dst_prefix_len: u8,
    pub next_hop_port: Uuid,
    #[serde(default)]
    pub weight: u32,
}

impl RouteConfig {
    pub fn new(dst_network: Ipv4Addr, dst_prefix_len: u8, next_hop_port: Uuid) -> Self {
        Self {
            dst_network,
            dst_prefix_len,
            next_hop_port,
            weight: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dst_prefix_len > 32 {
            return Err(StateError::invalid_config(
                "dst_prefix_len",
                format!("{} exceeds 32", self.dst_prefix_len),
            ));
        }
        Ok(())
    }
}

/// Entity names become path segments in the name indices.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(StateError::invalid_config(
            "name",
            format!("{name:?} is not a valid entity name"),
        ));
    }
    Ok(())
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}

/// Parses a child name that is expected to be an entity id.
pub(crate) fn parse_id(parent: &str, name: &str) -> Result<Uuid> {
    Uuid::parse_str(name).map_err(|_| {
        StateError::invalid_config("id", format!("child {name:?} of {parent} is not a UUID"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("uplink").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("..").is_err());
    }

    #[test]
    fn test_route_validation() {
        let port = Uuid::new_v4();
        assert!(RouteConfig::new(Ipv4Addr::new(10, 0, 0, 0), 8, port).validate().is_ok());
        assert!(RouteConfig::new(Ipv4Addr::new(10, 0, 0, 0), 33, port).validate().is_err());
    }

    #[test]
    fn test_port_config_round_trip() {
        let config = PortConfig {
            device_id: Uuid::new_v4(),
            device_kind: DeviceKind::Bridge,
        };
        let bytes = encode(&config).unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("\"bridge\""));
        assert_eq!(decode::<PortConfig>(&bytes).unwrap(), config);
    }

    #[test]
    fn test_parse_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_id("/r", &id.to_string()).unwrap(), id);
        assert!(parse_id("/r", "not-an-id").is_err());
    }
}
