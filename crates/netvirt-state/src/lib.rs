//! Control-plane state core for netvirt agents.
//!
//! Several agents run side by side with no lock manager between them. This
//! crate keeps two kinds of shared state consistent through the services
//! they all talk to:
//!
//! - **Topology** ([`topology`]): tenants and the routers and bridges they
//!   own, stored in a hierarchical coordination service ([`directory`]).
//!   Every lifecycle change commits as one atomic batch.
//! - **NAT leases** ([`nat`]): per-flow address/port translations stored in
//!   an expiring key-value cache ([`cache`]). Slots are reserved with
//!   conditional writes and reclaimed by TTL.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐        ┌──────────────────────┐
//! │ TopologyDirectory│──multi─▶  Directory           │
//! │  RouterHandler   │        │  (MemoryDirectory)   │
//! │  BridgeHandler   │        └──────────────────────┘
//! └──────────────────┘
//! ┌──────────────────┐        ┌──────────────────────┐
//! │ NatLeaseManager  │──put───▶  Cache               │
//! │                  │        │  (LocalCache, Redis) │
//! └──────────────────┘        └──────────────────────┘
//! ```
//!
//! Nothing here installs a tracing subscriber; binaries do that.

pub mod cache;
pub mod config;
pub mod directory;
pub mod error;
pub mod nat;
pub mod topology;

pub use cache::{open_cache, Cache, LocalCache};
#[cfg(feature = "redis")]
pub use cache::{RedisCache, RedisCacheConfig};
pub use config::{CacheBackend, CacheConfig, DirectoryConfig, NatConfig, NetvirtConfig};
pub use directory::{CreateMode, Directory, MemoryDirectory, Op, Version};
pub use error::{Result, StateError};
pub use nat::{NatBinding, NatLeaseManager, NatPool};
pub use topology::{BridgeHandler, PathBuilder, PrepareDelete, RouterHandler, TopologyDirectory};

pub use netvirt_types::{FlowKey, FlowMatch, MacAddress};
