use super::types::{NatBinding, NatPool, ReverseEntry};
use crate::cache::Cache;
use crate::config::NatConfig;
use crate::error::{Result, StateError};
use chrono::{DateTime, Utc};
use netvirt_types::FlowMatch;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Allocates, refreshes and releases NAT bindings in a shared [`Cache`].
///
/// Each agent owns its own manager; managers coordinate only through the
/// cache. No lock is held across calls.
pub struct NatLeaseManager {
    cache: Arc<dyn Cache>,
    config: NatConfig,
    lease: chrono::Duration,
    grace: chrono::Duration,
    cursor: AtomicU64,
}

/// A slot reservation this manager wrote, kept so cleanup only removes
/// its own entry.
struct Reservation {
    key: String,
    addr: Ipv4Addr,
    port: u16,
    value: Vec<u8>,
}

impl NatLeaseManager {
    pub fn new(cache: Arc<dyn Cache>, config: NatConfig) -> Result<Self> {
        config.validate()?;
        let lease = chrono::Duration::from_std(config.lease_ttl())
            .map_err(|e| StateError::invalid_config("nat.lease_ttl_secs", e.to_string()))?;
        let grace = chrono::Duration::from_std(config.orphan_grace())
            .map_err(|e| StateError::invalid_config("nat.orphan_grace_secs", e.to_string()))?;

        Ok(Self {
            cache,
            config,
            lease,
            grace,
            cursor: AtomicU64::new(rand::random()),
        })
    }

    pub fn config(&self) -> &NatConfig {
        &self.config
    }

    fn ttl(&self) -> Duration {
        self.config.lease_ttl()
    }

    /// Cache key of the forward entry for `flow`.
    pub fn forward_key(&self, flow: &FlowMatch) -> String {
        if self.config.canonicalize_flow_keys {
            format!("{}:fwd:{}", self.config.key_prefix, flow.canonical())
        } else {
            format!("{}:fwd:{}", self.config.key_prefix, flow)
        }
    }

    /// Cache key of the reverse entry for a translated slot.
    pub fn reverse_key(&self, protocol: u8, addr: Ipv4Addr, port: u16) -> String {
        format!("{}:rev:{}:{}:{}", self.config.key_prefix, protocol, addr, port)
    }

    fn keyed(&self, flow: &FlowMatch) -> FlowMatch {
        if self.config.canonicalize_flow_keys {
            flow.canonical()
        } else {
            flow.clone()
        }
    }

    /// Returns the binding for `flow`, creating one from `pool` if none is
    /// live. An existing binding is refreshed rather than replaced, and is
    /// returned as is even when its slot lies outside `pool`: a flow keeps
    /// its translation until it is released or its lease runs out.
    #[instrument(skip_all, fields(flow = %flow))]
    pub async fn allocate(&self, flow: &FlowMatch, pool: &NatPool) -> Result<NatBinding> {
        let flow = self.keyed(flow);
        if let Some(existing) = self.lookup_keyed(&flow).await? {
            return Ok(existing);
        }

        let protocol = flow.ip_protocol().unwrap_or(0);
        let reservation = self.reserve_slot(&flow, protocol, pool).await?;
        let binding = NatBinding {
            forward_key: self.forward_key(&flow),
            reverse_key: reservation.key.clone(),
            translated_addr: reservation.addr,
            translated_port: reservation.port,
            protocol,
            lease_expires_at: Utc::now() + self.lease,
        };

        let value = match serde_json::to_vec(&binding) {
            Ok(value) => value,
            Err(e) => {
                self.release_reservation(&reservation).await;
                return Err(e.into());
            }
        };

        match self
            .cache
            .put_if_absent(&binding.forward_key, &value, self.ttl())
            .await
        {
            Ok(true) => {
                info!(
                    addr = %binding.translated_addr,
                    port = binding.translated_port,
                    protocol,
                    "Allocated NAT binding"
                );
                Ok(binding)
            }
            Ok(false) => {
                // Another agent bound this flow while we were probing.
                self.release_reservation(&reservation).await;
                debug!(slot = %reservation.key, "Lost forward race, adopting winner");
                self.lookup_keyed(&flow).await?.ok_or_else(|| {
                    StateError::AllocationFailure(format!(
                        "binding for {} vanished after a concurrent allocation",
                        binding.forward_key
                    ))
                })
            }
            Err(e) => {
                self.release_reservation(&reservation).await;
                Err(e)
            }
        }
    }

    /// Returns the live binding for `flow` and extends its lease.
    ///
    /// A forward entry whose slot is missing or held by another flow is
    /// evicted and reported as absent.
    #[instrument(skip_all, fields(flow = %flow))]
    pub async fn lookup(&self, flow: &FlowMatch) -> Result<Option<NatBinding>> {
        let flow = self.keyed(flow);
        self.lookup_keyed(&flow).await
    }

    /// Maps a translated (protocol, address, port) back to the flow holding
    /// it. Does not refresh the lease.
    #[instrument(skip(self))]
    pub async fn lookup_reverse(
        &self,
        protocol: u8,
        addr: Ipv4Addr,
        port: u16,
    ) -> Result<Option<FlowMatch>> {
        let reverse_key = self.reverse_key(protocol, addr, port);
        let Some(raw) = self.cache.get(&reverse_key).await? else {
            return Ok(None);
        };
        let entry: ReverseEntry = serde_json::from_slice(&raw)?;

        // A reservation without its forward entry is not a binding yet.
        match self.forward_binding(&entry.flow).await? {
            Some(binding) if binding.reverse_key == reverse_key => Ok(Some(entry.flow)),
            _ => Ok(None),
        }
    }

    /// Drops the binding for `flow`. Releasing an unbound flow is a no-op.
    ///
    /// Both entries are read and decoded before anything is removed. An
    /// undecodable reverse entry is left to expire.
    #[instrument(skip_all, fields(flow = %flow))]
    pub async fn release(&self, flow: &FlowMatch) -> Result<()> {
        let flow = self.keyed(flow);
        let forward_key = self.forward_key(&flow);
        let Some(raw) = self.cache.get(&forward_key).await? else {
            debug!("No binding to release");
            return Ok(());
        };

        let binding: NatBinding = match serde_json::from_slice(&raw) {
            Ok(binding) => binding,
            Err(e) => {
                self.cache.delete(&forward_key).await?;
                warn!(key = %forward_key, error = %e, "Dropped undecodable forward entry");
                return Ok(());
            }
        };

        let owned_slot = match self.cache.get(&binding.reverse_key).await? {
            Some(raw_rev) => match serde_json::from_slice::<ReverseEntry>(&raw_rev) {
                Ok(entry) => (entry.flow == flow).then_some(raw_rev),
                Err(e) => {
                    warn!(slot = %binding.reverse_key, error = %e, "Left undecodable reverse entry");
                    None
                }
            },
            None => None,
        };

        self.cache.delete(&forward_key).await?;
        if let Some(raw_rev) = owned_slot {
            self.cache.delete_if_eq(&binding.reverse_key, &raw_rev).await?;
        }

        info!(
            addr = %binding.translated_addr,
            port = binding.translated_port,
            "Released NAT binding"
        );
        Ok(())
    }

    async fn forward_binding(&self, flow: &FlowMatch) -> Result<Option<NatBinding>> {
        match self.cache.get(&self.forward_key(flow)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn lookup_keyed(&self, flow: &FlowMatch) -> Result<Option<NatBinding>> {
        let forward_key = self.forward_key(flow);
        let Some(raw) = self.cache.get(&forward_key).await? else {
            return Ok(None);
        };
        let binding: NatBinding = serde_json::from_slice(&raw)?;

        let reverse = match self.cache.get(&binding.reverse_key).await? {
            Some(raw_rev) => {
                let entry: ReverseEntry = serde_json::from_slice(&raw_rev)?;
                (entry.flow == *flow).then_some(raw_rev)
            }
            None => None,
        };
        let Some(raw_rev) = reverse else {
            self.cache.delete_if_eq(&forward_key, &raw).await?;
            warn!(key = %forward_key, slot = %binding.reverse_key, "Evicted orphaned forward entry");
            return Ok(None);
        };

        let refreshed = NatBinding {
            lease_expires_at: binding.lease_expires_at.max(Utc::now() + self.lease),
            ..binding
        };

        // Both refreshes are conditional on the values just read, so a slot
        // that lapsed and was taken by another flow, or a binding released
        // meanwhile, is never written back. Reverse first, so a live forward
        // entry never outlives its slot.
        let ttl = self.ttl();
        if !self
            .cache
            .replace_if_eq(&refreshed.reverse_key, &raw_rev, &raw_rev, ttl)
            .await?
        {
            self.cache.delete_if_eq(&forward_key, &raw).await?;
            warn!(key = %forward_key, slot = %refreshed.reverse_key, "Slot lost during refresh");
            return Ok(None);
        }
        if !self
            .cache
            .replace_if_eq(&forward_key, &raw, &serde_json::to_vec(&refreshed)?, ttl)
            .await?
        {
            return self
                .settle_failed_refresh(&forward_key, &refreshed, &raw_rev)
                .await;
        }

        debug!(expires_at = %refreshed.lease_expires_at, "Refreshed NAT binding");
        Ok(Some(refreshed))
    }

    /// The forward entry changed after it was read. Another agent's refresh
    /// leaves the binding in place; anything else means this slot no longer
    /// backs the flow, and the reservation just refreshed is handed back.
    async fn settle_failed_refresh(
        &self,
        forward_key: &str,
        refreshed: &NatBinding,
        raw_rev: &[u8],
    ) -> Result<Option<NatBinding>> {
        let current = match self.cache.get(forward_key).await? {
            Some(raw) => serde_json::from_slice::<NatBinding>(&raw).ok(),
            None => None,
        };
        match current {
            Some(current) if current.reverse_key == refreshed.reverse_key => {
                debug!(expires_at = %current.lease_expires_at, "Binding refreshed concurrently");
                Ok(Some(current))
            }
            _ => {
                self.cache.delete_if_eq(&refreshed.reverse_key, raw_rev).await?;
                debug!(slot = %refreshed.reverse_key, "Binding released during refresh");
                Ok(None)
            }
        }
    }

    /// Claims a free slot, starting at the cursor and wrapping once around
    /// the pool.
    async fn reserve_slot(
        &self,
        flow: &FlowMatch,
        protocol: u8,
        pool: &NatPool,
    ) -> Result<Reservation> {
        let value = serde_json::to_vec(&ReverseEntry {
            flow: flow.clone(),
            reserved_at: Utc::now(),
        })?;

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..pool.size() {
            let (addr, port) = pool.slot(start.wrapping_add(offset));
            let key = self.reverse_key(protocol, addr, port);

            let mut claimed = self.cache.put_if_absent(&key, &value, self.ttl()).await?;
            if !claimed && self.reclaim_orphan(&key).await? {
                claimed = self.cache.put_if_absent(&key, &value, self.ttl()).await?;
            }
            if claimed {
                // Skip the slots just found busy on the next allocation.
                let _ = self.cursor.compare_exchange(
                    start.wrapping_add(1),
                    start.wrapping_add(offset).wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
                debug!(slot = %key, probes = offset + 1, "Reserved NAT slot");
                return Ok(Reservation {
                    key,
                    addr,
                    port,
                    value,
                });
            }
        }

        let (addr_start, addr_end) = pool.addr_range();
        let (port_start, port_end) = pool.port_range();
        Err(StateError::PoolExhausted(format!(
            "{addr_start}-{addr_end} ports {port_start}-{port_end} protocol {protocol}"
        )))
    }

    /// Removes the reservation under `key` when it is older than the grace
    /// period and no forward entry points at it. Returns whether the slot
    /// is now free.
    async fn reclaim_orphan(&self, key: &str) -> Result<bool> {
        let Some(raw) = self.cache.get(key).await? else {
            return Ok(true);
        };
        let entry: ReverseEntry = serde_json::from_slice(&raw)?;
        if !self.grace_elapsed(entry.reserved_at) {
            return Ok(false);
        }

        let owned = match self.cache.get(&self.forward_key(&entry.flow)).await? {
            Some(raw_fwd) => serde_json::from_slice::<NatBinding>(&raw_fwd)
                .map(|b| b.reverse_key == key)
                .unwrap_or(false),
            None => false,
        };
        if owned {
            return Ok(false);
        }

        let removed = self.cache.delete_if_eq(key, &raw).await?;
        if removed {
            warn!(slot = %key, flow = %entry.flow, "Reclaimed orphaned NAT slot");
        }
        Ok(removed)
    }

    fn grace_elapsed(&self, reserved_at: DateTime<Utc>) -> bool {
        Utc::now().signed_duration_since(reserved_at) >= self.grace
    }

    /// Best effort: a reservation left behind expires with its TTL.
    async fn release_reservation(&self, reservation: &Reservation) {
        if let Err(e) = self
            .cache
            .delete_if_eq(&reservation.key, &reservation.value)
            .await
        {
            warn!(slot = %reservation.key, error = %e, "Failed to release NAT slot reservation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use netvirt_types::FlowKey;
    use pretty_assertions::assert_eq;

    fn tcp_flow(src_port: u16) -> FlowMatch {
        FlowMatch::new()
            .add_key(FlowKey::InPort(3))
            .add_key(FlowKey::EtherType(0x0800))
            .add_key(FlowKey::ipv4(
                Ipv4Addr::new(10, 0, 0, 5),
                Ipv4Addr::new(198, 51, 100, 7),
                6,
            ))
            .add_key(FlowKey::Tcp {
                src: src_port,
                dst: 443,
            })
    }

    fn pool(ports: u16) -> NatPool {
        let addr = Ipv4Addr::new(192, 0, 2, 1);
        NatPool::new(addr, addr, 20000, 20000 + ports - 1).unwrap()
    }

    fn manager(cache: &LocalCache) -> NatLeaseManager {
        NatLeaseManager::new(Arc::new(cache.clone()), NatConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_allocate_then_lookup() {
        let cache = LocalCache::new();
        let nat = manager(&cache);
        let flow = tcp_flow(40000);

        let binding = nat.allocate(&flow, &pool(16)).await.unwrap();
        assert_eq!(binding.protocol, 6);
        assert!(pool(16).contains(binding.translated_addr, binding.translated_port));

        let found = nat.lookup(&flow).await.unwrap().unwrap();
        assert!(found.same_translation(&binding));
        assert!(found.lease_expires_at >= binding.lease_expires_at);

        let again = nat.allocate(&flow, &pool(16)).await.unwrap();
        assert!(again.same_translation(&binding));
        assert_eq!(cache.keys_with_prefix("netvirt:nat:rev:").len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_reverse() {
        let cache = LocalCache::new();
        let nat = manager(&cache);
        let flow = tcp_flow(40001);
        let binding = nat.allocate(&flow, &pool(4)).await.unwrap();

        let original = nat
            .lookup_reverse(6, binding.translated_addr, binding.translated_port)
            .await
            .unwrap();
        assert_eq!(original, Some(flow));
        assert_eq!(
            nat.lookup_reverse(17, binding.translated_addr, binding.translated_port)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_distinct_flows_get_distinct_slots() {
        let cache = LocalCache::new();
        let nat = manager(&cache);
        let a = nat.allocate(&tcp_flow(1), &pool(2)).await.unwrap();
        let b = nat.allocate(&tcp_flow(2), &pool(2)).await.unwrap();
        assert_ne!(a.reverse_key, b.reverse_key);

        let err = nat.allocate(&tcp_flow(3), &pool(2)).await.unwrap_err();
        assert!(matches!(err, StateError::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let cache = LocalCache::new();
        let nat = manager(&cache);
        let flow = tcp_flow(40002);
        nat.allocate(&flow, &pool(1)).await.unwrap();

        nat.release(&flow).await.unwrap();
        nat.release(&flow).await.unwrap();
        assert!(cache.is_empty());
        assert_eq!(nat.lookup(&flow).await.unwrap(), None);

        // The slot is free again.
        nat.allocate(&tcp_flow(40003), &pool(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_with_corrupt_reverse_entry() {
        let cache = LocalCache::new();
        let nat = manager(&cache);
        let flow = tcp_flow(40010);
        let binding = nat.allocate(&flow, &pool(4)).await.unwrap();
        cache
            .put(&binding.reverse_key, b"not json", Duration::from_secs(60))
            .await
            .unwrap();

        nat.release(&flow).await.unwrap();
        assert_eq!(cache.get(&binding.forward_key).await.unwrap(), None);
        assert_eq!(
            cache.keys_with_prefix("netvirt:nat:rev:"),
            vec![binding.reverse_key.clone()]
        );
    }

    #[tokio::test]
    async fn test_existing_binding_kept_across_pools() {
        let cache = LocalCache::new();
        let nat = manager(&cache);
        let flow = tcp_flow(40011);
        let binding = nat.allocate(&flow, &pool(4)).await.unwrap();

        let other = Ipv4Addr::new(198, 18, 0, 1);
        let other_pool = NatPool::new(other, other, 1000, 1003).unwrap();
        let again = nat.allocate(&flow, &other_pool).await.unwrap();
        assert!(again.same_translation(&binding));
        assert!(!other_pool.contains(again.translated_addr, again.translated_port));

        // A new translation comes only after release.
        nat.release(&flow).await.unwrap();
        let moved = nat.allocate(&flow, &other_pool).await.unwrap();
        assert!(other_pool.contains(moved.translated_addr, moved.translated_port));
    }

    #[tokio::test]
    async fn test_orphan_forward_is_evicted() {
        let cache = LocalCache::new();
        let nat = manager(&cache);
        let flow = tcp_flow(40004);
        let binding = nat.allocate(&flow, &pool(1)).await.unwrap();

        cache.delete(&binding.reverse_key).await.unwrap();
        assert_eq!(nat.lookup(&flow).await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_orphan_reservation_reclaimed_after_grace() {
        let cache = LocalCache::new();
        let config = NatConfig {
            orphan_grace_secs: 0,
            ..NatConfig::default()
        };
        let nat = NatLeaseManager::new(Arc::new(cache.clone()), config).unwrap();
        let stale = tcp_flow(1);
        let binding = nat.allocate(&stale, &pool(1)).await.unwrap();

        // Forward entry lost, reservation left behind.
        cache.delete(&binding.forward_key).await.unwrap();

        let fresh = tcp_flow(2);
        let taken = nat.allocate(&fresh, &pool(1)).await.unwrap();
        assert_eq!(taken.reverse_key, binding.reverse_key);
        assert_eq!(
            nat.lookup_reverse(6, taken.translated_addr, taken.translated_port)
                .await
                .unwrap(),
            Some(fresh)
        );
    }

    #[tokio::test]
    async fn test_young_reservation_is_not_reclaimed() {
        let cache = LocalCache::new();
        let nat = manager(&cache);
        let binding = nat.allocate(&tcp_flow(1), &pool(1)).await.unwrap();
        cache.delete(&binding.forward_key).await.unwrap();

        let err = nat.allocate(&tcp_flow(2), &pool(1)).await.unwrap_err();
        assert!(matches!(err, StateError::PoolExhausted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_refresh() {
        let cache = LocalCache::new();
        let nat = manager(&cache);
        let flow = tcp_flow(40005);
        nat.allocate(&flow, &pool(4)).await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(nat.lookup(&flow).await.unwrap().is_some());

        // The lookup above pushed expiry out by a full TTL.
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(nat.lookup(&flow).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(nat.lookup(&flow).await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_key_order_matters_unless_canonicalized() {
        let cache = LocalCache::new();
        let nat = manager(&cache);
        let flow = tcp_flow(40006);
        let reordered: FlowMatch = flow.keys().iter().rev().cloned().collect();

        nat.allocate(&flow, &pool(4)).await.unwrap();
        assert_eq!(nat.lookup(&reordered).await.unwrap(), None);

        let canonical = NatLeaseManager::new(
            Arc::new(LocalCache::new()),
            NatConfig {
                canonicalize_flow_keys: true,
                ..NatConfig::default()
            },
        )
        .unwrap();
        let binding = canonical.allocate(&flow, &pool(4)).await.unwrap();
        let found = canonical.lookup(&reordered).await.unwrap().unwrap();
        assert!(found.same_translation(&binding));
        assert_eq!(canonical.forward_key(&flow), canonical.forward_key(&reordered));
    }

    #[test]
    fn test_key_format() {
        let nat = manager(&LocalCache::new());
        assert_eq!(
            nat.reverse_key(17, Ipv4Addr::new(192, 0, 2, 1), 5000),
            "netvirt:nat:rev:17:192.0.2.1:5000"
        );
        assert_eq!(
            nat.forward_key(&FlowMatch::new().add_key(FlowKey::InPort(3))),
            "netvirt:nat:fwd:in_port(3)"
        );
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let config = NatConfig {
            lease_ttl_secs: 0,
            ..NatConfig::default()
        };
        assert!(NatLeaseManager::new(Arc::new(LocalCache::new()), config).is_err());
    }
}
