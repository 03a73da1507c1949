//! Tenant lifecycle against a shared in-memory coordination service.

use async_trait::async_trait;
use netvirt_state::directory::{Directory, MemoryDirectory, Op, Version};
use netvirt_state::topology::{PathBuilder, RouterHandler, TopologyDirectory};
use netvirt_state::{Result, StateError};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const ROOT: &str = "/netvirt";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Counts commits going through to the wrapped directory.
struct RecordingDirectory {
    inner: MemoryDirectory,
    multis: AtomicUsize,
}

#[async_trait]
impl Directory for RecordingDirectory {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Version)> {
        self.inner.get(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn get_children(&self, path: &str) -> Result<BTreeSet<String>> {
        self.inner.get_children(path).await
    }

    async fn multi(&self, ops: Vec<Op>) -> Result<()> {
        self.multis.fetch_add(1, Ordering::SeqCst);
        self.inner.multi(ops).await
    }
}

enum Interference {
    AddRouter { tenant: Uuid },
    RemoveRouter { router: Uuid },
}

/// Lets another agent change the tree right before the first delete batch
/// is committed.
struct InterleavingDirectory {
    inner: MemoryDirectory,
    interference: Interference,
    fired: AtomicBool,
}

#[async_trait]
impl Directory for InterleavingDirectory {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Version)> {
        self.inner.get(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn get_children(&self, path: &str) -> Result<BTreeSet<String>> {
        self.inner.get_children(path).await
    }

    async fn multi(&self, ops: Vec<Op>) -> Result<()> {
        if ops.iter().any(Op::is_delete) && !self.fired.swap(true, Ordering::SeqCst) {
            let other = RouterHandler::new(
                Arc::new(self.inner.new_session()),
                PathBuilder::new(ROOT),
            );
            match self.interference {
                Interference::AddRouter { tenant } => {
                    other.create(tenant, "late-arrival").await?;
                }
                Interference::RemoveRouter { router } => other.delete(router).await?,
            }
        }
        self.inner.multi(ops).await
    }
}

async fn topology_on(dir: Arc<dyn Directory>) -> TopologyDirectory {
    let topo = TopologyDirectory::new(dir, PathBuilder::new(ROOT));
    topo.initialize().await.unwrap();
    topo
}

async fn populate(topo: &TopologyDirectory, tenant: Uuid, routers: usize, bridges: usize) -> Vec<Uuid> {
    let mut ids = Vec::new();
    for i in 0..routers {
        let id = topo.routers().create(tenant, &format!("r{i}")).await.unwrap();
        topo.routers().add_port(id).await.unwrap();
        ids.push(id);
    }
    for i in 0..bridges {
        let id = topo.bridges().create(tenant, &format!("b{i}")).await.unwrap();
        topo.bridges().add_port(id).await.unwrap();
        topo.bridges().add_port(id).await.unwrap();
        ids.push(id);
    }
    ids
}

#[tokio::test]
async fn test_delete_tenant_commits_once() {
    init_tracing();
    let mem = MemoryDirectory::new();
    let recording = Arc::new(RecordingDirectory {
        inner: mem.clone(),
        multis: AtomicUsize::new(0),
    });
    let topo = topology_on(recording.clone()).await;
    let baseline = mem.node_count();

    let tenant = topo.create_tenant(None).await.unwrap();
    populate(&topo, tenant, 3, 2).await;

    let before = recording.multis.load(Ordering::SeqCst);
    topo.delete_tenant(tenant).await.unwrap();
    assert_eq!(recording.multis.load(Ordering::SeqCst) - before, 1);

    assert_eq!(mem.subtree_size(&format!("{ROOT}/tenants/{tenant}")), 0);
    assert_eq!(mem.node_count(), baseline);
}

#[tokio::test]
async fn test_tenants_are_isolated() {
    let mem = MemoryDirectory::new();
    let topo = topology_on(Arc::new(mem.clone())).await;

    let keep = topo.create_tenant(None).await.unwrap();
    let kept = populate(&topo, keep, 1, 1).await;
    let keep_size = mem.node_count();

    let gone = topo.create_tenant(None).await.unwrap();
    populate(&topo, gone, 2, 2).await;
    topo.delete_tenant(gone).await.unwrap();

    assert_eq!(mem.node_count(), keep_size);
    assert_eq!(topo.list_tenants().await.unwrap(), vec![keep]);
    assert_eq!(topo.list_routers(keep).await.unwrap(), vec![kept[0]]);
    assert_eq!(topo.list_bridges(keep).await.unwrap(), vec![kept[1]]);
}

#[tokio::test]
async fn test_concurrent_router_create_rejects_delete() {
    init_tracing();
    let mem = MemoryDirectory::new();
    let setup = topology_on(Arc::new(mem.clone())).await;
    let tenant = setup.create_tenant(None).await.unwrap();
    let routers = populate(&setup, tenant, 2, 1).await;

    let racing = Arc::new(InterleavingDirectory {
        inner: mem.clone(),
        interference: Interference::AddRouter { tenant },
        fired: AtomicBool::new(false),
    });
    let topo = TopologyDirectory::new(racing, PathBuilder::new(ROOT));

    let before = mem.node_count();
    let err = topo.delete_tenant(tenant).await.unwrap_err();
    assert!(matches!(err, StateError::VersionConflict { .. }), "{err}");
    assert!(err.is_retryable());

    // Only the competitor's router was added; nothing was removed.
    assert_eq!(mem.node_count(), before + 5);
    for router in &routers[..2] {
        assert!(setup.routers().get(*router).await.is_ok());
    }
    assert_eq!(setup.list_routers(tenant).await.unwrap().len(), 3);

    // A fresh enumeration succeeds.
    topo.delete_tenant(tenant).await.unwrap();
    assert!(!setup.tenant_exists(tenant).await.unwrap());
}

#[tokio::test]
async fn test_concurrent_router_delete_rejects_delete() {
    let mem = MemoryDirectory::new();
    let setup = topology_on(Arc::new(mem.clone())).await;
    let tenant = setup.create_tenant(None).await.unwrap();
    let routers = populate(&setup, tenant, 2, 0).await;

    let racing = Arc::new(InterleavingDirectory {
        inner: mem.clone(),
        interference: Interference::RemoveRouter { router: routers[0] },
        fired: AtomicBool::new(false),
    });
    let topo = TopologyDirectory::new(racing, PathBuilder::new(ROOT));

    let err = topo.delete_tenant(tenant).await.unwrap_err();
    assert!(matches!(err, StateError::VersionConflict { .. }), "{err}");
    assert_eq!(setup.list_routers(tenant).await.unwrap(), vec![routers[1]]);
    assert!(setup.tenant_exists(tenant).await.unwrap());
}

#[tokio::test]
async fn test_recreate_after_delete() {
    let mem = MemoryDirectory::new();
    let topo = topology_on(Arc::new(mem)).await;
    let id = Uuid::new_v4();

    topo.create_tenant(Some(id)).await.unwrap();
    assert!(matches!(
        topo.create_tenant(Some(id)).await,
        Err(StateError::AlreadyExists(_))
    ));
    topo.delete_tenant(id).await.unwrap();
    topo.create_tenant(Some(id)).await.unwrap();
    assert!(topo.list_routers(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_config_root_path() {
    let mem = MemoryDirectory::new();
    let config = netvirt_state::DirectoryConfig {
        root_path: "/cloud/mgmt".into(),
    };
    let topo = TopologyDirectory::from_config(Arc::new(mem.clone()), &config);
    topo.initialize().await.unwrap();

    let tenant = topo.create_tenant(None).await.unwrap();
    assert!(mem
        .exists(&format!("/cloud/mgmt/tenants/{tenant}/routers"))
        .await
        .unwrap());
}
