//! Tenant topology kept in the coordination service.
//!
//! A tenant owns routers and bridges. Every lifecycle change is a single
//! [`Directory::multi`] batch, so a tenant subtree either exists completely
//! or not at all. Deleting a tenant enumerates its children, asks each
//! child's handler for its delete ops through [`PrepareDelete`], and commits
//! those ops followed by the tenant's own containers. If the children
//! change between enumeration and commit the batch is rejected as a whole
//! and the caller gets [`StateError::VersionConflict`].

mod bridge;
mod paths;
mod router;
mod types;

pub use bridge::BridgeHandler;
pub use paths::PathBuilder;
pub use router::RouterHandler;
pub use types::{BridgeConfig, DeviceKind, PortConfig, RouteConfig, RouterConfig};

use crate::config::DirectoryConfig;
use crate::directory::{CreateMode, Directory, Op};
use crate::error::{Result, StateError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use types::parse_id;
use uuid::Uuid;

/// Produces the ops that remove an entity, its descendants and every
/// reference to it elsewhere in the tree, descendants first.
///
/// Nothing is written; the caller merges the ops into its own batch.
#[async_trait]
pub trait PrepareDelete: Send + Sync {
    async fn prepare_delete(&self, id: Uuid) -> Result<Vec<Op>>;
}

/// A batch that was built from an earlier read fails with `NotFound` or
/// `NotEmpty` when the tree moved underneath it. Report that as a conflict
/// on the entity being deleted.
pub(crate) fn conflict_on_stale(path: &str, err: StateError) -> StateError {
    match err {
        StateError::NotFound(p) => {
            StateError::version_conflict(path, format!("{p} disappeared before commit"))
        }
        StateError::NotEmpty(p) => {
            StateError::version_conflict(path, format!("{p} gained children before commit"))
        }
        other => other,
    }
}

/// Entry point for tenant lifecycle operations.
#[derive(Clone)]
pub struct TopologyDirectory {
    dir: Arc<dyn Directory>,
    paths: PathBuilder,
    routers: RouterHandler,
    bridges: BridgeHandler,
}

impl TopologyDirectory {
    pub fn new(dir: Arc<dyn Directory>, paths: PathBuilder) -> Self {
        Self {
            routers: RouterHandler::new(Arc::clone(&dir), paths.clone()),
            bridges: BridgeHandler::new(Arc::clone(&dir), paths.clone()),
            dir,
            paths,
        }
    }

    pub fn from_config(dir: Arc<dyn Directory>, config: &DirectoryConfig) -> Self {
        Self::new(dir, PathBuilder::new(&config.root_path))
    }

    pub fn paths(&self) -> &PathBuilder {
        &self.paths
    }

    pub fn routers(&self) -> &RouterHandler {
        &self.routers
    }

    pub fn bridges(&self) -> &BridgeHandler {
        &self.bridges
    }

    /// Creates the root containers that are missing. Safe to run from
    /// several agents at once.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        let mut created = 0;
        for path in self.paths.base_paths() {
            match self.dir.create(&path, Vec::new(), CreateMode::Persistent).await {
                Ok(()) => created += 1,
                Err(StateError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        debug!(root = self.paths.root(), created, "Topology root initialized");
        Ok(())
    }

    /// Creates a tenant with empty router and bridge containers and name
    /// indices. A new id is generated when `id` is `None`.
    #[instrument(skip(self))]
    pub async fn create_tenant(&self, id: Option<Uuid>) -> Result<Uuid> {
        let id = id.unwrap_or_else(Uuid::new_v4);
        let ops = [
            self.paths.tenant(id),
            self.paths.tenant_routers(id),
            self.paths.tenant_bridges(id),
            self.paths.tenant_router_names(id),
            self.paths.tenant_bridge_names(id),
        ]
        .into_iter()
        .map(Op::create_container)
        .collect();

        self.dir.multi(ops).await?;
        info!(tenant = %id, "Created tenant");
        Ok(id)
    }

    /// Deletes a tenant and everything it owns in one batch.
    ///
    /// Fails with `NotFound` when the tenant does not exist and with
    /// `VersionConflict` when a router or bridge was added or removed
    /// concurrently; in both cases nothing is removed. Not retried here.
    #[instrument(skip(self))]
    pub async fn delete_tenant(&self, id: Uuid) -> Result<()> {
        let tenant_path = self.paths.tenant(id);
        if !self.dir.exists(&tenant_path).await? {
            return Err(StateError::not_found(tenant_path));
        }

        let owned: [(Vec<Uuid>, &dyn PrepareDelete); 2] = [
            (self.list_routers(id).await?, &self.routers),
            (self.list_bridges(id).await?, &self.bridges),
        ];

        let mut ops = Vec::new();
        let mut children = 0;
        for (ids, handler) in owned {
            for child in ids {
                let child_ops = handler
                    .prepare_delete(child)
                    .await
                    .map_err(|e| conflict_on_stale(&tenant_path, e))?;
                ops.extend(child_ops);
                children += 1;
            }
        }

        ops.extend(
            [
                self.paths.tenant_bridge_names(id),
                self.paths.tenant_router_names(id),
                self.paths.tenant_bridges(id),
                self.paths.tenant_routers(id),
                tenant_path.clone(),
            ]
            .into_iter()
            .map(Op::delete),
        );

        let count = ops.len();
        self.dir
            .multi(ops)
            .await
            .map_err(|e| conflict_on_stale(&tenant_path, e))?;

        info!(tenant = %id, children, ops = count, "Deleted tenant");
        Ok(())
    }

    pub async fn tenant_exists(&self, id: Uuid) -> Result<bool> {
        self.dir.exists(&self.paths.tenant(id)).await
    }

    pub async fn list_tenants(&self) -> Result<Vec<Uuid>> {
        self.list_ids(&self.paths.tenants()).await
    }

    pub async fn list_routers(&self, tenant: Uuid) -> Result<Vec<Uuid>> {
        self.list_ids(&self.paths.tenant_routers(tenant)).await
    }

    pub async fn list_bridges(&self, tenant: Uuid) -> Result<Vec<Uuid>> {
        self.list_ids(&self.paths.tenant_bridges(tenant)).await
    }

    pub async fn find_router_by_name(&self, tenant: Uuid, name: &str) -> Result<Option<Uuid>> {
        self.resolve_name(&self.paths.tenant_router_name(tenant, name))
            .await
    }

    pub async fn find_bridge_by_name(&self, tenant: Uuid, name: &str) -> Result<Option<Uuid>> {
        self.resolve_name(&self.paths.tenant_bridge_name(tenant, name))
            .await
    }

    async fn list_ids(&self, parent: &str) -> Result<Vec<Uuid>> {
        self.dir
            .get_children(parent)
            .await?
            .iter()
            .map(|name| parse_id(parent, name))
            .collect()
    }

    async fn resolve_name(&self, path: &str) -> Result<Option<Uuid>> {
        let data = match self.dir.get(path).await {
            Ok((data, _)) => data,
            Err(StateError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let id = String::from_utf8_lossy(&data);
        parse_id(path, id.trim()).map(Some)
    }
}
