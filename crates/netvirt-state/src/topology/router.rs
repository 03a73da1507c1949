use super::paths::PathBuilder;
use super::types::{
    decode, encode, parse_id, validate_name, DeviceKind, PortConfig, RouteConfig, RouterConfig,
};
use super::{conflict_on_stale, PrepareDelete};
use crate::directory::{CreateMode, Directory, Op};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Owns router nodes and everything hanging off them.
#[derive(Clone)]
pub struct RouterHandler {
    dir: Arc<dyn Directory>,
    paths: PathBuilder,
}

impl RouterHandler {
    pub fn new(dir: Arc<dyn Directory>, paths: PathBuilder) -> Self {
        Self { dir, paths }
    }

    /// Creates a router owned by `tenant`.
    ///
    /// The global node, its `ports` and `routes` containers, the tenant's
    /// reference and the name index entry are committed in one batch, so a
    /// duplicate name fails with `AlreadyExists` and leaves nothing behind.
    #[instrument(skip(self))]
    pub async fn create(&self, tenant: Uuid, name: &str) -> Result<Uuid> {
        validate_name(name)?;
        let id = Uuid::new_v4();
        let config = RouterConfig {
            tenant_id: tenant,
            name: name.to_string(),
        };

        let ops = vec![
            Op::create(self.paths.router(id), encode(&config)?, CreateMode::Persistent),
            Op::create_container(self.paths.router_ports(id)),
            Op::create_container(self.paths.router_routes(id)),
            Op::create_container(self.paths.tenant_router(tenant, id)),
            Op::create(
                self.paths.tenant_router_name(tenant, name),
                id.to_string().into_bytes(),
                CreateMode::Persistent,
            ),
        ];
        self.dir.multi(ops).await?;

        info!(%tenant, router = %id, name, "Created router");
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<RouterConfig> {
        let (data, _) = self.dir.get(&self.paths.router(id)).await?;
        decode(&data)
    }

    /// Adds a port to `router` and returns the port id.
    #[instrument(skip(self))]
    pub async fn add_port(&self, router: Uuid) -> Result<Uuid> {
        let port = Uuid::new_v4();
        let config = PortConfig {
            device_id: router,
            device_kind: DeviceKind::Router,
        };
        self.dir
            .multi(vec![
                Op::create(self.paths.port(port), encode(&config)?, CreateMode::Persistent),
                Op::create_container(self.paths.router_port(router, port)),
            ])
            .await?;

        debug!(%router, %port, "Added router port");
        Ok(port)
    }

    #[instrument(skip(self, route))]
    pub async fn add_route(&self, router: Uuid, route: &RouteConfig) -> Result<Uuid> {
        route.validate()?;
        let id = Uuid::new_v4();
        self.dir
            .create(
                &self.paths.router_route(router, id),
                encode(route)?,
                CreateMode::Persistent,
            )
            .await?;

        debug!(%router, route = %id, "Added route");
        Ok(id)
    }

    pub async fn list_ports(&self, router: Uuid) -> Result<Vec<Uuid>> {
        let parent = self.paths.router_ports(router);
        self.dir
            .get_children(&parent)
            .await?
            .iter()
            .map(|name| parse_id(&parent, name))
            .collect()
    }

    pub async fn list_routes(&self, router: Uuid) -> Result<Vec<(Uuid, RouteConfig)>> {
        let parent = self.paths.router_routes(router);
        let mut routes = Vec::new();
        for name in self.dir.get_children(&parent).await? {
            let id = parse_id(&parent, &name)?;
            let (data, _) = self.dir.get(&self.paths.router_route(router, id)).await?;
            routes.push((id, decode(&data)?));
        }
        Ok(routes)
    }

    /// Deletes the router and all its descendants in one batch.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let ops = self.prepare_delete(id).await?;
        let count = ops.len();
        self.dir
            .multi(ops)
            .await
            .map_err(|e| conflict_on_stale(&self.paths.router(id), e))?;

        info!(router = %id, ops = count, "Deleted router");
        Ok(())
    }
}

#[async_trait]
impl PrepareDelete for RouterHandler {
    async fn prepare_delete(&self, id: Uuid) -> Result<Vec<Op>> {
        let (data, _) = self.dir.get(&self.paths.router(id)).await?;
        let config: RouterConfig = decode(&data)?;

        let mut ops = Vec::new();
        let routes = self.paths.router_routes(id);
        for route in self.dir.get_children(&routes).await? {
            ops.push(Op::delete(format!("{routes}/{route}")));
        }
        for port in self.list_ports(id).await? {
            ops.push(Op::delete(self.paths.router_port(id, port)));
            ops.push(Op::delete(self.paths.port(port)));
        }

        ops.push(Op::delete(routes));
        ops.push(Op::delete(self.paths.router_ports(id)));
        ops.push(Op::delete(self.paths.router(id)));
        ops.push(Op::delete(self.paths.tenant_router(config.tenant_id, id)));
        ops.push(Op::delete(
            self.paths.tenant_router_name(config.tenant_id, &config.name),
        ));
        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::error::StateError;
    use crate::topology::TopologyDirectory;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    async fn setup() -> (MemoryDirectory, TopologyDirectory, Uuid) {
        let mem = MemoryDirectory::new();
        let topo = TopologyDirectory::new(Arc::new(mem.clone()), PathBuilder::new("/netvirt"));
        topo.initialize().await.unwrap();
        let tenant = topo.create_tenant(None).await.unwrap();
        (mem, topo, tenant)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (_mem, topo, tenant) = setup().await;
        let id = topo.routers().create(tenant, "edge").await.unwrap();

        let config = topo.routers().get(id).await.unwrap();
        assert_eq!(config.tenant_id, tenant);
        assert_eq!(config.name, "edge");
        assert_eq!(topo.find_router_by_name(tenant, "edge").await.unwrap(), Some(id));
        assert_eq!(topo.list_routers(tenant).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected_atomically() {
        let (mem, topo, tenant) = setup().await;
        topo.routers().create(tenant, "edge").await.unwrap();
        let before = mem.node_count();

        let err = topo.routers().create(tenant, "edge").await.unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
        assert_eq!(mem.node_count(), before);
        assert_eq!(topo.list_routers(tenant).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_under_missing_tenant() {
        let (mem, topo, _) = setup().await;
        let before = mem.node_count();
        let err = topo.routers().create(Uuid::new_v4(), "edge").await.unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
        assert_eq!(mem.node_count(), before);
    }

    #[tokio::test]
    async fn test_ports_and_routes() {
        let (_mem, topo, tenant) = setup().await;
        let routers = topo.routers();
        let id = routers.create(tenant, "edge").await.unwrap();
        let port = routers.add_port(id).await.unwrap();

        let route = RouteConfig::new(Ipv4Addr::new(10, 1, 0, 0), 16, port);
        let route_id = routers.add_route(id, &route).await.unwrap();

        assert_eq!(routers.list_ports(id).await.unwrap(), vec![port]);
        assert_eq!(routers.list_routes(id).await.unwrap(), vec![(route_id, route)]);

        let bad = RouteConfig::new(Ipv4Addr::new(10, 1, 0, 0), 40, port);
        assert!(routers.add_route(id, &bad).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_removes_router_and_ports() {
        let (mem, topo, tenant) = setup().await;
        let routers = topo.routers();
        let id = routers.create(tenant, "edge").await.unwrap();
        let port = routers.add_port(id).await.unwrap();
        routers
            .add_route(id, &RouteConfig::new(Ipv4Addr::UNSPECIFIED, 0, port))
            .await
            .unwrap();

        routers.delete(id).await.unwrap();

        assert_eq!(mem.subtree_size(&format!("/netvirt/routers/{id}")), 0);
        assert_eq!(mem.subtree_size(&format!("/netvirt/ports/{port}")), 0);
        assert!(topo.list_routers(tenant).await.unwrap().is_empty());
        assert_eq!(topo.find_router_by_name(tenant, "edge").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_prepare_delete_orders_descendants_first() {
        let (_mem, topo, tenant) = setup().await;
        let routers = topo.routers();
        let id = routers.create(tenant, "edge").await.unwrap();
        let port = routers.add_port(id).await.unwrap();

        let ops = routers.prepare_delete(id).await.unwrap();
        let paths: Vec<&str> = ops.iter().map(Op::path).collect();
        let p = PathBuilder::new("/netvirt");
        assert_eq!(
            paths,
            vec![
                p.router_port(id, port),
                p.port(port),
                p.router_routes(id),
                p.router_ports(id),
                p.router(id),
                p.tenant_router(tenant, id),
                p.tenant_router_name(tenant, "edge"),
            ]
        );
        assert!(ops.iter().all(Op::is_delete));
    }
}
