use super::paths::PathBuilder;
use super::types::{decode, encode, parse_id, validate_name, BridgeConfig, DeviceKind, PortConfig};
use super::{conflict_on_stale, PrepareDelete};
use crate::directory::{CreateMode, Directory, Op};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Owns bridge nodes and their ports.
#[derive(Clone)]
pub struct BridgeHandler {
    dir: Arc<dyn Directory>,
    paths: PathBuilder,
}

impl BridgeHandler {
    pub fn new(dir: Arc<dyn Directory>, paths: PathBuilder) -> Self {
        Self { dir, paths }
    }

    #[instrument(skip(self))]
    pub async fn create(&self, tenant: Uuid, name: &str) -> Result<Uuid> {
        validate_name(name)?;
        let id = Uuid::new_v4();
        let config = BridgeConfig {
            tenant_id: tenant,
            name: name.to_string(),
        };

        self.dir
            .multi(vec![
                Op::create(self.paths.bridge(id), encode(&config)?, CreateMode::Persistent),
                Op::create_container(self.paths.bridge_ports(id)),
                Op::create_container(self.paths.tenant_bridge(tenant, id)),
                Op::create(
                    self.paths.tenant_bridge_name(tenant, name),
                    id.to_string().into_bytes(),
                    CreateMode::Persistent,
                ),
            ])
            .await?;

        info!(%tenant, bridge = %id, name, "Created bridge");
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<BridgeConfig> {
        let (data, _) = self.dir.get(&self.paths.bridge(id)).await?;
        decode(&data)
    }

    #[instrument(skip(self))]
    pub async fn add_port(&self, bridge: Uuid) -> Result<Uuid> {
        let port = Uuid::new_v4();
        let config = PortConfig {
            device_id: bridge,
            device_kind: DeviceKind::Bridge,
        };
        self.dir
            .multi(vec![
                Op::create(self.paths.port(port), encode(&config)?, CreateMode::Persistent),
                Op::create_container(self.paths.bridge_port(bridge, port)),
            ])
            .await?;

        debug!(%bridge, %port, "Added bridge port");
        Ok(port)
    }

    pub async fn list_ports(&self, bridge: Uuid) -> Result<Vec<Uuid>> {
        let parent = self.paths.bridge_ports(bridge);
        self.dir
            .get_children(&parent)
            .await?
            .iter()
            .map(|name| parse_id(&parent, name))
            .collect()
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let ops = self.prepare_delete(id).await?;
        self.dir
            .multi(ops)
            .await
            .map_err(|e| conflict_on_stale(&self.paths.bridge(id), e))?;

        info!(bridge = %id, "Deleted bridge");
        Ok(())
    }
}

#[async_trait]
impl PrepareDelete for BridgeHandler {
    async fn prepare_delete(&self, id: Uuid) -> Result<Vec<Op>> {
        let (data, _) = self.dir.get(&self.paths.bridge(id)).await?;
        let config: BridgeConfig = decode(&data)?;

        let mut ops = Vec::new();
        for port in self.list_ports(id).await? {
            ops.push(Op::delete(self.paths.bridge_port(id, port)));
            ops.push(Op::delete(self.paths.port(port)));
        }
        ops.push(Op::delete(self.paths.bridge_ports(id)));
        ops.push(Op::delete(self.paths.bridge(id)));
        ops.push(Op::delete(self.paths.tenant_bridge(config.tenant_id, id)));
        ops.push(Op::delete(
            self.paths.tenant_bridge_name(config.tenant_id, &config.name),
        ));
        Ok(ops)
    }
}
