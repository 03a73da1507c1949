//! Path layout of the topology namespace.
//!
//! ```text
//! <root>/tenants/<tenant>/routers/<router>          tenant -> router reference
//! <root>/tenants/<tenant>/bridges/<bridge>          tenant -> bridge reference
//! <root>/tenants/<tenant>/router-names/<name>       data: router id
//! <root>/tenants/<tenant>/bridge-names/<name>       data: bridge id
//! <root>/routers/<router>                           data: RouterConfig
//! <root>/routers/<router>/ports/<port>
//! <root>/routers/<router>/routes/<route>            data: RouteConfig
//! <root>/bridges/<bridge>                           data: BridgeConfig
//! <root>/bridges/<bridge>/ports/<port>
//! <root>/ports/<port>                               data: PortConfig
//! ```

use std::fmt::Display;

const TENANTS: &str = "tenants";
const ROUTERS: &str = "routers";
const BRIDGES: &str = "bridges";
const PORTS: &str = "ports";
const ROUTES: &str = "routes";
const ROUTER_NAMES: &str = "router-names";
const BRIDGE_NAMES: &str = "bridge-names";

/// Builds absolute paths under a configurable root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathBuilder {
    root: String,
}

impl PathBuilder {
    /// `root` is normalized to a leading slash and no trailing slash.
    pub fn new(root: impl AsRef<str>) -> Self {
        let trimmed = root.as_ref().trim_matches('/');
        let root = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        };
        Self { root }
    }

    pub fn root(&self) -> &str {
        if self.root.is_empty() {
            "/"
        } else {
            &self.root
        }
    }

    /// The fixed containers every deployment needs, parents first.
    pub fn base_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        let mut prefix = String::new();
        for segment in self.root.split('/').filter(|s| !s.is_empty()) {
            prefix.push('/');
            prefix.push_str(segment);
            paths.push(prefix.clone());
        }
        paths.extend([self.tenants(), self.routers(), self.bridges(), self.ports()]);
        paths
    }

    pub fn tenants(&self) -> String {
        format!("{}/{TENANTS}", self.root)
    }

    pub fn tenant(&self, tenant: impl Display) -> String {
        format!("{}/{TENANTS}/{tenant}", self.root)
    }

    pub fn tenant_routers(&self, tenant: impl Display) -> String {
        format!("{}/{ROUTERS}", self.tenant(tenant))
    }

    pub fn tenant_router(&self, tenant: impl Display, router: impl Display) -> String {
        format!("{}/{router}", self.tenant_routers(tenant))
    }

    pub fn tenant_bridges(&self, tenant: impl Display) -> String {
        format!("{}/{BRIDGES}", self.tenant(tenant))
    }

    pub fn tenant_bridge(&self, tenant: impl Display, bridge: impl Display) -> String {
        format!("{}/{bridge}", self.tenant_bridges(tenant))
    }

    pub fn tenant_router_names(&self, tenant: impl Display) -> String {
        format!("{}/{ROUTER_NAMES}", self.tenant(tenant))
    }

    pub fn tenant_router_name(&self, tenant: impl Display, name: &str) -> String {
        format!("{}/{name}", self.tenant_router_names(tenant))
    }

    pub fn tenant_bridge_names(&self, tenant: impl Display) -> String {
        format!("{}/{BRIDGE_NAMES}", self.tenant(tenant))
    }

    pub fn tenant_bridge_name(&self, tenant: impl Display, name: &str) -> String {
        format!("{}/{name}", self.tenant_bridge_names(tenant))
    }

    pub fn routers(&self) -> String {
        format!("{}/{ROUTERS}", self.root)
    }

    pub fn router(&self, router: impl Display) -> String {
        format!("{}/{router}", self.routers())
    }

    pub fn router_ports(&self, router: impl Display) -> String {
        format!("{}/{PORTS}", self.router(router))
    }

    pub fn router_port(&self, router: impl Display, port: impl Display) -> String {
        format!("{}/{port}", self.router_ports(router))
    }

    pub fn router_routes(&self, router: impl Display) -> String {
        format!("{}/{ROUTES}", self.router(router))
    }

    pub fn router_route(&self, router: impl Display, route: impl Display) -> String {
        format!("{}/{route}", self.router_routes(router))
    }

    pub fn bridges(&self) -> String {
        format!("{}/{BRIDGES}", self.root)
    }

    pub fn bridge(&self, bridge: impl Display) -> String {
        format!("{}/{bridge}", self.bridges())
    }

    pub fn bridge_ports(&self, bridge: impl Display) -> String {
        format!("{}/{PORTS}", self.bridge(bridge))
    }

    pub fn bridge_port(&self, bridge: impl Display, port: impl Display) -> String {
        format!("{}/{port}", self.bridge_ports(bridge))
    }

    pub fn ports(&self) -> String {
        format!("{}/{PORTS}", self.root)
    }

    pub fn port(&self, port: impl Display) -> String {
        format!("{}/{port}", self.ports())
    }
}
