// NodeProvider Trait - Abstracción para gestionar nodos de un cluster

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::node::{AuthConfig, NodeTemplate};
use crate::shared_kernel::{ClusterName, NodeId, Result, Tags};

/// Estado de salud del backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Backend completamente operativo
    Healthy,
    /// Backend con degradación (funciona pero con problemas)
    Degraded { reason: String },
    /// Backend no disponible
    Unhealthy { reason: String },
}

/// Remote-execution handle bound to one node.
///
/// Implementations sequence commands over an already-established access
/// path (SSH or an in-unit exec primitive); they do not implement the
/// transport themselves.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command on the node and return its combined output.
    async fn run(&self, command: &str) -> Result<String>;
}

/// Capability interface every orchestrator backend must implement.
///
/// The lifecycle core is backend-agnostic: it only assumes these operations
/// exist. A single logical caller is expected to drive provisioning and
/// termination for a given cluster at a time; the trait does not serialize
/// concurrent callers.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// Cluster this provider instance manages.
    fn cluster_name(&self) -> &ClusterName;

    /// Ids of nodes that are live (phase outside
    /// {Failed, Unknown, Succeeded, Terminating}) and not marked for
    /// deletion, restricted to this cluster and the given tag filter.
    async fn list_live_nodes(&self, tag_filters: &Tags) -> Result<Vec<NodeId>>;

    /// Whether the node's phase is `Running` right now. Point-read, never
    /// cached.
    async fn is_running(&self, node_id: &NodeId) -> Result<bool>;

    /// Whether the node's phase is outside {`Running`, `Pending`}.
    async fn is_terminated(&self, node_id: &NodeId) -> Result<bool>;

    /// Current tag mapping of the node.
    async fn node_tags(&self, node_id: &NodeId) -> Result<Tags>;

    /// Merge tags into each listed node, retrying on optimistic-concurrency
    /// conflicts.
    async fn set_node_tags(&self, node_ids: &[NodeId], tags: &Tags) -> Result<()>;

    /// The node's cluster-internal address.
    async fn internal_address(&self, node_id: &NodeId) -> Result<String>;

    /// The externally reachable address for the node.
    async fn external_address(&self, node_id: &NodeId) -> Result<String>;

    /// The externally published SSH port of the cluster the node belongs to.
    async fn external_port(&self, node_id: &NodeId) -> Result<i32>;

    /// Resolve a node id from an address, refreshing the address cache on a
    /// miss. Fails with `AddressNotFound` when the address is unknown even
    /// after a refresh.
    async fn resolve_node_id(&self, address: &str, use_internal_address: bool) -> Result<NodeId>;

    /// Create `count` nodes from the template, wait for them to schedule and
    /// run, and bootstrap SSH access. Created ids are not returned; callers
    /// re-query through [`NodeProvider::list_live_nodes`].
    async fn create_nodes(
        &self,
        template: &NodeTemplate,
        tags: &Tags,
        count: usize,
    ) -> Result<()>;

    /// Tear down one node and its routing services, tolerating already
    /// deleted resources.
    async fn terminate_node(&self, node_id: &NodeId) -> Result<()>;

    /// Sequential per-id termination.
    async fn terminate_nodes(&self, node_ids: &[NodeId]) -> Result<()> {
        for node_id in node_ids {
            self.terminate_node(node_id).await?;
        }
        Ok(())
    }

    /// Build a remote-execution handle for the node, bound to the
    /// authoritative SSH user from the persisted cluster configuration.
    async fn command_runner(
        &self,
        node_id: &NodeId,
        auth_config: &AuthConfig,
        use_internal_address: bool,
    ) -> Result<Box<dyn CommandRunner>>;

    /// Verify connectivity to the backing control plane.
    async fn health_check(&self) -> Result<HealthStatus>;
}
