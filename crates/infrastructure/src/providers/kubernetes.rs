//! Kubernetes Node Provider Implementation
//!
//! Production implementation of NodeProvider using Kubernetes Pods as
//! cluster nodes. Uses kube-rs for native Kubernetes API interaction.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Node as ClusterHost, Pod, Service};
use kube::{
    Client, Config,
    api::{Api, DeleteParams, ListParams, PostParams},
};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gantry_domain::{
    AuthConfig, ClusterName, CommandRunner, HealthStatus, NODE_KIND_HEAD, NodeId, NodePhase,
    NodeProvider, NodeProviderError, NodeTemplate, Result, SSH_BRIDGE_LABEL, TAG_CLUSTER_NAME,
    TAG_NODE_KIND, TAG_NODE_UUID, Tags, head_service_selector,
};

use crate::command_runner::SshCommandRunner;
use crate::persistence::cluster_file;
use crate::providers::kubernetes_ssh::{
    check_user_privilege, fetch_ssh_user, set_env_vars_in_units, setup_ssh_in_units,
};
use crate::providers::kubernetes_wait::{wait_for_units_to_run, wait_for_units_to_schedule};

const MAX_TAG_RETRIES: usize = 3;
const DELAY_BEFORE_TAG_RETRY: Duration = Duration::from_millis(500);

/// Grace period granted to a unit when it is deleted.
const DELETION_GRACE_PERIOD_SECS: u32 = 30;

/// Matches units that are in the `Pending` or `Running` phase. There is no
/// OR operator in field selectors, so every other phase is excluded
/// explicitly.
pub(crate) const NON_TERMINATED_FIELD_SELECTOR: &str = "status.phase!=Failed,\
status.phase!=Unknown,status.phase!=Succeeded,status.phase!=Terminating";

/// Render a tag mapping as a control-plane label selector.
pub(crate) fn to_label_selector(tags: &Tags) -> String {
    tags.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the Kubernetes node provider
#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    /// Namespace the cluster's units live in
    pub namespace: String,
    /// Path to kubeconfig file (None = in-cluster config)
    pub kubeconfig_path: Option<String>,
    /// Kubeconfig context to use (None = current-context)
    pub context: Option<String>,
    /// Timeout for the scheduling phase of provisioning. If resources are
    /// not allocated within this window, provisioning is considered failed
    /// so the caller can fail over.
    pub provision_timeout: Duration,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "gantry-nodes".to_string(),
            kubeconfig_path: None,
            context: None,
            provision_timeout: Duration::from_secs(300),
        }
    }
}

/// Builder for KubernetesConfig
pub struct KubernetesConfigBuilder {
    config: KubernetesConfig,
}

impl KubernetesConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: KubernetesConfig::default(),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn kubeconfig_path(mut self, path: impl Into<String>) -> Self {
        self.config.kubeconfig_path = Some(path.into());
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.config.context = Some(context.into());
        self
    }

    pub fn provision_timeout(mut self, timeout: Duration) -> Self {
        self.config.provision_timeout = timeout;
        self
    }

    /// Build the configuration, validating required fields
    pub fn build(self) -> Result<KubernetesConfig> {
        self.validate()?;
        Ok(self.config)
    }

    fn validate(&self) -> Result<()> {
        if self.config.namespace.is_empty() {
            return Err(NodeProviderError::ClusterConfig {
                message: "Kubernetes namespace cannot be empty".to_string(),
            });
        }
        if self.config.provision_timeout.is_zero() {
            return Err(NodeProviderError::ClusterConfig {
                message: "provision timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for KubernetesConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KubernetesConfig {
    /// Create a new builder
    pub fn builder() -> KubernetesConfigBuilder {
        KubernetesConfigBuilder::new()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut builder = KubernetesConfigBuilder::new();

        if let Ok(namespace) = std::env::var("GANTRY_K8S_NAMESPACE") {
            builder = builder.namespace(namespace);
        }

        if let Ok(kubeconfig) = std::env::var("GANTRY_K8S_KUBECONFIG") {
            builder = builder.kubeconfig_path(kubeconfig);
        }

        if let Ok(context) = std::env::var("GANTRY_K8S_CONTEXT") {
            builder = builder.context(context);
        }

        if let Ok(timeout) = std::env::var("GANTRY_K8S_PROVISION_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse::<u64>() {
                builder = builder.provision_timeout(Duration::from_secs(secs));
            }
        }

        builder.build()
    }
}

// ============================================================================
// Kubernetes Node Provider
// ============================================================================

/// Kubernetes backend managing the lifecycle of one cluster's units.
///
/// The address caches are advisory: entries are populated lazily by
/// [`NodeProvider::resolve_node_id`] and are not evicted on termination.
#[derive(Clone)]
pub struct KubernetesNodeProvider {
    cluster_name: ClusterName,
    client: Client,
    config: KubernetesConfig,
    internal_address_cache: Arc<Mutex<HashMap<String, NodeId>>>,
    external_address_cache: Arc<Mutex<HashMap<String, NodeId>>>,
}

impl KubernetesNodeProvider {
    /// Create a provider, building the Kubernetes client from the
    /// configuration (kubeconfig path/context or in-cluster inference).
    pub async fn new(cluster_name: ClusterName, config: KubernetesConfig) -> Result<Self> {
        let client = Self::create_client(&config).await?;
        Ok(Self::with_client(cluster_name, config, client))
    }

    /// Create a provider around an existing client.
    pub fn with_client(cluster_name: ClusterName, config: KubernetesConfig, client: Client) -> Self {
        Self {
            cluster_name,
            client,
            config,
            internal_address_cache: Arc::new(Mutex::new(HashMap::new())),
            external_address_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn create_client(config: &KubernetesConfig) -> Result<Client> {
        let kube_config = match (&config.kubeconfig_path, &config.context) {
            (Some(path), context) => {
                let options = kube::config::KubeConfigOptions {
                    context: context.clone(),
                    cluster: None,
                    user: None,
                };
                let kubeconfig = kube::config::Kubeconfig::read_from(path).map_err(|e| {
                    NodeProviderError::ClusterConfig {
                        message: format!("failed to read kubeconfig from {}: {}", path, e),
                    }
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| NodeProviderError::ClusterConfig {
                        message: format!("failed to create Kubernetes config: {}", e),
                    })?
            }
            (None, _) => {
                Config::infer()
                    .await
                    .map_err(|e| NodeProviderError::ControlPlane {
                        message: format!("failed to infer Kubernetes config: {}", e),
                    })?
            }
        };

        Client::try_from(kube_config).map_err(|e| NodeProviderError::ControlPlane {
            message: format!("failed to create Kubernetes client: {}", e),
        })
    }

    fn units(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn events(&self) -> Api<Event> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    async fn read_unit(&self, node_id: &NodeId) -> Result<Pod> {
        match self.units().get(node_id.as_str()).await {
            Ok(pod) => Ok(pod),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(NodeProviderError::NodeNotFound {
                node_id: node_id.to_string(),
            }),
            Err(e) => Err(control_plane_error("failed to read unit", e)),
        }
    }

    fn unit_phase(pod: &Pod) -> NodePhase {
        pod.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(NodePhase::parse)
            .unwrap_or(NodePhase::Unknown)
    }

    // ------------------------------------------------------------------
    // Address resolution
    // ------------------------------------------------------------------

    /// The unit's address, or `None` while the control plane has not
    /// assigned one yet.
    async fn unit_address(
        &self,
        node_id: &NodeId,
        use_internal_address: bool,
    ) -> Result<Option<String>> {
        if use_internal_address {
            let pod = self.read_unit(node_id).await?;
            Ok(pod.status.and_then(|s| s.pod_ip))
        } else {
            self.cluster_external_address().await.map(Some)
        }
    }

    /// External access goes through a published port, so any host address
    /// of the backing cluster will do. Prefers an ExternalIP, falls back to
    /// an InternalIP.
    async fn cluster_external_address(&self) -> Result<String> {
        let hosts: Api<ClusterHost> = Api::all(self.client.clone());
        let list = hosts
            .list(&ListParams::default())
            .await
            .map_err(|e| control_plane_error("failed to list cluster hosts", e))?;
        for host in list.items {
            let Some(addresses) = host.status.and_then(|s| s.addresses) else {
                continue;
            };
            if let Some(external) = addresses.iter().find(|a| a.type_ == "ExternalIP") {
                return Ok(external.address.clone());
            }
            if let Some(internal) = addresses.iter().find(|a| a.type_ == "InternalIP") {
                return Ok(internal.address.clone());
            }
        }
        Err(NodeProviderError::ControlPlane {
            message: "no cluster host reported a reachable address".to_string(),
        })
    }

    fn address_cache(&self, use_internal_address: bool) -> &Arc<Mutex<HashMap<String, NodeId>>> {
        if use_internal_address {
            &self.internal_address_cache
        } else {
            &self.external_address_cache
        }
    }

    fn cached_node_id(&self, address: &str, use_internal_address: bool) -> Option<NodeId> {
        self.address_cache(use_internal_address)
            .lock()
            .expect("address cache poisoned")
            .get(address)
            .cloned()
    }

    fn known_addresses(&self, use_internal_address: bool) -> Vec<String> {
        let mut known: Vec<String> = self
            .address_cache(use_internal_address)
            .lock()
            .expect("address cache poisoned")
            .keys()
            .cloned()
            .collect();
        known.sort();
        known
    }

    // ------------------------------------------------------------------
    // Tag writes
    // ------------------------------------------------------------------

    async fn write_node_tags(&self, node_ids: &[NodeId], tags: &Tags) -> Result<()> {
        let units = self.units();
        for node_id in node_ids {
            let mut pod = self.read_unit(node_id).await?;
            pod.metadata
                .labels
                .get_or_insert_with(Default::default)
                .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
            match units
                .replace(node_id.as_str(), &PostParams::default(), &pod)
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    return Err(NodeProviderError::ResourceConflict {
                        node_id: node_id.to_string(),
                    });
                }
                Err(e) => return Err(control_plane_error("failed to write unit tags", e)),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Termination helpers
    // ------------------------------------------------------------------

    /// Delete the bridge unit serving `node_id` if no other live unit still
    /// routes through it. Bridge units outlive their workers when a cluster
    /// is torn down from inside, so termination sweeps for them.
    async fn cleanup_zombie_bridge(&self, node_id: &NodeId) -> Result<()> {
        let units = self.units();
        let Some(pod) = units
            .get_opt(node_id.as_str())
            .await
            .map_err(|e| control_plane_error("failed to read unit for bridge cleanup", e))?
        else {
            return Ok(());
        };
        let Some(bridge) = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(SSH_BRIDGE_LABEL))
            .cloned()
        else {
            return Ok(());
        };

        let lp = ListParams::default()
            .labels(&format!("{}={}", SSH_BRIDGE_LABEL, bridge))
            .fields(NON_TERMINATED_FIELD_SELECTOR);
        let users = units
            .list(&lp)
            .await
            .map_err(|e| control_plane_error("failed to list bridge users", e))?;
        let still_used = users.items.iter().any(|p| {
            p.metadata.deletion_timestamp.is_none()
                && p.metadata.name.as_deref() != Some(node_id.as_str())
        });
        if still_used {
            return Ok(());
        }

        info!(bridge = %bridge, "no live units left behind bridge, removing it");
        if let Err(e) = units.delete(&bridge, &DeleteParams::default()).await {
            if !is_not_found(&e) {
                return Err(control_plane_error("failed to delete bridge unit", e));
            }
        }
        let bridge_service = format!("{}-ssh", bridge);
        if let Err(e) = self
            .services()
            .delete(&bridge_service, &DeleteParams::default())
            .await
        {
            if !is_not_found(&e) {
                return Err(control_plane_error("failed to delete bridge service", e));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Manifest preparation
// ============================================================================

/// Materialize the unit manifest for one batch: inject namespace and tags
/// into the template copy, attach the head-routing selector when the batch
/// creates a head node, then deserialize into a typed Pod.
fn prepare_unit_manifest(
    template: &NodeTemplate,
    cluster_name: &ClusterName,
    namespace: &str,
    tags: &Tags,
) -> Result<Pod> {
    let mut unit = template.unit.clone();
    {
        let root = unit
            .as_object_mut()
            .ok_or_else(|| NodeProviderError::InvalidTemplate {
                message: "unit manifest must be a JSON object".to_string(),
            })?;
        let metadata = root
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| NodeProviderError::InvalidTemplate {
                message: "unit metadata must be a JSON object".to_string(),
            })?;
        metadata.insert("namespace".to_string(), json!(namespace));
        let labels = metadata
            .entry("labels")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| NodeProviderError::InvalidTemplate {
                message: "unit labels must be a JSON object".to_string(),
            })?;
        for (key, value) in tags {
            labels.insert(key.clone(), json!(value));
        }
        // Allow the externally configured ingress service to route to the
        // head node.
        if tags.get(TAG_NODE_KIND).map(String::as_str) == Some(NODE_KIND_HEAD) {
            for (key, value) in head_service_selector(cluster_name) {
                labels.insert(key, json!(value));
            }
        }
    }
    serde_json::from_value(unit).map_err(|e| NodeProviderError::InvalidTemplate {
        message: format!("unit manifest is not a valid Pod: {}", e),
    })
}

/// Materialize one routing service for a freshly created unit. The service
/// is named after the unit and selects on the batch's unique id, tying the
/// route to this provisioning batch rather than to long-lived cluster
/// identity.
fn prepare_service_manifest(
    service_template: &Value,
    unit_name: &str,
    batch_uuid: &str,
) -> Result<Service> {
    let mut manifest = service_template.clone();
    {
        let root = manifest
            .as_object_mut()
            .ok_or_else(|| NodeProviderError::InvalidTemplate {
                message: "service manifest must be a JSON object".to_string(),
            })?;
        let metadata = root
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| NodeProviderError::InvalidTemplate {
                message: "service metadata must be a JSON object".to_string(),
            })?;
        metadata.insert("name".to_string(), json!(unit_name));
        let spec = root
            .entry("spec")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| NodeProviderError::InvalidTemplate {
                message: "service spec must be a JSON object".to_string(),
            })?;
        let mut selector = Map::new();
        selector.insert(TAG_NODE_UUID.to_string(), json!(batch_uuid));
        spec.insert("selector".to_string(), Value::Object(selector));
    }
    serde_json::from_value(manifest).map_err(|e| NodeProviderError::InvalidTemplate {
        message: format!("service manifest is not a valid Service: {}", e),
    })
}

pub(crate) fn control_plane_error(context: &str, err: kube::Error) -> NodeProviderError {
    NodeProviderError::ControlPlane {
        message: format!("{}: {}", context, err),
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

// ============================================================================
// NodeProvider implementation
// ============================================================================

#[async_trait]
impl NodeProvider for KubernetesNodeProvider {
    fn cluster_name(&self) -> &ClusterName {
        &self.cluster_name
    }

    async fn list_live_nodes(&self, tag_filters: &Tags) -> Result<Vec<NodeId>> {
        let mut filters = tag_filters.clone();
        filters.insert(TAG_CLUSTER_NAME.to_string(), self.cluster_name.to_string());
        let label_selector = to_label_selector(&filters);

        let lp = ListParams::default()
            .fields(NON_TERMINATED_FIELD_SELECTOR)
            .labels(&label_selector);
        let pod_list = self
            .units()
            .list(&lp)
            .await
            .map_err(|e| control_plane_error("failed to list units", e))?;

        // Units marked for deletion still report a live phase; exclude them.
        Ok(pod_list
            .items
            .into_iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .filter_map(|pod| pod.metadata.name.map(NodeId::from))
            .collect())
    }

    async fn is_running(&self, node_id: &NodeId) -> Result<bool> {
        let pod = self.read_unit(node_id).await?;
        Ok(Self::unit_phase(&pod) == NodePhase::Running)
    }

    async fn is_terminated(&self, node_id: &NodeId) -> Result<bool> {
        let pod = self.read_unit(node_id).await?;
        Ok(Self::unit_phase(&pod).is_terminated())
    }

    async fn node_tags(&self, node_id: &NodeId) -> Result<Tags> {
        let pod = self.read_unit(node_id).await?;
        Ok(pod.metadata.labels.unwrap_or_default())
    }

    async fn set_node_tags(&self, node_ids: &[NodeId], tags: &Tags) -> Result<()> {
        for _ in 0..MAX_TAG_RETRIES - 1 {
            match self.write_node_tags(node_ids, tags).await {
                Ok(()) => return Ok(()),
                Err(NodeProviderError::ResourceConflict { node_id }) => {
                    info!(
                        node_id = %node_id,
                        "caught a conflict while setting node tags, retrying"
                    );
                    tokio::time::sleep(DELAY_BEFORE_TAG_RETRY).await;
                }
                Err(e) => return Err(e),
            }
        }
        // One more try
        self.write_node_tags(node_ids, tags).await
    }

    async fn internal_address(&self, node_id: &NodeId) -> Result<String> {
        self.unit_address(node_id, true).await?.ok_or_else(|| {
            NodeProviderError::ControlPlane {
                message: format!("node {} has no internal address assigned yet", node_id),
            }
        })
    }

    async fn external_address(&self, node_id: &NodeId) -> Result<String> {
        self.unit_address(node_id, false).await?.ok_or_else(|| {
            NodeProviderError::ControlPlane {
                message: format!("node {} has no external address", node_id),
            }
        })
    }

    async fn external_port(&self, node_id: &NodeId) -> Result<i32> {
        // The node id embeds the cluster name by convention
        // (e.g. trainer-ab12-head-x8k2); strip the head suffix to find the
        // cluster's published SSH service. Uncached on purpose.
        let cluster = node_id
            .as_str()
            .split("-head")
            .next()
            .unwrap_or(node_id.as_str());
        let service_name = format!("{}-ssh", cluster);
        let service = self
            .services()
            .get(&service_name)
            .await
            .map_err(|e| control_plane_error("failed to read bridge service", e))?;
        service
            .spec
            .and_then(|s| s.ports)
            .and_then(|ports| ports.into_iter().next())
            .and_then(|port| port.node_port)
            .ok_or_else(|| NodeProviderError::ControlPlane {
                message: format!("service {} has no published port", service_name),
            })
    }

    async fn resolve_node_id(&self, address: &str, use_internal_address: bool) -> Result<NodeId> {
        if let Some(node_id) = self.cached_node_id(address, use_internal_address) {
            return Ok(node_id);
        }

        // Cache miss: recompute every live node's address, then re-check.
        let all_nodes = self.list_live_nodes(&Tags::new()).await?;
        for node_id in &all_nodes {
            let Some(node_address) = self.unit_address(node_id, use_internal_address).await? else {
                continue;
            };
            self.address_cache(use_internal_address)
                .lock()
                .expect("address cache poisoned")
                .insert(node_address, node_id.clone());
        }

        self.cached_node_id(address, use_internal_address)
            .ok_or_else(|| NodeProviderError::AddressNotFound {
                address: address.to_string(),
                use_internal_address,
                known: self.known_addresses(use_internal_address),
            })
    }

    async fn create_nodes(
        &self,
        template: &NodeTemplate,
        tags: &Tags,
        count: usize,
    ) -> Result<()> {
        let batch_uuid = Uuid::new_v4().to_string();
        let mut tags = tags.clone();
        tags.insert(TAG_CLUSTER_NAME.to_string(), self.cluster_name.to_string());
        tags.insert(TAG_NODE_UUID.to_string(), batch_uuid.clone());

        let unit_manifest =
            prepare_unit_manifest(template, &self.cluster_name, &self.config.namespace, &tags)?;

        info!(count, "calling create unit (count={})", count);
        let units = self.units();
        let mut new_nodes: Vec<String> = Vec::new();
        for _ in 0..count {
            let created = units
                .create(&PostParams::default(), &unit_manifest)
                .await
                .map_err(|e| control_plane_error("failed to create unit", e))?;
            let name = created
                .metadata
                .name
                .clone()
                .ok_or_else(|| NodeProviderError::ControlPlane {
                    message: "created unit has no name".to_string(),
                })?;
            new_nodes.push(name);
        }

        if let Some(service_template) = &template.service {
            info!(count, "calling create service (count={})", count);
            for node_name in &new_nodes {
                let service = prepare_service_manifest(service_template, node_name, &batch_uuid)?;
                self.services()
                    .create(&PostParams::default(), &service)
                    .await
                    .map_err(|e| control_plane_error("failed to create service", e))?;
            }
        }

        // The bridge unit joins the wait set so its readiness is checked
        // along with the new units, but it is excluded from the bootstrap
        // stages below (it comes pre-configured).
        let bridge =
            template
                .bridge_unit_name()
                .ok_or_else(|| NodeProviderError::InvalidTemplate {
                    message: format!(
                        "template does not name an SSH bridge unit (label {})",
                        SSH_BRIDGE_LABEL
                    ),
                })?;
        let mut wait_set = new_nodes.clone();
        wait_set.push(bridge);

        info!(units = ?wait_set, "waiting for units to schedule");
        wait_for_units_to_schedule(
            &units,
            &self.events(),
            &wait_set,
            self.config.provision_timeout,
        )
        .await?;

        info!(units = ?wait_set, "waiting for units to run");
        wait_for_units_to_run(&units, &wait_set).await?;

        info!("checking if user in image has sufficient privileges");
        check_user_privilege(&units, &new_nodes).await?;

        info!("setting up SSH in units");
        setup_ssh_in_units(&units, &new_nodes).await;

        info!("setting up environment variables in units");
        set_env_vars_in_units(&units, &new_nodes).await;

        info!("fetching and updating ssh username");
        if let Some(ssh_user) = fetch_ssh_user(&units, &new_nodes).await? {
            let path = cluster_file::cluster_file_path(&self.cluster_name);
            cluster_file::rewrite_ssh_user(&path, &ssh_user)?;
        }

        Ok(())
    }

    async fn terminate_node(&self, node_id: &NodeId) -> Result<()> {
        info!(node_id = %node_id, "terminating node");

        if let Err(e) = self.cleanup_zombie_bridge(node_id).await {
            warn!(node_id = %node_id, error = %e, "error occurred while analyzing SSH bridge unit");
        }

        // Routing services go first; their deletion failures are swallowed
        // so the unit itself is always attempted.
        for service_name in [node_id.to_string(), format!("{}-ssh", node_id)] {
            if let Err(e) = self
                .services()
                .delete(&service_name, &DeleteParams::default())
                .await
            {
                if !is_not_found(&e) {
                    error!(service = %service_name, error = %e, "failed to delete routing service");
                }
            }
        }

        // The unit is deleted last so that a termination driven from inside
        // the unit itself cannot orphan its services.
        let dp = DeleteParams {
            grace_period_seconds: Some(DELETION_GRACE_PERIOD_SECS),
            ..Default::default()
        };
        match self.units().delete(node_id.as_str(), &dp).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                warn!(node_id = %node_id, "tried to delete unit, but it was not found (404)");
                Ok(())
            }
            Err(e) => Err(control_plane_error("failed to delete unit", e)),
        }
    }

    async fn terminate_nodes(&self, node_ids: &[NodeId]) -> Result<()> {
        // One unit at a time; batch deletion through a collection delete is
        // a possible optimization.
        for node_id in node_ids {
            self.terminate_node(node_id).await?;
        }
        Ok(())
    }

    async fn command_runner(
        &self,
        node_id: &NodeId,
        auth_config: &AuthConfig,
        use_internal_address: bool,
    ) -> Result<Box<dyn CommandRunner>> {
        // Bootstrap rewrites the ssh user into the persisted cluster file
        // after discovering the image's actual user; the caller-supplied
        // auth config may predate that, so the file is authoritative.
        let path = cluster_file::cluster_file_path(&self.cluster_name);
        let credentials = cluster_file::ssh_credentials(&path)?;

        let (address, port) = if use_internal_address {
            (self.internal_address(node_id).await?, 22)
        } else {
            (
                self.external_address(node_id).await?,
                self.external_port(node_id).await?,
            )
        };

        debug!(node_id = %node_id, address = %address, port, "building command runner");
        let runner = SshCommandRunner::new(node_id.clone(), credentials.ssh_user, address, port)
            .with_private_key(
                credentials
                    .ssh_private_key
                    .or_else(|| auth_config.ssh_private_key.clone()),
            );
        Ok(Box::new(runner))
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        // List a single unit to verify connectivity and permissions.
        match self.units().list(&ListParams::default().limit(1)).await {
            Ok(_) => Ok(HealthStatus::Healthy),
            Err(kube::Error::Api(ae)) if ae.code == 403 => Ok(HealthStatus::Degraded {
                reason: format!(
                    "insufficient permissions in namespace {}",
                    self.config.namespace
                ),
            }),
            Err(e) => Ok(HealthStatus::Unhealthy {
                reason: format!("failed to connect to Kubernetes API: {}", e),
            }),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_domain::COMPONENT_LABEL;

    #[test]
    fn test_kubernetes_config_default() {
        let config = KubernetesConfig::default();
        assert_eq!(config.namespace, "gantry-nodes");
        assert!(config.kubeconfig_path.is_none());
        assert_eq!(config.provision_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_kubernetes_config_builder() {
        let config = KubernetesConfig::builder()
            .namespace("custom-namespace")
            .kubeconfig_path("/path/to/kubeconfig")
            .context("my-context")
            .provision_timeout(Duration::from_secs(60))
            .build()
            .expect("should build config");

        assert_eq!(config.namespace, "custom-namespace");
        assert_eq!(
            config.kubeconfig_path,
            Some("/path/to/kubeconfig".to_string())
        );
        assert_eq!(config.context, Some("my-context".to_string()));
        assert_eq!(config.provision_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_kubernetes_config_builder_validation() {
        assert!(KubernetesConfig::builder().namespace("").build().is_err());
        assert!(
            KubernetesConfig::builder()
                .provision_timeout(Duration::ZERO)
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_to_label_selector() {
        let mut tags = Tags::new();
        tags.insert("a".to_string(), "1".to_string());
        tags.insert("b".to_string(), "2".to_string());
        assert_eq!(to_label_selector(&tags), "a=1,b=2");
        assert_eq!(to_label_selector(&Tags::new()), "");
    }

    #[test]
    fn test_non_terminated_field_selector_excludes_all_dead_phases() {
        for phase in ["Failed", "Unknown", "Succeeded", "Terminating"] {
            assert!(NON_TERMINATED_FIELD_SELECTOR.contains(&format!("status.phase!={}", phase)));
        }
    }

    fn worker_template() -> NodeTemplate {
        NodeTemplate::new(serde_json::json!({
            "metadata": {
                "name": "trainer-ab12-worker",
                "labels": {
                    (SSH_BRIDGE_LABEL): "trainer-ab12-bridge",
                }
            },
            "spec": {
                "containers": [{"name": "node", "image": "gantry/node:latest"}]
            }
        }))
    }

    #[test]
    fn test_prepare_unit_manifest_injects_namespace_and_tags() {
        let cluster = ClusterName::new("trainer-ab12");
        let mut tags = Tags::new();
        tags.insert(TAG_CLUSTER_NAME.to_string(), cluster.to_string());
        tags.insert(TAG_NODE_UUID.to_string(), "batch-1".to_string());

        let pod = prepare_unit_manifest(&worker_template(), &cluster, "gantry-nodes", &tags)
            .expect("manifest should materialize");

        assert_eq!(pod.metadata.namespace.as_deref(), Some("gantry-nodes"));
        let labels = pod.metadata.labels.expect("labels present");
        assert_eq!(labels.get(TAG_CLUSTER_NAME), Some(&cluster.to_string()));
        assert_eq!(labels.get(TAG_NODE_UUID), Some(&"batch-1".to_string()));
        // Template's own labels survive the merge
        assert_eq!(
            labels.get(SSH_BRIDGE_LABEL),
            Some(&"trainer-ab12-bridge".to_string())
        );
        // Not a head batch: no component label
        assert!(!labels.contains_key(COMPONENT_LABEL));
    }

    #[test]
    fn test_prepare_unit_manifest_attaches_head_selector() {
        let cluster = ClusterName::new("trainer-ab12");
        let mut tags = Tags::new();
        tags.insert(TAG_NODE_KIND.to_string(), NODE_KIND_HEAD.to_string());

        let pod = prepare_unit_manifest(&worker_template(), &cluster, "gantry-nodes", &tags)
            .expect("manifest should materialize");

        let labels = pod.metadata.labels.expect("labels present");
        assert_eq!(
            labels.get(COMPONENT_LABEL),
            Some(&"trainer-ab12-head".to_string())
        );
    }

    #[test]
    fn test_prepare_unit_manifest_rejects_non_object() {
        let template = NodeTemplate::new(serde_json::json!("not-a-manifest"));
        let err = prepare_unit_manifest(
            &template,
            &ClusterName::new("c-ab12"),
            "gantry-nodes",
            &Tags::new(),
        )
        .expect_err("non-object template must be rejected");
        assert!(matches!(err, NodeProviderError::InvalidTemplate { .. }));
    }

    #[test]
    fn test_prepare_service_manifest_selects_batch_uuid() {
        let service_template = serde_json::json!({
            "spec": {
                "ports": [{"port": 22, "targetPort": 22}],
                "selector": {"stale": "selector"}
            }
        });

        let service = prepare_service_manifest(&service_template, "trainer-ab12-worker", "batch-1")
            .expect("service should materialize");

        assert_eq!(service.metadata.name.as_deref(), Some("trainer-ab12-worker"));
        let selector = service
            .spec
            .and_then(|s| s.selector)
            .expect("selector present");
        // The stale selector is replaced wholesale by the batch id
        assert_eq!(selector.len(), 1);
        assert_eq!(selector.get(TAG_NODE_UUID), Some(&"batch-1".to_string()));
    }

    #[test]
    fn test_unit_phase_parses_status() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "status": {"phase": "Running"}
        }))
        .expect("pod");
        assert_eq!(KubernetesNodeProvider::unit_phase(&pod), NodePhase::Running);

        let pod: Pod = serde_json::from_value(serde_json::json!({})).expect("pod");
        assert_eq!(KubernetesNodeProvider::unit_phase(&pod), NodePhase::Unknown);
    }
}
