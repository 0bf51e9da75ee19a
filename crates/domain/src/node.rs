// Node aggregate - plantillas y configuración de acceso

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::shared_kernel::{COMPONENT_LABEL, ClusterName, SSH_BRIDGE_LABEL, Tags};

/// Template for one provisioning batch.
///
/// The unit manifest is backend-shaped (the Kubernetes backend deserializes
/// it into a typed `Pod` after injecting labels and namespace), so the domain
/// keeps it as a JSON value. It is cloned before every mutation so templates
/// can be reused across invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTemplate {
    /// Workload-unit manifest.
    pub unit: Value,
    /// Optional per-node routing-service manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Value>,
}

impl NodeTemplate {
    pub fn new(unit: Value) -> Self {
        Self {
            unit,
            service: None,
        }
    }

    pub fn with_service(mut self, service: Value) -> Self {
        self.service = Some(service);
        self
    }

    /// Labels declared on the unit manifest's metadata.
    pub fn unit_labels(&self) -> Tags {
        self.unit
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Name of the cluster's SSH bridge unit, declared on the template via
    /// the [`SSH_BRIDGE_LABEL`] label.
    pub fn bridge_unit_name(&self) -> Option<String> {
        self.unit_labels().get(SSH_BRIDGE_LABEL).cloned()
    }
}

/// Static SSH authentication configuration supplied by the caller.
///
/// The username may be stale: bootstrap rewrites the authoritative value
/// into the persisted cluster file, and the command-runner factory reloads
/// it from there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub ssh_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_private_key: Option<String>,
}

/// Selector for the externally configured head ingress service.
pub fn head_service_selector(cluster_name: &ClusterName) -> Tags {
    let mut selector = Tags::new();
    selector.insert(
        COMPONENT_LABEL.to_string(),
        format!("{}-head", cluster_name),
    );
    selector
}
