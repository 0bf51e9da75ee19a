// Shared Kernel - Tipos base y errores compartidos entre bounded contexts

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identificador opaco de un nodo (el nombre de su unidad de trabajo)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Length of the user-hash suffix appended to cluster names.
///
/// Cluster names carry a trailing `-<hash>` segment so that different users
/// can launch clusters with the same display name. The persisted cluster
/// file is keyed by the display name, so the suffix must be stripped when
/// recovering the file path.
pub const USER_HASH_LENGTH: usize = 4;

/// Nombre de un cluster, incluyendo el sufijo de hash de usuario
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterName(pub String);

impl ClusterName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The cluster name without the trailing `-<hash>` suffix.
    ///
    /// Names shorter than the suffix are returned unchanged.
    pub fn display_name(&self) -> &str {
        let suffix_len = USER_HASH_LENGTH + 1;
        if self.0.len() > suffix_len {
            &self.0[..self.0.len() - suffix_len]
        } else {
            &self.0
        }
    }
}

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClusterName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClusterName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Label/tag mapping attached to a node. Also used as a query selector.
pub type Tags = BTreeMap<String, String>;

// ============================================================================
// Well-known tag keys
// ============================================================================

/// Cluster-identity tag, injected into every node at creation.
pub const TAG_CLUSTER_NAME: &str = "gantry.io/cluster-name";

/// Per-provisioning-batch unique-id tag; also the selector of the batch's
/// routing services.
pub const TAG_NODE_UUID: &str = "gantry.io/node-uuid";

/// Node-kind tag; value [`NODE_KIND_HEAD`] marks the head node.
pub const TAG_NODE_KIND: &str = "gantry.io/node-kind";

/// Value of [`TAG_NODE_KIND`] for the head node of a cluster.
pub const NODE_KIND_HEAD: &str = "head";

/// Component label consumed by the externally configured head ingress
/// service.
pub const COMPONENT_LABEL: &str = "cluster.gantry.io/component";

/// Template label naming the cluster's SSH bridge unit.
pub const SSH_BRIDGE_LABEL: &str = "gantry.io/ssh-bridge";

/// Sentinel echoed by the remote privilege probe when the unit's default
/// user has neither root nor passwordless sudo.
pub const INSUFFICIENT_PRIVILEGES_CODE: i32 = 52;

// ============================================================================
// Phases
// ============================================================================

/// Coarse lifecycle state of a unit as reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodePhase {
    Pending,
    Running,
    Failed,
    Unknown,
    Succeeded,
    Terminating,
}

impl NodePhase {
    /// Parse a control-plane phase string. Unrecognized values map to
    /// `Unknown`.
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => NodePhase::Pending,
            "Running" => NodePhase::Running,
            "Failed" => NodePhase::Failed,
            "Succeeded" => NodePhase::Succeeded,
            "Terminating" => NodePhase::Terminating,
            _ => NodePhase::Unknown,
        }
    }

    /// A node counts as live while it is `Pending` or `Running`.
    pub fn is_live(&self) -> bool {
        matches!(self, NodePhase::Pending | NodePhase::Running)
    }

    /// Terminated is the complement of live: any phase outside
    /// {`Running`, `Pending`}.
    pub fn is_terminated(&self) -> bool {
        !self.is_live()
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodePhase::Pending => write!(f, "Pending"),
            NodePhase::Running => write!(f, "Running"),
            NodePhase::Failed => write!(f, "Failed"),
            NodePhase::Unknown => write!(f, "Unknown"),
            NodePhase::Succeeded => write!(f, "Succeeded"),
            NodePhase::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Resource class named by a scheduling-failure diagnosis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Cpu,
    Memory,
    Gpu,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => write!(f, "CPU"),
            ResourceKind::Memory => write!(f, "memory"),
            ResourceKind::Gpu => write!(f, "GPU"),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errores del ciclo de vida de nodos
#[derive(Debug, thiserror::Error)]
pub enum NodeProviderError {
    #[error("conflict while updating tags on node {node_id}")]
    ResourceConflict { node_id: String },

    #[error("node {node_id} not found")]
    NodeNotFound { node_id: String },

    #[error("address {address} not found. Known addresses: {known:?}")]
    AddressNotFound {
        address: String,
        use_internal_address: bool,
        known: Vec<String>,
    },

    #[error(
        "insufficient system privileges in node {node_id}. Ensure the default \
         user has root access or sudo is installed and the user is in sudoers"
    )]
    InsufficientPrivileges { node_id: String },

    #[error("insufficient {kind} capacity on the cluster. {detail}")]
    InsufficientResource { kind: ResourceKind, detail: String },

    #[error("timed out while waiting for nodes to be scheduled. {detail}")]
    SchedulingTimeout {
        phase: Option<NodePhase>,
        detail: String,
    },

    #[error("failed to create container while launching node {node_id}. Error details: {message}")]
    ContainerStartFailure { node_id: String, message: String },

    #[error("remote command failed on node {node_id}: {message}")]
    ExecFailed { node_id: String, message: String },

    #[error("invalid node template: {message}")]
    InvalidTemplate { message: String },

    #[error("cluster config error: {message}")]
    ClusterConfig { message: String },

    #[error("control plane error: {message}")]
    ControlPlane { message: String },
}

pub type Result<T> = std::result::Result<T, NodeProviderError>;
