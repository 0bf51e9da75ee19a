//! SSH command runner
//!
//! Remote-execution handle bound to one node's resolved user, address, and
//! port. Owns its timeout policy instead of inheriting a caller-wide value:
//! the liveness probe gets more slack than the default because clusters are
//! sometimes reached over VPN from far away, while ordinary commands keep a
//! generous post-setup budget.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use gantry_domain::{CommandRunner, NodeId, NodeProviderError, Result};

/// Budget for ordinary commands once the node is reachable.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Budget for the `uptime` liveness probe.
pub const LIVENESS_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Per-command timeout table with a default.
#[derive(Debug, Clone)]
pub struct CommandTimeouts {
    default: Duration,
    per_command: HashMap<String, Duration>,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        let mut per_command = HashMap::new();
        per_command.insert("uptime".to_string(), LIVENESS_PROBE_TIMEOUT);
        Self {
            default: DEFAULT_COMMAND_TIMEOUT,
            per_command,
        }
    }
}

impl CommandTimeouts {
    pub fn for_command(&self, command: &str) -> Duration {
        self.per_command
            .get(command)
            .copied()
            .unwrap_or(self.default)
    }

    pub fn set(&mut self, command: impl Into<String>, timeout: Duration) {
        self.per_command.insert(command.into(), timeout);
    }
}

/// SSH-backed [`CommandRunner`] for one node.
#[derive(Debug, Clone)]
pub struct SshCommandRunner {
    node_id: NodeId,
    ssh_user: String,
    address: String,
    port: i32,
    ssh_private_key: Option<String>,
    timeouts: CommandTimeouts,
}

impl SshCommandRunner {
    pub fn new(
        node_id: NodeId,
        ssh_user: impl Into<String>,
        address: impl Into<String>,
        port: i32,
    ) -> Self {
        Self {
            node_id,
            ssh_user: ssh_user.into(),
            address: address.into(),
            port,
            ssh_private_key: None,
            timeouts: CommandTimeouts::default(),
        }
    }

    pub fn with_private_key(mut self, key: Option<String>) -> Self {
        self.ssh_private_key = key;
        self
    }

    pub fn with_timeouts(mut self, timeouts: CommandTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn port(&self) -> i32 {
        self.port
    }

    pub fn set_port(&mut self, port: i32) {
        self.port = port;
    }

    fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "IdentitiesOnly=yes".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS),
            "-p".into(),
            self.port.to_string(),
        ];
        if let Some(key) = &self.ssh_private_key {
            args.push("-i".into());
            args.push(key.clone());
        }
        args.push(format!("{}@{}", self.ssh_user, self.address));
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl CommandRunner for SshCommandRunner {
    async fn run(&self, command: &str) -> Result<String> {
        let timeout = self.timeouts.for_command(command);
        debug!(
            node_id = %self.node_id,
            address = %self.address,
            port = self.port,
            ?timeout,
            "running remote command"
        );

        let output = tokio::time::timeout(
            timeout,
            Command::new("ssh").args(self.ssh_args(command)).output(),
        )
        .await
        .map_err(|_| NodeProviderError::ExecFailed {
            node_id: self.node_id.to_string(),
            message: format!("command '{}' timed out after {:?}", command, timeout),
        })?
        .map_err(|e| NodeProviderError::ExecFailed {
            node_id: self.node_id.to_string(),
            message: format!("failed to spawn ssh: {}", e),
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(NodeProviderError::ExecFailed {
                node_id: self.node_id.to_string(),
                message: format!(
                    "command '{}' exited with {}: {}",
                    command,
                    output.status,
                    combined.trim()
                ),
            });
        }
        Ok(combined)
    }
}

// ============================================================================
// Tests
// ============================================================================
