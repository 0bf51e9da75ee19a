//! Persisted cluster configuration file
//!
//! One text file per cluster carries the launch configuration, including the
//! SSH username. Bootstrap rewrites the username in place once the image's
//! actual user is known; everything else in the file must survive the
//! rewrite byte for byte.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use gantry_domain::{ClusterName, NodeProviderError, Result};

/// Directory of per-cluster files, keyed by display name.
pub const CLUSTER_FILES_DIR: &str = "~/.gantry/clusters";

/// Fallback used when the per-cluster file is absent, which happens when
/// running from inside the cluster itself.
pub const REMOTE_CLUSTER_FILE: &str = "~/.gantry/cluster.yml";

/// SSH credentials read back out of the cluster file.
#[derive(Debug, Clone)]
pub struct SshCredentials {
    pub ssh_user: String,
    pub ssh_private_key: Option<String>,
}

#[derive(Deserialize)]
struct ClusterFileDoc {
    auth: AuthSection,
}

#[derive(Deserialize)]
struct AuthSection {
    ssh_user: String,
    #[serde(default)]
    ssh_private_key: Option<String>,
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Resolve the cluster's configuration file.
///
/// The cluster name carries a user-hash suffix that the file name does not;
/// strip it, then fall back to the well-known in-cluster path when the
/// per-cluster file does not exist.
pub fn cluster_file_path(cluster_name: &ClusterName) -> PathBuf {
    cluster_file_path_in(
        &expand_tilde(CLUSTER_FILES_DIR),
        &expand_tilde(REMOTE_CLUSTER_FILE),
        cluster_name,
    )
}

fn cluster_file_path_in(
    files_dir: &Path,
    remote_fallback: &Path,
    cluster_name: &ClusterName,
) -> PathBuf {
    let candidate = files_dir.join(format!("{}.yml", cluster_name.display_name()));
    if candidate.exists() {
        candidate
    } else {
        remote_fallback.to_path_buf()
    }
}

/// Rewrite the `ssh_user: <value>` line in place, leaving every other byte
/// of the file untouched.
pub fn rewrite_ssh_user(path: &Path, ssh_user: &str) -> Result<()> {
    let content = fs::read_to_string(path).map_err(|e| NodeProviderError::ClusterConfig {
        message: format!("failed to read cluster file {}: {}", path.display(), e),
    })?;
    let rewritten = rewrite_ssh_user_content(&content, ssh_user);
    fs::write(path, rewritten).map_err(|e| NodeProviderError::ClusterConfig {
        message: format!("failed to write cluster file {}: {}", path.display(), e),
    })
}

fn rewrite_ssh_user_content(content: &str, ssh_user: &str) -> String {
    content
        .split_inclusive('\n')
        .map(|line| rewrite_ssh_user_line(line, ssh_user))
        .collect()
}

fn rewrite_ssh_user_line(line: &str, ssh_user: &str) -> String {
    let indent_len = line.len() - line.trim_start().len();
    let (indent, body) = line.split_at(indent_len);
    let Some(value_part) = body.strip_prefix("ssh_user:") else {
        return line.to_string();
    };
    let spaces_len = value_part.len() - value_part.trim_start().len();
    let (spaces, value) = value_part.split_at(spaces_len);
    let word_len = value
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .map(|c| c.len_utf8())
        .sum::<usize>();
    if word_len == 0 {
        return line.to_string();
    }
    format!("{indent}ssh_user:{spaces}{ssh_user}{}", &value[word_len..])
}

/// Read the SSH credentials out of a cluster file's `auth` section.
pub fn ssh_credentials(path: &Path) -> Result<SshCredentials> {
    let content = fs::read_to_string(path).map_err(|e| NodeProviderError::ClusterConfig {
        message: format!("failed to read cluster file {}: {}", path.display(), e),
    })?;
    let doc: ClusterFileDoc =
        serde_yaml::from_str(&content).map_err(|e| NodeProviderError::ClusterConfig {
            message: format!("failed to parse cluster file {}: {}", path.display(), e),
        })?;
    Ok(SshCredentials {
        ssh_user: doc.auth.ssh_user,
        ssh_private_key: doc.auth.ssh_private_key,
    })
}

// ============================================================================
// Tests
// ============================================================================
