//! In-unit command execution and SSH bootstrap
//!
//! Brings a freshly scheduled unit into an SSH-reachable, environment-correct
//! state. Stages run in a fixed order against worker units only; the bridge
//! unit ships pre-configured and is skipped.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use tokio::io::AsyncReadExt;
use tracing::{error, info};

use gantry_domain::{INSUFFICIENT_PRIVILEGES_CODE, NodeProviderError, Result};

/// Installs an SSH server and rsync, enables root login, relaxes the PAM
/// loginuid restriction so exec'd sessions can log in, generates host keys,
/// installs the cluster's public key from the mounted secret, and restarts
/// the service. `prefix_cmd` resolves to `sudo` for non-root image users.
const SETUP_SSH_SCRIPT: &str = r#"prefix_cmd() { if [ $(id -u) -ne 0 ]; then echo "sudo"; else echo ""; fi; }; export DEBIAN_FRONTEND=noninteractive; $(prefix_cmd) apt-get update; $(prefix_cmd) apt install openssh-server rsync -y; $(prefix_cmd) mkdir -p /var/run/sshd; $(prefix_cmd) sed -i "s/PermitRootLogin prohibit-password/PermitRootLogin yes/" /etc/ssh/sshd_config; $(prefix_cmd) sed "s@session\s*required\s*pam_loginuid.so@session optional pam_loginuid.so@g" -i /etc/pam.d/sshd; cd /etc/ssh/ && $(prefix_cmd) ssh-keygen -A; $(prefix_cmd) mkdir -p ~/.ssh; $(prefix_cmd) cat /etc/secret-volume/ssh-publickey* > ~/.ssh/authorized_keys; $(prefix_cmd) service ssh restart"#;

/// Captures the unit's runtime environment (service discovery endpoints,
/// accelerator runtime variables injected by the control plane) into a
/// profile fragment so every future shell session inherits it.
const SET_ENV_VARS_SCRIPT: &str = r#"prefix_cmd() { if [ $(id -u) -ne 0 ]; then echo "sudo"; else echo ""; fi; } && printenv | awk -F "=" '{print "export " $1 "=\047" $2 "\047"}' > ~/gantry_env_vars.sh && mv ~/gantry_env_vars.sh /etc/profile.d/gantry_env_vars.sh || $(prefix_cmd) mv ~/gantry_env_vars.sh /etc/profile.d/gantry_env_vars.sh"#;

/// Succeeds silently for root (and aliases sudo away for later setup
/// scripts), confirms non-interactive sudo for everyone else, and echoes
/// the sentinel code when neither holds.
fn privilege_check_script() -> String {
    format!(
        "if [ $(id -u) -eq 0 ]; then \
           echo 'alias sudo=\"\"' >> ~/.bashrc; \
         else \
           if command -v sudo >/dev/null 2>&1; then \
             timeout 2 sudo -l >/dev/null 2>&1 || ( echo {code}; ); \
           else \
             ( echo {code}; ); \
           fi; \
         fi",
        code = INSUFFICIENT_PRIVILEGES_CODE
    )
}

/// Run a shell script inside a unit and return its combined output.
pub(crate) async fn run_command_in_unit(
    units: &Api<Pod>,
    node_name: &str,
    script: &str,
) -> Result<String> {
    let mut attached = units
        .exec(
            node_name,
            vec!["/bin/sh", "-c", script],
            &AttachParams::default(),
        )
        .await
        .map_err(|e| NodeProviderError::ExecFailed {
            node_id: node_name.to_string(),
            message: format!("failed to start exec: {}", e),
        })?;

    let stdout = attached.stdout();
    let stderr = attached.stderr();
    let stdout_fut = async {
        let mut buf = String::new();
        if let Some(mut reader) = stdout {
            let _ = reader.read_to_string(&mut buf).await;
        }
        buf
    };
    let stderr_fut = async {
        let mut buf = String::new();
        if let Some(mut reader) = stderr {
            let _ = reader.read_to_string(&mut buf).await;
        }
        buf
    };
    let (mut output, err_output) = tokio::join!(stdout_fut, stderr_fut);
    output.push_str(&err_output);

    if let Err(e) = attached.join().await {
        return Err(NodeProviderError::ExecFailed {
            node_id: node_name.to_string(),
            message: format!("exec did not complete cleanly: {}", e),
        });
    }
    Ok(output.trim().to_string())
}

/// Verify the image's default user can set the unit up: root, or a user
/// with non-interactive sudo. Fails fast with `InsufficientPrivileges`
/// when the probe echoes its sentinel.
pub(crate) async fn check_user_privilege(units: &Api<Pod>, nodes: &[String]) -> Result<()> {
    let script = privilege_check_script();
    let sentinel = INSUFFICIENT_PRIVILEGES_CODE.to_string();
    for node in nodes {
        let output = run_command_in_unit(units, node, &script).await?;
        if output.contains(&sentinel) {
            return Err(NodeProviderError::InsufficientPrivileges {
                node_id: node.clone(),
            });
        }
    }
    Ok(())
}

/// Install and configure the SSH server in each worker unit. Failures are
/// logged and do not abort provisioning; a worker that lost this stage
/// surfaces later as unreachable rather than failing the whole batch.
pub(crate) async fn setup_ssh_in_units(units: &Api<Pod>, nodes: &[String]) {
    for node in nodes {
        match run_command_in_unit(units, node, SETUP_SSH_SCRIPT).await {
            Ok(_) => info!(node_id = %node, "ssh server configured"),
            Err(e) => error!(node_id = %node, error = %e, "failed to set up ssh in unit"),
        }
    }
}

/// Export the unit's runtime environment into a profile fragment. Same
/// best-effort policy as SSH setup.
pub(crate) async fn set_env_vars_in_units(units: &Api<Pod>, nodes: &[String]) {
    for node in nodes {
        match run_command_in_unit(units, node, SET_ENV_VARS_SCRIPT).await {
            Ok(_) => info!(node_id = %node, "environment variables exported"),
            Err(e) => error!(node_id = %node, error = %e, "failed to export environment variables"),
        }
    }
}

/// Discover the actual remote username. Runs after SSH setup because
/// image-specific default users are only authoritative once setup has
/// completed. All units in a batch share an image, so the last answer wins.
pub(crate) async fn fetch_ssh_user(units: &Api<Pod>, nodes: &[String]) -> Result<Option<String>> {
    let mut ssh_user = None;
    for node in nodes {
        let output = run_command_in_unit(units, node, "echo $(whoami)").await?;
        ssh_user = Some(output.trim().to_string());
    }
    Ok(ssh_user)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privilege_script_echoes_sentinel() {
        let script = privilege_check_script();
        assert!(script.contains(&INSUFFICIENT_PRIVILEGES_CODE.to_string()));
        // Non-interactive sudo probe is bounded
        assert!(script.contains("timeout 2 sudo -l"));
    }

    #[test]
    fn test_setup_script_configures_sshd() {
        assert!(SETUP_SSH_SCRIPT.contains("apt install openssh-server rsync -y"));
        assert!(SETUP_SSH_SCRIPT.contains("PermitRootLogin yes"));
        assert!(SETUP_SSH_SCRIPT.contains("pam_loginuid.so"));
        assert!(SETUP_SSH_SCRIPT.contains("ssh-keygen -A"));
        assert!(SETUP_SSH_SCRIPT.contains("/etc/secret-volume/ssh-publickey"));
        assert!(SETUP_SSH_SCRIPT.contains("service ssh restart"));
    }

    #[test]
    fn test_env_script_writes_profile_fragment() {
        assert!(SET_ENV_VARS_SCRIPT.contains("printenv"));
        assert!(SET_ENV_VARS_SCRIPT.contains("/etc/profile.d/gantry_env_vars.sh"));
    }
}
