//! Resetting a crashed host.
use crate::config::{Policy, WatchdogConfig};
use crate::exec::{BoundedCommand, ExecError};
use crate::host::{wait_for_ssh, Host};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// What happened about resetting a host during one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "kebab-case")]
pub enum ResetOutcome {
    /// No new crash, nothing to do.
    #[default]
    NotNeeded,
    /// A new crash was found but resets are turned off.
    Disabled,
    Reset,
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ResetError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("reset command exited with {status:?}: {detail}")]
    Failed { status: Option<i32>, detail: String },
    #[error("reset is not supported for this provider")]
    Unsupported,
}

#[async_trait]
pub trait HostControl: Send + Sync {
    async fn reset(&self, host: &Host) -> Result<(), ResetError>;

    /// Block until the host is reachable again; false if it never came back.
    async fn wait_for_ssh(&self, _host: &Host) -> bool {
        true
    }
}

/// libvirt guests, reset with `virsh reset`.
#[derive(Debug, Clone)]
pub struct VirshControl {
    virsh: String,
    /// Prefix with sudo; needed for the libvirt system instance.
    sudo: Option<String>,
    ssh: String,
    timeout: Duration,
    probe_timeout: Duration,
    ssh_wait: Duration,
}

impl VirshControl {
    pub fn from_policy(policy: &Policy, use_sudo: bool) -> Self {
        Self {
            virsh: policy.paths.virsh.clone(),
            sudo: use_sudo.then(|| policy.paths.sudo.clone()),
            ssh: policy.paths.ssh.clone(),
            timeout: policy.timeouts.reset(),
            probe_timeout: policy.timeouts.probe(),
            ssh_wait: policy.timeouts.ssh_wait(),
        }
    }

    fn command(&self, host: &Host) -> BoundedCommand {
        let cmd = match &self.sudo {
            Some(sudo) => BoundedCommand::new(sudo).arg(&self.virsh),
            None => BoundedCommand::new(&self.virsh),
        };
        cmd.args(["reset", host.name.as_str()]).timeout(self.timeout)
    }
}

#[async_trait]
impl HostControl for VirshControl {
    async fn reset(&self, host: &Host) -> Result<(), ResetError> {
        let cmd = self.command(host);
        tracing::info!(host = %host.name, command = %cmd.command_line(), "resetting host");
        let out = cmd.run().await?;
        if !out.success() {
            return Err(ResetError::Failed {
                status: out.status,
                detail: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn wait_for_ssh(&self, host: &Host) -> bool {
        wait_for_ssh(&self.ssh, &host.name, self.probe_timeout, self.ssh_wait).await
    }
}

/// Providers the watchdog cannot reset.
#[derive(Debug, Clone, Default)]
pub struct UnsupportedControl;

#[async_trait]
impl HostControl for UnsupportedControl {
    async fn reset(&self, _host: &Host) -> Result<(), ResetError> {
        Err(ResetError::Unsupported)
    }
}

pub fn control_for(config: &WatchdogConfig, policy: &Policy) -> Arc<dyn HostControl> {
    if config.libvirt {
        Arc::new(VirshControl::from_policy(policy, config.libvirt_uri_system))
    } else {
        Arc::new(UnsupportedControl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalDelivery;

    fn host() -> Host {
        Host::new("line-xfs", "xfs", JournalDelivery::Ssh)
    }

    #[test]
    fn test_virsh_command_line() {
        let policy = Policy::default();
        let plain = VirshControl::from_policy(&policy, false);
        assert_eq!(plain.command(&host()).command_line(), "virsh reset line-xfs");
        let system = VirshControl::from_policy(&policy, true);
        assert_eq!(system.command(&host()).command_line(), "sudo virsh reset line-xfs");
    }

    #[tokio::test]
    async fn test_reset_failure_reports_status() {
        let mut policy = Policy::default();
        policy.paths.virsh = "false".into();
        let control = VirshControl::from_policy(&policy, false);
        assert!(matches!(
            control.reset(&host()).await.unwrap_err(),
            ResetError::Failed { status: Some(1), .. }
        ));

        policy.paths.virsh = "true".into();
        let control = VirshControl::from_policy(&policy, false);
        control.reset(&host()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_provider() {
        assert!(matches!(
            UnsupportedControl.reset(&host()).await.unwrap_err(),
            ResetError::Unsupported
        ));
    }

    #[test]
    fn test_outcome_json() {
        let json = serde_json::to_value(ResetOutcome::Failed("boom".into())).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["detail"], "boom");
        assert_eq!(serde_json::to_value(ResetOutcome::NotNeeded).unwrap()["outcome"], "not-needed");
    }
}
