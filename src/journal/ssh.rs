//! `journalctl` run on the host over ssh.
use super::{last_entry, log_text, LogMethod, LogSource, SourceError};
use crate::config::Policy;
use crate::exec::BoundedCommand;
use crate::host::{is_reachable, Host};
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SshJournal {
    ssh: String,
    timeout: Duration,
    probe_timeout: Duration,
}

impl SshJournal {
    pub fn new(ssh: impl Into<String>, timeout: Duration, probe_timeout: Duration) -> Self {
        Self {
            ssh: ssh.into(),
            timeout,
            probe_timeout,
        }
    }

    pub fn from_policy(policy: &Policy, timeout: Duration) -> Self {
        Self::new(policy.paths.ssh.clone(), timeout, policy.timeouts.probe())
    }

    async fn remote(&self, host: &Host, command: String) -> Result<String, SourceError> {
        let out = BoundedCommand::new(&self.ssh)
            .args([host.name.clone(), command])
            .timeout(self.timeout)
            .run()
            .await
            .map_err(|e| SourceError::from_exec(&host.name, e))?;
        if !out.success() {
            return Err(SourceError::Failed {
                host: host.name.clone(),
                status: out.status,
                detail: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout)
    }
}

#[async_trait]
impl LogSource for SshJournal {
    fn method(&self) -> LogMethod {
        LogMethod::Ssh
    }

    async fn is_available(&self, host: &Host) -> bool {
        is_reachable(&self.ssh, &host.name, self.probe_timeout).await
    }

    async fn last_match(&self, host: &Host, pattern: &str) -> Result<Option<String>, SourceError> {
        let command = format!(
            "sudo journalctl --no-pager -n 1 -k -g {}",
            shell_quote(pattern)
        );
        let stdout = self.remote(host, command).await?;
        Ok(last_entry(&stdout))
    }

    async fn kernel_log(&self, host: &Host) -> Result<Option<String>, SourceError> {
        let stdout = self
            .remote(host, "sudo journalctl --no-pager -k -b".to_string())
            .await?;
        Ok(log_text(&stdout))
    }
}

/// Quote `s` for the remote shell ssh hands the command to.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalDelivery;
    use crate::testutil::script;

    fn host() -> Host {
        Host::new("line-xfs-crc", "xfs_crc", JournalDelivery::Ssh)
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("run fstests"), "'run fstests'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_last_match_sends_quoted_query() {
        let dir = tempfile::tempdir().unwrap();
        // Stand-in ssh prints the host and the remote command it was given.
        let ssh = script(dir.path(), "ssh", "#!/bin/sh\necho \"$1|$2\"\n");
        let journal = SshJournal::new(ssh.to_string_lossy(), Duration::from_secs(5), Duration::from_secs(5));
        let line = journal.last_match(&host(), "Linux version").await.unwrap().unwrap();
        assert_eq!(
            line,
            "line-xfs-crc|sudo journalctl --no-pager -n 1 -k -g 'Linux version'"
        );
    }

    #[tokio::test]
    async fn test_kernel_log_reads_current_boot() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = script(dir.path(), "ssh", "#!/bin/sh\necho \"$2\"\n");
        let journal = SshJournal::new(ssh.to_string_lossy(), Duration::from_secs(5), Duration::from_secs(5));
        let log = journal.kernel_log(&host()).await.unwrap().unwrap();
        assert!(log.contains("-k -b"));
    }

    #[tokio::test]
    async fn test_unreachable_host_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = script(dir.path(), "ssh", "#!/bin/sh\necho 'Connection refused' >&2\nexit 255\n");
        let journal = SshJournal::new(ssh.to_string_lossy(), Duration::from_secs(5), Duration::from_secs(5));
        assert!(!journal.is_available(&host()).await);
        let err = journal.kernel_log(&host()).await.unwrap_err();
        assert!(matches!(err, SourceError::Failed { status: Some(255), .. }));
    }

    #[tokio::test]
    async fn test_hung_ssh_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = script(dir.path(), "ssh", "#!/bin/sh\nsleep 30\n");
        let journal = SshJournal::new(ssh.to_string_lossy(), Duration::from_millis(200), Duration::from_secs(5));
        assert!(journal.last_match(&host(), "run fstests").await.unwrap_err().is_timeout());
    }
}
