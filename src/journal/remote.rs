//! Journals uploaded by hosts to the local systemd-journal-remote collector.
//!
//! The collector writes one file per peer address, `remote-<ip>.journal`.
//! When the transport restarts it rotates the live file aside as
//! `remote-<ip>@<seqnum>-<seqnum>.journal~` style names, so a host's log can
//! span several files; all of them are handed to `journalctl --file`.
use super::{last_entry, log_text, LogMethod, LogSource, SourceError};
use crate::config::Policy;
use crate::exec::BoundedCommand;
use crate::host::Host;
use async_trait::async_trait;
use nix::unistd::{getegid, getgroups, Gid, Group};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RemoteJournal {
    dir: PathBuf,
    journalctl: String,
    timeout: Duration,
}

impl RemoteJournal {
    pub fn new(dir: impl Into<PathBuf>, journalctl: impl Into<String>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            journalctl: journalctl.into(),
            timeout,
        }
    }

    pub fn from_policy(policy: &Policy, timeout: Duration) -> Self {
        Self::new(
            policy.paths.remote_journal_dir.clone(),
            policy.paths.journalctl.clone(),
            timeout,
        )
    }

    /// Primary journal for `ip` first, then its split files in name order.
    pub fn journal_files(&self, ip: &str) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let primary = self.dir.join(format!("remote-{ip}.journal"));
        if primary.is_file() {
            files.push(primary);
        }

        let pattern = format!(
            "{}/remote-{}@*",
            glob::Pattern::escape(&self.dir.to_string_lossy()),
            glob::Pattern::escape(ip)
        );
        let mut splits: Vec<PathBuf> = match glob::glob(&pattern) {
            Ok(paths) => paths.flatten().filter(|p| p.is_file()).collect(),
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "bad journal glob");
                Vec::new()
            }
        };
        splits.sort();
        files.extend(splits);
        files
    }

    async fn journalctl(&self, host: &Host, query: &[&str]) -> Result<String, SourceError> {
        let Some(ip) = host.ip.as_deref() else {
            return Err(SourceError::Unavailable {
                host: host.name.clone(),
                reason: "host address unknown".into(),
            });
        };
        let files = self.journal_files(ip);
        if files.is_empty() {
            return Err(SourceError::Unavailable {
                host: host.name.clone(),
                reason: format!("no remote journal for {ip} in {}", self.dir.display()),
            });
        }

        let mut cmd = BoundedCommand::new(&self.journalctl).timeout(self.timeout);
        for file in &files {
            cmd = cmd.arg("--file").arg(file.to_string_lossy());
        }
        let out = cmd
            .args(query.iter().copied())
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
impl LogSource for RemoteJournal {
    fn method(&self) -> LogMethod {
        LogMethod::Remote
    }

    async fn is_available(&self, host: &Host) -> bool {
        host.ip
            .as_deref()
            .map(|ip| !self.journal_files(ip).is_empty())
            .unwrap_or(false)
    }

    async fn last_match(&self, host: &Host, pattern: &str) -> Result<Option<String>, SourceError> {
        let stdout = self
            .journalctl(host, &["--no-pager", "-n", "1", "-k", "-g", pattern])
            .await?;
        Ok(last_entry(&stdout))
    }

    async fn kernel_log(&self, host: &Host) -> Result<Option<String>, SourceError> {
        let stdout = self.journalctl(host, &["--no-pager", "-k"]).await?;
        Ok(log_text(&stdout))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("failed to look up group {group}: {source}")]
    Lookup {
        group: String,
        #[source]
        source: nix::Error,
    },
    #[error("group {0} does not exist; is systemd-journal-remote installed?")]
    MissingGroup(String),
    #[error(
        "you are not in the {0} group, needed to read remote journals; \
         run `sudo usermod -aG {0} $USER` and log in again"
    )]
    NotMember(String),
}

/// Fail unless this process may read the collector's journal files.
pub fn ensure_journal_group(name: &str) -> Result<(), AuthError> {
    let group = Group::from_name(name)
        .map_err(|e| AuthError::Lookup {
            group: name.to_string(),
            source: e,
        })?
        .ok_or_else(|| AuthError::MissingGroup(name.to_string()))?;

    let groups = getgroups().map_err(|e| AuthError::Lookup {
        group: name.to_string(),
        source: e,
    })?;

    if holds_group(group.gid, getegid(), &groups) {
        Ok(())
    } else {
        Err(AuthError::NotMember(name.to_string()))
    }
}

fn holds_group(gid: Gid, egid: Gid, supplementary: &[Gid]) -> bool {
    egid == gid || supplementary.contains(&gid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalDelivery;
    use crate::testutil::script;

    fn host() -> Host {
        Host::new("line-xfs-crc", "xfs_crc", JournalDelivery::SystemdRemote).with_ip("192.168.122.41")
    }

    #[test]
    fn test_journal_files_primary_then_splits() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("remote-192.168.122.41.journal"), "").unwrap();
        std::fs::write(dir.path().join("remote-192.168.122.41@0002.journal~"), "").unwrap();
        std::fs::write(dir.path().join("remote-192.168.122.41@0001.journal~"), "").unwrap();
        std::fs::write(dir.path().join("remote-192.168.122.4.journal"), "").unwrap();

        let journal = RemoteJournal::new(dir.path(), "journalctl", Duration::from_secs(5));
        let names: Vec<String> = journal
            .journal_files("192.168.122.41")
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "remote-192.168.122.41.journal",
                "remote-192.168.122.41@0001.journal~",
                "remote-192.168.122.41@0002.journal~",
            ]
        );
        assert!(journal.journal_files("10.0.0.9").is_empty());
    }

    #[tokio::test]
    async fn test_all_files_passed_to_journalctl() {
        let dir = tempfile::tempdir().unwrap();
        let journals = dir.path().join("remote");
        std::fs::create_dir(&journals).unwrap();
        std::fs::write(journals.join("remote-192.168.122.41.journal"), "").unwrap();
        std::fs::write(journals.join("remote-192.168.122.41@01.journal~"), "").unwrap();

        // Echo the arguments back so the test can see them.
        let journalctl = script(dir.path(), "journalctl", "#!/bin/sh\necho \"$@\"\n");
        let journal = RemoteJournal::new(&journals, journalctl.to_string_lossy(), Duration::from_secs(5));
        let line = journal.last_match(&host(), "Linux version").await.unwrap().unwrap();
        assert_eq!(line.matches("--file").count(), 2);
        assert!(line.contains("-n 1 -k -g Linux version"));
    }

    #[tokio::test]
    async fn test_no_entries_is_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("remote-192.168.122.41.journal"), "").unwrap();
        let journalctl = script(dir.path(), "jctl", "#!/bin/sh\necho '-- No entries --'\n");
        let journal = RemoteJournal::new(dir.path(), journalctl.to_string_lossy(), Duration::from_secs(5));
        assert!(journal.last_match(&host(), "Linux version").await.unwrap().is_none());
        assert!(journal.kernel_log(&host()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_journal_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RemoteJournal::new(dir.path(), "journalctl", Duration::from_secs(5));
        assert!(!journal.is_available(&host()).await);
        let err = journal.kernel_log(&host()).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { .. }));

        let no_ip = Host::new("h", "s", JournalDelivery::SystemdRemote);
        assert!(!journal.is_available(&no_ip).await);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("remote-192.168.122.41.journal"), "").unwrap();
        let journalctl = script(dir.path(), "jctl", "#!/bin/sh\necho corrupt >&2\nexit 1\n");
        let journal = RemoteJournal::new(dir.path(), journalctl.to_string_lossy(), Duration::from_secs(5));
        let err = journal.kernel_log(&host()).await.unwrap_err();
        assert!(matches!(err, SourceError::Failed { status: Some(1), .. }));
    }

    #[tokio::test]
    async fn test_slow_journalctl_times_out() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("remote-192.168.122.41.journal"), "").unwrap();
        let journalctl = script(dir.path(), "jctl", "#!/bin/sh\nsleep 30\n");
        let journal = RemoteJournal::new(dir.path(), journalctl.to_string_lossy(), Duration::from_millis(200));
        let err = journal.last_match(&host(), "run fstests").await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_holds_group() {
        let gid = Gid::from_raw(990);
        assert!(holds_group(gid, Gid::from_raw(990), &[]));
        assert!(holds_group(gid, Gid::from_raw(1000), &[Gid::from_raw(10), gid]));
        assert!(!holds_group(gid, Gid::from_raw(1000), &[Gid::from_raw(10)]));
    }

    #[test]
    fn test_missing_group() {
        let err = ensure_journal_group("no-such-group-hostwatch").unwrap_err();
        assert!(matches!(err, AuthError::MissingGroup(_)));
    }

    #[test]
    fn test_not_member_message_has_remediation() {
        let msg = AuthError::NotMember("systemd-journal-remote".into()).to_string();
        assert!(msg.contains("usermod -aG systemd-journal-remote"));
    }
}
