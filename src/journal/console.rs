//! Hypervisor console captures under `guestfs/<host>/console.log*`.
//!
//! The console sees everything the kernel printed, including the final
//! moments of a crash that never made it to disk or over the network.
use super::{LogMethod, LogSource, SourceError};
use crate::config::{Policy, WatchdogConfig};
use crate::exec::BoundedCommand;
use crate::host::Host;
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

static CONSOLE_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[\s*\d+\.\d+\]").unwrap());

#[derive(Debug, Clone)]
pub struct ConsoleLog {
    guestfs_dir: PathBuf,
    sudo: String,
    /// libvirt's system instance leaves console files owned by root.
    take_ownership: bool,
    timeout: Duration,
}

impl ConsoleLog {
    pub fn new(guestfs_dir: impl Into<PathBuf>, sudo: impl Into<String>, take_ownership: bool, timeout: Duration) -> Self {
        Self {
            guestfs_dir: guestfs_dir.into(),
            sudo: sudo.into(),
            take_ownership,
            timeout,
        }
    }

    pub fn from_config(config: &WatchdogConfig, policy: &Policy) -> Self {
        Self::new(
            config.guestfs_dir(),
            policy.paths.sudo.clone(),
            config.libvirt_uri_system,
            policy.timeouts.probe(),
        )
    }

    /// Console files for `host`, oldest first.
    pub fn console_files(&self, host: &str) -> Vec<PathBuf> {
        let pattern = format!(
            "{}/console.log*",
            glob::Pattern::escape(&self.guestfs_dir.join(host).to_string_lossy())
        );
        let mut files: Vec<(SystemTime, PathBuf)> = match glob::glob(&pattern) {
            Ok(paths) => paths
                .flatten()
                .filter(|p| p.is_file())
                .map(|p| {
                    let mtime = p
                        .metadata()
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    (mtime, p)
                })
                .collect(),
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "bad console glob");
                Vec::new()
            }
        };
        files.sort();
        files.into_iter().map(|(_, p)| p).collect()
    }

    async fn read_file(&self, host: &Host, path: &Path) -> Result<Vec<u8>, SourceError> {
        let unreadable = |e: std::io::Error| SourceError::Unavailable {
            host: host.name.clone(),
            reason: format!("cannot read {}: {e}", path.display()),
        };

        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied && self.take_ownership => {
                tracing::info!(host = %host.name, path = %path.display(), "console log not readable, taking ownership");
                self.chown(host, path).await?;
                tokio::fs::read(path).await.map_err(unreadable)
            }
            Err(e) => Err(unreadable(e)),
        }
    }

    async fn chown(&self, host: &Host, path: &Path) -> Result<(), SourceError> {
        let owner = format!("{}:{}", nix::unistd::getuid(), nix::unistd::getgid());
        let out = BoundedCommand::new(&self.sudo)
            .args(["chown".to_string(), owner, path.to_string_lossy().into_owned()])
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
        Ok(())
    }

    async fn read_log(&self, host: &Host) -> Result<Option<String>, SourceError> {
        let files = self.console_files(&host.name);
        if files.is_empty() {
            return Err(SourceError::Unavailable {
                host: host.name.clone(),
                reason: format!("no console log under {}", self.guestfs_dir.join(&host.name).display()),
            });
        }

        let mut text = String::new();
        for file in &files {
            let bytes = self.read_file(host, file).await?;
            text.push_str(&String::from_utf8_lossy(&bytes));
            if !text.ends_with('\n') {
                text.push('\n');
            }
        }

        let log = normalize_console(&host.name, &text);
        Ok(if log.is_empty() { None } else { Some(log) })
    }
}

/// Keep the last boot's lines and give kernel lines a journal-like prefix.
///
/// `[   12.345678] XFS (vda): Mounting` becomes
/// `<host> kernel: [   12.345678] XFS (vda): Mounting`, so signature and
/// marker matching behave the same as on journal output.
pub fn normalize_console(host: &str, text: &str) -> String {
    let lines: Vec<&str> = text
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .collect();
    let boot = lines
        .iter()
        .rposition(|l| l.contains("Linux version"))
        .unwrap_or(0);

    let mut out = String::new();
    for line in &lines[boot..] {
        if CONSOLE_LINE_RE.is_match(line) {
            out.push_str(host);
            out.push_str(" kernel: ");
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[async_trait]
impl LogSource for ConsoleLog {
    fn method(&self) -> LogMethod {
        LogMethod::Console
    }

    async fn is_available(&self, host: &Host) -> bool {
        !self.console_files(&host.name).is_empty()
    }

    async fn last_match(&self, host: &Host, pattern: &str) -> Result<Option<String>, SourceError> {
        let log = self.read_log(host).await?;
        Ok(log.and_then(|log| {
            log.lines()
                .rev()
                .find(|l| l.contains(pattern))
                .map(str::to_string)
        }))
    }

    async fn kernel_log(&self, host: &Host) -> Result<Option<String>, SourceError> {
        self.read_log(host).await
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
    fn test_normalize_keeps_last_boot() {
        let text = "\
[    0.000000] Linux version 6.7.0 (old boot)
[   10.000000] old message
[    0.000000] Linux version 6.8.0 (new boot)\r
[    1.500000] XFS (vda): Mounting V5 Filesystem

line-xfs login:
";
        let log = normalize_console("line-xfs", text);
        assert_eq!(
            log,
            "line-xfs kernel: [    0.000000] Linux version 6.8.0 (new boot)\n\
             line-xfs kernel: [    1.500000] XFS (vda): Mounting V5 Filesystem\n\
             line-xfs login:\n"
        );
    }

    #[test]
    fn test_normalize_without_banner_keeps_everything() {
        let log = normalize_console("h", "[ 1.0] a\n[ 2.0] b\n");
        assert_eq!(log.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_files_concatenated_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let host_dir = dir.path().join("line-xfs");
        std::fs::create_dir(&host_dir).unwrap();
        let old = host_dir.join("console.log.1");
        let new = host_dir.join("console.log");
        std::fs::write(&old, "[    0.000000] Linux version 6.8.0\n[    5.000000] first\n").unwrap();
        std::fs::write(&new, "[   50.000000] second\n").unwrap();
        filetime::set_file_mtime(&old, filetime::FileTime::from_unix_time(1_000, 0)).unwrap();
        filetime::set_file_mtime(&new, filetime::FileTime::from_unix_time(2_000, 0)).unwrap();

        let console = ConsoleLog::new(dir.path(), "sudo", false, Duration::from_secs(5));
        assert_eq!(console.console_files("line-xfs"), vec![old, new]);

        let log = console.kernel_log(&host()).await.unwrap().unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with("first"));
        assert!(lines[2].ends_with("second"));

        let last = console.last_match(&host(), "Linux version").await.unwrap().unwrap();
        assert!(last.starts_with("line-xfs kernel: "));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_decoded_lossily() {
        let dir = tempfile::tempdir().unwrap();
        let host_dir = dir.path().join("line-xfs");
        std::fs::create_dir(&host_dir).unwrap();
        std::fs::write(host_dir.join("console.log"), b"[ 1.0] bad \xff byte\n").unwrap();

        let console = ConsoleLog::new(dir.path(), "sudo", false, Duration::from_secs(5));
        let log = console.kernel_log(&host()).await.unwrap().unwrap();
        assert!(log.contains("bad \u{fffd} byte"));
    }

    #[tokio::test]
    async fn test_missing_console_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let console = ConsoleLog::new(dir.path(), "sudo", false, Duration::from_secs(5));
        assert!(!console.is_available(&host()).await);
        assert!(matches!(
            console.kernel_log(&host()).await.unwrap_err(),
            SourceError::Unavailable { .. }
        ));
    }
}
