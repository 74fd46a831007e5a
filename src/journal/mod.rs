//! Kernel log sources.
//!
//! A test host's kernel log reaches the watchdog over one of three paths:
//! journal files uploaded to the local systemd-journal-remote collector,
//! `journalctl` over ssh, or the hypervisor's console capture. Each path is a
//! [`LogSource`]; callers pick one (or an ordered list) up front and never
//! care which they got.
pub mod console;
pub mod remote;
pub mod ssh;

use crate::config::{JournalDelivery, Policy, WatchdogConfig};
use crate::exec::ExecError;
use crate::host::Host;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

pub use console::ConsoleLog;
pub use remote::{ensure_journal_group, AuthError, RemoteJournal};
pub use ssh::SshJournal;

/// Format of the timestamp the fstests/blktests runners log with each test.
const MARKER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static KERNEL_VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Linux version (\S+)").unwrap());

/// Which log path the crash detector reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMethod {
    /// Remote journal if enabled, then console if guestfs, then ssh.
    Auto,
    Remote,
    Console,
    Ssh,
}

impl std::fmt::Display for LogMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogMethod::Auto => write!(f, "auto"),
            LogMethod::Remote => write!(f, "remote"),
            LogMethod::Console => write!(f, "console"),
            LogMethod::Ssh => write!(f, "ssh"),
        }
    }
}

/// Outcome of a bounded log query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "lowercase")]
pub enum Probe<T> {
    Found(T),
    /// The query did not finish within its bound.
    Timeout,
    /// The query finished but produced nothing usable.
    Unknown,
}

impl<T> Probe<T> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Probe::Timeout)
    }

    pub fn found(&self) -> Option<&T> {
        match self {
            Probe::Found(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("log query on {host} timed out after {}s", .after.as_secs())]
    Timeout { host: String, after: Duration },
    #[error("log query on {host} failed (exit {status:?}): {detail}")]
    Failed {
        host: String,
        status: Option<i32>,
        detail: String,
    },
    #[error("no log available for {host}: {reason}")]
    Unavailable { host: String, reason: String },
}

impl SourceError {
    pub fn from_exec(host: &str, err: ExecError) -> Self {
        match err {
            ExecError::Timeout { after, .. } => SourceError::Timeout {
                host: host.to_string(),
                after,
            },
            ExecError::Spawn { .. } => SourceError::Unavailable {
                host: host.to_string(),
                reason: err.to_string(),
            },
            ExecError::Io { .. } => SourceError::Failed {
                host: host.to_string(),
                status: None,
                detail: err.to_string(),
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SourceError::Timeout { .. })
    }
}

/// A path to one host's kernel log.
#[async_trait]
pub trait LogSource: Send + Sync {
    fn method(&self) -> LogMethod;

    /// Cheap check that this source can serve `host` at all.
    async fn is_available(&self, _host: &Host) -> bool {
        true
    }

    /// Most recent kernel log line containing `pattern`.
    async fn last_match(&self, host: &Host, pattern: &str) -> Result<Option<String>, SourceError>;

    /// The host's kernel log for the current boot.
    async fn kernel_log(&self, host: &Host) -> Result<Option<String>, SourceError>;
}

/// Test suites whose runners leave `run <suite> <test> at <time>` markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suite {
    Fstests,
    Blktests,
}

impl Suite {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "fstests" => Some(Suite::Fstests),
            "blktests" => Some(Suite::Blktests),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Suite::Fstests => "fstests",
            Suite::Blktests => "blktests",
        }
    }

    /// Text that precedes the test name in a marker line.
    pub fn marker(&self) -> &'static str {
        match self {
            Suite::Fstests => "run fstests",
            Suite::Blktests => "run blktests",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelVersion {
    pub version: String,
    /// Taken from configuration because the logs could not say.
    pub fallback: bool,
}

impl std::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.fallback {
            write!(f, "{} (custom)", self.version)
        } else {
            write!(f, "{}", self.version)
        }
    }
}

/// The last test a host announced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestMarker {
    pub name: String,
    pub started: Option<NaiveDateTime>,
    /// `<test> at <timestamp>` as logged.
    pub raw: String,
}

pub fn parse_kernel_version(line: &str) -> Option<String> {
    KERNEL_VERSION_RE
        .captures(line)
        .map(|caps| caps[1].to_string())
}

/// Parse the part of a log line after `run <suite>`.
pub fn parse_test_marker(line: &str, suite: Suite) -> Option<TestMarker> {
    let idx = line.rfind(suite.marker())?;
    let raw = line[idx + suite.marker().len()..].trim();
    let (name, started) = match raw.split_once(" at ") {
        Some((name, time)) => (
            name.trim(),
            NaiveDateTime::parse_from_str(time.trim(), MARKER_TIME_FORMAT).ok(),
        ),
        None => (raw.split_whitespace().next()?, None),
    };
    if name.is_empty() {
        return None;
    }
    Some(TestMarker {
        name: name.to_string(),
        started,
        raw: raw.to_string(),
    })
}

/// Kernel the host booted, per its most recent `Linux version` banner.
///
/// When the logs cannot be queried the configured kernel is reported
/// instead, flagged as a fallback. A query that runs past its bound is
/// `Timeout` regardless.
pub async fn resolve_kernel(
    source: &dyn LogSource,
    host: &Host,
    configured: Option<&str>,
) -> Probe<KernelVersion> {
    let fallback = || match configured {
        Some(version) => Probe::Found(KernelVersion {
            version: version.to_string(),
            fallback: true,
        }),
        None => Probe::Unknown,
    };

    match source.last_match(host, "Linux version").await {
        Ok(Some(line)) => match parse_kernel_version(&line) {
            Some(version) => Probe::Found(KernelVersion {
                version,
                fallback: false,
            }),
            None => {
                tracing::debug!(host = %host.name, line = %line, "no version token after banner");
                Probe::Unknown
            }
        },
        Ok(None) => fallback(),
        Err(e) if e.is_timeout() => {
            tracing::warn!(host = %host.name, error = %e, "kernel version query timed out");
            Probe::Timeout
        }
        Err(e) => {
            tracing::debug!(host = %host.name, error = %e, "kernel version query failed");
            fallback()
        }
    }
}

/// The test `host` most recently started, per the suite runner's markers.
pub async fn resolve_current_test(
    source: &dyn LogSource,
    host: &Host,
    suite: &str,
) -> Probe<TestMarker> {
    let Some(suite) = Suite::parse(suite) else {
        tracing::debug!(suite, "unsupported suite, not querying");
        return Probe::Unknown;
    };

    match source.last_match(host, suite.marker()).await {
        Ok(Some(line)) => match parse_test_marker(&line, suite) {
            Some(marker) => Probe::Found(marker),
            None => Probe::Unknown,
        },
        Ok(None) => Probe::Unknown,
        Err(e) if e.is_timeout() => {
            tracing::warn!(host = %host.name, error = %e, "current test query timed out");
            Probe::Timeout
        }
        Err(e) => {
            tracing::debug!(host = %host.name, error = %e, "current test query failed");
            Probe::Unknown
        }
    }
}

/// The source stall polling uses for a given delivery.
pub fn delivery_source(delivery: JournalDelivery, policy: &Policy) -> Arc<dyn LogSource> {
    match delivery {
        JournalDelivery::SystemdRemote => Arc::new(RemoteJournal::from_policy(policy, policy.timeouts.query())),
        JournalDelivery::Ssh => Arc::new(SshJournal::from_policy(policy, policy.timeouts.query())),
    }
}

/// Sources the crash detector tries, in order.
pub fn sources_for(method: LogMethod, config: &WatchdogConfig, policy: &Policy) -> Vec<Arc<dyn LogSource>> {
    let timeout = policy.timeouts.collect();
    let remote = || Arc::new(RemoteJournal::from_policy(policy, timeout)) as Arc<dyn LogSource>;
    let console = || Arc::new(ConsoleLog::from_config(config, policy)) as Arc<dyn LogSource>;
    let ssh = || Arc::new(SshJournal::from_policy(policy, timeout)) as Arc<dyn LogSource>;

    match method {
        LogMethod::Remote => vec![remote()],
        LogMethod::Console => vec![console()],
        LogMethod::Ssh => vec![ssh()],
        LogMethod::Auto => {
            let mut sources = Vec::new();
            if config.journal_remote_enabled {
                sources.push(remote());
            }
            if config.guestfs {
                sources.push(console());
            }
            sources.push(ssh());
            sources
        }
    }
}

/// Whether reading logs via `method` requires the journal-remote group.
pub fn method_needs_journal_group(method: LogMethod, config: &WatchdogConfig) -> bool {
    match method {
        LogMethod::Remote => true,
        LogMethod::Auto => config.journal_remote_enabled,
        LogMethod::Console | LogMethod::Ssh => false,
    }
}

/// Last non-empty line of journalctl output, or None for no entries.
pub(crate) fn last_entry(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty() && !l.starts_with("-- "))
        .last()
        .map(str::to_string)
}

/// Whole journalctl output, or None when it holds no entries.
pub(crate) fn log_text(stdout: &str) -> Option<String> {
    if last_entry(stdout).is_none() {
        None
    } else {
        Some(stdout.to_string())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory log source for tests.
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub struct FakeSource {
        pub log: Option<String>,
        pub timeout: bool,
        pub fail: bool,
        pub queries: AtomicUsize,
    }

    impl FakeSource {
        pub fn with_log(log: &str) -> Self {
            Self {
                log: Some(log.to_string()),
                timeout: false,
                fail: false,
                queries: AtomicUsize::new(0),
            }
        }

        pub fn timing_out() -> Self {
            Self {
                log: None,
                timeout: true,
                fail: false,
                queries: AtomicUsize::new(0),
            }
        }

        pub fn failing() -> Self {
            Self {
                log: None,
                timeout: false,
                fail: true,
                queries: AtomicUsize::new(0),
            }
        }

        pub fn queries(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }

        fn check(&self, host: &Host) -> Result<(), SourceError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.timeout {
                return Err(SourceError::Timeout {
                    host: host.name.clone(),
                    after: Duration::from_secs(120),
                });
            }
            if self.fail {
                return Err(SourceError::Failed {
                    host: host.name.clone(),
                    status: Some(1),
                    detail: "no journal files".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LogSource for FakeSource {
        fn method(&self) -> LogMethod {
            LogMethod::Ssh
        }

        async fn last_match(&self, host: &Host, pattern: &str) -> Result<Option<String>, SourceError> {
            self.check(host)?;
            Ok(self
                .log
                .as_deref()
                .and_then(|log| log.lines().rev().find(|l| l.contains(pattern)))
                .map(str::to_string))
        }

        async fn kernel_log(&self, host: &Host) -> Result<Option<String>, SourceError> {
            self.check(host)?;
            Ok(self.log.clone())
        }
    }
}
