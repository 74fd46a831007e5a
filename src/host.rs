//! Test host identity and the few ssh probes the watchdog makes directly.
use crate::config::{JournalDelivery, Policy, WatchdogConfig};
use crate::exec::BoundedCommand;
use serde::Serialize;
use std::time::{Duration, Instant};

/// A test host as seen by one watchdog pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Host {
    pub name: String,
    /// Address the host connects from; names its remote journal files.
    pub ip: Option<String>,
    /// fstests section the host runs (e.g. `xfs_reflink`).
    pub section: String,
    pub delivery: JournalDelivery,
}

impl Host {
    pub fn new(name: impl Into<String>, section: impl Into<String>, delivery: JournalDelivery) -> Self {
        Self {
            name: name.into(),
            ip: None,
            section: section.into(),
            delivery,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Build a host from its inventory name, resolving its address through
    /// the local ssh configuration.
    pub async fn resolve(
        name: &str,
        config: &WatchdogConfig,
        policy: &Policy,
        delivery: JournalDelivery,
    ) -> Self {
        let section = fstests_section(name, config.hosts_prefix.as_deref());
        let mut host = Host::new(name, section, delivery);
        host.ip = resolve_ip(&policy.paths.ssh, name, policy.timeouts.probe()).await;
        if host.ip.is_none() {
            tracing::warn!(host = %name, "could not resolve host address from ssh config");
        }
        host
    }
}

/// Derive the fstests section from a host name.
///
/// Hosts are named `<prefix>-<section words>[-dev]`, with the section's
/// underscores written as dashes: `line-xfs-reflink-dev` runs `xfs_reflink`.
pub fn fstests_section(host: &str, prefix: Option<&str>) -> String {
    let mut name = host;
    if let Some(prefix) = prefix {
        if let Some(rest) = name
            .strip_prefix(prefix)
            .and_then(|r| r.strip_prefix('-'))
        {
            name = rest;
        }
    }
    let name = name.strip_suffix("-dev").unwrap_or(name);
    name.replace('-', "_")
}

/// Pull the `hostname` entry out of `ssh -G` output.
pub fn parse_ssh_g(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("hostname"), Some(value)) => Some(value.to_string()),
            _ => None,
        }
    })
}

/// Resolve a host's address with `ssh -G`.
pub async fn resolve_ip(ssh: &str, host: &str, timeout: Duration) -> Option<String> {
    let result = BoundedCommand::new(ssh)
        .args(["-G", host])
        .timeout(timeout)
        .run()
        .await;
    match result {
        Ok(out) if out.success() => parse_ssh_g(&out.stdout),
        Ok(out) => {
            tracing::warn!(host, status = ?out.status, stderr = %out.stderr.trim(), "ssh -G failed");
            None
        }
        Err(e) => {
            tracing::warn!(host, error = %e, "failed to resolve host address");
            None
        }
    }
}

/// True if `ssh <host> true` succeeds within `timeout`.
pub async fn is_reachable(ssh: &str, host: &str, timeout: Duration) -> bool {
    BoundedCommand::new(ssh)
        .args([host, "true"])
        .timeout(timeout)
        .run()
        .await
        .map(|out| out.success())
        .unwrap_or(false)
}

/// Poll ssh until the host answers or `deadline` elapses.
pub async fn wait_for_ssh(ssh: &str, host: &str, probe_timeout: Duration, deadline: Duration) -> bool {
    tracing::info!(host, "waiting for host to become reachable via ssh");
    let start = Instant::now();
    loop {
        if is_reachable(ssh, host, probe_timeout).await {
            tracing::info!(host, waited_secs = start.elapsed().as_secs(), "host is reachable");
            return true;
        }
        if start.elapsed() >= deadline {
            tracing::warn!(host, deadline_secs = deadline.as_secs(), "host did not come back within deadline");
            return false;
        }
        tokio::time::sleep(Duration::from_secs(5).min(deadline)).await;
    }
}
