//! Fleet status: poll every host, render one row each.
use crate::config::{JournalDelivery, Policy, WatchdogConfig};
use crate::crash::{CheckOutcome, CrashWatchdog};
use crate::host::Host;
use crate::journal::{LogSource, Probe};
use crate::pool::map_bounded;
use crate::stall::{evaluate, observe, BaselineLookup, StallStatus, TestObservation};
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CrashStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "CRASH")]
    Crash,
    #[serde(rename = "CORRUPTION")]
    Corruption,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "SKIPPED")]
    Skipped,
    #[serde(rename = "unknown")]
    Unknown,
    /// Crash checking turned off for this run.
    #[serde(rename = "-")]
    NotChecked,
}

impl CrashStatus {
    pub fn from_outcome(outcome: &CheckOutcome) -> Self {
        if outcome.skipped {
            CrashStatus::Skipped
        } else if outcome.logs_unavailable {
            CrashStatus::Unknown
        } else if outcome.has_crash() {
            CrashStatus::Crash
        } else if outcome.has_corruption() {
            CrashStatus::Corruption
        } else if outcome.warning_file().is_some() {
            CrashStatus::Warning
        } else {
            CrashStatus::Ok
        }
    }
}

impl std::fmt::Display for CrashStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CrashStatus::Ok => "OK",
            CrashStatus::Crash => "CRASH",
            CrashStatus::Corruption => "CORRUPTION",
            CrashStatus::Warning => "WARNING",
            CrashStatus::Skipped => "SKIPPED",
            CrashStatus::Unknown => "unknown",
            CrashStatus::NotChecked => "-",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub host: String,
    pub section: String,
    pub observation: TestObservation,
    pub crash_status: CrashStatus,
    pub crash: Option<CheckOutcome>,
}

/// Everything a fleet pass shares across hosts.
pub struct FleetContext {
    pub config: WatchdogConfig,
    pub policy: Policy,
    pub suite: String,
    pub source: Arc<dyn LogSource>,
    pub baselines: Arc<dyn BaselineLookup>,
    /// Crash checking, if enabled.
    pub crash: Option<CrashWatchdog>,
}

impl FleetContext {
    pub async fn poll_host(&self, host: &Host) -> HostReport {
        let observation = evaluate(
            self.source.as_ref(),
            self.baselines.as_ref(),
            host,
            &self.config,
            &self.policy,
            &self.suite,
            Local::now().naive_local(),
        )
        .await;

        let (crash_status, crash) = match &self.crash {
            None => (CrashStatus::NotChecked, None),
            Some(watchdog) => match watchdog.check_and_reset_host(host).await {
                Ok(outcome) => (CrashStatus::from_outcome(&outcome), Some(outcome)),
                Err(e) => {
                    tracing::error!(host = %host.name, error = %e, "crash check failed");
                    (CrashStatus::Unknown, None)
                }
            },
        };

        HostReport {
            host: host.name.clone(),
            section: host.section.clone(),
            observation,
            crash_status,
            crash,
        }
    }

    /// Row for a host whose poll did not complete.
    fn unknown_report(&self, host: &Host, now: NaiveDateTime) -> HostReport {
        HostReport {
            host: host.name.clone(),
            section: host.section.clone(),
            observation: observe(host, Probe::Unknown, Probe::Unknown, 0, &self.config, &self.policy, now),
            crash_status: CrashStatus::Unknown,
            crash: None,
        }
    }
}

/// Poll `hosts`, `jobs` at a time; one report per host, in input order.
pub async fn poll_fleet(ctx: Arc<FleetContext>, hosts: Vec<Host>, jobs: usize) -> Vec<HostReport> {
    let results = map_bounded(hosts.clone(), jobs, |host| {
        let ctx = ctx.clone();
        async move { ctx.poll_host(&host).await }
    })
    .await;

    let now = Local::now().naive_local();
    results
        .into_iter()
        .zip(&hosts)
        .map(|(report, host)| report.unwrap_or_else(|| ctx.unknown_report(host, now)))
        .collect()
}

pub fn header() -> String {
    format!(
        "{:>25}  {:>15}  {:>15}  {:>12}  {:>17}  {:>13}  {:<38}  {:<10}",
        "Hostname",
        "Test-name",
        "Completion %",
        "runtime(s)",
        "last-runtime(s)",
        "Stall-status",
        "Kernel",
        "Crash-status"
    )
    .trim_end()
    .to_string()
}

fn test_cell(obs: &TestObservation) -> String {
    match &obs.last_test {
        Probe::Found(marker) => marker.name.clone(),
        Probe::Timeout => "Timeout".to_string(),
        Probe::Unknown => "None".to_string(),
    }
}

fn kernel_cell(obs: &TestObservation) -> String {
    match &obs.kernel {
        Probe::Found(kernel) => kernel.to_string(),
        Probe::Timeout => "Timeout".to_string(),
        Probe::Unknown => "unknown".to_string(),
    }
}

fn percent_cell(obs: &TestObservation) -> String {
    let mut cell = format!("{:.0}%", obs.percent_done);
    if obs.soaking {
        cell.push_str(" (soak)");
    }
    cell
}

pub fn render_row(report: &HostReport) -> String {
    let obs = &report.observation;
    format!(
        "{:>25}  {:>15}  {:>15}  {:>12}  {:>17}  {:>13}  {:<38}  {:<10}",
        report.host,
        test_cell(obs),
        percent_cell(obs),
        obs.delta_seconds,
        obs.checktime,
        obs.status.to_string(),
        kernel_cell(obs),
        report.crash_status
    )
    .trim_end()
    .to_string()
}

pub fn render_verbose(report: &HostReport) -> String {
    let obs = &report.observation;
    let started = obs
        .last_test
        .found()
        .and_then(|m| m.started)
        .map(|t| t.to_string())
        .unwrap_or_else(|| "None".to_string());

    let mut out = format!(
        "Host               : {host}\n\
         Section            : {section}\n\
         Kernel             : {kernel}\n\
         Last    test       : {test}\n\
         Last    test   time: {started}\n\
         Current system time: {now}\n\
         Delta: {delta} total second\n\
         \t{minutes} minutes\n\
         \t{seconds} seconds\n\
         Completion    : {percent}\n\
         Timeout-status: {timeout}\n\
         Stall-status  : {stall}\n\
         Crash-status  : {crash}\n",
        host = report.host,
        section = report.section,
        kernel = kernel_cell(obs),
        test = test_cell(obs),
        now = obs.current_time.format("%Y-%m-%d %H:%M:%S"),
        delta = obs.delta_seconds,
        minutes = obs.delta_seconds / 60,
        seconds = obs.delta_seconds % 60,
        percent = percent_cell(obs),
        timeout = if obs.stall_suspect { "POSSIBLE-STALL" } else { "OK" },
        stall = obs.status,
        crash = report.crash_status,
    );
    if let Some(outcome) = &report.crash {
        for event in &outcome.events {
            let _ = writeln!(out, "  {} file  : {}", event.kind, event.artifact.display());
        }
        if let Some(path) = outcome.warning_file() {
            let _ = writeln!(out, "  warning file: {}", path.display());
        }
    }
    out
}

pub fn render_summary(delivery: JournalDelivery, soak_duration_secs: u64) -> String {
    format!(
        "\n{:>25}{:>20}\n{:>25}{:>20}\n",
        "Journal-method",
        "Soak-duration(s)",
        delivery.to_string(),
        soak_duration_secs
    )
}

#[derive(Debug, Serialize)]
pub struct FleetJson<'a> {
    pub journal_method: JournalDelivery,
    pub soak_duration_secs: u64,
    pub hosts: &'a [HostReport],
}

pub fn render_json(reports: &[HostReport], delivery: JournalDelivery, soak_duration_secs: u64) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&FleetJson {
        journal_method: delivery,
        soak_duration_secs,
        hosts: reports,
    })
}

/// Whether any host needs attention; used only for log output.
pub fn attention_count(reports: &[HostReport]) -> usize {
    reports
        .iter()
        .filter(|r| {
            r.observation.status != StallStatus::Ok
                || matches!(r.crash_status, CrashStatus::Crash | CrashStatus::Corruption)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DotConfig, SignaturePolicy};
    use crate::crash::{CheckOptions, HostControl, ResetError, SignatureSet};
    use crate::journal::fake::FakeSource;
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct NoReset;

    #[async_trait]
    impl HostControl for NoReset {
        async fn reset(&self, _host: &Host) -> Result<(), ResetError> {
            Ok(())
        }
    }

    fn config() -> WatchdogConfig {
        WatchdogConfig::from_dotconfig(&DotConfig::parse("CONFIG_FSTESTS_SOAK_DURATION=0\n"), PathBuf::from(".")).unwrap()
    }

    fn ctx(log: FakeSource, crash_dir: Option<PathBuf>) -> Arc<FleetContext> {
        let source: Arc<dyn LogSource> = Arc::new(log);
        let crash = crash_dir.map(|dir| {
            CrashWatchdog::new(
                vec![source.clone()],
                SignatureSet::from_policy(&SignaturePolicy::default()).unwrap(),
                Arc::new(NoReset),
                dir,
                CheckOptions {
                    wait_after_reset: false,
                    ..CheckOptions::default()
                },
            )
        });
        Arc::new(FleetContext {
            config: config(),
            policy: Policy::default(),
            suite: "fstests".into(),
            source,
            baselines: Arc::new(|_: &str, _: &str, _: &str, _: &str| Some(500u64)),
            crash,
        })
    }

    fn hosts(names: &[&str]) -> Vec<Host> {
        names
            .iter()
            .map(|n| Host::new(*n, "xfs", JournalDelivery::Ssh))
            .collect()
    }

    #[tokio::test]
    async fn test_poll_fleet_one_row_per_host_in_order() {
        let log = FakeSource::with_log("kernel: Linux version 6.8.0 (gcc)\nkernel: run fstests generic/400 at 2024-10-12 10:00:00\n");
        let reports = poll_fleet(ctx(log, None), hosts(&["c", "a", "b"]), 2).await;
        let names: Vec<&str> = reports.iter().map(|r| r.host.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert!(reports.iter().all(|r| r.crash_status == CrashStatus::NotChecked));
        assert_eq!(reports[0].observation.checktime, 500);
    }

    #[tokio::test]
    async fn test_timeout_renders_as_timeout() {
        let reports = poll_fleet(ctx(FakeSource::timing_out(), None), hosts(&["line-xfs"]), 1).await;
        let row = render_row(&reports[0]);
        let cells: Vec<&str> = row.split_whitespace().collect();
        assert_eq!(cells[0], "line-xfs");
        assert_eq!(cells[1], "Timeout");
        assert_eq!(cells[5], "Timeout");
        assert_eq!(cells[6], "Timeout");
    }

    #[tokio::test]
    async fn test_crash_status_in_row() {
        let dir = tempfile::tempdir().unwrap();
        let log = FakeSource::with_log("kernel: Linux version 6.8.0 (gcc)\nkernel: Kernel panic - not syncing\n");
        let reports = poll_fleet(ctx(log, Some(dir.path().to_path_buf())), hosts(&["line-xfs"]), 1).await;
        assert_eq!(reports[0].crash_status, CrashStatus::Crash);
        assert!(render_row(&reports[0]).ends_with("CRASH"));
        assert!(render_verbose(&reports[0]).contains("crash file  :"));
        assert_eq!(attention_count(&reports), 1);
    }

    #[test]
    fn test_row_layout() {
        let host = Host::new("line-xfs-crc", "xfs_crc", JournalDelivery::Ssh);
        let marker = crate::journal::TestMarker {
            name: "generic/400".into(),
            started: NaiveDateTime::parse_from_str("2024-10-12 10:00:00", "%Y-%m-%d %H:%M:%S").ok(),
            raw: String::new(),
        };
        let kernel = crate::journal::KernelVersion { version: "6.8.0".into(), fallback: false };
        let now = NaiveDateTime::parse_from_str("2024-10-12 10:00:50", "%Y-%m-%d %H:%M:%S").unwrap();
        let obs = observe(&host, Probe::Found(kernel), Probe::Found(marker), 500, &config(), &Policy::default(), now);
        let report = HostReport {
            host: host.name.clone(),
            section: host.section.clone(),
            observation: obs,
            crash_status: CrashStatus::Ok,
            crash: None,
        };

        let row = render_row(&report);
        let expected = format!(
            "{:>25}  {:>15}  {:>15}  {:>12}  {:>17}  {:>13}  {:<38}  {}",
            "line-xfs-crc", "generic/400", "10%", 50, 500, "OK", "6.8.0", "OK"
        );
        assert_eq!(row, expected);
        assert_eq!(header().find("Test-name").map(|i| i + "Test-name".len()), row.find("generic/400").map(|i| i + "generic/400".len()));
    }

    #[test]
    fn test_verbose_layout() {
        let host = Host::new("line-xfs", "xfs", JournalDelivery::Ssh);
        let marker = crate::journal::TestMarker {
            name: "generic/400".into(),
            started: NaiveDateTime::parse_from_str("2024-10-12 10:00:00", "%Y-%m-%d %H:%M:%S").ok(),
            raw: String::new(),
        };
        let kernel = crate::journal::KernelVersion { version: "6.8.0".into(), fallback: false };
        let now = NaiveDateTime::parse_from_str("2024-10-12 10:01:30", "%Y-%m-%d %H:%M:%S").unwrap();
        let obs = observe(&host, Probe::Found(kernel), Probe::Found(marker), 500, &config(), &Policy::default(), now);
        let report = HostReport {
            host: host.name.clone(),
            section: host.section.clone(),
            observation: obs,
            crash_status: CrashStatus::Ok,
            crash: None,
        };

        let text = render_verbose(&report);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Host               : line-xfs",
                "Section            : xfs",
                "Kernel             : 6.8.0",
                "Last    test       : generic/400",
                "Last    test   time: 2024-10-12 10:00:00",
                "Current system time: 2024-10-12 10:01:30",
                "Delta: 90 total second",
                "\t1 minutes",
                "\t30 seconds",
                "Completion    : 18%",
                "Timeout-status: OK",
                "Stall-status  : OK",
                "Crash-status  : OK",
            ]
        );
    }

    #[test]
    fn test_summary() {
        let summary = render_summary(JournalDelivery::SystemdRemote, 3600);
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines[0], "");
        assert!(lines[1].trim_start().starts_with("Journal-method"));
        assert!(lines[2].contains("systemd-journal-remote"));
        assert!(lines[2].ends_with("3600"));
    }

    #[test]
    fn test_crash_status_precedence() {
        let mut outcome = CheckOutcome::default();
        assert_eq!(CrashStatus::from_outcome(&outcome), CrashStatus::Ok);
        outcome.warning_file = Some(PathBuf::from("w"));
        assert_eq!(CrashStatus::from_outcome(&outcome), CrashStatus::Warning);
        outcome.logs_unavailable = true;
        assert_eq!(CrashStatus::from_outcome(&outcome), CrashStatus::Unknown);
        outcome.skipped = true;
        assert_eq!(CrashStatus::from_outcome(&outcome), CrashStatus::Skipped);
    }

    #[tokio::test]
    async fn test_json_output() {
        let reports = poll_fleet(ctx(FakeSource::timing_out(), None), hosts(&["h"]), 1).await;
        let json: serde_json::Value =
            serde_json::from_str(&render_json(&reports, JournalDelivery::Ssh, 0).unwrap()).unwrap();
        assert_eq!(json["journal_method"], "ssh");
        assert_eq!(json["hosts"][0]["host"], "h");
        assert_eq!(json["hosts"][0]["observation"]["status"], "Timeout");
        assert_eq!(json["hosts"][0]["crash_status"], "-");
    }
}
