//! Stall detection: is the test a host is running taking far longer than it
//! should?
//!
//! One pass produces one [`TestObservation`] per host. The observation is a
//! snapshot; nothing here remembers previous passes.
use crate::config::{Policy, StallLimits, WatchdogConfig};
use crate::host::Host;
use crate::journal::{resolve_current_test, resolve_kernel, KernelVersion, LogSource, Probe, TestMarker};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StallStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "Hung-Stalled")]
    HungStalled,
    /// The log channel did not answer in time; says nothing about the test.
    Timeout,
}

impl std::fmt::Display for StallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StallStatus::Ok => write!(f, "OK"),
            StallStatus::HungStalled => write!(f, "Hung-Stalled"),
            StallStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

/// Source of expected test runtimes.
pub trait BaselineLookup: Send + Sync {
    /// Seconds `test` took in a previous run of the same host/kernel/section.
    fn checktime(&self, host: &str, kernel: &str, section: &str, test: &str) -> Option<u64>;
}

impl<F> BaselineLookup for F
where
    F: Fn(&str, &str, &str, &str) -> Option<u64> + Send + Sync,
{
    fn checktime(&self, host: &str, kernel: &str, section: &str, test: &str) -> Option<u64> {
        self(host, kernel, section, test)
    }
}

/// Baselines from the `check.time` files fstests leaves in its results.
#[derive(Debug, Clone)]
pub struct CheckTimeBaselines {
    results_dir: PathBuf,
}

impl CheckTimeBaselines {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }

    /// `check.time` files belonging to `host`, best match first.
    ///
    /// A file belongs to a host when one of its path components is the host
    /// name. Files whose path also names the kernel rank above those naming
    /// only the section; ties go to the newest file.
    pub fn candidates(&self, host: &str, kernel: &str, section: &str) -> Vec<PathBuf> {
        let pattern = format!(
            "{}/**/check.time",
            glob::Pattern::escape(&self.results_dir.to_string_lossy())
        );
        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "bad check.time glob");
                return Vec::new();
            }
        };

        let mut ranked: Vec<(u8, SystemTime, PathBuf)> = paths
            .flatten()
            .filter(|p| has_component(p, host))
            .map(|p| {
                let mut score = 0;
                if !kernel.is_empty() && has_component(&p, kernel) {
                    score += 2;
                }
                if has_component(&p, section) {
                    score += 1;
                }
                let mtime = p
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (score, mtime, p)
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        ranked.into_iter().map(|(_, _, p)| p).collect()
    }
}

impl BaselineLookup for CheckTimeBaselines {
    fn checktime(&self, host: &str, kernel: &str, section: &str, test: &str) -> Option<u64> {
        for path in self.candidates(host, kernel, section) {
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "skipping unreadable check.time");
                    continue;
                }
            };
            if let Some(secs) = parse_check_time(&text).get(test) {
                return Some(*secs);
            }
        }
        None
    }
}

fn has_component(path: &Path, name: &str) -> bool {
    path.components().any(|c| c.as_os_str() == name)
}

/// `<test> <seconds>` per line; a later entry for a test replaces an earlier one.
pub fn parse_check_time(text: &str) -> HashMap<String, u64> {
    let mut times = HashMap::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(test), Some(secs)) = (parts.next(), parts.next()) {
            if let Ok(secs) = secs.parse() {
                times.insert(test.to_string(), secs);
            }
        }
    }
    times
}

/// Per-host stall snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TestObservation {
    pub host: String,
    pub kernel: Probe<KernelVersion>,
    pub last_test: Probe<TestMarker>,
    pub current_time: NaiveDateTime,
    /// Seconds since the last test started.
    pub delta_seconds: u64,
    /// Baseline runtime of the last test, 0 if unknown.
    pub checktime: u64,
    pub percent_done: f64,
    pub soak_duration_secs: u64,
    pub soaking: bool,
    pub stall_suspect: bool,
    pub status: StallStatus,
}

impl TestObservation {
    pub fn last_test_name(&self) -> Option<&str> {
        self.last_test.found().map(|m| m.name.as_str())
    }
}

/// Seconds a test may run before it is considered stalled.
///
/// `baseline` is what the test is expected to take: its previous runtime,
/// or the soak duration for a soaking test.
pub fn stall_threshold(baseline: u64, limits: &StallLimits) -> u64 {
    if baseline > 0 {
        baseline
            .saturating_mul(limits.hung_multiplier)
            .max(limits.fast_test_max_secs)
    } else {
        limits.max_new_test_secs
    }
}

/// Classify already-resolved probes.
pub fn observe(
    host: &Host,
    kernel: Probe<KernelVersion>,
    last_test: Probe<TestMarker>,
    checktime: u64,
    config: &WatchdogConfig,
    policy: &Policy,
    now: NaiveDateTime,
) -> TestObservation {
    let (delta_seconds, soaking) = match &last_test {
        Probe::Found(marker) => {
            let delta = marker
                .started
                .map(|t| (now - t).num_seconds().max(0) as u64)
                .unwrap_or(0);
            let soaking = config.soak_duration_secs != 0
                && policy.soak.tests.iter().any(|t| *t == marker.name);
            (delta, soaking)
        }
        _ => (0, false),
    };

    let baseline = if soaking {
        config.soak_duration_secs
    } else {
        checktime
    };
    let percent_done = if baseline == 0 {
        0.0
    } else {
        delta_seconds as f64 * 100.0 / baseline as f64
    };

    let timed_out = kernel.is_timeout() || last_test.is_timeout();
    let overdue = last_test.found().is_some() && delta_seconds > stall_threshold(baseline, &config.stall);
    let status = if timed_out {
        StallStatus::Timeout
    } else if overdue {
        StallStatus::HungStalled
    } else {
        StallStatus::Ok
    };

    TestObservation {
        host: host.name.clone(),
        kernel,
        last_test,
        current_time: now,
        delta_seconds,
        checktime,
        percent_done,
        soak_duration_secs: config.soak_duration_secs,
        soaking,
        stall_suspect: timed_out || overdue,
        status,
    }
}

/// Query `source` about `host` and classify the result.
///
/// If the kernel query times out the channel is treated as down and the
/// test query is not issued.
pub async fn evaluate(
    source: &dyn LogSource,
    baselines: &dyn BaselineLookup,
    host: &Host,
    config: &WatchdogConfig,
    policy: &Policy,
    suite: &str,
    now: NaiveDateTime,
) -> TestObservation {
    let kernel = resolve_kernel(source, host, config.configured_kernel.as_deref()).await;
    let last_test = if kernel.is_timeout() {
        Probe::Timeout
    } else {
        resolve_current_test(source, host, suite).await
    };

    let checktime = match (&kernel, &last_test) {
        (Probe::Found(k), Probe::Found(t)) => baselines
            .checktime(&host.name, &k.version, &host.section, &t.name)
            .unwrap_or(0),
        _ => 0,
    };

    let observation = observe(host, kernel, last_test, checktime, config, policy, now);
    tracing::debug!(
        host = %host.name,
        status = %observation.status,
        delta = observation.delta_seconds,
        checktime = observation.checktime,
        "evaluated host"
    );
    observation
}
