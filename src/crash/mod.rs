//! Kernel crash, filesystem corruption and warning detection.
//!
//! Detection works on a plain list of log lines so it does not care which
//! [`LogSource`](crate::journal::LogSource) produced them. Matches are
//! grouped into events; each event gets a fingerprint from the lines around
//! its first match so later passes over the same log recognise it.
pub mod artifact;
pub mod decode;
pub mod reset;
pub mod watchdog;

use crate::config::{CapturePolicy, ConfigError, SignaturePolicy};
use regex::Regex;
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::LazyLock;

pub use artifact::{ArtifactError, ArtifactStore, HostLock};
pub use decode::{DecodeError, Decoder, StacktraceDecoder};
pub use reset::{control_for, HostControl, ResetError, ResetOutcome, UnsupportedControl, VirshControl};
pub use watchdog::{CheckOptions, CheckOutcome, CrashWatchdog, WatchdogError};

/// Lines hashed, in addition to the anchor, for an event fingerprint.
const FINGERPRINT_CONTEXT: usize = 5;

static UPTIME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[\s*\d+\.\d+\]\s*").unwrap());

static FSTESTS_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"run fstests (\S+/\d+)").unwrap());

/// Pseudo-tests the fstests runner logs around a run.
const RUN_BOUNDARIES: &[&str] = &["fstestsstart/000", "fstestsdone/000"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionKind {
    Crash,
    Corruption,
    Warning,
}

impl DetectionKind {
    /// Artifact file extension.
    pub fn extension(&self) -> &'static str {
        match self {
            DetectionKind::Crash => "crash",
            DetectionKind::Corruption => "corruption",
            DetectionKind::Warning => "warning",
        }
    }
}

impl std::fmt::Display for DetectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Compiled signature patterns.
#[derive(Debug, Clone)]
pub struct SignatureSet {
    crash: Vec<Regex>,
    corruption: Vec<Regex>,
    warning_marker: String,
    benign: Vec<Regex>,
    intentional_corruption: HashSet<String>,
}

impl SignatureSet {
    pub fn from_policy(policy: &SignaturePolicy) -> Result<Self, ConfigError> {
        Ok(Self {
            crash: compile(&policy.crash)?,
            corruption: compile(&policy.corruption)?,
            warning_marker: policy.warning_marker.clone(),
            benign: compile(&policy.benign_warnings)?,
            intentional_corruption: policy.intentional_corruption_tests.iter().cloned().collect(),
        })
    }

    /// The crash pattern `line` matches, if any.
    pub fn crash_match(&self, line: &str) -> Option<&str> {
        self.crash.iter().find(|re| re.is_match(line)).map(Regex::as_str)
    }

    pub fn corruption_match(&self, line: &str) -> Option<&str> {
        self.corruption.iter().find(|re| re.is_match(line)).map(Regex::as_str)
    }

    /// A warning line that is not on the benign list.
    pub fn is_warning(&self, line: &str) -> bool {
        line.contains(&self.warning_marker) && !self.benign.iter().any(|re| re.is_match(line))
    }

    pub fn corrupts_on_purpose(&self, test: &str) -> bool {
        self.intentional_corruption.contains(test)
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| ConfigError::Pattern {
                pattern: p.clone(),
                source: e,
            })
        })
        .collect()
}

/// Where each fstests test starts in a log.
#[derive(Debug, Clone, Default)]
pub struct FstestsTimeline {
    /// (line index, test name), in log order.
    markers: Vec<(usize, String)>,
}

impl FstestsTimeline {
    pub fn build(lines: &[&str]) -> Self {
        let markers = lines
            .iter()
            .enumerate()
            .filter_map(|(idx, line)| {
                FSTESTS_MARKER_RE
                    .captures(line)
                    .map(|caps| (idx, caps[1].to_string()))
            })
            .collect();
        Self { markers }
    }

    /// The test running when line `idx` was logged.
    pub fn test_at(&self, idx: usize) -> Option<&str> {
        let (_, name) = self.markers.iter().rev().find(|(pos, _)| *pos < idx)?;
        if RUN_BOUNDARIES.contains(&name.as_str()) {
            None
        } else {
            Some(name)
        }
    }

    /// Lines logged while `test` ran, markers excluded. A test run more
    /// than once contributes every run, in order.
    pub fn window<'a>(&self, lines: &[&'a str], test: &str) -> Option<Vec<&'a str>> {
        let mut found = false;
        let mut out = Vec::new();
        for (i, (pos, name)) in self.markers.iter().enumerate() {
            if name != test {
                continue;
            }
            found = true;
            let end = self
                .markers
                .get(i + 1)
                .map(|(next, _)| *next)
                .unwrap_or(lines.len());
            out.extend_from_slice(&lines[(*pos + 1).min(end)..end]);
        }
        found.then_some(out)
    }
}

/// A group of signature matches treated as one incident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub kind: DetectionKind,
    /// The pattern that named the event.
    pub pattern: String,
    /// Index of the first matching line.
    pub anchor: usize,
    pub fingerprint: String,
    /// fstests test running at the anchor.
    pub test: Option<String>,
}

/// The kernel message in `line`, without the journal or console prefix and
/// without the uptime stamp.
///
/// `Oct 12 10:00:20 host kernel: BUG: x` and
/// `host kernel: [   20.000000] BUG: x` both give `BUG: x`.
pub fn kernel_message(line: &str) -> &str {
    let message = match line.find("kernel: ") {
        Some(at) => &line[at + "kernel: ".len()..],
        None => line,
    };
    let message = match UPTIME_RE.find(message) {
        Some(stamp) => &message[stamp.end()..],
        None => message,
    };
    message.trim_end()
}

/// Fingerprint of the event anchored at `anchor`.
///
/// Only the kernel message of each line is hashed, so the same event read
/// through a different log source keeps its fingerprint.
pub fn fingerprint(lines: &[&str], anchor: usize) -> String {
    let start = anchor.saturating_sub(FINGERPRINT_CONTEXT);
    let mut hasher = Sha1::new();
    for line in &lines[start..=anchor] {
        hasher.update(kernel_message(line).as_bytes());
        hasher.update(b"\n");
    }
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Find crash and corruption events in `lines`.
///
/// A match less than `group_span` lines after the current event's anchor
/// belongs to that event. An event containing any crash match is a crash.
pub fn scan(
    lines: &[&str],
    signatures: &SignatureSet,
    timeline: &FstestsTimeline,
    group_span: usize,
) -> Vec<Detection> {
    let mut events: Vec<Detection> = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let (kind, pattern) = if let Some(p) = signatures.crash_match(line) {
            (DetectionKind::Crash, p)
        } else if let Some(p) = signatures.corruption_match(line) {
            (DetectionKind::Corruption, p)
        } else {
            continue;
        };

        if let Some(last) = events.last_mut() {
            if idx < last.anchor + group_span {
                if kind == DetectionKind::Crash && last.kind != DetectionKind::Crash {
                    last.kind = DetectionKind::Crash;
                    last.pattern = pattern.to_string();
                }
                continue;
            }
        }

        let test = timeline.test_at(idx);
        if kind == DetectionKind::Corruption {
            if let Some(test) = test.filter(|t| signatures.corrupts_on_purpose(t)) {
                tracing::debug!(test, line = idx, "ignoring corruption from a test that corrupts on purpose");
                continue;
            }
        }

        events.push(Detection {
            kind,
            pattern: pattern.to_string(),
            anchor: idx,
            fingerprint: fingerprint(lines, idx),
            test: test.map(str::to_string),
        });
    }

    events
}

/// How much of the log goes into an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureScope {
    /// A few lines before the anchor and the tail after it.
    Context,
    FullLog,
    /// The lines logged while this fstests test ran.
    FstestsTest(String),
}

/// Artifact text for one detection: header, blank line, captured lines.
pub fn capture(
    lines: &[&str],
    detection: &Detection,
    scope: &CaptureScope,
    timeline: &FstestsTimeline,
    policy: &CapturePolicy,
) -> String {
    let context = || {
        let start = detection.anchor.saturating_sub(policy.lines_before);
        let end = (detection.anchor + policy.lines_after).min(lines.len());
        lines[start..end].to_vec()
    };

    let body = match scope {
        CaptureScope::Context => context(),
        CaptureScope::FullLog => lines.to_vec(),
        CaptureScope::FstestsTest(test) => match timeline.window(lines, test) {
            Some(test_lines) => test_lines,
            None => {
                tracing::warn!(test = %test, "test not found in log, capturing context instead");
                context()
            }
        },
    };

    let mut out = format!(
        "Detected kernel {} ({}) [event {}]:\n\n",
        detection.kind, detection.pattern, detection.fingerprint
    );
    for line in body {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Non-benign warning lines, in log order.
pub fn warning_lines<'a>(lines: &[&'a str], signatures: &SignatureSet) -> Vec<&'a str> {
    lines
        .iter()
        .copied()
        .filter(|l| signatures.is_warning(l))
        .collect()
}

/// A persisted crash or corruption event.
#[derive(Debug, Clone, Serialize)]
pub struct CrashEvent {
    pub host: String,
    pub kind: DetectionKind,
    pub signature: String,
    pub fingerprint: String,
    pub test: Option<String>,
    #[serde(skip)]
    pub raw: String,
    #[serde(skip)]
    pub decoded: Option<String>,
    pub artifact: PathBuf,
    pub decoded_artifact: Option<PathBuf>,
}
