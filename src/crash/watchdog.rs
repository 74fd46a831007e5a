//! One crash-detection pass over one host.
//!
//! lock -> collect log -> scan -> persist new events -> decode -> warnings
//! -> reset (new crash only). The host lock is held for the whole pass so
//! two concurrent passes can never both persist or both reset for the same
//! event. A failed event write stops the scan but the pass still resets for
//! the crashes saved before it.
use super::artifact::{ArtifactError, ArtifactStore};
use super::decode::{Decoder, StacktraceDecoder};
use super::reset::{control_for, HostControl, ResetError, ResetOutcome};
use super::{capture, scan, warning_lines, CaptureScope, CrashEvent, DetectionKind, FstestsTimeline, SignatureSet};
use crate::config::{CapturePolicy, ConfigError, Policy, WatchdogConfig};
use crate::host::Host;
use crate::journal::{sources_for, LogMethod, LogSource};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub method: LogMethod,
    /// Capture the whole log instead of a window around each event.
    pub full_log: bool,
    /// Capture, and return for printing, the lines of this fstests test.
    pub fstests_log: Option<String>,
    pub save_warnings: bool,
    pub reset: bool,
    pub wait_after_reset: bool,
    /// Return the collected log in the outcome.
    pub dump_log: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            method: LogMethod::Auto,
            full_log: false,
            fstests_log: None,
            save_warnings: true,
            reset: true,
            wait_after_reset: true,
            dump_log: false,
        }
    }
}

impl CheckOptions {
    pub fn scope(&self) -> CaptureScope {
        match (&self.fstests_log, self.full_log) {
            (Some(test), _) => CaptureScope::FstestsTest(test.clone()),
            (None, true) => CaptureScope::FullLog,
            (None, false) => CaptureScope::Context,
        }
    }
}

/// Result of one pass over one host.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckOutcome {
    /// Events persisted by this pass. Known events are not repeated.
    pub events: Vec<CrashEvent>,
    pub warning_file: Option<PathBuf>,
    pub reset: ResetOutcome,
    pub logs_unavailable: bool,
    /// Another pass held the host lock.
    pub skipped: bool,
    pub source: Option<LogMethod>,
    /// An artifact could not be written. `events` holds what was saved.
    pub save_failed: bool,
    #[serde(skip)]
    pub fstests_log: Option<String>,
    #[serde(skip)]
    pub log: Option<String>,
}

impl CheckOutcome {
    fn files(&self, kind: DetectionKind) -> Vec<&Path> {
        self.events
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.artifact.as_path())
            .collect()
    }

    pub fn crash_files(&self) -> Vec<&Path> {
        self.files(DetectionKind::Crash)
    }

    pub fn corruption_files(&self) -> Vec<&Path> {
        self.files(DetectionKind::Corruption)
    }

    pub fn decoded_files(&self) -> Vec<&Path> {
        self.events
            .iter()
            .filter_map(|e| e.decoded_artifact.as_deref())
            .collect()
    }

    /// Most recent crash artifact written by this pass.
    pub fn crash_file(&self) -> Option<&Path> {
        self.crash_files().pop()
    }

    pub fn warning_file(&self) -> Option<&Path> {
        self.warning_file.as_deref()
    }

    pub fn has_crash(&self) -> bool {
        !self.crash_files().is_empty()
    }

    pub fn has_corruption(&self) -> bool {
        !self.corruption_files().is_empty()
    }
}

pub struct CrashWatchdog {
    sources: Vec<Arc<dyn LogSource>>,
    signatures: SignatureSet,
    capture: CapturePolicy,
    decoder: Option<Arc<dyn Decoder>>,
    control: Arc<dyn HostControl>,
    output_dir: PathBuf,
    options: CheckOptions,
}

impl CrashWatchdog {
    pub fn new(
        sources: Vec<Arc<dyn LogSource>>,
        signatures: SignatureSet,
        control: Arc<dyn HostControl>,
        output_dir: PathBuf,
        options: CheckOptions,
    ) -> Self {
        Self {
            sources,
            signatures,
            capture: CapturePolicy::default(),
            decoder: None,
            control,
            output_dir,
            options,
        }
    }

    /// Build from configuration. Decoding is enabled when `decode` is set
    /// and the kernel tree has what the decoder needs.
    pub fn from_config(
        config: &WatchdogConfig,
        policy: &Policy,
        output_dir: PathBuf,
        options: CheckOptions,
        decode: bool,
    ) -> Result<Self, ConfigError> {
        let sources = sources_for(options.method, config, policy);
        let signatures = SignatureSet::from_policy(&policy.signatures)?;
        let mut watchdog = Self::new(sources, signatures, control_for(config, policy), output_dir, options)
            .with_capture(policy.capture.clone());
        if decode {
            if let Some(decoder) = StacktraceDecoder::from_topdir(&config.topdir, policy.timeouts.decode()) {
                watchdog = watchdog.with_decoder(Arc::new(decoder));
            }
        }
        Ok(watchdog)
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn with_capture(mut self, capture: CapturePolicy) -> Self {
        self.capture = capture;
        self
    }

    pub fn options(&self) -> &CheckOptions {
        &self.options
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn collect(&self, host: &Host) -> Option<(LogMethod, String)> {
        for source in &self.sources {
            let method = source.method();
            if !source.is_available(host).await {
                tracing::debug!(host = %host.name, %method, "log source not available");
                continue;
            }
            match source.kernel_log(host).await {
                Ok(Some(log)) => {
                    tracing::info!(host = %host.name, %method, "collected kernel log");
                    return Some((method, log));
                }
                Ok(None) => tracing::debug!(host = %host.name, %method, "kernel log empty"),
                Err(e) => tracing::warn!(host = %host.name, %method, error = %e, "failed to collect kernel log"),
            }
        }
        None
    }

    /// Run one detection pass over `host`.
    ///
    /// Errors only when the host directory cannot be locked. Later write
    /// failures set [`CheckOutcome::save_failed`] instead.
    pub async fn check_and_reset_host(&self, host: &Host) -> Result<CheckOutcome, WatchdogError> {
        let store = ArtifactStore::new(&self.output_dir, &host.name);
        let Some(_lock) = store.try_lock()? else {
            tracing::info!(host = %host.name, "another pass is checking this host, skipping");
            return Ok(CheckOutcome {
                skipped: true,
                ..CheckOutcome::default()
            });
        };

        let mut outcome = CheckOutcome::default();
        let Some((method, log)) = self.collect(host).await else {
            tracing::warn!(host = %host.name, "unable to collect kernel log, not resetting");
            outcome.logs_unavailable = true;
            return Ok(outcome);
        };
        outcome.source = Some(method);
        if self.options.dump_log {
            outcome.log = Some(log.clone());
        }

        let lines: Vec<&str> = log.lines().collect();
        let timeline = FstestsTimeline::build(&lines);

        if let Some(test) = &self.options.fstests_log {
            match timeline.window(&lines, test) {
                Some(test_lines) => outcome.fstests_log = Some(test_lines.join("\n")),
                None => tracing::warn!(host = %host.name, test = %test, "test not found in kernel log"),
            }
        }

        let known = store.known_events();
        let scope = self.options.scope();
        let mut new_crash = false;

        for detection in scan(&lines, &self.signatures, &timeline, self.capture.lines_after) {
            if known.contains(&detection.fingerprint) {
                tracing::debug!(host = %host.name, event = %detection.fingerprint, "event already captured");
                continue;
            }

            let raw = capture(&lines, &detection, &scope, &timeline, &self.capture);
            let artifact = match store.persist(detection.kind, &raw) {
                Ok(path) => path,
                Err(e) => {
                    tracing::error!(
                        host = %host.name,
                        kind = %detection.kind,
                        event = %detection.fingerprint,
                        error = %e,
                        "failed to save kernel {} log",
                        detection.kind
                    );
                    outcome.save_failed = true;
                    break;
                }
            };
            tracing::info!(
                host = %host.name,
                kind = %detection.kind,
                event = %detection.fingerprint,
                path = %artifact.display(),
                "saved kernel {} log",
                detection.kind
            );

            let (decoded, decoded_artifact) = self.decode(host, &store, &artifact, detection.kind).await;
            new_crash |= detection.kind == DetectionKind::Crash;

            outcome.events.push(CrashEvent {
                host: host.name.clone(),
                kind: detection.kind,
                signature: detection.pattern,
                fingerprint: detection.fingerprint,
                test: detection.test,
                raw,
                decoded,
                artifact,
                decoded_artifact,
            });
        }

        if self.options.save_warnings {
            match self.save_warnings(host, &store, &lines) {
                Ok(path) => outcome.warning_file = path,
                Err(e) => {
                    tracing::warn!(host = %host.name, error = %e, "failed to save kernel warnings");
                    outcome.save_failed = true;
                }
            }
        }

        // Set only once a crash artifact is on disk
        if new_crash {
            outcome.reset = self.reset(host).await;
        }

        Ok(outcome)
    }

    fn save_warnings(
        &self,
        host: &Host,
        store: &ArtifactStore,
        lines: &[&str],
    ) -> Result<Option<PathBuf>, ArtifactError> {
        let known = store.known_warning_lines();
        let mut seen = HashSet::new();
        let fresh: Vec<&str> = warning_lines(lines, &self.signatures)
            .into_iter()
            .filter(|l| !known.contains(*l) && seen.insert(*l))
            .collect();

        if fresh.is_empty() {
            tracing::debug!(host = %host.name, "no new kernel warnings");
            return Ok(None);
        }

        let mut content = fresh.join("\n");
        content.push('\n');
        let path = store.persist(DetectionKind::Warning, &content)?;
        tracing::info!(host = %host.name, count = fresh.len(), path = %path.display(), "saved kernel warnings");
        Ok(Some(path))
    }

    async fn decode(
        &self,
        host: &Host,
        store: &ArtifactStore,
        raw: &Path,
        kind: DetectionKind,
    ) -> (Option<String>, Option<PathBuf>) {
        let Some(decoder) = &self.decoder else {
            return (None, None);
        };
        match decoder.decode(raw).await {
            Ok(text) => match store.persist_decoded(raw, kind, &text) {
                Ok(path) => {
                    tracing::info!(host = %host.name, path = %path.display(), "saved decoded log");
                    (Some(text), Some(path))
                }
                Err(e) => {
                    tracing::warn!(host = %host.name, error = %e, "failed to save decoded log");
                    (Some(text), None)
                }
            },
            Err(e) => {
                tracing::warn!(host = %host.name, error = %e, "failed to decode, keeping raw log");
                (None, None)
            }
        }
    }

    async fn reset(&self, host: &Host) -> ResetOutcome {
        if !self.options.reset {
            tracing::info!(host = %host.name, "host reset disabled");
            return ResetOutcome::Disabled;
        }
        match self.control.reset(host).await {
            Ok(()) => {
                tracing::info!(host = %host.name, "host reset");
                if self.options.wait_after_reset && !self.control.wait_for_ssh(host).await {
                    tracing::warn!(host = %host.name, "host not reachable after reset");
                }
                ResetOutcome::Reset
            }
            Err(e @ ResetError::Unsupported) => {
                tracing::warn!(host = %host.name, error = %e, "cannot reset host");
                ResetOutcome::Failed(e.to_string())
            }
            Err(e) => {
                tracing::error!(host = %host.name, error = %e, "failed to reset host");
                ResetOutcome::Failed(e.to_string())
            }
        }
    }
}
