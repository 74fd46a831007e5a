//! Watchdog configuration.
//!
//! Two layers:
//! - [`WatchdogConfig`], derived from the Kconfig `.config` that sits next to
//!   the ansible hosts file. Read once per invocation and never mutated.
//! - [`Policy`], an optional `watchdog.toml` holding tunables that are policy
//!   rather than topology: signature patterns, soak-capable tests, capture
//!   window and timeouts.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Policy file looked up next to `.config` when no explicit path is given.
pub const POLICY_FILE_NAME: &str = "watchdog.toml";

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid value for {key}: {value:?} is not a number")]
    InvalidNumber { key: String, value: String },
    #[error("failed to parse policy file {}: {source}", .path.display())]
    Policy {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid signature pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Raw key/value view of a Kconfig `.config` file.
///
/// `CONFIG_FOO=y`, `CONFIG_BAR="text"` and `CONFIG_N=42` are recorded with
/// surrounding quotes stripped. `# CONFIG_FOO is not set` lines are comments,
/// so unset options are simply absent.
#[derive(Debug, Clone, Default)]
pub struct DotConfig {
    values: HashMap<String, String>,
}

impl DotConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut values = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            values.insert(key.trim().to_string(), value.to_string());
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// True for boolean options set to `y`.
    pub fn is_enabled(&self, key: &str) -> bool {
        self.get(key) == Some("y")
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.get(key) {
            None | Some("") => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidNumber {
                    key: key.to_string(),
                    value: value.to_string(),
                }),
        }
    }
}

/// How host journals reach the watchdog for stall polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JournalDelivery {
    /// Query each host's journal over ssh.
    #[serde(rename = "ssh")]
    Ssh,
    /// Read journals uploaded to the local systemd-journal-remote collector.
    #[serde(rename = "systemd-journal-remote")]
    SystemdRemote,
}

impl std::fmt::Display for JournalDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JournalDelivery::Ssh => write!(f, "ssh"),
            JournalDelivery::SystemdRemote => write!(f, "systemd-journal-remote"),
        }
    }
}

/// Limits used to decide when a test has stopped making progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallLimits {
    /// A test with a known baseline is suspect past `baseline * hung_multiplier`.
    pub hung_multiplier: u64,
    /// Floor for the stall threshold of tests with short baselines.
    pub fast_test_max_secs: u64,
    /// Threshold for tests with no baseline at all.
    pub max_new_test_secs: u64,
}

impl Default for StallLimits {
    fn default() -> Self {
        Self {
            hung_multiplier: 5,
            fast_test_max_secs: 5 * 60,
            max_new_test_secs: 60 * 60,
        }
    }
}

/// Everything the watchdog needs from `.config`.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Directory holding `.config`; guestfs consoles, the kernel tree and
    /// test results are found relative to it.
    pub topdir: PathBuf,
    pub journal_remote_enabled: bool,
    /// Soak duration in seconds, 0 = disabled.
    pub soak_duration_secs: u64,
    /// Kernel identity to report when log-based resolution fails.
    pub configured_kernel: Option<String>,
    pub libvirt: bool,
    pub libvirt_uri_system: bool,
    pub guestfs: bool,
    pub hosts_prefix: Option<String>,
    pub stall: StallLimits,
}

impl WatchdogConfig {
    /// Load from a `.config` path; the top directory is its parent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let dot = DotConfig::load(path)?;
        let topdir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_dotconfig(&dot, topdir)
    }

    pub fn from_dotconfig(dot: &DotConfig, topdir: PathBuf) -> Result<Self, ConfigError> {
        let configured_kernel = if dot.contains("CONFIG_WORKFLOW_LINUX_DISTRO") {
            Some("Distro-kernel".to_string())
        } else {
            dot.get("CONFIG_BOOTLINUX_TREE_REF")
                .filter(|r| !r.is_empty())
                .map(str::to_string)
        };

        let defaults = StallLimits::default();
        let stall = StallLimits {
            hung_multiplier: dot
                .get_u64("CONFIG_FSTESTS_WATCHDOG_HUNG_MULTIPLIER_LONG_TESTS")?
                .unwrap_or(defaults.hung_multiplier),
            fast_test_max_secs: dot
                .get_u64("CONFIG_FSTESTS_WATCHDOG_HUNG_FAST_TEST_MAX_TIME")?
                .map(|mins| mins * 60)
                .unwrap_or(defaults.fast_test_max_secs),
            max_new_test_secs: dot
                .get_u64("CONFIG_FSTESTS_WATCHDOG_MAX_NEW_TEST_TIME")?
                .map(|mins| mins * 60)
                .unwrap_or(defaults.max_new_test_secs),
        };

        Ok(Self {
            topdir,
            journal_remote_enabled: dot.contains("CONFIG_DEVCONFIG_ENABLE_SYSTEMD_JOURNAL_REMOTE"),
            soak_duration_secs: dot.get_u64("CONFIG_FSTESTS_SOAK_DURATION")?.unwrap_or(0),
            configured_kernel,
            libvirt: dot.is_enabled("CONFIG_LIBVIRT"),
            libvirt_uri_system: dot.is_enabled("CONFIG_LIBVIRT_URI_SYSTEM"),
            guestfs: dot.is_enabled("CONFIG_GUESTFS"),
            hosts_prefix: dot
                .get("CONFIG_KDEVOPS_HOSTS_PREFIX")
                .filter(|p| !p.is_empty())
                .map(str::to_string),
            stall,
        })
    }

    /// Journal delivery for stall polling: remote when configured, unless
    /// ssh is forced.
    pub fn journal_delivery(&self, force_ssh: bool) -> JournalDelivery {
        if self.journal_remote_enabled && !force_ssh {
            JournalDelivery::SystemdRemote
        } else {
            JournalDelivery::Ssh
        }
    }

    /// Where guestfs keeps per-host console captures.
    pub fn guestfs_dir(&self) -> PathBuf {
        self.topdir.join("guestfs")
    }

    /// Results tree for a test suite (`workflows/<suite>/results`).
    pub fn results_dir(&self, suite: &str) -> PathBuf {
        self.topdir.join("workflows").join(suite).join("results")
    }

    /// Crash artifacts, shared by every binary that checks for crashes.
    pub fn crash_dir(&self) -> PathBuf {
        self.topdir.join("crashes")
    }
}

/// Tunables loaded from `watchdog.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Policy {
    pub timeouts: TimeoutPolicy,
    pub capture: CapturePolicy,
    pub signatures: SignaturePolicy,
    pub soak: SoakPolicy,
    pub paths: PathPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    /// Single journal queries (kernel version, current test).
    pub query_secs: u64,
    /// Whole kernel log collection for crash detection.
    pub collect_secs: u64,
    /// `ssh -G` and `ssh host true` probes.
    pub probe_secs: u64,
    pub reset_secs: u64,
    pub decode_secs: u64,
    /// How long to wait for ssh to come back after a reset.
    pub ssh_wait_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CapturePolicy {
    /// Lines kept before the matching line.
    pub lines_before: usize,
    /// Lines kept from the matching line onward.
    pub lines_after: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignaturePolicy {
    /// Regexes that mark a kernel crash.
    pub crash: Vec<String>,
    /// Regexes that mark filesystem corruption.
    pub corruption: Vec<String>,
    /// Substring that marks a kernel warning line.
    pub warning_marker: String,
    /// Regexes for warning lines that are expected and ignored.
    pub benign_warnings: Vec<String>,
    /// fstests tests that corrupt a filesystem on purpose.
    pub intentional_corruption_tests: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SoakPolicy {
    /// fstests tests that loop for the configured soak duration.
    pub tests: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathPolicy {
    pub remote_journal_dir: PathBuf,
    pub journal_group: String,
    pub ssh: String,
    pub journalctl: String,
    pub virsh: String,
    pub sudo: String,
}

impl Policy {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Policy {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load `explicit` if given, else `<topdir>/watchdog.toml` if present,
    /// else built-in defaults.
    pub fn load_for(explicit: Option<&Path>, topdir: &Path) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let implicit = topdir.join(POLICY_FILE_NAME);
        if implicit.exists() {
            tracing::debug!(path = %implicit.display(), "loading watchdog policy");
            return Self::load(&implicit);
        }
        Ok(Self::default())
    }
}

impl TimeoutPolicy {
    pub fn query(&self) -> Duration {
        Duration::from_secs(self.query_secs)
    }

    pub fn collect(&self) -> Duration {
        Duration::from_secs(self.collect_secs)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }

    pub fn reset(&self) -> Duration {
        Duration::from_secs(self.reset_secs)
    }

    pub fn decode(&self) -> Duration {
        Duration::from_secs(self.decode_secs)
    }

    pub fn ssh_wait(&self) -> Duration {
        Duration::from_secs(self.ssh_wait_secs)
    }
}

// --- Default implementations ---

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            query_secs: 120,
            collect_secs: 120,
            probe_secs: 10,
            reset_secs: 60,
            decode_secs: 300,
            ssh_wait_secs: 600,
        }
    }
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            lines_before: 5,
            lines_after: 100,
        }
    }
}

impl Default for SignaturePolicy {
    fn default() -> Self {
        Self {
            crash: to_strings(DEFAULT_CRASH_PATTERNS),
            corruption: to_strings(DEFAULT_CORRUPTION_PATTERNS),
            warning_marker: "WARNING:".to_string(),
            benign_warnings: to_strings(DEFAULT_BENIGN_WARNINGS),
            intentional_corruption_tests: to_strings(DEFAULT_INTENTIONAL_CORRUPTION_TESTS),
        }
    }
}

impl Default for SoakPolicy {
    fn default() -> Self {
        Self {
            tests: to_strings(DEFAULT_SOAK_TESTS),
        }
    }
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self {
            remote_journal_dir: PathBuf::from("/var/log/journal/remote"),
            journal_group: "systemd-journal-remote".to_string(),
            ssh: "ssh".to_string(),
            journalctl: "journalctl".to_string(),
            virsh: "virsh".to_string(),
            sudo: "sudo".to_string(),
        }
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// "Call Trace" and "RIP:" also follow every WARNING splat; they are not
// crash signatures on their own.
const DEFAULT_CRASH_PATTERNS: &[&str] = &[
    r"Kernel panic",
    r"BUG:",
    r"Oops:",
    r"general protection fault",
    r"Unable to handle kernel",
    r"divide error",
    r"kernel BUG at",
    r"UBSAN:",
    r"kernel stack overflow",
    r"detected stall on CPU",
    r"soft lockup",
    r"hung_task: blocked tasks",
    r"INFO: task .* blocked for more than \d+ seconds",
];

const DEFAULT_CORRUPTION_PATTERNS: &[&str] = &[
    r"Filesystem corruption detected",
    r"Corrupted directory entry",
    r"bad inode",
    r"journal commit I/O error",
    r"XFS: Internal error",
    r"XFS \(.+\): Corruption detected",
    r"XFS \(.+\): Metadata corruption",
    r"XFS \(.+\): bad magic number",
    r"XFS \(.+\): Unrecoverable I/O failure",
    r"XFS \(.+\): Log inconsistent",
    r"XFS \(.+\): Log recovery failed",
    r"XFS: Assertion failed:",
    r"BTRFS critical",
    r"BTRFS: corruption",
    r"BTRFS: parent transid verify failed",
    r"BTRFS: checksum verify failed",
    r"BTRFS: Transaction aborted",
    r"BTRFS: tree block corruption detected",
];

const DEFAULT_BENIGN_WARNINGS: &[&str] = &[
    r"Spectre V2 : WARNING: Unprivileged eBPF is enabled",
    r"WARNING: CPU: \d+ PID: \d+ at (net|drivers|security|arch)/.*spectre",
    r"WARNING: You are running an unsupported configuration",
    r"WARNING: Support for unprivileged eBPF will be removed soon",
];

// Tests that use _require_scratch_nocheck and corrupt the scratch device.
const DEFAULT_INTENTIONAL_CORRUPTION_TESTS: &[&str] = &[
    "btrfs/011", "btrfs/012", "btrfs/027", "btrfs/060", "btrfs/061", "btrfs/062",
    "btrfs/063", "btrfs/064", "btrfs/065", "btrfs/066", "btrfs/067", "btrfs/068",
    "btrfs/069", "btrfs/070", "btrfs/071", "btrfs/072", "btrfs/073", "btrfs/074",
    "btrfs/080", "btrfs/136", "btrfs/196", "btrfs/207", "btrfs/254", "btrfs/290",
    "btrfs/321", "ext4/002", "ext4/025", "ext4/033", "ext4/037", "ext4/040",
    "ext4/041", "ext4/054", "ext4/055", "generic/050", "generic/311", "generic/321",
    "generic/322", "generic/338", "generic/347", "generic/405", "generic/455",
    "generic/461", "generic/464", "generic/466", "generic/482", "generic/484",
    "generic/487", "generic/500", "generic/520", "generic/556", "generic/563",
    "generic/570", "generic/590", "generic/623", "generic/740", "generic/749",
    "generic/757", "overlay/005", "overlay/010", "overlay/014", "overlay/019",
    "overlay/031", "overlay/035", "overlay/036", "overlay/037", "overlay/038",
    "overlay/041", "overlay/043", "overlay/044", "overlay/045", "overlay/046",
    "overlay/049", "overlay/051", "overlay/053", "overlay/055", "overlay/056",
    "overlay/057", "overlay/059", "overlay/060", "overlay/065", "overlay/067",
    "overlay/069", "overlay/070", "overlay/071", "overlay/077", "overlay/079",
    "overlay/080", "overlay/083", "overlay/084", "overlay/085", "overlay/086",
    "overlay/087", "xfs/001", "xfs/002", "xfs/005", "xfs/045", "xfs/049", "xfs/058",
    "xfs/070", "xfs/076", "xfs/081", "xfs/115", "xfs/132", "xfs/133", "xfs/134",
    "xfs/154", "xfs/155", "xfs/157", "xfs/162", "xfs/179", "xfs/202", "xfs/205",
    "xfs/270", "xfs/306", "xfs/310", "xfs/424", "xfs/438", "xfs/439", "xfs/448",
    "xfs/449", "xfs/490", "xfs/493", "xfs/495", "xfs/500", "xfs/503", "xfs/504",
    "xfs/506", "xfs/516", "xfs/520", "xfs/521", "xfs/522", "xfs/523", "xfs/524",
    "xfs/525", "xfs/526", "xfs/528", "xfs/530", "xfs/533", "xfs/546", "xfs/569",
    "xfs/601", "xfs/602", "xfs/603", "xfs/608", "xfs/798",
];

// fstests that honour SOAK_DURATION instead of a fixed op count.
const DEFAULT_SOAK_TESTS: &[&str] = &[
    "generic/019", "generic/388", "generic/475", "generic/476", "generic/482",
    "generic/521", "generic/522", "generic/642", "generic/648", "generic/650",
    "xfs/285", "xfs/517",
];

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
#
# Automatically generated file; DO NOT EDIT.
#
CONFIG_LIBVIRT=y
# CONFIG_LIBVIRT_URI_SYSTEM is not set
CONFIG_GUESTFS=y
CONFIG_DEVCONFIG_ENABLE_SYSTEMD_JOURNAL_REMOTE=y
CONFIG_FSTESTS_SOAK_DURATION=\"3600\"
CONFIG_BOOTLINUX_TREE_REF=\"v6.8-rc1\"
CONFIG_KDEVOPS_HOSTS_PREFIX=\"line\"
";

    #[test]
    fn test_dotconfig_parse_values_and_comments() {
        let dot = DotConfig::parse(SAMPLE);
        assert!(dot.is_enabled("CONFIG_LIBVIRT"));
        assert!(!dot.contains("CONFIG_LIBVIRT_URI_SYSTEM"));
        assert_eq!(dot.get("CONFIG_BOOTLINUX_TREE_REF"), Some("v6.8-rc1"));
        assert_eq!(dot.get_u64("CONFIG_FSTESTS_SOAK_DURATION").unwrap(), Some(3600));
        assert_eq!(dot.get_u64("CONFIG_MISSING").unwrap(), None);
    }

    #[test]
    fn test_dotconfig_invalid_number() {
        let dot = DotConfig::parse("CONFIG_FSTESTS_SOAK_DURATION=\"soon\"\n");
        let err = dot.get_u64("CONFIG_FSTESTS_SOAK_DURATION").unwrap_err();
        assert!(err.to_string().contains("CONFIG_FSTESTS_SOAK_DURATION"));
    }

    #[test]
    fn test_watchdog_config_from_dotconfig() {
        let dot = DotConfig::parse(SAMPLE);
        let config = WatchdogConfig::from_dotconfig(&dot, PathBuf::from("/srv/kdevops")).unwrap();
        assert!(config.journal_remote_enabled);
        assert_eq!(config.soak_duration_secs, 3600);
        assert_eq!(config.configured_kernel.as_deref(), Some("v6.8-rc1"));
        assert!(config.libvirt);
        assert!(!config.libvirt_uri_system);
        assert!(config.guestfs);
        assert_eq!(config.hosts_prefix.as_deref(), Some("line"));
        assert_eq!(config.stall, StallLimits::default());
        assert_eq!(config.guestfs_dir(), PathBuf::from("/srv/kdevops/guestfs"));
        assert_eq!(
            config.results_dir("fstests"),
            PathBuf::from("/srv/kdevops/workflows/fstests/results")
        );
    }

    #[test]
    fn test_distro_kernel_wins_over_tree_ref() {
        let dot = DotConfig::parse(
            "CONFIG_WORKFLOW_LINUX_DISTRO=y\nCONFIG_BOOTLINUX_TREE_REF=\"master\"\n",
        );
        let config = WatchdogConfig::from_dotconfig(&dot, PathBuf::from(".")).unwrap();
        assert_eq!(config.configured_kernel.as_deref(), Some("Distro-kernel"));
    }

    #[test]
    fn test_stall_limits_from_dotconfig_minutes() {
        let dot = DotConfig::parse(
            "CONFIG_FSTESTS_WATCHDOG_HUNG_MULTIPLIER_LONG_TESTS=10\n\
             CONFIG_FSTESTS_WATCHDOG_HUNG_FAST_TEST_MAX_TIME=2\n\
             CONFIG_FSTESTS_WATCHDOG_MAX_NEW_TEST_TIME=30\n",
        );
        let config = WatchdogConfig::from_dotconfig(&dot, PathBuf::from(".")).unwrap();
        assert_eq!(config.stall.hung_multiplier, 10);
        assert_eq!(config.stall.fast_test_max_secs, 120);
        assert_eq!(config.stall.max_new_test_secs, 1800);
    }

    #[test]
    fn test_journal_delivery() {
        let dot = DotConfig::parse(SAMPLE);
        let config = WatchdogConfig::from_dotconfig(&dot, PathBuf::from(".")).unwrap();
        assert_eq!(config.journal_delivery(false), JournalDelivery::SystemdRemote);
        assert_eq!(config.journal_delivery(true), JournalDelivery::Ssh);

        let config = WatchdogConfig::from_dotconfig(&DotConfig::default(), PathBuf::from(".")).unwrap();
        assert_eq!(config.journal_delivery(false), JournalDelivery::Ssh);
        assert_eq!(config.soak_duration_secs, 0);
        assert!(config.configured_kernel.is_none());
    }

    #[test]
    fn test_load_sets_topdir_to_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".config");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = WatchdogConfig::load(&path).unwrap();
        assert_eq!(config.topdir, dir.path());
        assert_eq!(config.crash_dir(), dir.path().join("crashes"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = WatchdogConfig::load(Path::new("/nonexistent/.config")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_policy_defaults() {
        let policy = Policy::default();
        assert_eq!(policy.timeouts.query(), Duration::from_secs(120));
        assert_eq!(policy.capture.lines_before, 5);
        assert_eq!(policy.capture.lines_after, 100);
        assert!(policy.signatures.crash.iter().any(|p| p == "Kernel panic"));
        assert_eq!(policy.paths.journal_group, "systemd-journal-remote");
    }

    #[test]
    fn test_policy_partial_toml_keeps_defaults() {
        let policy: Policy = toml::from_str(
            r#"
[timeouts]
query_secs = 30

[soak]
tests = ["generic/999"]
"#,
        )
        .unwrap();
        assert_eq!(policy.timeouts.query_secs, 30);
        assert_eq!(policy.timeouts.collect_secs, 120);
        assert_eq!(policy.soak.tests, vec!["generic/999"]);
        assert!(!policy.signatures.crash.is_empty());
    }

    #[test]
    fn test_policy_load_for_prefers_explicit_then_topdir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            Policy::load_for(None, dir.path()).unwrap().timeouts.query_secs,
            120
        );

        std::fs::write(
            dir.path().join(POLICY_FILE_NAME),
            "[timeouts]\nquery_secs = 45\n",
        )
        .unwrap();
        assert_eq!(
            Policy::load_for(None, dir.path()).unwrap().timeouts.query_secs,
            45
        );

        let explicit = dir.path().join("other.toml");
        std::fs::write(&explicit, "[timeouts]\nquery_secs = 7\n").unwrap();
        assert_eq!(
            Policy::load_for(Some(&explicit), dir.path())
                .unwrap()
                .timeouts
                .query_secs,
            7
        );
    }

    #[test]
    fn test_policy_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[timeouts\n").unwrap();
        assert!(matches!(
            Policy::load(&path).unwrap_err(),
            ConfigError::Policy { .. }
        ));
    }
}
