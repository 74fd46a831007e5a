//! On-disk crash artifacts, one directory per host.
//!
//! ```text
//! <output>/<host>/
//!   .lock
//!   journal-20241012-101500.crash
//!   journal-20241012-101500.decoded.crash
//!   journal-20241012-101500.warning
//! ```
//!
//! The files are the only state kept between passes: a raw artifact's first
//! line carries its event fingerprint, and that is how a later pass knows an
//! event was already handled.
use super::DetectionKind;
use chrono::Local;
use fs2::FileExt;
use regex::Regex;
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static EVENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[event ([0-9a-f]{16})\]").unwrap());

const LOCK_FILE: &str = ".lock";

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to lock {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Exclusive hold on a host's artifact directory. Released on drop.
#[derive(Debug)]
pub struct HostLock {
    file: File,
}

impl Drop for HostLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(output_dir: &Path, host: &str) -> Self {
        Self {
            dir: output_dir.join(host),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Take the host lock without waiting. `None` if another pass holds it.
    pub fn try_lock(&self) -> Result<Option<HostLock>, ArtifactError> {
        std::fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let path = self.dir.join(LOCK_FILE);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err(&path))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(HostLock { file })),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(ArtifactError::Lock { path, source: e }),
        }
    }

    /// Artifacts of `kind`, raw and decoded, in name order.
    pub fn artifacts(&self, kind: DetectionKind) -> Vec<PathBuf> {
        let suffix = format!(".{}", kind.extension());
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("journal-") && n.ends_with(&suffix))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        files
    }

    /// Fingerprints of every crash and corruption event already on disk.
    pub fn known_events(&self) -> HashSet<String> {
        let mut known = HashSet::new();
        for path in self
            .artifacts(DetectionKind::Crash)
            .into_iter()
            .chain(self.artifacts(DetectionKind::Corruption))
        {
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    let first = text.lines().next().unwrap_or_default();
                    if let Some(caps) = EVENT_RE.captures(first) {
                        known.insert(caps[1].to_string());
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to read artifact");
                }
            }
        }
        known
    }

    /// Every line already saved in a warning artifact.
    pub fn known_warning_lines(&self) -> HashSet<String> {
        self.artifacts(DetectionKind::Warning)
            .iter()
            .filter_map(|p| std::fs::read_to_string(p).ok())
            .flat_map(|text| text.lines().map(str::to_string).collect::<Vec<_>>())
            .collect()
    }

    /// Write a new `journal-<timestamp>.<kind>` artifact.
    pub fn persist(&self, kind: DetectionKind, content: &str) -> Result<PathBuf, ArtifactError> {
        let stem = format!("journal-{}", Local::now().format("%Y%m%d-%H%M%S"));
        self.write_new(&stem, kind.extension(), content)
    }

    /// Write the decoded companion of the raw artifact at `raw`.
    pub fn persist_decoded(&self, raw: &Path, kind: DetectionKind, content: &str) -> Result<PathBuf, ArtifactError> {
        let ext = kind.extension();
        let name = raw
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("journal");
        let stem = name.strip_suffix(&format!(".{ext}")).unwrap_or(name);
        self.write_new(&format!("{stem}.decoded"), ext, content)
    }

    /// Atomically create `<stem>.<ext>`, or `<stem>-N.<ext>` if taken.
    fn write_new(&self, stem: &str, ext: &str, content: &str) -> Result<PathBuf, ArtifactError> {
        std::fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err(&self.dir))?;
        tmp.write_all(content.as_bytes()).map_err(io_err(tmp.path()))?;
        tmp.as_file().sync_all().map_err(io_err(tmp.path()))?;

        let mut attempt = 0u32;
        loop {
            let path = if attempt == 0 {
                self.dir.join(format!("{stem}.{ext}"))
            } else {
                self.dir.join(format!("{stem}-{attempt}.{ext}"))
            };
            match tmp.persist_noclobber(&path) {
                Ok(_) => {
                    sync_dir(&self.dir)?;
                    return Ok(path);
                }
                Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                    tmp = e.file;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(ArtifactError::Io {
                        path,
                        source: e.error,
                    })
                }
            }
        }
    }
}

fn sync_dir(dir: &Path) -> Result<(), ArtifactError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(io_err(dir))
}
