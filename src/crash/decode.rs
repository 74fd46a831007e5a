//! Symbolizing captured stack traces.
use crate::exec::{BoundedCommand, ExecError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("decoder exited with {status:?}: {detail}")]
    Failed { status: Option<i32>, detail: String },
}

/// Turns a raw artifact into a symbolized one.
#[async_trait]
pub trait Decoder: Send + Sync {
    async fn decode(&self, raw: &Path) -> Result<String, DecodeError>;
}

/// The kernel tree's `scripts/decode_stacktrace.sh`, fed the artifact on stdin.
#[derive(Debug, Clone)]
pub struct StacktraceDecoder {
    script: PathBuf,
    vmlinux: PathBuf,
    timeout: Duration,
}

impl StacktraceDecoder {
    pub fn new(script: PathBuf, vmlinux: PathBuf, timeout: Duration) -> Self {
        Self {
            script,
            vmlinux,
            timeout,
        }
    }

    /// Decoder for the kernel built under `<topdir>/linux`, if both the
    /// script and `vmlinux` are present.
    pub fn from_topdir(topdir: &Path, timeout: Duration) -> Option<Self> {
        let linux = topdir.join("linux");
        let script = linux.join("scripts").join("decode_stacktrace.sh");
        let vmlinux = linux.join("vmlinux");
        if script.is_file() && vmlinux.is_file() {
            Some(Self::new(script, vmlinux, timeout))
        } else {
            tracing::info!(dir = %linux.display(), "decode_stacktrace.sh or vmlinux missing, crashes will not be decoded");
            None
        }
    }
}

#[async_trait]
impl Decoder for StacktraceDecoder {
    async fn decode(&self, raw: &Path) -> Result<String, DecodeError> {
        let out = BoundedCommand::new(self.script.to_string_lossy())
            .arg(self.vmlinux.to_string_lossy())
            .stdin_file(raw)
            .timeout(self.timeout)
            .run()
            .await?;
        if !out.success() {
            return Err(DecodeError::Failed {
                status: out.status,
                detail: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout)
    }
}
