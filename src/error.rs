use std::path::PathBuf;

use crate::ffmpeg::FfmpegError;
use crate::platform::PlatformError;

/// Default number of retries granted to transient failures.
pub const MAX_RETRIES: i64 = 3;

/// Errors raised while reading a scene package.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("scene manifest not found: {0}")]
    MissingManifest(PathBuf),

    #[error("invalid scene manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("palette not found: {0}")]
    MissingPalette(PathBuf),

    #[error("unreadable palette {path}: {reason}")]
    Palette { path: PathBuf, reason: String },

    #[error("material settings not found: {0}")]
    MissingMaterials(PathBuf),

    #[error("unreadable material settings {path}: {reason}")]
    Materials { path: PathBuf, reason: String },

    #[error("unreadable content blob {path}: {reason}")]
    Content { path: PathBuf, reason: String },

    #[error("file reference escapes the package: {0}")]
    UnsafePath(String),

    #[error("no package directory inside archive")]
    NoPackageRoot,

    #[error("archive extraction failed: {0}")]
    Unpack(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a render engine binding.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("renderer failed to start: {0}")]
    Start(String),

    #[error("renderer poll failed: {0}")]
    Poll(String),

    #[error("renderer exited with status {0}")]
    Exit(i32),

    #[error("render finished without producing {0}")]
    MissingOutput(PathBuf),
}

/// Worker-level failure taxonomy. Every variant maps to exactly one store
/// outcome in the worker loop.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("download failed: {0}")]
    Download(PlatformError),

    #[error("malformed package: {0}")]
    Malformed(#[from] PackageError),

    #[error("render failed: {0}")]
    Render(#[from] RenderError),

    #[error("video encoding failed: {0}")]
    Encode(#[from] FfmpegError),

    #[error("delivery failed: {0}")]
    Delivery(PlatformError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("job cancelled")]
    Cancelled,
}

impl JobError {
    /// Only transient intake and delivery failures are retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Download(_) | JobError::Delivery(_))
    }

    /// Retry budget to hand to `mark_failed` given the configured maximum.
    pub fn retry_budget(&self, max_retries: i64) -> i64 {
        if self.is_transient() {
            max_retries
        } else {
            0
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}
