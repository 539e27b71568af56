//! Assembling orbit frames into a video with `ffmpeg`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

/// Orbit videos always play at this rate.
pub const FRAME_RATE: u32 = 30;

/// Frame file pattern the encoder reads, relative to the frame directory.
pub const FRAME_PATTERN: &str = "frame_%04d.jpg";

#[derive(Debug, thiserror::Error)]
pub enum FfmpegError {
    #[error("ffmpeg binary not found: {0}")]
    NotFound(std::io::Error),

    #[error("ffmpeg execution failed (exit code {exit_code:?}): {stderr}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("encoder produced no output at {0}")]
    MissingOutput(PathBuf),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Name of the `index`-th frame file.
pub fn frame_file_name(index: usize) -> String {
    format!("frame_{index:04}")
}

#[async_trait]
pub trait VideoEncoder: Send + Sync {
    /// Encodes `frame_dir/frame_%04d.jpg` into `output`.
    async fn encode(&self, frame_dir: &Path, output: &Path) -> Result<(), FfmpegError>;
}

/// Shells out to the `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    program: PathBuf,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
        }
    }
}

impl Ffmpeg {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, frame_dir: &Path, output: &Path) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(["-y", "-loglevel", "error", "-framerate"])
            .arg(FRAME_RATE.to_string())
            .arg("-i")
            .arg(frame_dir.join(FRAME_PATTERN))
            .args(["-c:v", "libx264", "-pix_fmt", "yuv420p"])
            .arg(output);
        command
    }
}

#[async_trait]
impl VideoEncoder for Ffmpeg {
    async fn encode(&self, frame_dir: &Path, output: &Path) -> Result<(), FfmpegError> {
        debug!(frames = %frame_dir.display(), output = %output.display(), "Running ffmpeg");
        let result = self
            .command(frame_dir, output)
            .output()
            .await
            .map_err(FfmpegError::NotFound)?;

        if !result.status.success() {
            return Err(FfmpegError::ExecutionFailed {
                exit_code: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).to_string(),
            });
        }
        if !output.is_file() {
            return Err(FfmpegError::MissingOutput(output.to_path_buf()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_names_are_zero_padded() {
        assert_eq!(frame_file_name(0), "frame_0000");
        assert_eq!(frame_file_name(42), "frame_0042");
    }

    #[test]
    fn builds_the_encode_command_line() {
        let command = Ffmpeg::default().command(Path::new("/tmp/frames"), Path::new("/tmp/castle_orbit.mp4"));
        let args: Vec<_> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "-y",
                "-loglevel",
                "error",
                "-framerate",
                "30",
                "-i",
                "/tmp/frames/frame_%04d.jpg",
                "-c:v",
                "libx264",
                "-pix_fmt",
                "yuv420p",
                "/tmp/castle_orbit.mp4",
            ]
        );
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = Ffmpeg::new("/nonexistent/ffmpeg")
            .encode(dir.path(), &dir.path().join("out.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, FfmpegError::NotFound(_)));
    }
}
