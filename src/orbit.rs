//! Orbit animations: a camera sweep rendered frame by frame and assembled
//! into a video.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cancel::checkpoint;
use crate::error::JobError;
use crate::ffmpeg::{frame_file_name, VideoEncoder};
use crate::render::{render_frame, RenderEngine};
use crate::scene::framing::ORBIT_OFFSET;
use crate::scene::Scene;

pub const MAX_ORBIT_FRAMES: u32 = 300;

/// Azimuth advance per frame, in degrees.
pub const ORBIT_STEP: f64 = 1.2;

pub const ORBIT_RESOLUTION: [u32; 2] = [320, 320];

static ORBIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)orbit=([+-]?\d+)?").expect("valid regex"));

/// Frame count requested by an `orbit=<n>` directive, or 0 when the message
/// carries none or an out-of-range one.
pub fn parse_orbit(content: &str) -> u32 {
    let Some(captures) = ORBIT_RE.captures(content) else {
        return 0;
    };
    let Some(value) = captures.get(1) else {
        debug!("Orbit directive without a number");
        return 0;
    };
    match value.as_str().parse::<i64>() {
        Ok(frames) if (1..=i64::from(MAX_ORBIT_FRAMES)).contains(&frames) => frames as u32,
        Ok(frames) => {
            warn!(frames, "Orbit frame count out of range (must be 1-300)");
            0
        }
        Err(_) => 0,
    }
}

/// Renders `frames` frames into `frame_dir` and encodes them into `output`.
///
/// Frame files are always removed, whether the sweep succeeds, fails or is
/// cancelled.
#[instrument(skip_all, fields(frames = frames))]
pub async fn render_orbit(
    engine: &mut dyn RenderEngine,
    encoder: &dyn VideoEncoder,
    scene: &mut Scene,
    frames: u32,
    frame_dir: &Path,
    output: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, JobError> {
    tokio::fs::create_dir_all(frame_dir).await?;
    let result = sweep(engine, encoder, scene, frames, frame_dir, output, cancel).await;
    remove_frames(frame_dir).await;
    result
}

async fn sweep(
    engine: &mut dyn RenderEngine,
    encoder: &dyn VideoEncoder,
    scene: &mut Scene,
    frames: u32,
    frame_dir: &Path,
    output: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, JobError> {
    scene.camera.resolution = ORBIT_RESOLUTION;
    scene.output.directory = frame_dir.to_path_buf();

    for i in 0..frames {
        checkpoint(cancel)?;
        debug!(frame = i + 1, frames, "Rendering orbit frame");

        let elevation = scene.camera.elevation;
        scene
            .camera
            .set_orbit(ORBIT_OFFSET + f64::from(i) * ORBIT_STEP, elevation);
        scene.output.name = frame_file_name(i as usize);
        render_frame(engine, scene, cancel).await?;
    }

    info!(frames, "All frames rendered, encoding video");
    encoder.encode(frame_dir, output).await?;
    Ok(output.to_path_buf())
}

async fn remove_frames(frame_dir: &Path) {
    match tokio::fs::remove_dir_all(frame_dir).await {
        Ok(()) => debug!(dir = %frame_dir.display(), "Removed orbit frames"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(dir = %frame_dir.display(), error = %err, "Failed to remove orbit frames"),
    }
}
