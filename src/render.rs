//! Render engine seam and the poll loop that drives it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{JobError, RenderError};
use crate::scene::Scene;

pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// An external renderer consuming a scene graph.
#[async_trait]
pub trait RenderEngine: Send {
    /// Starts rendering `scene` into `scene.output.path()`.
    async fn start(&mut self, scene: &Scene) -> Result<(), RenderError>;

    async fn stop(&mut self) -> Result<(), RenderError>;

    /// Whether the last started render is still running.
    async fn rendering(&mut self) -> Result<bool, RenderError>;
}

/// Starts a render and polls it until it finishes or `cancel` fires.
/// Returns the produced image.
pub async fn render_frame(
    engine: &mut dyn RenderEngine,
    scene: &Scene,
    cancel: &CancellationToken,
) -> Result<PathBuf, JobError> {
    let output = scene.output.path();
    engine.start(scene).await?;

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        ticker.tick().await;
        if cancel.is_cancelled() {
            info!("Stopping render on cancel request");
            if let Err(err) = engine.stop().await {
                warn!(error = %err, "Renderer did not stop cleanly");
            }
            return Err(JobError::Cancelled);
        }
        if !engine.rendering().await? {
            break;
        }
    }

    if !output.is_file() {
        return Err(RenderError::MissingOutput(output).into());
    }
    debug!(output = %output.display(), "Render finished");
    Ok(output)
}

/// Runs `<program> <scene.json> <output>` for every render.
#[derive(Debug)]
pub struct CommandRenderer {
    program: PathBuf,
    child: Option<Child>,
}

impl CommandRenderer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            child: None,
        }
    }

    fn scene_file(scene: &Scene) -> PathBuf {
        scene
            .output
            .directory
            .join(format!("{}.scene.json", scene.output.name))
    }

    async fn write_scene(path: &Path, scene: &Scene) -> Result<(), RenderError> {
        let body = serde_json::to_vec(scene).map_err(|e| RenderError::Start(e.to_string()))?;
        tokio::fs::write(path, body)
            .await
            .map_err(|e| RenderError::Start(format!("{}: {e}", path.display())))
    }
}

#[async_trait]
impl RenderEngine for CommandRenderer {
    async fn start(&mut self, scene: &Scene) -> Result<(), RenderError> {
        if self.child.is_some() {
            self.stop().await?;
        }

        let scene_file = Self::scene_file(scene);
        Self::write_scene(&scene_file, scene).await?;

        let child = Command::new(&self.program)
            .arg(&scene_file)
            .arg(scene.output.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RenderError::Start(format!("{}: {e}", self.program.display())))?;
        debug!(program = %self.program.display(), pid = ?child.id(), "Renderer started");
        self.child = Some(child);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), RenderError> {
        if let Some(mut child) = self.child.take() {
            child
                .kill()
                .await
                .map_err(|e| RenderError::Poll(e.to_string()))?;
        }
        Ok(())
    }

    async fn rendering(&mut self) -> Result<bool, RenderError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(false);
        };
        match child.try_wait() {
            Ok(None) => Ok(true),
            Ok(Some(status)) => {
                self.child = None;
                if status.success() {
                    Ok(false)
                } else {
                    Err(RenderError::Exit(status.code().unwrap_or(-1)))
                }
            }
            Err(e) => Err(RenderError::Poll(e.to_string())),
        }
    }
}
