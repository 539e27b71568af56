//! The single sequential worker: dequeue, download, parse, build, frame,
//! render, deliver, record the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Error;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::archive::{find_package_root, Unpacker};
use crate::cancel::checkpoint;
use crate::db::{ClaimedJob, FailOutcome, JobStore};
use crate::error::{JobError, MAX_RETRIES};
use crate::ffmpeg::VideoEncoder;
use crate::orbit::{parse_orbit, render_orbit};
use crate::package::parse_package;
use crate::platform::{self, ChatPlatform, OutgoingMessage};
use crate::render::{render_frame, RenderEngine};
use crate::scene::{build_scene, frame_scene, MeshMode, Scene};
use crate::Job;

const ARCHIVE_FILE: &str = "package.vmax.zip";
const UNPACK_DIR: &str = "unpacked";
const FRAME_DIR: &str = "frames";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Parent of the per-job scratch directories.
    pub work_dir: PathBuf,
    pub mode: MeshMode,
    pub max_retries: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("voxq_work"),
            mode: MeshMode::Boxes,
            max_retries: MAX_RETRIES,
        }
    }
}

/// How a claimed job left the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { attempt: i64 },
    Failed,
    Cancelled,
}

pub struct Worker {
    store: Arc<JobStore>,
    platform: Arc<dyn ChatPlatform>,
    engine: Box<dyn RenderEngine>,
    unpacker: Arc<dyn Unpacker>,
    encoder: Arc<dyn VideoEncoder>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        store: Arc<JobStore>,
        platform: Arc<dyn ChatPlatform>,
        engine: Box<dyn RenderEngine>,
        unpacker: Arc<dyn Unpacker>,
        encoder: Arc<dyn VideoEncoder>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            platform,
            engine,
            unpacker,
            encoder,
            config,
        }
    }

    /// Processes jobs until the store reports shutdown. A job in flight when
    /// shutdown is requested still runs to its outcome. Only a failing
    /// `dequeue` stops the loop; a job whose outcome cannot be recorded is
    /// logged and left for startup recovery.
    pub async fn run(mut self) -> Result<(), Error> {
        info!(work_dir = %self.config.work_dir.display(), "Worker started");
        while let Some(claimed) = self.store.dequeue().await? {
            let job_id = claimed.job.id;
            if let Err(err) = self.process(claimed).await {
                error!(job_id, error = ?err, "Could not record job outcome");
            }
        }
        info!("Worker stopped.");
        Ok(())
    }

    /// Runs one job and funnels its result into exactly one store outcome.
    #[instrument(skip_all, fields(job_id = claimed.job.id, filename = %claimed.job.original_filename))]
    pub async fn process(&mut self, claimed: ClaimedJob) -> Result<JobOutcome, Error> {
        let ClaimedJob { job, cancel } = claimed;
        let scratch = self.config.work_dir.join(format!("job_{}", job.id));

        let result = self.execute(&job, &cancel, &scratch).await;
        let outcome = self.finish(&job, result).await;

        match tokio::fs::remove_dir_all(&scratch).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(dir = %scratch.display(), error = %err, "Failed to remove scratch directory"),
        }
        outcome
    }

    async fn execute(
        &mut self,
        job: &Job,
        cancel: &CancellationToken,
        scratch: &Path,
    ) -> Result<(), JobError> {
        tokio::fs::create_dir_all(scratch).await?;

        debug!(url = %job.attachment_url, "Downloading package");
        let bytes = platform::download(&*self.platform, &job.attachment_url)
            .await
            .map_err(JobError::Download)?;
        info!(bytes = bytes.len(), "Package downloaded");
        checkpoint(cancel)?;

        let archive = scratch.join(ARCHIVE_FILE);
        tokio::fs::write(&archive, &bytes).await?;
        let unpacked = scratch.join(UNPACK_DIR);
        tokio::fs::create_dir_all(&unpacked).await?;
        self.unpacker.unpack(&archive, &unpacked).await?;
        let root = find_package_root(&unpacked)?;

        let mut scene = {
            let cancel = cancel.clone();
            let mode = self.config.mode;
            tokio::task::spawn_blocking(move || prepare_scene(&root, mode, &cancel))
                .await
                .map_err(std::io::Error::other)??
        };
        checkpoint(cancel)?;

        if let Err(err) = self.store.mark_render_started(job.id).await {
            warn!(error = %err, "Could not record render start time");
        }

        let stem = artifact_stem(job);
        let frames = parse_orbit(&job.message_content);
        let (artifact, content) = if frames > 0 {
            info!(frames, "Starting orbit animation");
            let output = scratch.join(format!("{stem}_orbit.mp4"));
            let video = render_orbit(
                self.engine.as_mut(),
                self.encoder.as_ref(),
                &mut scene,
                frames,
                &scratch.join(FRAME_DIR),
                &output,
                cancel,
            )
            .await?;
            (video, format!("Here's your VoxelMax orbit animation! <@{}>", job.user_id))
        } else {
            info!("Starting single frame render");
            scene.output.directory = scratch.to_path_buf();
            scene.output.name = stem;
            let image = render_frame(self.engine.as_mut(), &scene, cancel).await?;
            (image, format!("Here's your rendered VoxelMax image! <@{}>", job.user_id))
        };
        checkpoint(cancel)?;

        let message = OutgoingMessage::text(job.channel_id, content)
            .with_file(&artifact)
            .await
            .map_err(JobError::Delivery)?;
        platform::send(&*self.platform, message)
            .await
            .map_err(JobError::Delivery)?;
        info!(artifact = %artifact.display(), "Delivered");
        Ok(())
    }

    async fn finish(&mut self, job: &Job, result: Result<(), JobError>) -> Result<JobOutcome, Error> {
        let err = match result {
            Ok(()) => {
                self.store.mark_completed(job.id).await?;
                return Ok(JobOutcome::Completed);
            }
            Err(JobError::Cancelled) => {
                info!("Job cancelled");
                self.store.mark_current_job_cancelled().await?;
                return Ok(JobOutcome::Cancelled);
            }
            Err(err) => err,
        };

        let budget = err.retry_budget(self.config.max_retries);
        match self.store.mark_failed(job.id, budget).await? {
            FailOutcome::Retrying { attempt } => {
                warn!(error = %err, attempt, "Job failed, retrying later");
                Ok(JobOutcome::Retrying { attempt })
            }
            FailOutcome::Abandoned | FailOutcome::Missing => {
                error!(error = %err, "Job failed");
                self.notify_failure(job, &err).await;
                Ok(JobOutcome::Failed)
            }
        }
    }

    async fn notify_failure(&mut self, job: &Job, err: &JobError) {
        let notice = OutgoingMessage::text(
            job.channel_id,
            format!(
                "Could not render `{}`: {err}. <@{}>",
                job.original_filename, job.user_id
            ),
        );
        if let Err(send_err) = platform::send(&*self.platform, notice).await {
            error!(error = %send_err, "Failed to send failure notice");
        }
    }
}

/// Parses, builds and frames the scene. CPU-bound; runs off the runtime.
fn prepare_scene(root: &Path, mode: MeshMode, cancel: &CancellationToken) -> Result<Scene, JobError> {
    let package = parse_package(root, cancel)?;
    let (mut scene, report) = build_scene(&package, mode, cancel)?;
    if frame_scene(&mut scene).is_none() {
        warn!(models = report.canonical_models, "Scene has no visible voxels");
    }
    Ok(scene)
}

/// Artifact file stem: the upload's base name, flattened to one path
/// component.
fn artifact_stem(job: &Job) -> String {
    let stem = job.base_name().replace(['/', '\\'], "_");
    if stem.is_empty() || stem == "." || stem == ".." {
        "render".into()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::{PackageError, RenderError};
    use crate::ffmpeg::FfmpegError;
    use crate::package::fixture::PackageFixture;
    use crate::platform::{Callback, PlatformError};
    use crate::{NewJob, Status};

    /// Fails the first `download_failures` downloads, records every message.
    #[derive(Default)]
    struct FakePlatform {
        download_failures: Mutex<usize>,
        sent: Mutex<Vec<OutgoingMessage>>,
    }

    impl FakePlatform {
        fn failing(download_failures: usize) -> Self {
            Self {
                download_failures: Mutex::new(download_failures),
                ..Default::default()
            }
        }

        fn sent(&self) -> Vec<OutgoingMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl ChatPlatform for FakePlatform {
        fn request(&self, _url: &str, callback: Callback<Vec<u8>>) {
            let mut failures = self.download_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                callback(Err(PlatformError::Status(503)));
            } else {
                callback(Ok(b"PK".to_vec()));
            }
        }

        fn send_message(&self, message: OutgoingMessage, callback: Callback<()>) {
            self.sent.lock().unwrap().push(message);
            callback(Ok(()));
        }
    }

    /// Ignores the archive and writes a known package instead.
    struct FixtureUnpacker;

    #[async_trait]
    impl Unpacker for FixtureUnpacker {
        async fn unpack(&self, _archive: &Path, dest: &Path) -> Result<(), PackageError> {
            PackageFixture::two_placements_of_one_model().write(&dest.join("castle.vmax"));
            Ok(())
        }
    }

    /// Finishes every render on the first poll. With `cancel_at` set, fires
    /// the token when the given (1-based) render starts.
    #[derive(Default)]
    struct InstantEngine {
        started: Arc<Mutex<usize>>,
        cancel_at: Option<(usize, CancellationToken)>,
        output: Option<PathBuf>,
    }

    #[async_trait]
    impl RenderEngine for InstantEngine {
        async fn start(&mut self, scene: &Scene) -> Result<(), RenderError> {
            let started = {
                let mut started = self.started.lock().unwrap();
                *started += 1;
                *started
            };
            if let Some((at, token)) = &self.cancel_at {
                if *at == started {
                    token.cancel();
                }
            }
            self.output = Some(scene.output.path());
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), RenderError> {
            self.output = None;
            Ok(())
        }

        async fn rendering(&mut self) -> Result<bool, RenderError> {
            if let Some(output) = self.output.take() {
                std::fs::write(output, b"jpeg").unwrap();
            }
            Ok(false)
        }
    }

    #[derive(Default)]
    struct RecordingEncoder {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl VideoEncoder for RecordingEncoder {
        async fn encode(&self, _frame_dir: &Path, output: &Path) -> Result<(), FfmpegError> {
            *self.calls.lock().unwrap() += 1;
            tokio::fs::write(output, b"mp4").await?;
            Ok(())
        }
    }

    struct Harness {
        store: Arc<JobStore>,
        platform: Arc<FakePlatform>,
        encoder: Arc<RecordingEncoder>,
        work_dir: tempfile::TempDir,
    }

    impl Harness {
        async fn new(platform: FakePlatform) -> Self {
            Self::with_database("sqlite::memory:", platform).await
        }

        async fn with_database(url: &str, platform: FakePlatform) -> Self {
            Self {
                store: Arc::new(JobStore::open(url, CancellationToken::new()).await.unwrap()),
                platform: Arc::new(platform),
                encoder: Arc::new(RecordingEncoder::default()),
                work_dir: tempfile::tempdir().unwrap(),
            }
        }

        fn worker(&self, engine: InstantEngine) -> Worker {
            Worker::new(
                self.store.clone(),
                self.platform.clone(),
                Box::new(engine),
                Arc::new(FixtureUnpacker),
                self.encoder.clone(),
                WorkerConfig {
                    work_dir: self.work_dir.path().to_path_buf(),
                    ..Default::default()
                },
            )
        }

        async fn enqueue(&self, content: &str) -> i64 {
            let job = NewJob::new(
                "https://cdn/castle.vmax.zip",
                "castle.vmax.zip",
                7,
                42,
                "ann",
                content,
            );
            self.store.enqueue(&job).await.unwrap()
        }

        fn work_dir_is_empty(&self) -> bool {
            std::fs::read_dir(self.work_dir.path()).unwrap().next().is_none()
        }
    }

    fn job(filename: &str) -> Job {
        Job {
            id: 1,
            attachment_url: String::new(),
            original_filename: filename.into(),
            channel_id: 0,
            user_id: 0,
            username: String::new(),
            message_content: String::new(),
            created_at: 0,
            retry_count: 0,
            status: Status::Processing,
            render_started_at: 0,
            render_finished_at: 0,
        }
    }

    #[test]
    fn artifact_stem_stays_in_scratch() {
        assert_eq!(artifact_stem(&job("Castle.VMAX.ZIP")), "Castle");
        assert_eq!(artifact_stem(&job("../up.vmax.zip")), ".._up");
        assert_eq!(artifact_stem(&job(".vmax.zip")), "render");
    }

    #[test]
    fn default_config_uses_standard_retry_budget() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_retries, MAX_RETRIES);
        assert_eq!(config.mode, MeshMode::Boxes);
    }

    #[tokio::test]
    async fn renders_and_delivers_a_still_image() {
        let harness = Harness::new(FakePlatform::default()).await;
        let id = harness.enqueue("render please").await;
        let mut worker = harness.worker(InstantEngine::default());

        let claimed = harness.store.dequeue().await.unwrap().unwrap();
        assert_eq!(worker.process(claimed).await.unwrap(), JobOutcome::Completed);

        let job = harness.store.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, Status::Completed);
        assert!(job.render_started_at > 0);

        let sent = harness.platform.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel_id, 7);
        assert!(sent[0].content.contains("<@42>"));
        let attachment = sent[0].attachment.as_ref().unwrap();
        assert_eq!(attachment.file_name, "castle.jpg");
        assert_eq!(attachment.bytes, b"jpeg");
        assert_eq!(*harness.encoder.calls.lock().unwrap(), 0);
        assert!(harness.work_dir_is_empty());
    }

    #[tokio::test]
    async fn renders_an_orbit_into_a_video() {
        let harness = Harness::new(FakePlatform::default()).await;
        harness.enqueue("orbit=4").await;
        let engine = InstantEngine::default();
        let started = engine.started.clone();
        let mut worker = harness.worker(engine);

        let claimed = harness.store.dequeue().await.unwrap().unwrap();
        assert_eq!(worker.process(claimed).await.unwrap(), JobOutcome::Completed);

        assert_eq!(*started.lock().unwrap(), 4);
        assert_eq!(*harness.encoder.calls.lock().unwrap(), 1);
        let sent = harness.platform.sent();
        assert_eq!(
            sent[0].attachment.as_ref().unwrap().file_name,
            "castle_orbit.mp4"
        );
    }

    #[tokio::test]
    async fn cancelled_orbit_leaves_nothing_behind() {
        let harness = Harness::new(FakePlatform::default()).await;
        let id = harness.enqueue("orbit=10").await;

        let claimed = harness.store.dequeue().await.unwrap().unwrap();
        let engine = InstantEngine {
            cancel_at: Some((3, claimed.cancel.clone())),
            ..Default::default()
        };
        let started = engine.started.clone();
        let mut worker = harness.worker(engine);

        assert_eq!(worker.process(claimed).await.unwrap(), JobOutcome::Cancelled);

        assert_eq!(*started.lock().unwrap(), 3);
        assert_eq!(*harness.encoder.calls.lock().unwrap(), 0);
        assert!(harness.platform.sent().is_empty());
        assert!(harness.store.job(id).await.unwrap().is_none());
        assert!(harness.work_dir_is_empty());
    }

    #[tokio::test]
    async fn download_failures_retry_then_give_up_once() {
        let harness = Harness::new(FakePlatform::failing(usize::MAX)).await;
        let id = harness.enqueue("").await;
        let mut worker = harness.worker(InstantEngine::default());

        let mut outcomes = Vec::new();
        for _ in 0..MAX_RETRIES {
            let claimed = harness.store.dequeue().await.unwrap().unwrap();
            assert_eq!(claimed.job.id, id);
            outcomes.push(worker.process(claimed).await.unwrap());
        }
        assert_eq!(
            outcomes,
            vec![
                JobOutcome::Retrying { attempt: 1 },
                JobOutcome::Retrying { attempt: 2 },
                JobOutcome::Failed,
            ]
        );
        assert!(harness.store.job(id).await.unwrap().is_none());

        let sent = harness.platform.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].content.starts_with("Could not render `castle.vmax.zip`"));
        assert!(sent[0].attachment.is_none());
    }

    #[tokio::test]
    async fn store_error_on_one_job_does_not_stop_the_worker() {
        use sqlx::{Connection, Executor};

        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let harness = Harness::with_database(&url, FakePlatform::default()).await;
        let first = harness.enqueue("").await;
        let second = harness.enqueue("").await;

        // Recording the first completion fails as a locked database would.
        let mut conn = sqlx::SqliteConnection::connect(&url).await.unwrap();
        let trigger = format!(
            "CREATE TRIGGER refuse_completion BEFORE UPDATE OF status ON work_queue \
            WHEN NEW.status = 'completed' AND OLD.id = {first} \
            BEGIN SELECT RAISE(ABORT, 'database is locked'); END;"
        );
        (&mut conn).execute(trigger.as_str()).await.unwrap();

        let running = tokio::spawn(harness.worker(InstantEngine::default()).run());
        for _ in 0..200 {
            let job = harness.store.job(second).await.unwrap().unwrap();
            if job.status == Status::Completed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        harness.store.request_shutdown();
        running.await.unwrap().unwrap();

        let second = harness.store.job(second).await.unwrap().unwrap();
        assert_eq!(second.status, Status::Completed);
        let first = harness.store.job(first).await.unwrap().unwrap();
        assert_eq!(first.status, Status::Processing);
        assert_eq!(harness.platform.sent().len(), 2);
    }

    #[tokio::test]
    async fn malformed_packages_fail_without_retry() {
        struct EmptyUnpacker;

        #[async_trait]
        impl Unpacker for EmptyUnpacker {
            async fn unpack(&self, _archive: &Path, _dest: &Path) -> Result<(), PackageError> {
                Ok(())
            }
        }

        let harness = Harness::new(FakePlatform::default()).await;
        let id = harness.enqueue("").await;
        let mut worker = harness.worker(InstantEngine::default());
        worker.unpacker = Arc::new(EmptyUnpacker);

        let claimed = harness.store.dequeue().await.unwrap().unwrap();
        assert_eq!(worker.process(claimed).await.unwrap(), JobOutcome::Failed);
        assert!(harness.store.job(id).await.unwrap().is_none());
        assert_eq!(harness.platform.sent().len(), 1);
    }
}
