use std::sync::Arc;

use anyhow::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::archive::Unpacker;
use crate::db::JobStore;
use crate::ffmpeg::VideoEncoder;
use crate::intake::{InboundEvent, Intake};
use crate::platform::{self, ChatPlatform};
use crate::render::RenderEngine;
use crate::worker::{Worker, WorkerConfig};

/// External collaborators the service drives.
pub struct Services {
    pub platform: Arc<dyn ChatPlatform>,
    pub engine: Box<dyn RenderEngine>,
    pub unpacker: Arc<dyn Unpacker>,
    pub encoder: Arc<dyn VideoEncoder>,
}

/// Opens the job store, runs the worker and feeds it from inbound events
/// until `cancel_token` fires. Returns after the worker has finished its
/// in-flight job.
pub async fn serve(
    cancel_token: CancellationToken,
    connect_url: String,
    worker_config: WorkerConfig,
    admins: Vec<i64>,
    services: Services,
    mut recv_from_client: mpsc::UnboundedReceiver<InboundEvent>,
) -> Result<(), Error> {
    trace!("Connecting to db:{}", connect_url);
    let store = Arc::new(JobStore::open(&connect_url, cancel_token.clone()).await?);
    let intake = Intake::new(store.clone(), admins);
    let platform = services.platform.clone();

    let mut worker = {
        let worker = Worker::new(
            store.clone(),
            services.platform,
            services.engine,
            services.unpacker,
            services.encoder,
            worker_config,
        );
        tokio::spawn(worker.run().instrument(info_span!("worker")))
    };

    let mut intake_open = true;
    let finished = loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break None;
            },
            joined = &mut worker => {
                error!("Worker exited unexpectedly");
                cancel_token.cancel();
                break Some(joined);
            },
            event = recv_from_client.recv(), if intake_open => {
                match event {
                    None => {
                        debug!("Event stream closed, no further intake");
                        intake_open = false;
                    },
                    Some(event) => {
                        debug!(message = "Inbound event", event = ?event);
                        match intake.handle(event).await {
                            Ok(Some(reply)) => {
                                if let Err(err) = platform::send(&*platform, reply).await {
                                    warn!(message = "Failed to send reply", error = %err);
                                }
                            },
                            Ok(None) => {},
                            Err(err) => error!(message = "Failed to handle event", error = ?err),
                        }
                    }
                }
            }
        }
    };

    store.request_shutdown();
    let joined = match finished {
        Some(joined) => joined,
        None => {
            info!("Waiting for worker to finish its current job...");
            worker.await
        }
    };
    joined??;

    info!("Server stopped.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::error::{PackageError, RenderError};
    use crate::ffmpeg::FfmpegError;
    use crate::intake::IncomingCommand;
    use crate::platform::{Callback, OutgoingMessage, PlatformError};
    use crate::scene::Scene;

    #[derive(Default)]
    struct RecordingPlatform {
        sent: Mutex<Vec<OutgoingMessage>>,
    }

    impl ChatPlatform for RecordingPlatform {
        fn request(&self, _url: &str, callback: Callback<Vec<u8>>) {
            callback(Err(PlatformError::Status(404)));
        }

        fn send_message(&self, message: OutgoingMessage, callback: Callback<()>) {
            self.sent.lock().unwrap().push(message);
            callback(Ok(()));
        }
    }

    struct IdleEngine;

    #[async_trait]
    impl RenderEngine for IdleEngine {
        async fn start(&mut self, _scene: &Scene) -> Result<(), RenderError> {
            Err(RenderError::Start("idle".into()))
        }

        async fn stop(&mut self) -> Result<(), RenderError> {
            Ok(())
        }

        async fn rendering(&mut self) -> Result<bool, RenderError> {
            Ok(false)
        }
    }

    struct NoUnpack;

    #[async_trait]
    impl Unpacker for NoUnpack {
        async fn unpack(&self, _archive: &Path, _dest: &Path) -> Result<(), PackageError> {
            Err(PackageError::NoPackageRoot)
        }
    }

    struct NoEncode;

    #[async_trait]
    impl VideoEncoder for NoEncode {
        async fn encode(&self, _frame_dir: &Path, output: &Path) -> Result<(), FfmpegError> {
            Err(FfmpegError::MissingOutput(output.to_path_buf()))
        }
    }

    #[tokio::test]
    async fn answers_commands_and_stops_on_cancel() {
        let platform = Arc::new(RecordingPlatform::default());
        let work_dir = tempfile::tempdir().unwrap();
        let services = Services {
            platform: platform.clone(),
            engine: Box::new(IdleEngine),
            unpacker: Arc::new(NoUnpack),
            encoder: Arc::new(NoEncode),
        };
        let config = WorkerConfig {
            work_dir: work_dir.path().to_path_buf(),
            ..Default::default()
        };

        let (send_to_server, recv_from_client) = mpsc::unbounded_channel();
        send_to_server
            .send(InboundEvent::Command(IncomingCommand {
                name: "queue".into(),
                args: Vec::new(),
                channel_id: 3,
                user_id: 1,
            }))
            .unwrap();
        drop(send_to_server);

        let cancel_token = CancellationToken::new();
        let server = tokio::spawn(serve(
            cancel_token.clone(),
            "sqlite::memory:".into(),
            config,
            vec![],
            services,
            recv_from_client,
        ));

        for _ in 0..100 {
            if !platform.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel_token.cancel();
        server.await.unwrap().unwrap();

        let sent = platform.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel_id, 3);
        assert!(sent[0].content.starts_with("No queued jobs!"));
    }
}
