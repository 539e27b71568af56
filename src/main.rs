use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Error;
use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use voxq::archive::UnzipCommand;
use voxq::error::MAX_RETRIES;
use voxq::ffmpeg::Ffmpeg;
use voxq::intake::InboundEvent;
use voxq::platform::WebhookPlatform;
use voxq::render::CommandRenderer;
use voxq::scene::MeshMode;
use voxq::server::{self, Services};
use voxq::telemetry;
use voxq::worker::WorkerConfig;

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(
        short = 'd',
        long = "database",
        help = "SQLite Connection URL",
        default_value = "sqlite://work_queue_vmax.db"
    )]
    database: String,

    #[arg(
        short = 'w',
        long = "work-dir",
        help = "Directory for per-job scratch files",
        default_value = "./voxq_work"
    )]
    work_dir: PathBuf,

    #[arg(
        short = 'r',
        long = "renderer",
        help = "Render engine executable",
        default_value = "bella_cli"
    )]
    renderer: PathBuf,

    #[arg(long = "ffmpeg", help = "ffmpeg executable", default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    #[arg(long = "webhook-url", help = "Chat platform webhook URL")]
    webhook_url: String,

    #[arg(long = "admin", help = "User id allowed to cancel any job (repeatable)")]
    admins: Vec<i64>,

    #[arg(long = "mode", value_enum, default_value_t = MeshMode::Boxes)]
    mode: MeshMode,

    #[arg(long = "max-retries", default_value_t = MAX_RETRIES)]
    max_retries: i64,

    #[arg(long = "jaeger-endpoint", help = "Jaeger collector endpoint")]
    jaeger_endpoint: Option<String>,
}

/// Reads one JSON event per line from stdin until EOF or cancellation.
async fn read_events(
    cancel_token: CancellationToken,
    send_to_server: mpsc::UnboundedSender<InboundEvent>,
) -> Result<(), Error> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel_token.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            debug!("stdin closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<InboundEvent>(&line) {
            Ok(event) => send_to_server.send(event)?,
            Err(err) => warn!(message = "Ignoring malformed event", error = %err),
        }
    }
    Ok(())
}

#[instrument(skip_all)]
async fn setup(config: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    let (send_to_server, recv_from_client) = mpsc::unbounded_channel();

    let services = Services {
        platform: Arc::new(WebhookPlatform::new(config.webhook_url.clone())?),
        engine: Box::new(CommandRenderer::new(config.renderer.clone())),
        unpacker: Arc::new(UnzipCommand::default()),
        encoder: Arc::new(Ffmpeg::new(config.ffmpeg.clone())),
    };
    let worker_config = WorkerConfig {
        work_dir: config.work_dir.clone(),
        mode: config.mode,
        max_retries: config.max_retries,
    };

    let server_spawn = {
        let cancel_token = cancel_token.clone();
        tokio::spawn(
            async move {
                if let Err(err) = server::serve(
                    cancel_token,
                    config.database,
                    worker_config,
                    config.admins,
                    services,
                    recv_from_client,
                )
                .await
                {
                    error!("Server error: {:?}", err);
                }
            }
            .instrument(info_span!("server")),
        )
    };

    if let Err(err) = read_events(cancel_token.clone(), send_to_server).await {
        error!("Event reader stopped: {:?}", err);
    }

    info!("Waiting for server to shutdown...");
    server_spawn.await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "voxq=debug");
    }
    let config = ConfigContext::parse();

    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let app = tokio::spawn(setup(config, token.clone()));

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => { info!("Received SIGTERM"); token.cancel() },
            _ = sigint.recv() => { info!("Received SIGINT"); token.cancel() },
        }
    });
    app.await??;
    info!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
