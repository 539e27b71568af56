//! Chat platform seam.
//!
//! Platform clients answer through callbacks fired from their own tasks.
//! [`call`] turns such a callback into a value the worker can await.

use std::path::Path;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("platform returned HTTP {0}")]
    Status(u16),

    #[error("platform dropped the request without answering")]
    Dropped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Invoked exactly once with the outcome of a platform operation.
pub type Callback<T> = Box<dyn FnOnce(Result<T, PlatformError>) + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub channel_id: i64,
    pub content: String,
    pub attachment: Option<Attachment>,
}

impl OutgoingMessage {
    pub fn text(channel_id: i64, content: impl Into<String>) -> Self {
        Self {
            channel_id,
            content: content.into(),
            attachment: None,
        }
    }

    /// Attaches a file from disk under its own file name.
    pub async fn with_file(mut self, path: &Path) -> Result<Self, PlatformError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "render".into());
        self.attachment = Some(Attachment { file_name, bytes });
        Ok(self)
    }
}

pub trait ChatPlatform: Send + Sync {
    /// Fetches the body behind `url`, e.g. an uploaded attachment.
    fn request(&self, url: &str, callback: Callback<Vec<u8>>);

    fn send_message(&self, message: OutgoingMessage, callback: Callback<()>);
}

/// Runs a callback-style operation and waits for its single answer.
pub async fn call<T, F>(start: F) -> Result<T, PlatformError>
where
    T: Send + 'static,
    F: FnOnce(Callback<T>),
{
    let (tx, rx) = oneshot::channel();
    start(Box::new(move |result| {
        // The waiter may have gone away on shutdown.
        let _ = tx.send(result);
    }));
    rx.await.map_err(|_| PlatformError::Dropped)?
}

pub async fn download(platform: &dyn ChatPlatform, url: &str) -> Result<Vec<u8>, PlatformError> {
    call(|callback| platform.request(url, callback)).await
}

pub async fn send(platform: &dyn ChatPlatform, message: OutgoingMessage) -> Result<(), PlatformError> {
    call(|callback| platform.send_message(message, callback)).await
}

/// Downloads over plain HTTP and delivers through a webhook accepting
/// multipart posts with `channel_id`, `content` and an optional `file`.
#[derive(Debug, Clone)]
pub struct WebhookPlatform {
    client: reqwest::Client,
    webhook_url: String,
}

impl WebhookPlatform {
    pub fn new(webhook_url: impl Into<String>) -> Result<Self, PlatformError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
        })
    }

    async fn fetch(client: reqwest::Client, url: String) -> Result<Vec<u8>, PlatformError> {
        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(PlatformError::Status(response.status().as_u16()));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn post(
        client: reqwest::Client,
        webhook_url: String,
        message: OutgoingMessage,
    ) -> Result<(), PlatformError> {
        let mut form = reqwest::multipart::Form::new()
            .text("channel_id", message.channel_id.to_string())
            .text("content", message.content);
        if let Some(attachment) = message.attachment {
            form = form.part(
                "file",
                reqwest::multipart::Part::bytes(attachment.bytes).file_name(attachment.file_name),
            );
        }

        let response = client.post(&webhook_url).multipart(form).send().await?;
        if !response.status().is_success() {
            return Err(PlatformError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

impl ChatPlatform for WebhookPlatform {
    fn request(&self, url: &str, callback: Callback<Vec<u8>>) {
        let client = self.client.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            debug!(%url, "Downloading attachment");
            let result = Self::fetch(client, url).await;
            if let Err(err) = &result {
                warn!(error = %err, "Attachment download failed");
            }
            callback(result);
        });
    }

    fn send_message(&self, message: OutgoingMessage, callback: Callback<()>) {
        let client = self.client.clone();
        let webhook_url = self.webhook_url.clone();
        tokio::spawn(async move {
            debug!(channel_id = message.channel_id, "Delivering message");
            callback(Self::post(client, webhook_url, message).await);
        });
    }
}
