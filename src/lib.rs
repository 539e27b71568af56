use chrono::Utc;

pub mod archive;
pub mod cancel;
pub mod db;
pub mod error;
pub mod ffmpeg;
pub mod intake;
pub mod orbit;
pub mod package;
pub mod platform;
pub mod render;
pub mod scene;
pub mod server;
pub mod telemetry;
pub mod worker;

/// Suffix that marks an uploaded attachment as a voxel scene package.
pub const PACKAGE_EXTENSION: &str = ".vmax.zip";

/// A job as submitted by intake, before the store has assigned it an id.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub attachment_url: String,
    pub original_filename: String,
    pub channel_id: i64,
    pub user_id: i64,
    pub username: String,
    pub message_content: String,
    /// Unix seconds. Never changes across retries.
    pub created_at: i64,
}

impl NewJob {
    pub fn new(
        attachment_url: impl Into<String>,
        original_filename: impl Into<String>,
        channel_id: i64,
        user_id: i64,
        username: impl Into<String>,
        message_content: impl Into<String>,
    ) -> Self {
        Self {
            attachment_url: attachment_url.into(),
            original_filename: original_filename.into(),
            channel_id,
            user_id,
            username: username.into(),
            message_content: message_content.into(),
            created_at: Utc::now().timestamp(),
        }
    }

    pub fn created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub attachment_url: String,
    pub original_filename: String,
    pub channel_id: i64,
    pub user_id: i64,
    pub username: String,
    pub message_content: String,
    pub created_at: i64,
    pub retry_count: i64,
    pub status: Status,
    /// Unix seconds, 0 when unset.
    pub render_started_at: i64,
    /// Unix seconds, 0 when unset.
    pub render_finished_at: i64,
}

impl Job {
    /// Filename with the package suffix stripped, used to name artifacts.
    pub fn base_name(&self) -> &str {
        base_name(&self.original_filename)
    }
}

/// Strips a case-insensitive [`PACKAGE_EXTENSION`] suffix.
pub fn base_name(filename: &str) -> &str {
    let cut = filename.len().saturating_sub(PACKAGE_EXTENSION.len());
    match filename.get(cut..) {
        Some(tail) if tail.eq_ignore_ascii_case(PACKAGE_EXTENSION) => &filename[..cut],
        _ => filename,
    }
}

/// Whether an attachment name should trigger an enqueue.
pub fn is_package_filename(filename: &str) -> bool {
    base_name(filename).len() != filename.len()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Processing,
    Completed,
}
