//! Inbound chat events: package uploads and status commands.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Error;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::db::JobStore;
use crate::platform::OutgoingMessage;
use crate::{is_package_filename, NewJob};

pub const DEFAULT_HISTORY_LIMIT: i64 = 10;

pub const UPLOAD_ACK: &str = "VoxelMax file(s) detected! Adding to render queue...";

const HELP: &str = "I am a VoxelMax render bot! Drop .vmax.zip files and I'll convert them to images.\n\n\
**Commands:**\n\
- Upload .vmax.zip files - rendered automatically, in order\n\
- Add `orbit=30` to your message for an animation (1-300 frames)\n\
- `/queue` - current render queue\n\
- `/history [N]` - recently completed renders\n\
- `/remove` - cancel the current render (owner or admin)";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundEvent {
    Message(IncomingMessage),
    Command(IncomingCommand),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IncomingMessage {
    pub channel_id: i64,
    pub user_id: i64,
    pub username: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<IncomingAttachment>,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IncomingAttachment {
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IncomingCommand {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub channel_id: i64,
    pub user_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Queue,
    History { limit: i64 },
    Remove,
    Unsupported(String),
}

impl Command {
    pub fn parse(name: &str, args: &[String]) -> Self {
        match name.trim_start_matches('/').to_ascii_lowercase().as_str() {
            "help" => Command::Help,
            "queue" => Command::Queue,
            "history" => Command::History {
                limit: args
                    .first()
                    .and_then(|arg| arg.parse::<i64>().ok())
                    .filter(|limit| *limit > 0)
                    .unwrap_or(DEFAULT_HISTORY_LIMIT),
            },
            "remove" => Command::Remove,
            other => Command::Unsupported(other.to_string()),
        }
    }
}

/// `Nm Ss`, or `Ss` under a minute.
pub fn format_duration(seconds: i64) -> String {
    let (minutes, seconds) = (seconds / 60, seconds % 60);
    if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

pub struct Intake {
    store: Arc<JobStore>,
    admins: HashSet<i64>,
}

impl Intake {
    pub fn new(store: Arc<JobStore>, admins: impl IntoIterator<Item = i64>) -> Self {
        Self {
            store,
            admins: admins.into_iter().collect(),
        }
    }

    /// Handles one event and returns the reply to post, if any.
    pub async fn handle(&self, event: InboundEvent) -> Result<Option<OutgoingMessage>, Error> {
        match event {
            InboundEvent::Message(message) => self.handle_message(message).await,
            InboundEvent::Command(command) => {
                let channel_id = command.channel_id;
                let reply = self.handle_command(command).await?;
                Ok(Some(OutgoingMessage::text(channel_id, reply)))
            }
        }
    }

    /// Enqueues one job per package attachment and acknowledges once.
    #[instrument(skip_all, fields(user = %message.username, channel_id = message.channel_id))]
    pub async fn handle_message(
        &self,
        message: IncomingMessage,
    ) -> Result<Option<OutgoingMessage>, Error> {
        if message.bot {
            return Ok(None);
        }

        let packages: Vec<_> = message
            .attachments
            .iter()
            .filter(|attachment| is_package_filename(&attachment.filename))
            .collect();
        if packages.is_empty() {
            debug!(attachments = message.attachments.len(), "No package attachments");
            return Ok(None);
        }

        for attachment in packages {
            let job = NewJob::new(
                &attachment.url,
                &attachment.filename,
                message.channel_id,
                message.user_id,
                &message.username,
                &message.content,
            );
            self.store.enqueue(&job).await?;
        }
        Ok(Some(OutgoingMessage::text(message.channel_id, UPLOAD_ACK)))
    }

    #[instrument(skip_all, fields(command = %command.name, user_id = command.user_id))]
    pub async fn handle_command(&self, command: IncomingCommand) -> Result<String, Error> {
        match Command::parse(&command.name, &command.args) {
            Command::Help => Ok(HELP.to_string()),
            Command::Queue => self.queue_reply().await,
            Command::History { limit } => self.history_reply(limit).await,
            Command::Remove => self.remove_reply(command.user_id).await,
            Command::Unsupported(name) => {
                debug!(%name, "Unsupported command");
                Ok("This command is not supported. Please use `/help`, `/queue`, `/history`, or `/remove`.".into())
            }
        }
    }

    async fn queue_reply(&self) -> Result<String, Error> {
        let entries = self.store.queue_display().await?;
        if entries.is_empty() {
            return Ok(
                "No queued jobs! Any .vmax.zip file you send will be processed immediately.".into(),
            );
        }

        let now = Utc::now().timestamp();
        let mut reply = String::new();
        let mut position = 1;
        for entry in entries {
            if entry.processing {
                let elapsed = if entry.render_started_at > 0 {
                    format!(" ({})", format_duration(now - entry.render_started_at))
                } else {
                    String::new()
                };
                reply += &format!(
                    "**Rendering:** `{}` - {}{elapsed}\n",
                    entry.original_filename, entry.username
                );
            } else {
                reply += &format!(
                    "{position}. `{}` - {}\n",
                    entry.original_filename, entry.username
                );
                position += 1;
            }
        }
        Ok(reply)
    }

    async fn history_reply(&self, limit: i64) -> Result<String, Error> {
        let entries = self.store.history(limit).await?;
        if entries.is_empty() {
            return Ok("No completed renders found in history.".into());
        }

        let mut reply = String::from("**Recent Completed Renders:**\n\n");
        for entry in entries {
            let seconds = entry.render_finished_at - entry.render_started_at;
            let timing = if seconds > 0 {
                format_duration(seconds)
            } else {
                "timing data incomplete".into()
            };
            reply += &format!(
                "`{}` - {} ({timing})\n",
                entry.original_filename, entry.username
            );
        }
        Ok(reply)
    }

    async fn remove_reply(&self, user_id: i64) -> Result<String, Error> {
        let owner = self.store.current_job_owner().await?;
        if !self.admins.contains(&user_id) && owner != Some(user_id) {
            info!(user_id, ?owner, "Cancel request denied");
            return Ok("Access denied. You can only cancel your own jobs (or be an admin).".into());
        }

        Ok(match self.store.cancel_current_job().await? {
            Some(filename) => format!("**Cancelling VoxelMax render:** `{filename}`"),
            None => "No job is currently being processed.".into(),
        })
    }
}
