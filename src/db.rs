use crate::cancel::CurrentJob;
use crate::{Job, NewJob, Status};
use anyhow::Error;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{Connection, Executor};
use std::str::FromStr;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COLUMNS: &str = "id, attachment_url, original_filename, channel_id, user_id, username, \
    message_content, created_at, retry_count, status, render_started_at, render_finished_at";

/// Completed rows older than this are swept on startup.
pub const COMPLETED_RETENTION_SECS: i64 = 24 * 60 * 60;

/// A job handed to the worker along with the token that cancels this run.
#[derive(Debug)]
pub struct ClaimedJob {
    pub job: Job,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Row reset to pending; `attempt` is the new retry count.
    Retrying { attempt: i64 },
    /// Retry budget exhausted, row deleted.
    Abandoned,
    /// Row was already gone.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct QueueEntry {
    pub original_filename: String,
    pub username: String,
    pub processing: bool,
    pub render_started_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct HistoryEntry {
    pub original_filename: String,
    pub username: String,
    pub render_started_at: i64,
    pub render_finished_at: i64,
    pub created_at: i64,
}

struct Inner {
    conn: SqliteConnection,
    current: Option<CurrentJob>,
}

impl Inner {
    /// Forget the current job if it is `id`.
    fn release(&mut self, id: i64) {
        if self.current.as_ref().is_some_and(|current| current.id == id) {
            self.current = None;
        }
    }
}

/// Persistent FIFO queue of render jobs.
///
/// Every operation runs under one lock around the SQLite connection. The
/// only suspension point is the wait inside [`JobStore::dequeue`], which
/// happens with the lock released.
pub struct JobStore {
    inner: Mutex<Inner>,
    available: Notify,
    shutdown: CancellationToken,
}

impl JobStore {
    pub async fn open(url: &str, shutdown: CancellationToken) -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options).await?;

        (&mut conn).execute(include_str!("setup.sql")).await?;

        let cutoff = Utc::now().timestamp() - COMPLETED_RETENTION_SECS;
        let purged = Self::purge(&mut conn, cutoff).await?;
        if purged > 0 {
            info!(count = purged, "Cleaned up old completed jobs");
        }

        // A row still processing without an end time was interrupted by a crash.
        let reset = sqlx::query(
            "UPDATE work_queue SET status = 'pending' \
            WHERE status = 'processing' AND render_finished_at = 0",
        )
        .execute(&mut conn)
        .await?
        .rows_affected();
        if reset > 0 {
            info!(count = reset, "Reset stuck processing jobs back to pending");
        }

        debug!(url, "Job store ready");
        Ok(JobStore {
            inner: Mutex::new(Inner {
                conn,
                current: None,
            }),
            available: Notify::new(),
            shutdown,
        })
    }

    pub async fn enqueue(&self, job: &NewJob) -> Result<i64, Error> {
        let id = {
            let mut inner = self.inner.lock().await;
            sqlx::query_scalar::<_, i64>(
                "INSERT INTO work_queue \
                (attachment_url, original_filename, channel_id, user_id, username, \
                message_content, created_at, retry_count, status) \
                VALUES (?, ?, ?, ?, ?, ?, ?, 0, 'pending') \
                RETURNING id",
            )
            .bind(&job.attachment_url)
            .bind(&job.original_filename)
            .bind(job.channel_id)
            .bind(job.user_id)
            .bind(&job.username)
            .bind(&job.message_content)
            .bind(job.created_at)
            .fetch_one(&mut inner.conn)
            .await?
        };

        info!(job_id = id, filename = %job.original_filename, "Enqueued job");
        self.available.notify_one();
        Ok(id)
    }

    /// Waits for the oldest pending job and marks it processing. Returns
    /// `None` once shutdown has been requested.
    pub async fn dequeue(&self) -> Result<Option<ClaimedJob>, Error> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(None);
            }

            {
                let mut inner = self.inner.lock().await;
                if let Some(job) = Self::claim_next(&mut inner.conn).await? {
                    let current = CurrentJob::new(job.id);
                    let cancel = current.token.clone();
                    inner.current = Some(current);
                    info!(job_id = job.id, filename = %job.original_filename, "Dequeued job");
                    return Ok(Some(ClaimedJob { job, cancel }));
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Dequeue interrupted by shutdown");
                    return Ok(None);
                },
                _ = self.available.notified() => {},
            }
        }
    }

    pub async fn mark_render_started(&self, id: i64) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        sqlx::query("UPDATE work_queue SET render_started_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&mut inner.conn)
            .await?;

        debug!(job_id = id, "Marked render start time");
        Ok(())
    }

    pub async fn mark_completed(&self, id: i64) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        inner.release(id);
        sqlx::query(
            "UPDATE work_queue \
                SET status = 'completed', \
                render_finished_at = ? \
            WHERE id = ?",
        )
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&mut inner.conn)
        .await?;

        info!(job_id = id, "Completed job");
        Ok(())
    }

    /// Records a failed attempt. The row survives with status pending and
    /// its original `created_at` until `max_retries` failures have been
    /// recorded, at which point it is deleted.
    pub async fn mark_failed(&self, id: i64, max_retries: i64) -> Result<FailOutcome, Error> {
        let outcome = {
            let mut inner = self.inner.lock().await;
            inner.release(id);

            let retries: Option<i64> =
                sqlx::query_scalar("SELECT retry_count FROM work_queue WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut inner.conn)
                    .await?;

            match retries {
                None => FailOutcome::Missing,
                Some(retries) if retries + 1 >= max_retries => {
                    sqlx::query("DELETE FROM work_queue WHERE id = ?")
                        .bind(id)
                        .execute(&mut inner.conn)
                        .await?;
                    FailOutcome::Abandoned
                }
                Some(retries) => {
                    sqlx::query(
                        "UPDATE work_queue SET retry_count = ?, status = 'pending' WHERE id = ?",
                    )
                    .bind(retries + 1)
                    .bind(id)
                    .execute(&mut inner.conn)
                    .await?;
                    FailOutcome::Retrying {
                        attempt: retries + 1,
                    }
                }
            }
        };

        match outcome {
            FailOutcome::Missing => warn!(job_id = id, "Job not found for retry update"),
            FailOutcome::Abandoned => info!(job_id = id, "Job failed permanently"),
            FailOutcome::Retrying { attempt } => {
                info!(job_id = id, attempt, max_retries, "Job failed, will retry");
                self.available.notify_one();
            }
        }
        Ok(outcome)
    }

    /// Requests cancellation of the processing job and returns its filename.
    pub async fn cancel_current_job(&self) -> Result<Option<String>, Error> {
        let mut inner = self.inner.lock().await;
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT id, original_filename FROM work_queue \
            WHERE status = 'processing' \
            ORDER BY created_at ASC, id ASC \
            LIMIT 1",
        )
        .fetch_optional(&mut inner.conn)
        .await?;

        let Some((id, filename)) = row else {
            return Ok(None);
        };

        match inner.current.as_ref() {
            Some(current) => {
                current.token.cancel();
                info!(job_id = id, filename = %filename, "Cancellation requested");
            }
            None => warn!(job_id = id, "Processing job has no active run to cancel"),
        }
        Ok(Some(filename))
    }

    /// Deletes the current job's row. Cancellation forfeits any retry.
    pub async fn mark_current_job_cancelled(&self) -> Result<Option<i64>, Error> {
        let mut inner = self.inner.lock().await;
        let Some(current) = inner.current.take() else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM work_queue WHERE id = ?")
            .bind(current.id)
            .execute(&mut inner.conn)
            .await?;

        info!(job_id = current.id, "Cancelled job removed");
        Ok(Some(current.id))
    }

    pub async fn current_job_owner(&self) -> Result<Option<i64>, Error> {
        let mut inner = self.inner.lock().await;
        Ok(sqlx::query_scalar(
            "SELECT user_id FROM work_queue \
            WHERE status = 'processing' \
            ORDER BY created_at ASC, id ASC \
            LIMIT 1",
        )
        .fetch_optional(&mut inner.conn)
        .await?)
    }

    /// Processing jobs first, then pending jobs in FIFO order.
    pub async fn queue_display(&self) -> Result<Vec<QueueEntry>, Error> {
        let mut inner = self.inner.lock().await;
        Ok(sqlx::query_as::<_, QueueEntry>(
            "SELECT original_filename, username, \
                status = 'processing' AS processing, \
                CASE WHEN status = 'processing' THEN render_started_at ELSE 0 END AS render_started_at \
            FROM work_queue \
            WHERE status IN ('processing', 'pending') \
            ORDER BY status = 'processing' DESC, created_at ASC, id ASC",
        )
        .fetch_all(&mut inner.conn)
        .await?)
    }

    pub async fn history(&self, limit: i64) -> Result<Vec<HistoryEntry>, Error> {
        let mut inner = self.inner.lock().await;
        Ok(sqlx::query_as::<_, HistoryEntry>(
            "SELECT original_filename, username, render_started_at, render_finished_at, created_at \
            FROM work_queue \
            WHERE status = 'completed' AND render_started_at > 0 AND render_finished_at > 0 \
            ORDER BY render_finished_at DESC, id DESC \
            LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&mut inner.conn)
        .await?)
    }

    pub async fn job(&self, id: i64) -> Result<Option<Job>, Error> {
        let mut inner = self.inner.lock().await;
        Ok(
            sqlx::query_as::<_, Job>(&format!("SELECT {COLUMNS} FROM work_queue WHERE id = ?"))
                .bind(id)
                .fetch_optional(&mut inner.conn)
                .await?,
        )
    }

    /// Deletes completed rows that finished before `cutoff` (unix seconds).
    pub async fn purge_completed_before(&self, cutoff: i64) -> Result<u64, Error> {
        let mut inner = self.inner.lock().await;
        Self::purge(&mut inner.conn, cutoff).await
    }

    /// Makes any blocked or future `dequeue` return `None`.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn purge(conn: &mut SqliteConnection, cutoff: i64) -> Result<u64, Error> {
        Ok(sqlx::query(
            "DELETE FROM work_queue WHERE status = 'completed' AND render_finished_at < ?",
        )
        .bind(cutoff)
        .execute(&mut *conn)
        .await?
        .rows_affected())
    }

    async fn claim_next(conn: &mut SqliteConnection) -> Result<Option<Job>, Error> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {COLUMNS} FROM work_queue \
            WHERE status = 'pending' \
            ORDER BY created_at ASC, id ASC \
            LIMIT 1"
        ))
        .fetch_optional(&mut *conn)
        .await?;

        let Some(mut job) = job else {
            return Ok(None);
        };

        sqlx::query("UPDATE work_queue SET status = 'processing' WHERE id = ?")
            .bind(job.id)
            .execute(&mut *conn)
            .await?;
        job.status = Status::Processing;
        Ok(Some(job))
    }
}
