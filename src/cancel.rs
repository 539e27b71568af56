//! Cooperative cancellation for the job currently owned by the worker.
//!
//! Every claimed job gets its own [`CancellationToken`]. The store keeps a
//! clone in [`CurrentJob`] so that a cancel command can trip it, and the
//! worker polls it at checkpoints with [`checkpoint`].

use tokio_util::sync::CancellationToken;

use crate::error::JobError;

/// Identity of the job held by the worker together with its token.
#[derive(Debug, Clone)]
pub struct CurrentJob {
    pub id: i64,
    pub token: CancellationToken,
}

impl CurrentJob {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            token: CancellationToken::new(),
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Returns [`JobError::Cancelled`] once cancellation has been requested.
pub fn checkpoint(token: &CancellationToken) -> Result<(), JobError> {
    if token.is_cancelled() {
        Err(JobError::Cancelled)
    } else {
        Ok(())
    }
}
