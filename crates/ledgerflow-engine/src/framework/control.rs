//! External stop and abort signals for a running job

use tokio_util::sync::CancellationToken;

/// Handle used to stop a running job from outside
///
/// `stop` lets the in-flight chunk finish committing and ends the job
/// `STOPPED` at the next chunk boundary. `abort` abandons the in-flight chunk
/// without committing it. Both are resumable from the last checkpoint.
#[derive(Debug, Clone, Default)]
pub struct JobControl {
    stop: CancellationToken,
    abort: CancellationToken,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful stop at the next chunk boundary
    pub fn stop(&self) {
        tracing::info!("Graceful stop requested");
        self.stop.cancel();
    }

    /// Request an immediate abort; the in-flight chunk is rolled back
    pub fn abort(&self) {
        tracing::warn!("Hard abort requested");
        self.abort.cancel();
        self.stop.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Resolves once `abort` is called
    pub async fn aborted(&self) {
        self.abort.cancelled().await
    }

    /// Child handle for a partition; cancelled with its parent
    pub fn child(&self) -> Self {
        Self {
            stop: self.stop.child_token(),
            abort: self.abort.child_token(),
        }
    }
}
