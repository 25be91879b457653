use tokio_util::sync::CancellationToken;

/// User-facing stop switch for one in-flight reply.
///
/// Clones share the same signal. Cancelling twice, or after the stream has
/// already ended, does nothing.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!("reply cancelled by user");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}
