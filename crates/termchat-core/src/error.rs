use thiserror::Error;

/// Failures the relay reports to its caller as a terminal error event.
///
/// None of these are retried; the user decides whether to send again.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Cannot connect to backend at {url}: {reason}")]
    BackendUnreachable { url: String, reason: String },

    #[error("Backend error {status}: {body}")]
    BackendRejected { status: u16, body: String },

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),
}
