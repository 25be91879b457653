use futures_util::{Stream, StreamExt};
use serde::Deserialize;

use crate::ai::DeltaToken;
use crate::cancel::CancelHandle;
use crate::sse::ProtocolEvent;
use crate::thinking::{Phase, StreamState};

pub const STOPPED_MARKER: &str = "[stopped]";
pub const ERROR_MARKER: &str = "[ERROR]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Completed(String),
    /// User cancelled; holds what was visible at that moment
    Stopped(String),
    Failed { partial: String, message: String },
}

impl ReplyOutcome {
    /// Text to keep in the transcript, or `None` when the reply left nothing
    /// worth recording.
    pub fn transcript(&self) -> Option<String> {
        match self {
            ReplyOutcome::Completed(text) => (!text.is_empty()).then(|| text.clone()),
            ReplyOutcome::Stopped(text) => {
                (!text.is_empty()).then(|| format!("{}\n\n{}", text, STOPPED_MARKER))
            }
            ReplyOutcome::Failed { partial, message } => Some(if partial.is_empty() {
                format!("{} {}", ERROR_MARKER, message)
            } else {
                format!("{}\n\n{} {}", partial, ERROR_MARKER, message)
            }),
        }
    }
}

/// What one event did to the reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyUpdate {
    /// Newly visible text (may be empty while a reasoning block streams)
    Visible(String),
    Failed(String),
    Done,
    Ignored,
}

#[derive(Deserialize)]
struct ErrorPayload {
    error: serde_json::Value,
}

#[derive(Debug, Default)]
pub struct PendingReply {
    state: StreamState,
    error: Option<String>,
}

impl PendingReply {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text released so far.
    pub fn visible(&self) -> &str {
        self.state.visible()
    }

    pub fn is_thinking(&self) -> bool {
        self.state.phase() == Phase::Thinking
    }

    pub fn apply(&mut self, event: &ProtocolEvent) -> ReplyUpdate {
        let payload = match event {
            ProtocolEvent::Terminator => return ReplyUpdate::Done,
            ProtocolEvent::Data(payload) => payload,
        };

        if let Ok(ErrorPayload { error }) = serde_json::from_str::<ErrorPayload>(payload) {
            if !error.is_null() {
                let message = match error {
                    serde_json::Value::String(message) => message,
                    other => other.to_string(),
                };
                self.error = Some(message.clone());
                return ReplyUpdate::Failed(message);
            }
        }

        match DeltaToken::from_payload(payload) {
            Ok(token) => ReplyUpdate::Visible(self.state.push(&token.text).to_string()),
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed event");
                ReplyUpdate::Ignored
            }
        }
    }

    /// Close the reply. `cancelled` marks a user stop.
    pub fn finish(mut self, cancelled: bool) -> ReplyOutcome {
        if let Some(message) = self.error.take() {
            return ReplyOutcome::Failed {
                partial: self.state.visible().trim().to_string(),
                message,
            };
        }
        if cancelled {
            return ReplyOutcome::Stopped(self.state.visible().trim().to_string());
        }
        self.state.finish();
        ReplyOutcome::Completed(self.state.visible().trim().to_string())
    }

    /// Consume a relay stream to its end. `on_visible` sees the whole
    /// visible text each time it grows.
    pub async fn drive<S, F>(mut self, events: S, cancel: &CancelHandle, mut on_visible: F) -> ReplyOutcome
    where
        S: Stream<Item = ProtocolEvent>,
        F: FnMut(&str),
    {
        let mut events = std::pin::pin!(events);
        while let Some(event) = events.next().await {
            match self.apply(&event) {
                ReplyUpdate::Visible(delta) if !delta.is_empty() => on_visible(self.visible()),
                ReplyUpdate::Failed(_) | ReplyUpdate::Done => break,
                _ => {}
            }
        }
        self.finish(cancel.is_cancelled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn delta(text: &str) -> ProtocolEvent {
        ProtocolEvent::Data(
            serde_json::json!({"choices": [{"delta": {"content": text}}]}).to_string(),
        )
    }

    #[test]
    fn test_completed_reply() {
        let mut reply = PendingReply::new();
        assert_eq!(reply.apply(&delta("Hello")), ReplyUpdate::Visible("Hello".into()));
        assert_eq!(reply.apply(&delta(" world")), ReplyUpdate::Visible(" world".into()));
        assert_eq!(reply.apply(&ProtocolEvent::Terminator), ReplyUpdate::Done);
        assert_eq!(reply.finish(false), ReplyOutcome::Completed("Hello world".into()));
    }

    #[test]
    fn test_malformed_event_is_skipped() {
        let mut reply = PendingReply::new();
        reply.apply(&delta("ok "));
        assert_eq!(
            reply.apply(&ProtocolEvent::Data("{oops".into())),
            ReplyUpdate::Ignored
        );
        reply.apply(&delta("still going"));
        assert_eq!(reply.finish(false), ReplyOutcome::Completed("ok still going".into()));
    }

    #[test]
    fn test_error_event_keeps_partial() {
        let mut reply = PendingReply::new();
        reply.apply(&delta("The answer is"));
        assert_eq!(
            reply.apply(&ProtocolEvent::error("Stream interrupted: reset")),
            ReplyUpdate::Failed("Stream interrupted: reset".into())
        );
        let outcome = reply.finish(false);
        assert_eq!(
            outcome.transcript().unwrap(),
            "The answer is\n\n[ERROR] Stream interrupted: reset"
        );
    }

    #[test]
    fn test_structured_error_payload() {
        let mut reply = PendingReply::new();
        let update = reply.apply(&ProtocolEvent::Data(r#"{"error":{"code":400}}"#.into()));
        assert_eq!(update, ReplyUpdate::Failed(r#"{"code":400}"#.into()));
    }

    #[test]
    fn test_unclosed_reasoning_records_nothing() {
        let mut reply = PendingReply::new();
        reply.apply(&delta("<think>Let me think"));
        assert!(reply.is_thinking());
        reply.apply(&delta(" about it"));
        let outcome = reply.finish(false);
        assert_eq!(outcome, ReplyOutcome::Completed(String::new()));
        assert_eq!(outcome.transcript(), None);
    }

    #[test]
    fn test_stopped_transcript() {
        assert_eq!(
            ReplyOutcome::Stopped("The answer is 4".into()).transcript().unwrap(),
            "The answer is 4\n\n[stopped]"
        );
        assert_eq!(ReplyOutcome::Stopped(String::new()).transcript(), None);
        assert_eq!(
            ReplyOutcome::Failed {
                partial: String::new(),
                message: "boom".into()
            }
            .transcript()
            .unwrap(),
            "[ERROR] boom"
        );
    }

    #[tokio::test]
    async fn test_drive_reports_growth() {
        let events = stream::iter(vec![
            delta("<think>hmm</think>"),
            delta("Hi"),
            delta(" there"),
            ProtocolEvent::Terminator,
            delta("ignored after done"),
        ]);
        let mut seen = Vec::new();
        let outcome = PendingReply::new()
            .drive(events, &CancelHandle::new(), |visible| seen.push(visible.to_string()))
            .await;
        assert_eq!(seen, vec!["Hi".to_string(), "Hi there".to_string()]);
        assert_eq!(outcome, ReplyOutcome::Completed("Hi there".into()));
    }

    #[tokio::test]
    async fn test_drive_marks_user_stop() {
        let cancel = CancelHandle::new();
        let events = stream::iter(vec![delta("The answer is 4")]);
        let outcome = PendingReply::new()
            .drive(events, &cancel, |_| cancel.cancel())
            .await;
        assert_eq!(outcome, ReplyOutcome::Stopped("The answer is 4".into()));
    }
}
