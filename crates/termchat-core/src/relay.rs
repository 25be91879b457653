use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ai::{LmStudioClient, DEFAULT_BACKEND_URL, DEFAULT_MODEL};
use crate::cancel::CancelHandle;
use crate::error::RelayError;
use crate::secret::{self, EncryptedSecret};
use crate::sse::{FrameDecoder, ProtocolEvent};
use crate::state::{with_system_turn, ChatTurn};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOptions {
    /// Ask the backend to skip its reasoning mode (`enable_thinking: false`)
    pub disable_extended_reasoning: bool,
}

/// Stored system prompt plus the password that unlocks it
#[derive(Debug, Clone)]
pub struct SystemSecret {
    pub secret: EncryptedSecret,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct RelayRequest {
    pub turns: Vec<ChatTurn>,
    pub model: Option<String>,
    pub backend_url: Option<String>,
    pub options: RelayOptions,
    pub system_secret: Option<SystemSecret>,
}

impl RelayRequest {
    pub fn backend_url(&self) -> &str {
        self.backend_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .unwrap_or(DEFAULT_BACKEND_URL)
    }

    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .filter(|model| !model.is_empty())
            .unwrap_or(DEFAULT_MODEL)
    }
}

/// JSON body of `POST /api/chat` on a relay server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayChatBody {
    pub messages: Vec<ChatTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_enabled: Option<bool>,
}

/// Events of one relayed completion.
///
/// Ends after the backend closes, after a synthetic error event, or as soon
/// as the request is cancelled. Events still queued at cancel time are not
/// delivered.
pub struct RelayStream {
    rx: mpsc::Receiver<ProtocolEvent>,
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

impl RelayStream {
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl Stream for RelayStream {
    type Item = ProtocolEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx)
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn spawn_stream<F, Fut>(cancel: CancelHandle, run: F) -> RelayStream
where
    F: FnOnce(mpsc::Sender<ProtocolEvent>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let task = tokio::spawn(run(tx));
    RelayStream { rx, cancel, task }
}

/// Relays chat completions straight to an inference backend
#[derive(Clone, Default)]
pub struct Relay {
    http: Client,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }

    pub fn start(&self, request: RelayRequest, cancel: CancelHandle) -> RelayStream {
        let client = LmStudioClient::with_client(self.http.clone(), request.backend_url());
        let task_cancel = cancel.clone();
        spawn_stream(cancel, move |tx| run_relay(client, request, tx, task_cancel))
    }
}

async fn run_relay(
    client: LmStudioClient,
    request: RelayRequest,
    tx: mpsc::Sender<ProtocolEvent>,
    cancel: CancelHandle,
) {
    let system = match request.system_secret.clone() {
        Some(sealed) => tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            prompt = unlock_system_prompt(sealed) => prompt,
        },
        None => None,
    };
    let messages = with_system_turn(&request.turns, system);

    tracing::info!(
        url = %client.base_url(),
        model = %request.model(),
        turns = messages.len(),
        "relaying chat completion"
    );

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = client.stream_chat(
            request.model(),
            &messages,
            request.options.disable_extended_reasoning,
        ) => result,
    };

    match response {
        Ok(response) => pump(response.bytes_stream(), &tx, &cancel).await,
        Err(e) => {
            tracing::warn!(error = %e, "backend request failed");
            forward(&tx, ProtocolEvent::error(&e), &cancel).await;
        }
    }
}

/// Key derivation is CPU-bound, so it runs on the blocking pool
async fn unlock_system_prompt(sealed: SystemSecret) -> Option<String> {
    let unlocked =
        tokio::task::spawn_blocking(move || secret::unwrap(&sealed.secret, &sealed.password))
            .await;
    match unlocked {
        Ok(Ok(prompt)) => Some(prompt),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "system prompt unavailable, continuing without it");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "system prompt unlock task failed");
            None
        }
    }
}

/// Relays chat completions through a remote relay server's `/api/chat`
#[derive(Clone)]
pub struct RemoteRelay {
    http: Client,
    relay_url: String,
}

impl RemoteRelay {
    pub fn new(relay_url: &str) -> Self {
        Self {
            http: Client::new(),
            relay_url: relay_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    pub fn start(&self, body: RelayChatBody, cancel: CancelHandle) -> RelayStream {
        let http = self.http.clone();
        let relay_url = self.relay_url.clone();
        let task_cancel = cancel.clone();
        spawn_stream(cancel, move |tx| {
            run_remote(http, relay_url, body, tx, task_cancel)
        })
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

async fn run_remote(
    http: Client,
    relay_url: String,
    body: RelayChatBody,
    tx: mpsc::Sender<ProtocolEvent>,
    cancel: CancelHandle,
) {
    let url = format!("{}/api/chat", relay_url);
    tracing::info!(url = %url, turns = body.messages.len(), "requesting remote relay");

    let sent = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = http.post(&url).json(&body).send() => result,
    };

    let response = match sent {
        Ok(response) => response,
        Err(e) => {
            let err = RelayError::BackendUnreachable {
                url: relay_url,
                reason: e.to_string(),
            };
            tracing::warn!(error = %err, "relay request failed");
            forward(&tx, ProtocolEvent::error(&err), &cancel).await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let event = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => ProtocolEvent::error(body.error),
            Err(_) => ProtocolEvent::error(RelayError::BackendRejected {
                status: status.as_u16(),
                body: text,
            }),
        };
        tracing::warn!(status = %status, "relay rejected request");
        forward(&tx, event, &cancel).await;
        return;
    }

    pump(response.bytes_stream(), &tx, &cancel).await;
}

/// Read a response body through the frame decoder until it ends, fails, or
/// the request is cancelled.
async fn pump<S, E>(body: S, tx: &mpsc::Sender<ProtocolEvent>, cancel: &CancelHandle)
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = FrameDecoder::new();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("cancelled, closing backend connection");
                return;
            }
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for event in decoder.feed(&bytes) {
                    if !forward(tx, event, cancel).await {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                let err = RelayError::StreamInterrupted(e.to_string());
                tracing::warn!(error = %err, "backend stream failed");
                forward(tx, ProtocolEvent::error(&err), cancel).await;
                return;
            }
            None => {
                for event in decoder.close() {
                    if !forward(tx, event, cancel).await {
                        return;
                    }
                }
                tracing::debug!("backend stream finished");
                return;
            }
        }
    }
}

/// Returns false once the caller is gone or has cancelled.
async fn forward(
    tx: &mpsc::Sender<ProtocolEvent>,
    event: ProtocolEvent,
    cancel: &CancelHandle,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;

    async fn pump_chunks(chunks: Vec<Result<&'static str, String>>) -> Vec<ProtocolEvent> {
        let body = stream::iter(
            chunks
                .into_iter()
                .map(|chunk| chunk.map(|s| Bytes::from_static(s.as_bytes()))),
        );
        let (tx, mut rx) = mpsc::channel(16);
        pump(body, &tx, &CancelHandle::new()).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_pump_forwards_terminator() {
        let events = pump_chunks(vec![Ok("data: {\"a\":1}\n\nda"), Ok("ta: [DONE]\n\n")]).await;
        assert_eq!(
            events,
            vec![ProtocolEvent::Data("{\"a\":1}".into()), ProtocolEvent::Terminator]
        );
    }

    #[tokio::test]
    async fn test_pump_reports_interruption_after_partial_output() {
        let events = pump_chunks(vec![
            Ok("data: {\"a\":1}\n\n"),
            Err("connection reset".to_string()),
            Ok("data: never\n\n"),
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ProtocolEvent::Data("{\"a\":1}".into()));
        assert_eq!(
            events[1],
            ProtocolEvent::error("Stream interrupted: connection reset")
        );
    }

    #[tokio::test]
    async fn test_pump_stops_when_cancelled() {
        let cancel = CancelHandle::new();
        cancel.cancel();
        let body = stream::iter(vec![Ok::<_, Infallible>(Bytes::from_static(b"data: x\n\n"))]);
        let (tx, mut rx) = mpsc::channel(4);
        pump(body, &tx, &cancel).await;
        drop(tx);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_unlock_system_prompt() {
        let sealed = secret::seal("Be brief.", "hunter2").unwrap();
        let unlocked = unlock_system_prompt(SystemSecret {
            secret: sealed.clone(),
            password: "hunter2".into(),
        })
        .await;
        assert_eq!(unlocked.as_deref(), Some("Be brief."));

        let locked = unlock_system_prompt(SystemSecret {
            secret: sealed,
            password: "wrong".into(),
        })
        .await;
        assert_eq!(locked, None);
    }

    #[test]
    fn test_request_defaults() {
        let request = RelayRequest::default();
        assert_eq!(request.backend_url(), "http://localhost:1234");
        assert_eq!(request.model(), "default");

        let request = RelayRequest {
            backend_url: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(request.backend_url(), DEFAULT_BACKEND_URL);
    }

    #[test]
    fn test_chat_body_is_camel_case() {
        let body = RelayChatBody {
            messages: vec![ChatTurn::user("hi")],
            backend_url: Some("http://h:1".into()),
            thinking_enabled: Some(false),
            ..Default::default()
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["backendUrl"], "http://h:1");
        assert_eq!(json["thinkingEnabled"], false);
        assert!(json.get("password").is_none());
    }
}
