use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use termchat_core::{
    CancelHandle, Config, EncryptedSecret, LmStudioClient, Relay, RelayChatBody, RelayOptions,
    RelayRequest, SecretStore, SecretUpdate, SystemSecret, DEFAULT_BACKEND_URL,
};

#[derive(Clone)]
pub struct ServerState {
    http: reqwest::Client,
    relay: Relay,
    backend_url: Arc<RwLock<String>>,
    secrets: Arc<dyn SecretStore>,
    config_path: Option<PathBuf>,
}

impl ServerState {
    pub fn new(backend_url: Option<String>, secrets: Arc<dyn SecretStore>) -> Self {
        let http = reqwest::Client::new();
        Self {
            relay: Relay::with_client(http.clone()),
            http,
            backend_url: Arc::new(RwLock::new(
                backend_url.unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            )),
            secrets,
            config_path: None,
        }
    }

    /// Persist backend URL changes to this config file
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    fn backend_url(&self) -> String {
        match self.backend_url.read() {
            Ok(url) => url.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_backend_url(&self, url: String) -> Result<()> {
        if let Some(path) = &self.config_path {
            let mut config = Config::load_from(path)?;
            config.backend_url = Some(url.clone());
            config.save_to(path)?;
        }
        let mut current = self
            .backend_url
            .write()
            .map_err(|_| anyhow!("settings lock poisoned"))?;
        *current = url;
        Ok(())
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/models", get(models))
        .route("/api/settings", get(get_settings).put(put_settings))
        .with_state(state)
}

pub async fn serve(bind: &str, state: ServerState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "relay server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

async fn chat(State(state): State<ServerState>, Json(body): Json<RelayChatBody>) -> Response {
    let system_secret = match state.secrets.load() {
        Ok(secret) => secret.map(|secret| SystemSecret {
            secret,
            password: body.password.clone().unwrap_or_default(),
        }),
        Err(e) => {
            tracing::warn!(error = %e, "could not load system prompt");
            None
        }
    };

    let request = RelayRequest {
        turns: body.messages,
        model: body.model,
        backend_url: body.backend_url.or_else(|| Some(state.backend_url())),
        options: RelayOptions {
            disable_extended_reasoning: body.thinking_enabled == Some(false),
        },
        system_secret,
    };

    // Dropping the body on client disconnect drops the stream, which
    // aborts the backend read.
    let events = state
        .relay
        .start(request, CancelHandle::new())
        .map(|event| Ok::<_, Infallible>(event.to_wire()));

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(events))
        .unwrap_or_else(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))
}

#[derive(Serialize)]
struct ModelEntry {
    id: String,
}

async fn models(State(state): State<ServerState>) -> Response {
    let client = LmStudioClient::with_client(state.http.clone(), &state.backend_url());
    match client.list_models().await {
        Ok(ids) => {
            let data: Vec<ModelEntry> = ids.into_iter().map(|id| ModelEntry { id }).collect();
            Json(json!({ "data": data })).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "model listing failed");
            error_response(StatusCode::BAD_GATEWAY, e)
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SettingsView {
    pub backend_url: String,
    pub has_system_prompt: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub backend_url: Option<String>,
    pub system_prompt: Option<String>,
    pub iv: Option<String>,
    #[serde(default)]
    pub clear_system_prompt: bool,
}

fn settings_view(state: &ServerState) -> Result<SettingsView> {
    Ok(SettingsView {
        backend_url: state.backend_url(),
        has_system_prompt: state.secrets.load()?.is_some(),
    })
}

async fn get_settings(State(state): State<ServerState>) -> Response {
    match settings_view(&state) {
        Ok(view) => Json(view).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn put_settings(
    State(state): State<ServerState>,
    Json(update): Json<SettingsUpdate>,
) -> Response {
    let secret_update = if update.clear_system_prompt {
        Some(SecretUpdate::Clear)
    } else {
        match (update.system_prompt, update.iv) {
            (Some(ciphertext), Some(iv)) => {
                Some(SecretUpdate::Replace(EncryptedSecret { ciphertext, iv }))
            }
            (None, None) => None,
            _ => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "systemPrompt and iv must be sent together",
                )
            }
        }
    };

    if let Some(url) = update.backend_url {
        let url = url.trim_end_matches('/').to_string();
        if let Err(e) = state.set_backend_url(url) {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
        }
    }

    if let Some(secret_update) = secret_update {
        let cleared = secret_update == SecretUpdate::Clear;
        if let Err(e) = state.secrets.store(secret_update) {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
        }
        tracing::info!(cleared, "system prompt updated");
    }

    get_settings(State(state)).await
}
