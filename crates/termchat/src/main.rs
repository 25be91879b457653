use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use termchat_core::{
    secret, Config, ConfigSecretStore, LmStudioClient, SecretStore, SecretUpdate,
    DEFAULT_BACKEND_URL, DEFAULT_MODEL,
};
use tracing_subscriber::EnvFilter;

mod app;
mod handler;
mod serve;
mod tui;
mod ui;

use app::{App, Session};
use tui::{EventHandler, Tui};

const DEFAULT_LOG_FILTER: &str = "termchat=info,termchat_core=info";

#[derive(Parser)]
#[command(name = "termchat", version)]
#[command(about = "Terminal chat client and streaming relay for local LLM servers")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    chat: ChatArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat (default)
    Chat(ChatArgs),
    /// Run the relay HTTP server
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:3000")]
        bind: String,
        /// Inference backend URL
        #[arg(long, env = "TERMCHAT_BACKEND_URL")]
        backend: Option<String>,
    },
    /// List models the backend has loaded
    Models {
        /// Inference backend URL
        #[arg(long, env = "TERMCHAT_BACKEND_URL")]
        backend: Option<String>,
    },
    /// Seal and store the system prompt
    SetPrompt {
        /// Prompt text
        text: String,
        /// Password that will unlock the prompt
        #[arg(long, env = "TERMCHAT_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Remove the stored system prompt
    ClearPrompt,
}

#[derive(Args, Clone, Default)]
struct ChatArgs {
    /// Model to request
    #[arg(short, long, env = "TERMCHAT_MODEL")]
    model: Option<String>,
    /// Inference backend URL
    #[arg(long, env = "TERMCHAT_BACKEND_URL")]
    backend: Option<String>,
    /// Send requests through a relay server instead of the backend
    #[arg(long, env = "TERMCHAT_RELAY_URL")]
    relay: Option<String>,
    /// Password that unlocks the stored system prompt
    #[arg(long, env = "TERMCHAT_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Ask the model to skip its reasoning mode
    #[arg(long)]
    no_thinking: bool,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// The chat screen owns the terminal, so its logs go to a file
fn init_file_logging() -> Result<()> {
    let dir = Config::config_dir()?;
    std::fs::create_dir_all(&dir)?;
    let log_path = dir.join("termchat.log");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("could not open {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

fn init_stderr_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => run_chat(cli.chat).await,
        Some(Commands::Chat(args)) => run_chat(args).await,
        Some(Commands::Serve { bind, backend }) => {
            init_stderr_logging();
            let config = load_config();
            let store = ConfigSecretStore::with_default_path()?;
            let state = serve::ServerState::new(backend.or(config.backend_url), Arc::new(store))
                .with_config_path(Config::get_config_path()?);
            serve::serve(&bind, state).await
        }
        Some(Commands::Models { backend }) => {
            init_stderr_logging();
            let config = load_config();
            let url = backend
                .or(config.backend_url)
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
            list_models(&url).await
        }
        Some(Commands::SetPrompt { text, password }) => {
            init_stderr_logging();
            let sealed =
                tokio::task::spawn_blocking(move || secret::seal(&text, &password)).await??;
            if sealed.is_legacy() {
                eprintln!("warning: stored without encryption (no secure random source)");
            }
            ConfigSecretStore::with_default_path()?.store(SecretUpdate::Replace(sealed))?;
            println!("System prompt stored.");
            Ok(())
        }
        Some(Commands::ClearPrompt) => {
            init_stderr_logging();
            ConfigSecretStore::with_default_path()?.store(SecretUpdate::Clear)?;
            println!("System prompt cleared.");
            Ok(())
        }
    }
}

fn load_config() -> Config {
    Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "could not read config, using defaults");
        Config::new()
    })
}

/// Flag and env (via clap) win over the config file, which wins over defaults
fn resolve_session(args: ChatArgs, config: &Config) -> Session {
    Session {
        backend_url: args.backend.or_else(|| config.backend_url.clone()),
        relay_url: args.relay,
        model: args
            .model
            .or_else(|| config.default_model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        password: args.password,
        thinking_enabled: config.thinking_enabled && !args.no_thinking,
    }
}

async fn list_models(url: &str) -> Result<()> {
    let models = LmStudioClient::new(url).list_models().await?;
    if models.is_empty() {
        println!("No models loaded at {}", url);
    }
    for model in models {
        println!("{}", model);
    }
    Ok(())
}

async fn run_chat(args: ChatArgs) -> Result<()> {
    init_file_logging()?;

    let config = load_config();
    let session = resolve_session(args, &config);
    let config_path = Config::get_config_path()?;
    let secrets = Arc::new(ConfigSecretStore::new(config_path.clone()));
    tracing::info!(model = %session.model, relay = ?session.relay_url, "starting chat");

    let mut app = App::new(session, secrets, Some(config_path));

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let mut events = EventHandler::new();

    let result = run_loop(&mut terminal, &mut app, &mut events).await;

    // Leave nothing streaming behind
    app.stop();
    tui::restore()?;
    result
}

async fn run_loop(terminal: &mut Tui, app: &mut App, events: &mut EventHandler) -> Result<()> {
    let tx = events.sender();
    while !app.should_quit {
        terminal.draw(|frame| ui::render(app, frame))?;

        match events.next().await {
            Some(event) => handler::handle_event(app, event, &tx),
            None => break,
        }
    }
    Ok(())
}
