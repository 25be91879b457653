use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use termchat_core::{secret, EncryptedSecret, PendingReply, RelayStream, ReplyOutcome};
use tokio::sync::mpsc::UnboundedSender;

use crate::app::App;
use crate::tui::AppEvent;

const HELP: &str = "\
Commands:
  /cls             clear the conversation
  /server [url]    show or set the backend URL
  /system [text]   seal and store the system prompt (empty clears it)
  /thinking        toggle the model's reasoning mode
  /stop            stop the streaming reply (also Esc)
  /help            show this help
  /quit            exit (also Ctrl-C when idle)";

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Clear,
    Server(&'a str),
    System(&'a str),
    Thinking,
    Stop,
    Help,
    Quit,
    Unknown(&'a str),
}

fn parse_command(line: &str) -> Option<Command<'_>> {
    let rest = line.strip_prefix('/')?;
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    Some(match name {
        "cls" | "clear" => Command::Clear,
        "server" => Command::Server(arg),
        "system" => Command::System(arg),
        "thinking" => Command::Thinking,
        "stop" => Command::Stop,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(name),
    })
}

pub fn handle_event(app: &mut App, event: AppEvent, tx: &UnboundedSender<AppEvent>) {
    match event {
        AppEvent::Key(key) => handle_key(app, key, tx),
        AppEvent::Resize(_, _) => {}
        AppEvent::Tick => app.tick_animation(),
        AppEvent::ReplyDelta { id, visible } => app.apply_delta(id, visible),
        AppEvent::ReplyDone { id, outcome } => app.finish_reply(id, outcome),
        AppEvent::PromptSealed(sealed) => store_sealed_prompt(app, sealed),
    }
}

fn handle_key(app: &mut App, key: KeyEvent, tx: &UnboundedSender<AppEvent>) {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);

    match key.code {
        // Stop first, quit only when idle
        KeyCode::Char('c') if ctrl => {
            if !app.stop() {
                app.should_quit = true;
            }
        }
        KeyCode::Esc => {
            if !app.stop() {
                app.clear_input();
            }
        }
        KeyCode::Enter => submit(app, tx),

        // Input editing
        KeyCode::Backspace => app.delete_before_cursor(),
        KeyCode::Delete => app.delete_at_cursor(),
        KeyCode::Left => app.move_cursor_left(),
        KeyCode::Right => app.move_cursor_right(),
        KeyCode::Home => app.move_cursor_home(),
        KeyCode::End => app.move_cursor_end(),
        KeyCode::Char('u') if ctrl => app.clear_input(),
        KeyCode::Char(c) if !ctrl => app.insert_char(c),

        // Transcript scrolling
        KeyCode::Up => app.scroll_up(1),
        KeyCode::Down => app.scroll_down(1),
        KeyCode::PageUp => app.scroll_up(app.page()),
        KeyCode::PageDown => app.scroll_down(app.page()),

        _ => {}
    }
}

fn submit(app: &mut App, tx: &UnboundedSender<AppEvent>) {
    let line = app.input.trim();
    if line.is_empty() {
        return;
    }

    if line.starts_with('/') {
        let line = app.take_input();
        if let Some(command) = parse_command(line.trim()) {
            run_command(app, command, tx);
        }
        return;
    }

    // One request in flight; keep the typed text for later
    if app.is_streaming() {
        app.notice("A reply is still streaming. Press Esc or type /stop first.");
        return;
    }

    let text = app.take_input().trim().to_string();
    match app.send(text.clone()) {
        Ok((id, stream)) => spawn_reply(id, stream, tx.clone()),
        Err(e) => {
            tracing::error!(error = %e, "could not start reply");
            app.restore_input(text);
            app.notice(format!("[ERROR] {}", e));
        }
    }
}

/// Drive the relay stream off the UI loop, reporting visible text and the
/// final outcome as events tagged with the reply id.
fn spawn_reply(id: u64, stream: RelayStream, tx: UnboundedSender<AppEvent>) {
    tokio::spawn(async move {
        let cancel = stream.cancel_handle();
        let delta_tx = tx.clone();
        let outcome = PendingReply::new()
            .drive(stream, &cancel, |visible| {
                let _ = delta_tx.send(AppEvent::ReplyDelta {
                    id,
                    visible: visible.to_string(),
                });
            })
            .await;

        match &outcome {
            ReplyOutcome::Completed(text) => {
                tracing::info!(id, chars = text.len(), "reply completed")
            }
            ReplyOutcome::Stopped(text) => {
                tracing::info!(id, chars = text.len(), "reply stopped by user")
            }
            ReplyOutcome::Failed { message, .. } => {
                tracing::warn!(id, error = %message, "reply failed")
            }
        }
        let _ = tx.send(AppEvent::ReplyDone { id, outcome });
    });
}

/// PBKDF2 takes long enough to freeze the screen, so sealing runs on the
/// blocking pool and reports back as an event.
fn spawn_seal(text: String, password: String, tx: UnboundedSender<AppEvent>) {
    tokio::spawn(async move {
        let sealed = match tokio::task::spawn_blocking(move || secret::seal(&text, &password)).await
        {
            Ok(sealed) => sealed.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        let _ = tx.send(AppEvent::PromptSealed(sealed));
    });
}

fn store_sealed_prompt(app: &mut App, sealed: Result<EncryptedSecret, String>) {
    let sealed = match sealed {
        Ok(sealed) => sealed,
        Err(e) => {
            tracing::error!(error = %e, "could not seal system prompt");
            app.notice(format!("[ERROR] could not seal system prompt: {}", e));
            return;
        }
    };
    let legacy = sealed.is_legacy();
    match app.store_system_prompt(sealed) {
        Ok(()) if legacy => {
            app.notice("System prompt stored WITHOUT encryption (no secure random source).")
        }
        Ok(()) => app.notice("System prompt sealed and stored."),
        Err(e) => app.notice(format!("[ERROR] {}", e)),
    }
}

fn run_command(app: &mut App, command: Command<'_>, tx: &UnboundedSender<AppEvent>) {
    match command {
        Command::Clear => app.clear(),
        Command::Server("") => {
            let target = app.target_label();
            app.notice(format!("Backend: {}", target));
        }
        Command::Server(url) => match app.set_backend(url) {
            Ok(()) => {
                tracing::info!(url = %url, "backend changed");
                app.notice(format!("Backend set to {}", app.target_label()));
            }
            Err(e) => app.notice(format!("[ERROR] could not save backend: {}", e)),
        },
        Command::System("") => match app.clear_system_prompt() {
            Ok(()) => app.notice("System prompt cleared."),
            Err(e) => app.notice(format!("[ERROR] {}", e)),
        },
        Command::System(text) => match app.sealing_password() {
            Ok(password) => spawn_seal(text.to_string(), password, tx.clone()),
            Err(e) => app.notice(format!("[ERROR] {}", e)),
        },
        Command::Thinking => match app.toggle_thinking() {
            Ok(true) => app.notice("Reasoning mode on."),
            Ok(false) => app.notice("Reasoning mode off."),
            Err(e) => app.notice(format!("[ERROR] could not save setting: {}", e)),
        },
        Command::Stop => {
            if !app.stop() {
                app.notice("Nothing to stop.");
            }
        }
        Command::Help => app.notice(HELP),
        Command::Quit => {
            app.stop();
            app.should_quit = true;
        }
        Command::Unknown(name) => {
            app.notice(format!("Unknown command /{}. Type /help for commands.", name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tests::{session, test_app, BrokenStore};
    use crate::app::EntryKind;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use termchat_core::{MemorySecretStore, SecretStore};
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn key(code: KeyCode) -> AppEvent {
        AppEvent::Key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn ctrl(c: char) -> AppEvent {
        AppEvent::Key(KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL))
    }

    fn type_line(app: &mut App, tx: &UnboundedSender<AppEvent>, text: &str) {
        for c in text.chars() {
            handle_event(app, key(KeyCode::Char(c)), tx);
        }
        handle_event(app, key(KeyCode::Enter), tx);
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("/cls"), Some(Command::Clear));
        assert_eq!(
            parse_command("/server http://h:1234"),
            Some(Command::Server("http://h:1234"))
        );
        assert_eq!(
            parse_command("/system  Be terse. "),
            Some(Command::System("Be terse."))
        );
        assert_eq!(parse_command("/system"), Some(Command::System("")));
        assert_eq!(parse_command("/model x"), Some(Command::Unknown("model")));
        assert_eq!(parse_command("hello"), None);
    }

    #[test]
    fn test_ctrl_c_quits_when_idle() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut app = test_app();
        handle_event(&mut app, ctrl('c'), &tx);
        assert!(app.should_quit);
    }

    #[tokio::test]
    async fn test_ctrl_c_and_esc_stop_streaming() {
        let (tx, _rx) = mpsc::unbounded_channel();
        for event in [ctrl('c'), key(KeyCode::Esc)] {
            let mut app = test_app();
            app.push_user("q".into());
            let (_id, _stream) = app.start_reply().unwrap();
            let cancel = app.streaming.as_ref().unwrap().cancel.clone();

            handle_event(&mut app, event, &tx);
            assert!(cancel.is_cancelled());
            assert!(!app.should_quit);
        }
    }

    #[tokio::test]
    async fn test_send_refused_while_streaming() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut app = test_app();
        let (_id, _stream) = app.start_reply().unwrap();

        type_line(&mut app, &tx, "second question");
        assert_eq!(app.input, "second question");
        assert_eq!(app.entries.last().unwrap().kind, EntryKind::Notice);
        assert!(!app.entries.iter().any(|e| e.kind == EntryKind::User));
    }

    #[tokio::test]
    async fn test_unreadable_secret_store_does_not_block_send() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut app = App::new(session(), Arc::new(BrokenStore), None);

        type_line(&mut app, &tx, "hi");
        assert!(app.is_streaming());
        assert!(app.input.is_empty());
        assert_eq!(app.entries.len(), 1);
        assert_eq!(app.entries[0].kind, EntryKind::User);
    }

    #[test]
    fn test_slash_commands() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut app = test_app();

        type_line(&mut app, &tx, "/thinking");
        assert!(!app.session.thinking_enabled);

        type_line(&mut app, &tx, "/server http://other:1234");
        assert_eq!(app.session.backend_url.as_deref(), Some("http://other:1234"));

        type_line(&mut app, &tx, "/help");
        assert!(app.entries.last().unwrap().text.contains("/system"));

        type_line(&mut app, &tx, "/bogus");
        assert!(app.entries.last().unwrap().text.contains("Unknown command /bogus"));

        type_line(&mut app, &tx, "/cls");
        assert!(app.entries.is_empty());

        type_line(&mut app, &tx, "/quit");
        assert!(app.should_quit);
    }

    #[tokio::test]
    async fn test_system_command_seals_off_the_ui_loop() {
        let store = Arc::new(MemorySecretStore::default());
        let mut app = App::new(session(), store.clone(), None);
        let (tx, mut rx) = mpsc::unbounded_channel();

        type_line(&mut app, &tx, "/system Be brief.");
        assert_eq!(store.load().unwrap(), None);

        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, AppEvent::PromptSealed(Ok(_))));
        handle_event(&mut app, event, &tx);

        let stored = store.load().unwrap().unwrap();
        assert_eq!(secret::unwrap(&stored, "pw").unwrap(), "Be brief.");
        assert_eq!(app.entries.last().unwrap().text, "System prompt sealed and stored.");

        type_line(&mut app, &tx, "/system");
        assert_eq!(store.load().unwrap(), None);
        assert_eq!(app.entries.last().unwrap().text, "System prompt cleared.");
    }

    #[test]
    fn test_system_command_without_password() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut app = test_app();
        app.session.password = None;

        type_line(&mut app, &tx, "/system Be brief.");
        assert!(app.entries.last().unwrap().text.contains("no password"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_seal_failure_is_reported() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut app = test_app();
        handle_event(&mut app, AppEvent::PromptSealed(Err("encryption failed".into())), &tx);
        let last = app.entries.last().unwrap();
        assert_eq!(last.kind, EntryKind::Notice);
        assert!(last.text.contains("encryption failed"));
    }

    #[tokio::test]
    async fn test_conversation_against_backend() {
        let server = MockServer::start().await;
        let body = [
            json!({"choices": [{"delta": {"content": "<think>hmm"}}]}),
            json!({"choices": [{"delta": {"content": "</think>Hello"}}]}),
            json!({"choices": [{"delta": {"content": " there!"}}]}),
        ]
        .iter()
        .map(|v| format!("data: {}\n\n", v))
        .chain(std::iter::once("data: [DONE]\n\n".to_string()))
        .collect::<String>();
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let mut session = session();
        session.backend_url = Some(server.uri());
        let mut app = App::new(session, Arc::new(MemorySecretStore::default()), None);
        let (tx, mut rx) = mpsc::unbounded_channel();

        type_line(&mut app, &tx, "hi");
        assert!(app.is_streaming());

        while app.is_streaming() {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            handle_event(&mut app, event, &tx);
        }

        let last = app.entries.last().unwrap();
        assert_eq!(last.kind, EntryKind::Assistant);
        assert_eq!(last.text, "Hello there!");
        assert_eq!(app.history().len(), 2);
    }
}
