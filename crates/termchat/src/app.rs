use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use termchat_core::{
    CancelHandle, ChatTurn, Config, EncryptedSecret, Relay, RelayChatBody, RelayOptions, RelayRequest,
    RelayStream, RemoteRelay, RenderCache, ReplyOutcome, SecretStore, SecretUpdate, SystemSecret,
    DEFAULT_BACKEND_URL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    User,
    Assistant,
    /// Failed reply: shown under the assistant label, never sent back
    Error,
    /// Local output such as /help, never sent back
    Notice,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub kind: EntryKind,
    pub text: String,
}

/// Settings resolved from flags, environment and config file
#[derive(Debug, Clone)]
pub struct Session {
    pub backend_url: Option<String>,
    pub relay_url: Option<String>,
    pub model: String,
    pub password: Option<String>,
    pub thinking_enabled: bool,
}

/// The reply currently streaming in
pub struct Streaming {
    pub id: u64,
    pub cancel: CancelHandle,
    pub visible: String,
    pub render: RenderCache,
}

enum Transport {
    Local(Relay),
    Remote(RemoteRelay),
}

pub struct App {
    pub should_quit: bool,
    pub session: Session,
    transport: Transport,
    secrets: Arc<dyn SecretStore>,
    config_path: Option<PathBuf>,

    // Transcript
    pub entries: Vec<Entry>,
    pub streaming: Option<Streaming>,
    next_reply_id: u64,

    // Input line (cursor counts chars, not bytes)
    pub input: String,
    pub cursor: usize,

    // Scroll state, sizes are written back by the renderer
    pub scroll: u16,
    pub follow: bool,
    pub max_scroll: u16,
    pub chat_height: u16,

    // 0-2 for the waiting indicator
    pub animation_frame: u8,
}

impl App {
    /// `config_path` is where /server and /thinking persist; `None` keeps
    /// changes in memory.
    pub fn new(
        session: Session,
        secrets: Arc<dyn SecretStore>,
        config_path: Option<PathBuf>,
    ) -> Self {
        let transport = match &session.relay_url {
            Some(url) => Transport::Remote(RemoteRelay::new(url)),
            None => Transport::Local(Relay::new()),
        };

        Self {
            should_quit: false,
            session,
            transport,
            secrets,
            config_path,
            entries: Vec::new(),
            streaming: None,
            next_reply_id: 0,
            input: String::new(),
            cursor: 0,
            scroll: 0,
            follow: true,
            max_scroll: 0,
            chat_height: 0,
            animation_frame: 0,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some()
    }

    /// Where requests go, for display
    pub fn target_label(&self) -> String {
        match &self.session.relay_url {
            Some(url) => format!("relay {}", url),
            None => self
                .session
                .backend_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
        }
    }

    /// Conversation as sent to the backend
    pub fn history(&self) -> Vec<ChatTurn> {
        self.entries
            .iter()
            .filter_map(|entry| match entry.kind {
                EntryKind::User => Some(ChatTurn::user(entry.text.clone())),
                EntryKind::Assistant => Some(ChatTurn::assistant(entry.text.clone())),
                EntryKind::Error | EntryKind::Notice => None,
            })
            .collect()
    }

    pub fn notice(&mut self, text: impl Into<String>) {
        self.push(EntryKind::Notice, text.into());
    }

    pub fn push_user(&mut self, text: String) {
        self.push(EntryKind::User, text);
    }

    fn push(&mut self, kind: EntryKind, text: String) {
        self.entries.push(Entry { kind, text });
        self.follow = true;
    }

    /// Start relaying the current history. Only one reply streams at a time.
    pub fn start_reply(&mut self) -> Result<(u64, RelayStream)> {
        if self.is_streaming() {
            return Err(anyhow!("a reply is already streaming"));
        }

        let cancel = CancelHandle::new();
        let stream = match &self.transport {
            Transport::Local(relay) => {
                let request = RelayRequest {
                    turns: self.history(),
                    model: Some(self.session.model.clone()),
                    backend_url: self.session.backend_url.clone(),
                    options: RelayOptions {
                        disable_extended_reasoning: !self.session.thinking_enabled,
                    },
                    system_secret: self.system_secret(),
                };
                relay.start(request, cancel.clone())
            }
            Transport::Remote(remote) => {
                let body = RelayChatBody {
                    messages: self.history(),
                    model: Some(self.session.model.clone()),
                    password: self.session.password.clone(),
                    backend_url: self.session.backend_url.clone(),
                    thinking_enabled: Some(self.session.thinking_enabled),
                };
                remote.start(body, cancel.clone())
            }
        };

        self.next_reply_id += 1;
        let id = self.next_reply_id;
        self.streaming = Some(Streaming {
            id,
            cancel,
            visible: String::new(),
            render: RenderCache::default(),
        });
        self.follow = true;
        Ok((id, stream))
    }

    /// Push a user turn and start its reply. On failure the turn is taken
    /// back so it is never sent with a later message.
    pub fn send(&mut self, text: String) -> Result<(u64, RelayStream)> {
        self.push_user(text);
        let started = self.start_reply();
        if started.is_err() {
            self.entries.pop();
        }
        started
    }

    /// An unreadable store means no system prompt, never a failed chat
    fn system_secret(&self) -> Option<SystemSecret> {
        let secret = match self.secrets.load() {
            Ok(secret) => secret?,
            Err(e) => {
                tracing::warn!(error = %e, "could not load system prompt, continuing without it");
                return None;
            }
        };
        Some(SystemSecret {
            secret,
            password: self.session.password.clone().unwrap_or_default(),
        })
    }

    pub fn apply_delta(&mut self, id: u64, visible: String) {
        if let Some(streaming) = self.streaming.as_mut().filter(|s| s.id == id) {
            streaming.visible = visible;
        }
    }

    /// Record how reply `id` ended. Outcomes of replies dropped by /cls are
    /// ignored.
    pub fn finish_reply(&mut self, id: u64, outcome: ReplyOutcome) {
        if self.streaming.as_ref().map(|s| s.id) != Some(id) {
            return;
        }
        self.streaming = None;

        let kind = match &outcome {
            ReplyOutcome::Failed { .. } => EntryKind::Error,
            _ => EntryKind::Assistant,
        };
        if let Some(text) = outcome.transcript() {
            self.push(kind, text);
        }
    }

    /// Cancel the streaming reply. Returns false when nothing was streaming.
    pub fn stop(&mut self) -> bool {
        match &self.streaming {
            Some(streaming) => {
                streaming.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the transcript, including any reply still streaming.
    pub fn clear(&mut self) {
        if let Some(streaming) = self.streaming.take() {
            streaming.cancel.cancel();
        }
        self.entries.clear();
        self.scroll = 0;
        self.follow = true;
    }

    pub fn set_backend(&mut self, url: &str) -> Result<()> {
        let url = url.trim_end_matches('/').to_string();
        self.persist(|config| config.backend_url = Some(url.clone()))?;
        self.session.backend_url = Some(url);
        Ok(())
    }

    pub fn toggle_thinking(&mut self) -> Result<bool> {
        let enabled = !self.session.thinking_enabled;
        self.persist(|config| config.thinking_enabled = enabled)?;
        self.session.thinking_enabled = enabled;
        Ok(enabled)
    }

    fn ensure_local_prompt(&self) -> Result<()> {
        match &self.transport {
            Transport::Remote(remote) => Err(anyhow!(
                "the system prompt is kept by the relay server at {}",
                remote.relay_url()
            )),
            Transport::Local(_) => Ok(()),
        }
    }

    /// Password a new system prompt gets sealed with
    pub fn sealing_password(&self) -> Result<String> {
        self.ensure_local_prompt()?;
        self.session
            .password
            .clone()
            .ok_or_else(|| anyhow!("no password set (use --password or TERMCHAT_PASSWORD)"))
    }

    pub fn store_system_prompt(&mut self, sealed: EncryptedSecret) -> Result<()> {
        self.ensure_local_prompt()?;
        self.secrets.store(SecretUpdate::Replace(sealed))
    }

    pub fn clear_system_prompt(&mut self) -> Result<()> {
        self.ensure_local_prompt()?;
        self.secrets.store(SecretUpdate::Clear)
    }

    fn persist(&self, update: impl FnOnce(&mut Config)) -> Result<()> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };
        let mut config = Config::load_from(path)?;
        update(&mut config);
        config.save_to(path)
    }

    // Input line editing

    fn byte_index(&self, char_idx: usize) -> usize {
        self.input
            .char_indices()
            .nth(char_idx)
            .map(|(i, _)| i)
            .unwrap_or(self.input.len())
    }

    pub fn insert_char(&mut self, c: char) {
        let at = self.byte_index(self.cursor);
        self.input.insert(at, c);
        self.cursor += 1;
    }

    pub fn delete_before_cursor(&mut self) {
        if self.cursor == 0 {
            return;
        }
        self.cursor -= 1;
        let at = self.byte_index(self.cursor);
        self.input.remove(at);
    }

    pub fn delete_at_cursor(&mut self) {
        if self.cursor < self.input.chars().count() {
            let at = self.byte_index(self.cursor);
            self.input.remove(at);
        }
    }

    pub fn move_cursor_left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn move_cursor_right(&mut self) {
        self.cursor = (self.cursor + 1).min(self.input.chars().count());
    }

    pub fn move_cursor_home(&mut self) {
        self.cursor = 0;
    }

    pub fn move_cursor_end(&mut self) {
        self.cursor = self.input.chars().count();
    }

    pub fn clear_input(&mut self) {
        self.input.clear();
        self.cursor = 0;
    }

    pub fn take_input(&mut self) -> String {
        self.cursor = 0;
        std::mem::take(&mut self.input)
    }

    /// Put back a line that could not be sent
    pub fn restore_input(&mut self, text: String) {
        self.cursor = text.chars().count();
        self.input = text;
    }

    // Scrolling

    pub fn scroll_up(&mut self, lines: u16) {
        self.follow = false;
        self.scroll = self.scroll.min(self.max_scroll).saturating_sub(lines);
    }

    pub fn scroll_down(&mut self, lines: u16) {
        self.scroll = self.scroll.saturating_add(lines);
        if self.scroll >= self.max_scroll {
            self.follow = true;
        }
    }

    pub fn page(&self) -> u16 {
        (self.chat_height / 2).max(1)
    }

    pub fn tick_animation(&mut self) {
        if self.streaming.as_ref().is_some_and(|s| s.visible.is_empty()) {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use termchat_core::{secret, MemorySecretStore};

    pub(crate) struct BrokenStore;

    impl SecretStore for BrokenStore {
        fn load(&self) -> Result<Option<EncryptedSecret>> {
            Err(anyhow!("key must be a string at line 1 column 2"))
        }

        fn store(&self, _update: SecretUpdate) -> Result<()> {
            Err(anyhow!("read-only"))
        }
    }

    pub(crate) fn session() -> Session {
        Session {
            backend_url: Some("http://127.0.0.1:9".to_string()),
            relay_url: None,
            model: "test-model".to_string(),
            password: Some("pw".to_string()),
            thinking_enabled: true,
        }
    }

    pub(crate) fn test_app() -> App {
        App::new(session(), Arc::new(MemorySecretStore::default()), None)
    }

    #[test]
    fn test_history_skips_local_entries() {
        let mut app = test_app();
        app.push_user("hi".into());
        app.notice("help text");
        app.entries.push(Entry {
            kind: EntryKind::Error,
            text: "[ERROR] boom".into(),
        });
        app.entries.push(Entry {
            kind: EntryKind::Assistant,
            text: "hello".into(),
        });

        let history = app.history();
        assert_eq!(history, vec![ChatTurn::user("hi"), ChatTurn::assistant("hello")]);
    }

    #[tokio::test]
    async fn test_finish_reply_records_outcome() {
        let mut app = test_app();
        app.push_user("q".into());
        let (id, _stream) = app.start_reply().unwrap();
        assert!(app.start_reply().is_err());

        app.apply_delta(id, "The answer is 4".into());
        assert_eq!(app.streaming.as_ref().unwrap().visible, "The answer is 4");

        assert!(app.stop());
        assert!(app.streaming.as_ref().unwrap().cancel.is_cancelled());
        app.finish_reply(id, ReplyOutcome::Stopped("The answer is 4".into()));

        assert!(!app.is_streaming());
        let last = app.entries.last().unwrap();
        assert_eq!(last.kind, EntryKind::Assistant);
        assert_eq!(last.text, "The answer is 4\n\n[stopped]");
    }

    #[tokio::test]
    async fn test_failed_reply_is_error_entry() {
        let mut app = test_app();
        let (id, _stream) = app.start_reply().unwrap();
        app.finish_reply(
            id,
            ReplyOutcome::Failed {
                partial: String::new(),
                message: "Backend error 500: oops".into(),
            },
        );
        let last = app.entries.last().unwrap();
        assert_eq!(last.kind, EntryKind::Error);
        assert_eq!(last.text, "[ERROR] Backend error 500: oops");
        assert!(app.history().is_empty());
    }

    #[tokio::test]
    async fn test_clear_ignores_late_outcome() {
        let mut app = test_app();
        app.push_user("q".into());
        let (id, _stream) = app.start_reply().unwrap();
        let cancel = app.streaming.as_ref().unwrap().cancel.clone();

        app.clear();
        assert!(cancel.is_cancelled());
        app.apply_delta(id, "late".into());
        app.finish_reply(id, ReplyOutcome::Stopped("late".into()));
        assert!(app.entries.is_empty());
        assert!(!app.is_streaming());
    }

    #[test]
    fn test_empty_completion_adds_nothing() {
        let mut app = test_app();
        app.streaming = Some(Streaming {
            id: 7,
            cancel: CancelHandle::new(),
            visible: String::new(),
            render: RenderCache::default(),
        });
        app.finish_reply(7, ReplyOutcome::Completed(String::new()));
        assert!(app.entries.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_secret_store_still_chats() {
        let mut app = App::new(session(), Arc::new(BrokenStore), None);
        let (_id, _stream) = app.send("hi".into()).unwrap();
        assert!(app.is_streaming());
        assert_eq!(app.history(), vec![ChatTurn::user("hi")]);
    }

    #[tokio::test]
    async fn test_failed_send_takes_back_user_turn() {
        let mut app = test_app();
        let (_id, _stream) = app.send("first".into()).unwrap();

        assert!(app.send("second".into()).is_err());
        assert_eq!(app.history(), vec![ChatTurn::user("first")]);
    }

    #[test]
    fn test_system_prompt_roundtrip() {
        let store = Arc::new(MemorySecretStore::default());
        let mut app = App::new(session(), store.clone(), None);

        let password = app.sealing_password().unwrap();
        let sealed = secret::seal("Be brief.", &password).unwrap();
        app.store_system_prompt(sealed).unwrap();
        let stored = store.load().unwrap().unwrap();
        assert!(!stored.is_legacy());
        assert_eq!(secret::unwrap(&stored, "pw").unwrap(), "Be brief.");

        app.clear_system_prompt().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_system_prompt_needs_password() {
        let mut app = test_app();
        app.session.password = None;
        let err = app.sealing_password().unwrap_err();
        assert!(err.to_string().contains("no password"));
    }

    #[test]
    fn test_system_prompt_refused_through_relay() {
        let mut session = session();
        session.relay_url = Some("http://relay:3000".into());
        let mut app = App::new(session, Arc::new(MemorySecretStore::default()), None);
        assert_eq!(app.target_label(), "relay http://relay:3000");
        assert!(app.sealing_password().is_err());
        assert!(app.clear_system_prompt().is_err());
    }

    #[test]
    fn test_settings_persist_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut app = App::new(
            session(),
            Arc::new(MemorySecretStore::default()),
            Some(path.clone()),
        );

        app.set_backend("http://gpu-box:1234/").unwrap();
        assert!(!app.toggle_thinking().unwrap());

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.backend_url.as_deref(), Some("http://gpu-box:1234"));
        assert!(!config.thinking_enabled);
        assert_eq!(app.target_label(), "http://gpu-box:1234");
    }

    #[test]
    fn test_input_editing_multibyte() {
        let mut app = test_app();
        for c in "héllo".chars() {
            app.insert_char(c);
        }
        app.move_cursor_left();
        app.move_cursor_left();
        app.delete_before_cursor();
        assert_eq!(app.input, "hélo");
        app.move_cursor_home();
        app.delete_at_cursor();
        assert_eq!(app.input, "élo");
        app.move_cursor_end();
        app.insert_char('!');
        assert_eq!(app.take_input(), "élo!");
        assert_eq!(app.cursor, 0);

        app.restore_input("élo!".into());
        assert_eq!(app.cursor, 4);
        app.delete_before_cursor();
        assert_eq!(app.input, "élo");
    }

    #[test]
    fn test_scroll_follow() {
        let mut app = test_app();
        app.max_scroll = 10;
        app.scroll = 10;
        app.scroll_up(3);
        assert!(!app.follow);
        assert_eq!(app.scroll, 7);
        app.scroll_down(5);
        assert!(app.follow);
    }
}
