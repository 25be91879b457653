pub mod ai;
pub mod cancel;
pub mod config;
pub mod error;
pub mod markup;
pub mod relay;
pub mod reply;
pub mod secret;
pub mod sse;
pub mod state;
pub mod thinking;

// Re-export main types for convenience
pub use ai::{DeltaToken, LmStudioClient, DEFAULT_BACKEND_URL, DEFAULT_MODEL};
pub use cancel::CancelHandle;
pub use config::{Config, ConfigSecretStore, MemorySecretStore, SecretStore, SecretUpdate};
pub use error::RelayError;
pub use markup::{render, Inline, RenderBlock, RenderCache};
pub use relay::{
    Relay, RelayChatBody, RelayOptions, RelayRequest, RelayStream, RemoteRelay, SystemSecret,
};
pub use reply::{PendingReply, ReplyOutcome, ReplyUpdate};
pub use secret::{DecryptionError, EncryptedSecret};
pub use sse::{FrameDecoder, ProtocolEvent};
pub use state::{ChatRole, ChatTurn};
pub use thinking::{Phase, StreamState};
