pub mod lmstudio;

pub use lmstudio::{DeltaToken, LmStudioClient, DEFAULT_BACKEND_URL, DEFAULT_MODEL};
