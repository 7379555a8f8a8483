//! Remote text generation through an Ollama server.

mod backend;

pub use backend::{GenerationBackendError, OllamaConfig, RemoteGenerationBackend};
