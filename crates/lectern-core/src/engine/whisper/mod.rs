//! Local speech-to-text through OpenAI Whisper.

mod adapter;
mod backend;

pub use adapter::{
    CancelFlag, RaiseOnDrop, TranscriptionEngine, TranscriptionError, WhisperCliConfig,
    WhisperCliEngine,
};
pub use backend::LocalTranscriptionBackend;
