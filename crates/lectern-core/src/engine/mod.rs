//! Concrete backend adapters shipped with the crate.

pub mod ollama;
pub mod whisper;
