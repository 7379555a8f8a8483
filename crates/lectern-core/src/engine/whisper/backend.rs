use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::adapter::{CancelFlag, TranscriptionEngine, TranscriptionError};
use crate::runtime::backend::protocol::{
    BackendAdapter, BackendFailure, BackendOutput, BackendRequest, BackendResult,
};
use crate::runtime::types::{JobInput, JobKind};

/// [`BackendAdapter`] running a blocking [`TranscriptionEngine`] on the
/// blocking thread pool.
///
/// When the dispatcher drops an attempt (timeout or cancellation) the
/// engine's [`CancelFlag`] is raised so the blocking call can stop early.
#[derive(Clone)]
pub struct LocalTranscriptionBackend {
    engine: Arc<dyn TranscriptionEngine>,
}

impl std::fmt::Debug for LocalTranscriptionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTranscriptionBackend").finish_non_exhaustive()
    }
}

impl LocalTranscriptionBackend {
    pub fn init(engine: impl TranscriptionEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

fn check_media(path: &Path) -> Result<(), TranscriptionError> {
    let invalid = |reason: String| TranscriptionError::InvalidMedia {
        path: path.to_path_buf(),
        reason,
    };
    let meta = std::fs::metadata(path).map_err(|e| invalid(e.to_string()))?;
    if !meta.is_file() {
        return Err(invalid("not a regular file".into()));
    }
    if meta.len() == 0 {
        return Err(invalid("file is empty".into()));
    }
    Ok(())
}

#[async_trait]
impl BackendAdapter for LocalTranscriptionBackend {
    fn name(&self) -> &str {
        "whisper.local"
    }

    fn capability(&self) -> JobKind {
        JobKind::Transcription
    }

    async fn invoke(&self, request: BackendRequest) -> BackendResult {
        let media = match request.input {
            JobInput::Media(media) => media.path,
            other => {
                return Err(BackendFailure::invalid_input(format!(
                    "transcription needs a media reference, got {} input",
                    other.kind()
                )));
            }
        };

        let cancel = CancelFlag::new();
        // Raised if this future is dropped before the blocking call returns.
        let _guard = cancel.raise_on_drop();

        let engine = Arc::clone(&self.engine);
        let job_id = request.job_id;
        let attempt = request.attempt;
        let result = tokio::task::spawn_blocking(move || {
            check_media(&media)?;
            debug!(%job_id, attempt, media = %media.display(), "transcribing");
            engine.transcribe(&media, &cancel)
        })
        .await
        .map_err(|e| {
            warn!(%job_id, error = %e, "transcription task panicked");
            BackendFailure::internal("transcription task panicked")
        })?;

        result
            .map(BackendOutput::Transcript)
            .map_err(BackendFailure::from)
    }
}
