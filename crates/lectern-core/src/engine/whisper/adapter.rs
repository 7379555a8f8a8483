use std::ffi::OsString;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::runtime::backend::protocol::BackendFailure;
use crate::runtime::types::Transcript;

/// Longest stderr tail kept for error messages.
const STDERR_TAIL: usize = 2048;

/// Cooperative stop signal shared between the async adapter and a blocking
/// engine call.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Guard that raises the flag when dropped.
    pub fn raise_on_drop(&self) -> RaiseOnDrop {
        RaiseOnDrop(self.clone())
    }
}

#[derive(Debug)]
pub struct RaiseOnDrop(CancelFlag);

impl Drop for RaiseOnDrop {
    fn drop(&mut self) {
        self.0.raise();
    }
}

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("media file {path} is not usable: {reason}")]
    InvalidMedia { path: PathBuf, reason: String },

    #[error("failed to launch transcription command `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transcription command exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },

    #[error("transcription cancelled")]
    Cancelled,

    #[error("failed to read transcription output at {path}")]
    ReadOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode transcription output")]
    Decode {
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error {0}")]
    Io(#[from] std::io::Error),
}

impl From<TranscriptionError> for BackendFailure {
    fn from(err: TranscriptionError) -> Self {
        let message = format!("{err:#}");
        match err {
            TranscriptionError::InvalidMedia { .. } => BackendFailure::invalid_input(message),
            TranscriptionError::Spawn { source, .. } => {
                BackendFailure::unavailable(format!("{message}: {source}"))
            }
            _ => BackendFailure::internal(message),
        }
    }
}

/// A blocking speech-to-text engine.
///
/// Called from a blocking thread. Long-running engines should check
/// `cancel` periodically and return [`TranscriptionError::Cancelled`] once it
/// is raised.
pub trait TranscriptionEngine: Send + Sync + 'static {
    fn transcribe(&self, media: &Path, cancel: &CancelFlag)
        -> Result<Transcript, TranscriptionError>;
}

impl<F> TranscriptionEngine for F
where
    F: Fn(&Path, &CancelFlag) -> Result<Transcript, TranscriptionError> + Send + Sync + 'static,
{
    fn transcribe(
        &self,
        media: &Path,
        cancel: &CancelFlag,
    ) -> Result<Transcript, TranscriptionError> {
        self(media, cancel)
    }
}

/// Settings for [`WhisperCliEngine`].
#[derive(Debug, Clone)]
pub struct WhisperCliConfig {
    /// Executable to run, e.g. `whisper` or `python3`.
    pub program: PathBuf,
    /// Arguments placed before the media path, e.g. `["-m", "whisper"]`.
    pub program_args: Vec<OsString>,
    /// Whisper model name.
    pub model: String,
    /// Spoken language; auto-detected when unset.
    pub language: Option<String>,
    /// Directory receiving per-run output directories.
    pub work_dir: PathBuf,
    /// How often the child process is checked for exit and cancellation.
    pub poll_interval: Duration,
}

impl Default for WhisperCliConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("whisper"),
            program_args: Vec::new(),
            model: "base".to_owned(),
            language: None,
            work_dir: std::env::temp_dir().join("lectern-whisper"),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Removes a run's output directory on every exit path.
struct OutputDir(PathBuf);

impl Drop for OutputDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.0) {
            debug!(path = %self.0.display(), error = %e, "could not remove whisper output dir");
        }
    }
}

/// Runs the Whisper command-line tool as a child process.
///
/// Invocation: `<program> [program_args] <media> --model <model> --task
/// transcribe --output_format json --output_dir <dir> --verbose False
/// [--language <lang>]`. The JSON file Whisper writes (`<dir>/<stem>.json`)
/// carries `text` and `segments[{start, end, text}]`.
#[derive(Debug, Clone)]
pub struct WhisperCliEngine {
    config: WhisperCliConfig,
}

impl WhisperCliEngine {
    /// Prepare the engine. Creates the work directory.
    pub fn init(config: WhisperCliConfig) -> Result<Self, TranscriptionError> {
        fs::create_dir_all(&config.work_dir)?;
        info!(
            program = %config.program.display(),
            model = %config.model,
            work_dir = %config.work_dir.display(),
            "whisper engine ready"
        );
        Ok(Self { config })
    }

    pub fn config(&self) -> &WhisperCliConfig {
        &self.config
    }

    fn command(&self, media: &Path, output_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.program_args)
            .arg(media)
            .args(["--model", &self.config.model])
            .args(["--task", "transcribe"])
            .args(["--output_format", "json"])
            .arg("--output_dir")
            .arg(output_dir)
            .args(["--verbose", "False"]);
        if let Some(language) = &self.config.language {
            cmd.args(["--language", language]);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl TranscriptionEngine for WhisperCliEngine {
    fn transcribe(
        &self,
        media: &Path,
        cancel: &CancelFlag,
    ) -> Result<Transcript, TranscriptionError> {
        let stem = media
            .file_stem()
            .ok_or_else(|| TranscriptionError::InvalidMedia {
                path: media.to_path_buf(),
                reason: "path has no file name".into(),
            })?
            .to_owned();

        let output_dir = OutputDir(self.config.work_dir.join(Uuid::new_v4().to_string()));
        fs::create_dir_all(&output_dir.0)?;

        let mut child = self
            .command(media, &output_dir.0)
            .spawn()
            .map_err(|source| TranscriptionError::Spawn {
                program: self.config.program.display().to_string(),
                source,
            })?;

        // Drain stderr on its own thread so a chatty child never blocks on a
        // full pipe.
        let stderr = child.stderr.take();
        let stderr_reader = thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf);
            }
            buf
        });

        let status = loop {
            if cancel.is_raised() {
                if let Err(e) = child.kill() {
                    warn!(error = %e, "failed to kill whisper process");
                }
                let _ = child.wait();
                return Err(TranscriptionError::Cancelled);
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(self.config.poll_interval),
            }
        };
        let stderr = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            let start = stderr.len().saturating_sub(STDERR_TAIL);
            let start = (start..stderr.len())
                .find(|i| stderr.is_char_boundary(*i))
                .unwrap_or(stderr.len());
            return Err(TranscriptionError::Exited {
                status: status.to_string(),
                stderr: stderr[start..].trim().to_owned(),
            });
        }

        let mut json_name = stem;
        json_name.push(".json");
        let json_path = output_dir.0.join(json_name);
        let raw = fs::read(&json_path).map_err(|source| TranscriptionError::ReadOutput {
            path: json_path.clone(),
            source,
        })?;
        let transcript: Transcript =
            serde_json::from_slice(&raw).map_err(|source| TranscriptionError::Decode { source })?;

        debug!(
            media = %media.display(),
            segments = transcript.segments.len(),
            "whisper run complete"
        );
        Ok(transcript)
    }
}
