//! Server configuration, loaded from environment variables at startup.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use lectern_core::engine::ollama::OllamaConfig;
use lectern_core::engine::whisper::WhisperCliConfig;
use lectern_core::{DispatcherConfig, JobKind, JobPolicy, PoolConfig};

/// Backend class names the server registers.
pub const TRANSCRIPTION_CLASS: &str = "transcription";
pub const GENERATION_CLASS: &str = "generation";

/// Runtime configuration for lectern-server.
///
/// Every field has a default so the server starts without any environment
/// variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8000"`).
    pub bind_address: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Comma-separated CORS origins; any origin is allowed when unset.
    pub cors_allowed_origins: Option<String>,

    /// Serve the OpenAPI document at `/api-docs/openapi.json`.
    pub enable_docs: bool,

    pub transcription_pool: PoolConfig,
    pub generation_pool: PoolConfig,

    /// Whisper command line; the first word is the program, the rest are
    /// leading arguments (e.g. `"python3 -m whisper"`).
    pub whisper_command: String,
    pub whisper_model: String,
    pub whisper_language: Option<String>,
    pub whisper_work_dir: Option<PathBuf>,

    pub ollama_url: String,
    pub ollama_model: String,

    pub transcription_timeout: Duration,
    pub transcription_max_attempts: u32,
    pub generation_timeout: Duration,
    pub generation_max_attempts: u32,

    /// How long finished jobs stay pollable.
    pub retention: Duration,
    pub eviction_interval: Duration,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build [`Config`] from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Env(lookup);
        Self {
            bind_address: env.or("LECTERN_BIND", "0.0.0.0:8000"),
            log_level: env.or("LECTERN_LOG", "info"),
            log_json: env.flag("LECTERN_LOG_JSON", false),
            cors_allowed_origins: env.get("LECTERN_CORS_ORIGINS"),
            enable_docs: env.flag("LECTERN_ENABLE_DOCS", true),
            transcription_pool: PoolConfig::new(
                env.parse("LECTERN_TRANSCRIPTION_WORKERS", 2),
                env.parse("LECTERN_TRANSCRIPTION_QUEUE_DEPTH", 16),
            ),
            generation_pool: PoolConfig::new(
                env.parse("LECTERN_GENERATION_WORKERS", 8),
                env.parse("LECTERN_GENERATION_QUEUE_DEPTH", 64),
            ),
            whisper_command: env.or("LECTERN_WHISPER_BIN", "whisper"),
            whisper_model: env.or("LECTERN_WHISPER_MODEL", "base"),
            whisper_language: env.get("LECTERN_WHISPER_LANGUAGE"),
            whisper_work_dir: env.get("LECTERN_WHISPER_WORK_DIR").map(PathBuf::from),
            ollama_url: env.or("LECTERN_OLLAMA_URL", "http://localhost:11434"),
            ollama_model: env.or("LECTERN_OLLAMA_MODEL", "mistral"),
            transcription_timeout: Duration::from_secs(
                env.parse("LECTERN_TRANSCRIPTION_TIMEOUT_SECS", 900),
            ),
            transcription_max_attempts: env.parse("LECTERN_TRANSCRIPTION_MAX_ATTEMPTS", 1),
            generation_timeout: Duration::from_secs(
                env.parse("LECTERN_GENERATION_TIMEOUT_SECS", 180),
            ),
            generation_max_attempts: env.parse("LECTERN_GENERATION_MAX_ATTEMPTS", 3),
            retention: Duration::from_secs(env.parse("LECTERN_RETENTION_SECS", 3600)),
            eviction_interval: Duration::from_secs(
                env.parse("LECTERN_EVICTION_INTERVAL_SECS", 60),
            ),
        }
    }

    /// Default policy for jobs of `kind` submitted over HTTP.
    pub fn policy_for(&self, kind: JobKind) -> JobPolicy {
        let policy = JobPolicy::for_kind(kind);
        match kind {
            JobKind::Transcription => policy
                .with_timeout(self.transcription_timeout)
                .with_max_attempts(self.transcription_max_attempts),
            JobKind::Generation => policy
                .with_timeout(self.generation_timeout)
                .with_max_attempts(self.generation_max_attempts),
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            retention: self.retention,
            eviction_interval: self.eviction_interval,
        }
    }

    pub fn whisper(&self) -> WhisperCliConfig {
        let mut words = self.whisper_command.split_whitespace();
        let mut config = WhisperCliConfig {
            model: self.whisper_model.clone(),
            language: self.whisper_language.clone(),
            ..Default::default()
        };
        if let Some(program) = words.next() {
            config.program = PathBuf::from(program);
            config.program_args = words.map(OsString::from).collect();
        }
        if let Some(dir) = &self.whisper_work_dir {
            config.work_dir = dir.clone();
        }
        config
    }

    pub fn ollama(&self) -> OllamaConfig {
        OllamaConfig {
            base_url: self.ollama_url.clone(),
            model: self.ollama_model.clone(),
            ..Default::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_owned())
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(default)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }
}
