//! lectern-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Prepare the Whisper and Ollama backends and start the dispatcher.
//! 4. Build the Axum router and serve with graceful shutdown.
//! 5. Drain the dispatcher and tear the backends down.

mod config;
mod error;
mod mcq;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use lectern_core::engine::ollama::RemoteGenerationBackend;
use lectern_core::engine::whisper::{LocalTranscriptionBackend, WhisperCliEngine};
use lectern_core::Dispatcher;
use tracing::{info, warn};

use crate::config::{Config, GENERATION_CLASS, TRANSCRIPTION_CLASS};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: LECTERN_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "lectern-server starting");

    // ── 3. Backends and dispatcher ─────────────────────────────────────────────
    let whisper = WhisperCliEngine::init(cfg.whisper()).context("preparing whisper engine")?;
    let ollama = RemoteGenerationBackend::init(cfg.ollama()).context("preparing ollama client")?;

    let dispatcher = Dispatcher::builder()
        .config(cfg.dispatcher())
        .backend(
            TRANSCRIPTION_CLASS,
            cfg.transcription_pool,
            Arc::new(LocalTranscriptionBackend::init(whisper)),
        )
        .backend(GENERATION_CLASS, cfg.generation_pool, Arc::new(ollama))
        .start()
        .context("starting dispatcher")?;

    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        dispatcher: dispatcher.clone(),
    });

    // ── 4. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg
        .bind_address
        .parse()
        .with_context(|| format!("invalid LECTERN_BIND '{}'", cfg.bind_address))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── 5. Drain ───────────────────────────────────────────────────────────────
    dispatcher.shutdown().await;

    info!("lectern-server stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
