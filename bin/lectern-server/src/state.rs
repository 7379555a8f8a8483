//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use lectern_core::Dispatcher;

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Job admission, execution and polling.
    pub dispatcher: Dispatcher,
}
