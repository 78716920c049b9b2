//! Application context shared across route handlers via Axum state.

use std::sync::Arc;

use tm_core::config::Config;
use tm_engine::Engine;

/// Everything a handler needs. Cloning is cheap: every field is an `Arc`.
#[derive(Clone)]
pub struct AppContext {
    pub engine: Arc<Engine>,
    pub config: Arc<Config>,
}

impl AppContext {
    pub fn new(engine: Arc<Engine>, config: Config) -> Self {
        Self {
            engine,
            config: Arc::new(config),
        }
    }
}
