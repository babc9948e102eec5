use std::sync::Arc;

use attend_core::Pipeline;

use crate::config::Config;

/// Shared application state available to all handlers via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub config: Arc<Config>,
    /// Tag of the embedding model behind the pipeline's extractor.
    pub model: String,
}
