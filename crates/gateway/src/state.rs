//! Shared application state passed to all API handlers.

use std::sync::Arc;

use relay_domain::config::Config;

use crate::runtime::RunManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<RunManager>,
    /// SHA-256 hash of the API bearer token, computed once at startup.
    /// `None` = dev mode (no auth enforced).
    pub api_token_hash: Option<Vec<u8>>,
}
