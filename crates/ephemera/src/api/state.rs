//! Shared application state.

use std::sync::Arc;

use crate::ws::hub::Hub;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    /// Origins allowed to open relay connections. Exact string match.
    pub allowed_origins: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(hub: Hub, allowed_origins: Vec<String>) -> Self {
        Self {
            hub,
            allowed_origins: Arc::new(allowed_origins),
        }
    }
}
