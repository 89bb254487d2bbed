//! Shared application state

use std::sync::Arc;

use glimpse_core::Governor;

#[derive(Clone)]
pub struct AppState {
    pub governor: Arc<Governor>,
}

impl AppState {
    pub fn new(governor: Governor) -> Self {
        Self {
            governor: Arc::new(governor),
        }
    }
}
