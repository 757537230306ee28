//! Application state shared across admin handlers

use std::sync::Arc;

use crate::{config::Config, storage::Storage, supervisor::Supervisor};

/// Handles every admin endpoint needs: config, storage, and the live
/// supervisor
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<Storage>,
    pub supervisor: Arc<Supervisor>,
}

impl AppState {
    pub fn new(config: Arc<Config>, storage: Arc<Storage>, supervisor: Arc<Supervisor>) -> Self {
        Self {
            config,
            storage,
            supervisor,
        }
    }
}
