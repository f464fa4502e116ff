//! Shared state for the admin handlers.

use std::sync::Arc;

use dogenet_net::NetService;
use dogenet_store::Store;

/// Handles the admin API needs: the store for stats and listings, the
/// net service for live peer information and peer injection.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub net: Arc<NetService>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, net: Arc<NetService>) -> Self {
        Self { store, net }
    }
}
