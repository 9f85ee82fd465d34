use std::sync::Arc;

use debridfs_core::{AuthStore, Engine, SanitizedConfig};

/// Shared application state
pub struct AppState {
    engine: Arc<Engine>,
    auth: AuthStore,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        let auth = AuthStore::new(engine.config().auth_file());
        Self { engine, auth }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn auth(&self) -> &AuthStore {
        &self.auth
    }

    /// Whether API requests must carry credentials.
    pub fn auth_required(&self) -> bool {
        self.engine.config().use_auth
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(self.engine.config().as_ref())
    }
}
