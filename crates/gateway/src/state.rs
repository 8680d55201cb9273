use std::sync::Arc;

use linkgate_config::{LinkgateConfig, UploadsConfig};

use crate::{auth::ResolvedAuth, manager::SessionManager};

/// Shared state behind every HTTP and WebSocket handler.
pub struct GatewayState {
    pub manager: Arc<SessionManager>,
    pub auth: ResolvedAuth,
    pub uploads: UploadsConfig,
    pub max_upload_bytes: usize,
    /// Server version string.
    pub version: String,
}

impl GatewayState {
    pub fn new(
        manager: Arc<SessionManager>,
        auth: ResolvedAuth,
        config: &LinkgateConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            auth,
            uploads: config.uploads.clone(),
            max_upload_bytes: config.server.max_upload_bytes,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}
