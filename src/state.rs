use std::sync::Arc;

use crate::auth::Authenticator;
use crate::ws::hub::Hub;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Connection registry and router.
    pub hub: Arc<Hub>,
    /// Upgrade-time credential validator.
    pub auth: Arc<dyn Authenticator>,
}
