use std::sync::Arc;

use shoal_auth::AuthService;

use crate::hub::SessionHub;
use crate::service::SessionService;

#[derive(Clone)]
pub struct AppState {
    pub auth: AuthService,
    pub service: Arc<SessionService>,
    pub hub: SessionHub,
}
