use std::sync::Arc;

use shoal_auth::AuthService;
use shoal_tenant::TenantRouter;

use crate::fanout::RoomFanout;
use crate::pipeline::ChatService;

#[derive(Clone)]
pub struct AppState {
    pub auth: AuthService,
    pub chat: Arc<ChatService>,
    pub fanout: RoomFanout,
    pub tenants: Arc<TenantRouter>,
}
