use std::time::Duration;

use server_api::ApiContext;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) idle_timeout: Duration,
}
