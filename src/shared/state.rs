use std::sync::Arc;

use crate::config::AppConfig;
use crate::platform::PlatformClient;
use crate::queue::DeliveryQueue;
use crate::shared::utils::DbPool;

#[derive(Clone)]
pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub platform: Arc<PlatformClient>,
    pub queue: Arc<DeliveryQueue>,
}
