use dotenvy::dotenv;
use log::info;
use std::sync::Arc;

use flowserver::config::AppConfig;
use flowserver::main_module::run_axum_server;
use flowserver::platform::PlatformClient;
use flowserver::queue::DeliveryQueue;
use flowserver::shared::state::AppState;
use flowserver::shared::utils::create_conn;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Always)
        .init();

    let config = AppConfig::from_env()?;
    if config.platform.app_secret.is_none() {
        log::warn!("WEBHOOK_APP_SECRET not set; all webhook deliveries will be dropped");
    }

    let pool = create_conn()?;
    let platform = Arc::new(PlatformClient::new(config.platform.api_base.clone()));
    let queue = Arc::new(DeliveryQueue::new(pool.clone(), config.worker.clone()));

    info!(
        "starting flowserver on {}:{}",
        config.server.host, config.server.port
    );

    let state = Arc::new(AppState {
        conn: pool,
        config,
        platform,
        queue,
    });

    run_axum_server(state).await.map_err(Into::into)
}
