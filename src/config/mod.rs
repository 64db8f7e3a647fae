use anyhow::Result;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub platform: PlatformConfig,
    pub worker: WorkerConfig,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Graph-style API base, overridable so tests can point at a local mock.
    pub api_base: String,
    /// Shared secret used to check webhook signatures. When unset every
    /// delivery is dropped (and still acknowledged).
    pub app_secret: Option<String>,
    pub verify_token: String,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub endpoint: Option<String>,
    pub auth_token: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            server: ServerConfig {
                host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: std::env::var("SERVER_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(8080),
            },
            platform: PlatformConfig {
                api_base: std::env::var("PLATFORM_API_BASE")
                    .unwrap_or_else(|_| "https://graph.facebook.com/v17.0".to_string()),
                app_secret: std::env::var("WEBHOOK_APP_SECRET").ok(),
                verify_token: std::env::var("WEBHOOK_VERIFY_TOKEN")
                    .unwrap_or_else(|_| "webhook_verify".to_string()),
            },
            worker: WorkerConfig {
                endpoint: std::env::var("WORKER_ENDPOINT").ok(),
                auth_token: std::env::var("WORKER_AUTH_TOKEN").ok(),
            },
            request_timeout_secs: std::env::var("REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(25),
        })
    }
}
