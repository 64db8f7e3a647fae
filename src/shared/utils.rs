use anyhow::{Context, Result};
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;

use crate::automation::AutomationError;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn create_conn() -> Result<DbPool> {
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://flowserver:@localhost:5432/flowserver".to_string());
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder()
        .build(manager)
        .context("failed to build database pool")
}

/// Runs a diesel closure on the blocking pool with a connection checked out
/// from `pool`. Diesel is synchronous; every store access goes through here.
pub async fn run_blocking<T, F>(pool: DbPool, f: F) -> Result<T, AutomationError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, AutomationError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| AutomationError::Database(e.to_string()))?;
        f(&mut conn)
    })
    .await
    .map_err(|e| AutomationError::Internal(e.to_string()))?
}
