//! Creator resolution: maps the platform account id carried in a webhook
//! entry to the creator's active integration record. No match means nobody
//! owns the traffic and the entry is dropped upstream.

use diesel::prelude::*;

use crate::automation::AutomationError;
use crate::shared::models::{integrations, Integration};
use crate::shared::utils::{run_blocking, DbPool};

pub async fn resolve_account(
    pool: DbPool,
    platform_account_id: &str,
) -> Result<Option<Integration>, AutomationError> {
    let account = platform_account_id.to_string();
    run_blocking(pool, move |conn| {
        integrations::table
            .filter(integrations::account_id.eq(&account))
            .filter(integrations::is_active.eq(true))
            .first::<Integration>(conn)
            .optional()
            .map_err(AutomationError::from)
    })
    .await
}
