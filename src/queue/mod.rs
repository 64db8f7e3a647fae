//! Delivery queue: the single choke point for outbound content.
//!
//! A send request becomes a `pending` queue job plus a `queued` delivery
//! log row written in one transaction; the log's unique dedup key is what
//! closes the check-then-act race between concurrent webhook deliveries.
//! An external worker drains the jobs; we only poke it awake.

use chrono::Utc;
use diesel::prelude::*;
use log::{debug, info};
use serde_json::json;
use tokio::task::spawn_blocking;
use uuid::Uuid;

use crate::automation::AutomationError;
use crate::config::WorkerConfig;
use crate::shared::models::{
    delivery_logs, queue_jobs, DeliveryLog, DeliveryStatus, JobStatus, QueueJob,
};
use crate::shared::utils::DbPool;

pub const JOB_DM_DELIVERY: &str = "dm_delivery";
pub const PROVIDER: &str = "instagram";

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub creator_id: Uuid,
    pub integration_id: Uuid,
    pub recipient_id: String,
    pub text: String,
    pub quick_replies: Vec<String>,
    pub attachments: Vec<serde_json::Value>,
    pub source: String,
    pub rule_id: Option<Uuid>,
    /// Unique suppression key; `None` skips the dedup constraint entirely.
    pub dedup_key: Option<String>,
    pub variables: serde_json::Value,
}

pub struct DeliveryQueue {
    conn: DbPool,
    worker: WorkerConfig,
    http: reqwest::Client,
}

impl DeliveryQueue {
    pub fn new(conn: DbPool, worker: WorkerConfig) -> Self {
        Self {
            conn,
            worker,
            http: reqwest::Client::new(),
        }
    }

    /// Persists the job and its delivery log. Returns `false` when the
    /// dedup key already exists, meaning a concurrent or earlier fire won
    /// and this one must be suppressed.
    pub async fn enqueue_dm(&self, request: SendRequest) -> Result<bool, AutomationError> {
        let pool = self.conn.clone();
        let req = request.clone();

        let enqueued = spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| AutomationError::Database(e.to_string()))?;

            conn.transaction::<bool, AutomationError, _>(|conn| {
                let now = Utc::now();
                let log = build_log(&req, now);
                let inserted = diesel::insert_into(delivery_logs::table)
                    .values(&log)
                    .on_conflict_do_nothing()
                    .execute(conn)?;
                if req.dedup_key.is_some() && inserted == 0 {
                    return Ok(false);
                }

                let job = build_job(&req, now);
                diesel::insert_into(queue_jobs::table)
                    .values(&job)
                    .execute(conn)?;
                Ok(true)
            })
        })
        .await
        .map_err(|e| AutomationError::Internal(e.to_string()))??;

        if enqueued {
            info!(
                "queued {} for recipient {} (source: {})",
                JOB_DM_DELIVERY, request.recipient_id, request.source
            );
            self.notify_worker();
        } else {
            debug!(
                "suppressed duplicate delivery for recipient {} (key: {:?})",
                request.recipient_id, request.dedup_key
            );
        }
        Ok(enqueued)
    }

    /// Best-effort wake-up call; the worker polls anyway, so any failure
    /// here is ignored.
    fn notify_worker(&self) {
        let Some(endpoint) = self.worker.endpoint.clone() else {
            return;
        };
        let token = self.worker.auth_token.clone();
        let http = self.http.clone();
        tokio::spawn(async move {
            let mut request = http.post(&endpoint).json(&json!({ "action": "process_queue" }));
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    debug!("worker notify returned {}", response.status());
                }
                Ok(_) => {}
                Err(e) => debug!("worker notify failed: {e}"),
            }
        });
    }
}

fn build_log(req: &SendRequest, now: chrono::DateTime<Utc>) -> DeliveryLog {
    DeliveryLog {
        id: Uuid::new_v4(),
        creator_id: req.creator_id,
        recipient_id: req.recipient_id.clone(),
        rule_id: req.rule_id,
        message: req.text.clone(),
        status: DeliveryStatus::Queued.to_string(),
        delivery_status: None,
        provider: PROVIDER.to_string(),
        source: req.source.clone(),
        platform_message_id: None,
        dedup_key: req.dedup_key.clone(),
        created_at: now,
    }
}

fn build_job(req: &SendRequest, now: chrono::DateTime<Utc>) -> QueueJob {
    QueueJob {
        id: Uuid::new_v4(),
        job_type: JOB_DM_DELIVERY.to_string(),
        status: JobStatus::Pending.to_string(),
        payload: json!({
            "recipient_id": req.recipient_id,
            "text": req.text,
            "integration_id": req.integration_id,
            "quick_replies": req.quick_replies,
            "attachments": req.attachments,
            "source": req.source,
            "variables": req.variables,
        }),
        attempts: 0,
        next_run_at: now,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SendRequest {
        SendRequest {
            creator_id: Uuid::new_v4(),
            integration_id: Uuid::new_v4(),
            recipient_id: "9001".into(),
            text: "DM content".into(),
            quick_replies: vec![],
            attachments: vec![],
            source: "reel_comment".into(),
            rule_id: Some(Uuid::new_v4()),
            dedup_key: Some("c:r:rule:bucket".into()),
            variables: json!({}),
        }
    }

    #[test]
    fn job_carries_source_and_recipient() {
        let req = request();
        let job = build_job(&req, Utc::now());
        assert_eq!(job.job_type, JOB_DM_DELIVERY);
        assert_eq!(job.status, "pending");
        assert_eq!(job.payload["source"], "reel_comment");
        assert_eq!(job.payload["recipient_id"], "9001");
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn log_starts_queued_with_dedup_key() {
        let req = request();
        let log = build_log(&req, Utc::now());
        assert_eq!(log.status, "queued");
        assert_eq!(log.dedup_key.as_deref(), Some("c:r:rule:bucket"));
        assert_eq!(log.rule_id, req.rule_id);
    }

    #[test]
    fn job_runs_immediately() {
        let now = Utc::now();
        let job = build_job(&request(), now);
        assert_eq!(job.next_run_at, now);
    }
}
