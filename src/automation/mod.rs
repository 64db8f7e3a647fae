//! Automation engine: turns parsed inbound events into rule fires.
//!
//! One rule fires per event at most. Active flow sessions preempt rule
//! matching for direct messages; follow-gated rules defer their content
//! behind a pending request; everything outbound goes through the
//! delivery queue except the two latency-sensitive synchronous sends
//! (follow prompt, pending-request resolution).

pub mod dedup;
pub mod followgate;
pub mod matcher;

use chrono::Utc;
use diesel::prelude::*;
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::flows::{template, FlowEngine};
use crate::gateway::events::InboundEvent;
use crate::queue::{SendRequest, PROVIDER};
use crate::shared::models::{
    automation_rules, delivery_logs, AutomationRule, DeliveryLog, DeliveryStatus, Integration,
    TriggerType,
};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;

const REELS_PRODUCT_TYPE: &str = "REELS";
const SOURCE_FOLLOW_PROMPT: &str = "follow_prompt";
const SOURCE_FOLLOW_RESOLUTION: &str = "follow_resolution";
const DEFAULT_FOLLOW_PROMPT: &str =
    "Almost there! Follow us first, then your content is on the way.";

#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    #[error("database error: {0}")]
    Database(String),
    #[error("platform api error: {0}")]
    Platform(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<diesel::result::Error> for AutomationError {
    fn from(e: diesel::result::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<crate::platform::PlatformError> for AutomationError {
    fn from(e: crate::platform::PlatformError) -> Self {
        Self::Platform(e.to_string())
    }
}

pub struct AutomationService {
    state: Arc<AppState>,
}

impl AutomationService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn handle_event(
        &self,
        integration: &Integration,
        event: InboundEvent,
    ) -> Result<(), AutomationError> {
        match event {
            InboundEvent::DirectMessage {
                sender_id,
                username,
                text,
                quick_reply,
                ..
            } => {
                self.handle_direct_message(
                    integration,
                    &sender_id,
                    username.as_deref(),
                    &text,
                    quick_reply.as_deref(),
                )
                .await
            }
            InboundEvent::StoryReply {
                sender_id,
                username,
                text,
                ..
            } => {
                self.fire_rules(
                    integration,
                    &[TriggerType::StoryReply],
                    &sender_id,
                    username.as_deref(),
                    &text,
                )
                .await
            }
            InboundEvent::Comment {
                commenter_id,
                username,
                text,
                media_product_type,
                ..
            } => {
                let category = if media_product_type.as_deref() == Some(REELS_PRODUCT_TYPE) {
                    TriggerType::ReelComment
                } else {
                    TriggerType::Comment
                };
                self.fire_rules(
                    integration,
                    &[category],
                    &commenter_id,
                    username.as_deref(),
                    &text,
                )
                .await
            }
            InboundEvent::Follow {
                follower_id,
                username,
            } => {
                self.handle_follow(integration, &follower_id, username.as_deref())
                    .await
            }
            InboundEvent::StoryMention {
                sender_id, username, ..
            } => {
                self.fire_rules(
                    integration,
                    &[TriggerType::StoryMention],
                    &sender_id,
                    username.as_deref(),
                    "",
                )
                .await
            }
            InboundEvent::StatusUpdate {
                platform_message_id,
                status,
            } => self.handle_status_update(&platform_message_id, &status).await,
        }
    }

    /// DMs route through the flow engine first: an active session owns the
    /// recipient outright, and flow triggers outrank single-rule matching.
    async fn handle_direct_message(
        &self,
        integration: &Integration,
        sender_id: &str,
        username: Option<&str>,
        text: &str,
        quick_reply: Option<&str>,
    ) -> Result<(), AutomationError> {
        let flows = FlowEngine::new(self.state.clone());
        if flows
            .route_message(integration, sender_id, username, text, quick_reply)
            .await?
        {
            return Ok(());
        }
        if flows.try_start(integration, sender_id, username, text).await? {
            return Ok(());
        }

        self.fire_rules(
            integration,
            &[TriggerType::DmKeyword, TriggerType::Dm],
            sender_id,
            username,
            text,
        )
        .await
    }

    /// Scans the creator's active rules for the event category in priority
    /// order and fires the first one that matches, is not suppressed by
    /// the dedup guard, and is not already parked behind a follow gate.
    async fn fire_rules(
        &self,
        integration: &Integration,
        categories: &[TriggerType],
        recipient_id: &str,
        recipient_username: Option<&str>,
        text: &str,
    ) -> Result<(), AutomationError> {
        let rules = self.load_rules(integration.creator_id, categories).await?;

        for rule in rules {
            if !matcher::rule_matches(&rule, text) {
                continue;
            }

            let window = rule.window();
            let suppressed = {
                let creator_id = integration.creator_id;
                let recipient = recipient_id.to_string();
                let rule_id = rule.id;
                run_blocking(self.state.conn.clone(), move |conn| {
                    dedup::is_suppressed(conn, creator_id, &recipient, rule_id, window)
                        .map_err(AutomationError::from)
                })
                .await?
            };
            if suppressed {
                debug!(
                    "rule {} suppressed for recipient {} ({} window)",
                    rule.id, recipient_id, window
                );
                continue;
            }

            if rule.follow_required {
                let waiting = {
                    let creator_id = integration.creator_id;
                    let recipient = recipient_id.to_string();
                    let rule_id = rule.id;
                    run_blocking(self.state.conn.clone(), move |conn| {
                        followgate::has_waiting_request(conn, creator_id, &recipient, rule_id)
                            .map_err(AutomationError::from)
                    })
                    .await?
                };
                if waiting {
                    debug!(
                        "rule {} already waiting on a follow from {}",
                        rule.id, recipient_id
                    );
                    continue;
                }
            }

            self.fire_rule(integration, &rule, recipient_id, recipient_username)
                .await?;
            return Ok(());
        }
        Ok(())
    }

    async fn fire_rule(
        &self,
        integration: &Integration,
        rule: &AutomationRule,
        recipient_id: &str,
        recipient_username: Option<&str>,
    ) -> Result<(), AutomationError> {
        let variants = rule.variants();
        let Some((variant_index, reply)) = matcher::pick_variant(&variants, rule.last_variant_index)
        else {
            warn!("rule {} fired with no reply content", rule.id);
            return Ok(());
        };

        self.record_fire(rule.id, variant_index).await?;

        let vars = json!({
            "username": recipient_username.unwrap_or_default(),
            "name": recipient_username.unwrap_or_default(),
        });
        let reply = template::render(&reply, &vars);

        if rule.follow_required {
            let following = self
                .state
                .platform
                .is_following(
                    &integration.account_id,
                    recipient_id,
                    &integration.access_token,
                )
                .await?;
            if !following {
                return self
                    .defer_behind_follow_gate(integration, rule, recipient_id, recipient_username, &reply)
                    .await;
            }
        }

        let key = dedup::dedup_key(
            integration.creator_id,
            recipient_id,
            rule.id,
            rule.window(),
            Utc::now(),
        );
        self.state
            .queue
            .enqueue_dm(SendRequest {
                creator_id: integration.creator_id,
                integration_id: integration.id,
                recipient_id: recipient_id.to_string(),
                text: reply,
                quick_replies: vec![],
                attachments: vec![],
                source: rule.trigger_type.clone(),
                rule_id: Some(rule.id),
                dedup_key: key,
                variables: vars,
            })
            .await?;
        Ok(())
    }

    /// Parks the rule's content behind a pending follow request and sends
    /// the prompt. The request row is created first (conflict-free) so the
    /// prompt goes out exactly once even under concurrent deliveries.
    async fn defer_behind_follow_gate(
        &self,
        integration: &Integration,
        rule: &AutomationRule,
        recipient_id: &str,
        recipient_username: Option<&str>,
        content: &str,
    ) -> Result<(), AutomationError> {
        let request = followgate::build_request(
            integration.creator_id,
            recipient_id,
            recipient_username,
            rule.id,
            &rule.trigger_type,
            content,
            rule.follow_expiry_hours,
        );
        let created = run_blocking(self.state.conn.clone(), move |conn| {
            followgate::create_request(conn, &request).map_err(AutomationError::from)
        })
        .await?;
        if !created {
            debug!(
                "follow request already pending for rule {} and recipient {}",
                rule.id, recipient_id
            );
            return Ok(());
        }

        let vars = json!({
            "username": recipient_username.unwrap_or_default(),
            "name": recipient_username.unwrap_or_default(),
        });
        let prompt = template::render(
            rule.follow_prompt.as_deref().unwrap_or(DEFAULT_FOLLOW_PROMPT),
            &vars,
        );
        let outcome = self
            .state
            .platform
            .send_direct_message(
                &integration.account_id,
                recipient_id,
                &prompt,
                &[],
                &integration.access_token,
            )
            .await?;
        if !outcome.success {
            warn!(
                "follow prompt send failed for recipient {}: {:?}",
                recipient_id, outcome.error
            );
        }

        // Prompts are logged without a rule reference so the dedup oracle
        // never mistakes them for the rule's delivered content.
        self.log_sync_send(
            integration.creator_id,
            recipient_id,
            None,
            &prompt,
            SOURCE_FOLLOW_PROMPT,
            &outcome,
        )
        .await?;

        info!(
            "deferred rule {} behind follow gate for recipient {}",
            rule.id, recipient_id
        );
        Ok(())
    }

    /// A follow event resolves pending requests first, then lets a welcome
    /// (new_follow) rule fire. One creator lookup covers both paths.
    async fn handle_follow(
        &self,
        integration: &Integration,
        follower_id: &str,
        username: Option<&str>,
    ) -> Result<(), AutomationError> {
        self.resolve_pending(integration, follower_id).await?;
        self.fire_rules(
            integration,
            &[TriggerType::NewFollow],
            follower_id,
            username,
            "",
        )
        .await
    }

    async fn resolve_pending(
        &self,
        integration: &Integration,
        follower_id: &str,
    ) -> Result<(), AutomationError> {
        let requests = {
            let creator_id = integration.creator_id;
            let recipient = follower_id.to_string();
            run_blocking(self.state.conn.clone(), move |conn| {
                followgate::live_requests(conn, creator_id, &recipient, Utc::now())
                    .map_err(AutomationError::from)
            })
            .await?
        };

        for request in requests {
            let outcome = self
                .state
                .platform
                .send_direct_message(
                    &integration.account_id,
                    follower_id,
                    &request.content,
                    &[],
                    &integration.access_token,
                )
                .await?;
            if !outcome.success {
                warn!(
                    "pending-request delivery failed for recipient {}: {:?}",
                    follower_id, outcome.error
                );
                continue;
            }

            let request_id = request.id;
            run_blocking(self.state.conn.clone(), move |conn| {
                followgate::mark_completed(conn, request_id)?;
                Ok(())
            })
            .await?;
            self.log_sync_send(
                integration.creator_id,
                follower_id,
                Some(request.rule_id),
                &request.content,
                SOURCE_FOLLOW_RESOLUTION,
                &outcome,
            )
            .await?;
            info!(
                "completed follow request {} for recipient {}",
                request.id, follower_id
            );
        }
        Ok(())
    }

    /// Delivery receipts from the platform annotate the matching log row.
    async fn handle_status_update(
        &self,
        platform_message_id: &str,
        status: &str,
    ) -> Result<(), AutomationError> {
        if !matches!(status, "sent" | "delivered" | "read" | "failed" | "undeliverable") {
            debug!("ignoring unknown delivery status '{status}'");
            return Ok(());
        }

        let mid = platform_message_id.to_string();
        let receipt = status.to_string();
        run_blocking(self.state.conn.clone(), move |conn| {
            diesel::update(
                delivery_logs::table.filter(delivery_logs::platform_message_id.eq(&mid)),
            )
            .set(delivery_logs::delivery_status.eq(Some(receipt)))
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn load_rules(
        &self,
        creator_id: Uuid,
        categories: &[TriggerType],
    ) -> Result<Vec<AutomationRule>, AutomationError> {
        let types: Vec<String> = categories.iter().map(ToString::to_string).collect();
        run_blocking(self.state.conn.clone(), move |conn| {
            automation_rules::table
                .filter(automation_rules::creator_id.eq(creator_id))
                .filter(automation_rules::trigger_type.eq_any(types))
                .filter(automation_rules::is_active.eq(true))
                .order(automation_rules::priority.desc())
                .load(conn)
                .map_err(AutomationError::from)
        })
        .await
    }

    async fn record_fire(
        &self,
        rule_id: Uuid,
        variant_index: i32,
    ) -> Result<(), AutomationError> {
        run_blocking(self.state.conn.clone(), move |conn| {
            diesel::update(automation_rules::table.find(rule_id))
                .set((
                    automation_rules::trigger_count.eq(automation_rules::trigger_count + 1),
                    automation_rules::last_variant_index.eq(Some(variant_index)),
                    automation_rules::updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn log_sync_send(
        &self,
        creator_id: Uuid,
        recipient_id: &str,
        rule_id: Option<Uuid>,
        message: &str,
        source: &str,
        outcome: &crate::platform::SendOutcome,
    ) -> Result<(), AutomationError> {
        let log = DeliveryLog {
            id: Uuid::new_v4(),
            creator_id,
            recipient_id: recipient_id.to_string(),
            rule_id,
            message: message.to_string(),
            status: if outcome.success {
                DeliveryStatus::Sent.to_string()
            } else {
                DeliveryStatus::Failed.to_string()
            },
            delivery_status: None,
            provider: PROVIDER.to_string(),
            source: source.to_string(),
            platform_message_id: outcome.message_id.clone(),
            dedup_key: None,
            created_at: Utc::now(),
        };
        run_blocking(self.state.conn.clone(), move |conn| {
            diesel::insert_into(delivery_logs::table)
                .values(&log)
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}
