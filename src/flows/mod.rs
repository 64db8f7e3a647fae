//! Flow session engine.
//!
//! A flow is a creator-authored ordered script (message / question /
//! email_collect / delay). One active session exists per (creator,
//! recipient); while it lives, every inbound message from that recipient
//! is routed here and never reaches rule matching. Session creation is an
//! atomic create-if-absent so concurrent webhook deliveries cannot start
//! two conversations.

pub mod template;

use chrono::{Duration, Utc};
use diesel::prelude::*;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::automation::AutomationError;
use crate::queue::SendRequest;
use crate::shared::models::{
    flow_definitions, flow_sessions, FlowDefinition, FlowSession, Integration, TriggerType,
};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;

pub const SESSION_TTL_HOURS: i64 = 24;
/// Quick-reply button cap for question steps.
pub const MAX_QUESTION_BUTTONS: usize = 3;
pub const EMAIL_VARIABLE: &str = "email";

pub const SOURCE_FLOW: &str = "flow";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowStep {
    Message {
        text: String,
    },
    Question {
        text: String,
        #[serde(default)]
        buttons: Vec<FlowButton>,
    },
    EmailCollect {
        text: String,
        #[serde(default)]
        variable: Option<String>,
    },
    Delay {
        delay_seconds: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowButton {
    pub label: String,
    #[serde(default)]
    pub next_step: Option<usize>,
}

/// Decodes the stored step list; malformed steps end the flow rather than
/// crash the handler.
pub fn parse_steps(raw: &Value) -> Vec<FlowStep> {
    serde_json::from_value(raw.clone()).unwrap_or_default()
}

/// Flow triggers match like catch-all-or-contains rules: an empty keyword
/// list always starts the flow, otherwise any keyword contained in the
/// message (case-insensitive) does.
pub fn trigger_matches(keywords: &[String], text: &str) -> bool {
    if keywords.is_empty() {
        return true;
    }
    let lowered = text.to_lowercase();
    keywords
        .iter()
        .any(|keyword| lowered.contains(&keyword.trim().to_lowercase()))
}

/// Routes a question answer to its next step by exact (case-insensitive)
/// button label. `None` means the input matched no button: the session
/// stays on the current step.
pub fn route_button(buttons: &[FlowButton], current_index: usize, input: &str) -> Option<usize> {
    let trimmed = input.trim();
    buttons
        .iter()
        .take(MAX_QUESTION_BUTTONS)
        .find(|b| b.label.eq_ignore_ascii_case(trimmed))
        .map(|b| b.next_step.unwrap_or(current_index + 1))
}

/// Loose email shape check: something@domain.tld, no spaces.
pub fn looks_like_email(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.contains(' ') {
        return false;
    }
    match trimmed.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

fn template_vars(session_vars: &Value, username: Option<&str>) -> Value {
    let mut map = serde_json::Map::new();
    if let Some(name) = username {
        map.insert("username".to_string(), json!(name));
        map.insert("name".to_string(), json!(name));
    }
    if let Some(vars) = session_vars.as_object() {
        for (key, value) in vars {
            map.insert(key.clone(), value.clone());
        }
    }
    Value::Object(map)
}

pub struct FlowEngine {
    state: Arc<AppState>,
}

impl FlowEngine {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Routes an inbound message to the recipient's active session, if one
    /// exists. Returns true when the message was consumed by a session.
    pub async fn route_message(
        &self,
        integration: &Integration,
        recipient_id: &str,
        username: Option<&str>,
        text: &str,
        quick_reply: Option<&str>,
    ) -> Result<bool, AutomationError> {
        let Some(session) = self.load_session(integration.creator_id, recipient_id).await? else {
            return Ok(false);
        };

        if session.expires_at <= Utc::now() {
            self.delete_session(session.id).await?;
            return Ok(false);
        }

        let Some(flow) = self.load_flow(session.flow_id).await? else {
            warn!("session {} references missing flow; ending it", session.id);
            self.delete_session(session.id).await?;
            return Ok(false);
        };
        let steps = parse_steps(&flow.steps);
        let index = session.current_step as usize;
        let Some(step) = steps.get(index) else {
            self.delete_session(session.id).await?;
            return Ok(false);
        };

        match step {
            FlowStep::Question { buttons, .. } => {
                let input = quick_reply.unwrap_or(text);
                match route_button(buttons, index, input) {
                    Some(next) => {
                        self.run_from(integration, recipient_id, username, &flow, &steps, session, next)
                            .await?;
                    }
                    None => self.touch_session(session.id).await?,
                }
            }
            FlowStep::EmailCollect { variable, .. } => {
                if looks_like_email(text) {
                    let key = variable.clone().unwrap_or_else(|| EMAIL_VARIABLE.to_string());
                    let mut session = session;
                    let mut vars = session.variables.take();
                    if !vars.is_object() {
                        vars = json!({});
                    }
                    vars[key] = json!(text.trim());
                    session.variables = vars;
                    self.run_from(integration, recipient_id, username, &flow, &steps, session, index + 1)
                        .await?;
                } else {
                    self.touch_session(session.id).await?;
                }
            }
            // Message and delay steps do not wait on input; a message that
            // arrives while one is in flight is absorbed by the session.
            FlowStep::Message { .. } | FlowStep::Delay { .. } => {
                self.touch_session(session.id).await?;
            }
        }

        Ok(true)
    }

    /// Checks the message against active dm_keyword flow triggers and, on
    /// a match, atomically creates the session and runs the first step.
    /// Returns true when a flow handled the event.
    pub async fn try_start(
        &self,
        integration: &Integration,
        recipient_id: &str,
        username: Option<&str>,
        text: &str,
    ) -> Result<bool, AutomationError> {
        let flows = self.active_keyword_flows(integration.creator_id).await?;
        for flow in flows {
            if !trigger_matches(&flow.trigger_keywords, text) {
                continue;
            }
            let steps = parse_steps(&flow.steps);
            if steps.is_empty() {
                continue;
            }

            let now = Utc::now();
            let session = FlowSession {
                id: Uuid::new_v4(),
                creator_id: integration.creator_id,
                recipient_id: recipient_id.to_string(),
                flow_id: flow.id,
                current_step: 0,
                variables: json!({}),
                awaiting_input: false,
                created_at: now,
                expires_at: now + Duration::hours(SESSION_TTL_HOURS),
            };
            if !self.insert_session(session.clone()).await? {
                // Lost the create race: an active session already owns
                // this recipient, so hand the message to it.
                return self
                    .route_message(integration, recipient_id, username, text, None)
                    .await;
            }

            info!(
                "started flow '{}' for recipient {} (creator {})",
                flow.name, recipient_id, integration.creator_id
            );
            self.run_from(integration, recipient_id, username, &flow, &steps, session, 0)
                .await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Executes steps starting at `index` until the flow waits on input,
    /// schedules a delay, or completes.
    async fn run_from(
        &self,
        integration: &Integration,
        recipient_id: &str,
        username: Option<&str>,
        flow: &FlowDefinition,
        steps: &[FlowStep],
        session: FlowSession,
        index: usize,
    ) -> Result<(), AutomationError> {
        let mut index = index;
        loop {
            let Some(step) = steps.get(index) else {
                info!("flow '{}' completed for recipient {}", flow.name, recipient_id);
                self.delete_session(session.id).await?;
                return Ok(());
            };

            match step {
                FlowStep::Message { text } => {
                    self.send_step(integration, recipient_id, username, &session, text, &[])
                        .await?;
                    index += 1;
                }
                FlowStep::Question { text, buttons } => {
                    let labels: Vec<String> = buttons
                        .iter()
                        .take(MAX_QUESTION_BUTTONS)
                        .map(|b| b.label.clone())
                        .collect();
                    self.send_step(integration, recipient_id, username, &session, text, &labels)
                        .await?;
                    self.save_progress(session.id, index as i32, true, session.variables.clone())
                        .await?;
                    return Ok(());
                }
                FlowStep::EmailCollect { text, .. } => {
                    self.send_step(integration, recipient_id, username, &session, text, &[])
                        .await?;
                    self.save_progress(session.id, index as i32, true, session.variables.clone())
                        .await?;
                    return Ok(());
                }
                FlowStep::Delay { delay_seconds } => {
                    self.save_progress(session.id, index as i32, false, session.variables.clone())
                        .await?;

                    let engine = FlowEngine::new(self.state.clone());
                    let integration = integration.clone();
                    let recipient = recipient_id.to_string();
                    let username = username.map(str::to_string);
                    let session_id = session.id;
                    let resume_at = index + 1;
                    let seconds = *delay_seconds;
                    tokio::spawn(async move {
                        tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
                        if let Err(e) = engine
                            .resume_after_delay(
                                &integration,
                                &recipient,
                                username.as_deref(),
                                session_id,
                                resume_at,
                            )
                            .await
                        {
                            error!("flow delay continuation failed: {e}");
                        }
                    });
                    return Ok(());
                }
            }
        }
    }

    /// Deferred continuation for delay steps. The session may have been
    /// completed, replaced or expired while the timer ran; in all of those
    /// cases there is nothing to do. Boxed because the continuation
    /// re-enters [`Self::run_from`], which is what scheduled it.
    fn resume_after_delay<'a>(
        &'a self,
        integration: &'a Integration,
        recipient_id: &'a str,
        username: Option<&'a str>,
        session_id: Uuid,
        resume_at: usize,
    ) -> BoxFuture<'a, Result<(), AutomationError>> {
        async move {
            let Some(session) = self.load_session_by_id(session_id).await? else {
                return Ok(());
            };
            if session.expires_at <= Utc::now() {
                self.delete_session(session.id).await?;
                return Ok(());
            }
            let Some(flow) = self.load_flow(session.flow_id).await? else {
                self.delete_session(session.id).await?;
                return Ok(());
            };
            let steps = parse_steps(&flow.steps);
            self.run_from(integration, recipient_id, username, &flow, &steps, session, resume_at)
                .await
        }
        .boxed()
    }

    async fn send_step(
        &self,
        integration: &Integration,
        recipient_id: &str,
        username: Option<&str>,
        session: &FlowSession,
        text: &str,
        quick_replies: &[String],
    ) -> Result<(), AutomationError> {
        let vars = template_vars(&session.variables, username);
        let rendered = template::render(text, &vars);
        self.state
            .queue
            .enqueue_dm(SendRequest {
                creator_id: integration.creator_id,
                integration_id: integration.id,
                recipient_id: recipient_id.to_string(),
                text: rendered,
                quick_replies: quick_replies.to_vec(),
                attachments: vec![],
                source: SOURCE_FLOW.to_string(),
                rule_id: None,
                dedup_key: None,
                variables: vars,
            })
            .await?;
        Ok(())
    }

    async fn load_session(
        &self,
        creator_id: Uuid,
        recipient_id: &str,
    ) -> Result<Option<FlowSession>, AutomationError> {
        let recipient = recipient_id.to_string();
        run_blocking(self.state.conn.clone(), move |conn| {
            flow_sessions::table
                .filter(flow_sessions::creator_id.eq(creator_id))
                .filter(flow_sessions::recipient_id.eq(&recipient))
                .first::<FlowSession>(conn)
                .optional()
                .map_err(AutomationError::from)
        })
        .await
    }

    async fn load_session_by_id(
        &self,
        session_id: Uuid,
    ) -> Result<Option<FlowSession>, AutomationError> {
        run_blocking(self.state.conn.clone(), move |conn| {
            flow_sessions::table
                .find(session_id)
                .first::<FlowSession>(conn)
                .optional()
                .map_err(AutomationError::from)
        })
        .await
    }

    async fn load_flow(
        &self,
        flow_id: Uuid,
    ) -> Result<Option<FlowDefinition>, AutomationError> {
        run_blocking(self.state.conn.clone(), move |conn| {
            flow_definitions::table
                .find(flow_id)
                .filter(flow_definitions::is_active.eq(true))
                .first::<FlowDefinition>(conn)
                .optional()
                .map_err(AutomationError::from)
        })
        .await
    }

    async fn active_keyword_flows(
        &self,
        creator_id: Uuid,
    ) -> Result<Vec<FlowDefinition>, AutomationError> {
        run_blocking(self.state.conn.clone(), move |conn| {
            flow_definitions::table
                .filter(flow_definitions::creator_id.eq(creator_id))
                .filter(flow_definitions::trigger_type.eq(TriggerType::DmKeyword.to_string()))
                .filter(flow_definitions::is_active.eq(true))
                .order(flow_definitions::created_at.asc())
                .load(conn)
                .map_err(AutomationError::from)
        })
        .await
    }

    async fn insert_session(&self, session: FlowSession) -> Result<bool, AutomationError> {
        run_blocking(self.state.conn.clone(), move |conn| {
            let inserted = diesel::insert_into(flow_sessions::table)
                .values(&session)
                .on_conflict_do_nothing()
                .execute(conn)?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn save_progress(
        &self,
        session_id: Uuid,
        step: i32,
        awaiting: bool,
        variables: Value,
    ) -> Result<(), AutomationError> {
        run_blocking(self.state.conn.clone(), move |conn| {
            diesel::update(flow_sessions::table.find(session_id))
                .set((
                    flow_sessions::current_step.eq(step),
                    flow_sessions::awaiting_input.eq(awaiting),
                    flow_sessions::variables.eq(variables),
                    flow_sessions::expires_at.eq(Utc::now() + Duration::hours(SESSION_TTL_HOURS)),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn touch_session(&self, session_id: Uuid) -> Result<(), AutomationError> {
        run_blocking(self.state.conn.clone(), move |conn| {
            diesel::update(flow_sessions::table.find(session_id))
                .set(flow_sessions::expires_at.eq(Utc::now() + Duration::hours(SESSION_TTL_HOURS)))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<(), AutomationError> {
        run_blocking(self.state.conn.clone(), move |conn| {
            diesel::delete(flow_sessions::table.find(session_id)).execute(conn)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_parse_from_authoring_json() {
        let raw = json!([
            {"kind": "message", "text": "Welcome {{username}}!"},
            {"kind": "question", "text": "Interested?", "buttons": [
                {"label": "Yes"},
                {"label": "No", "next_step": 3}
            ]},
            {"kind": "email_collect", "text": "Drop your email"},
            {"kind": "delay", "delay_seconds": 60}
        ]);
        let steps = parse_steps(&raw);
        assert_eq!(steps.len(), 4);
        assert!(matches!(steps[0], FlowStep::Message { .. }));
        assert!(matches!(steps[3], FlowStep::Delay { delay_seconds: 60 }));
    }

    #[test]
    fn malformed_steps_become_an_empty_flow() {
        assert!(parse_steps(&json!([{"kind": "hologram"}])).is_empty());
        assert!(parse_steps(&json!("not an array")).is_empty());
    }

    #[test]
    fn trigger_matching_is_catch_all_or_contains() {
        assert!(trigger_matches(&[], "anything"));
        assert!(trigger_matches(&["help".into()], "I need HELP now"));
        assert!(!trigger_matches(&["help".into()], "all good"));
    }

    #[test]
    fn button_routing_is_exact_label_match() {
        let buttons = vec![
            FlowButton { label: "Yes".into(), next_step: None },
            FlowButton { label: "No".into(), next_step: Some(5) },
        ];
        assert_eq!(route_button(&buttons, 1, "yes"), Some(2));
        assert_eq!(route_button(&buttons, 1, " NO "), Some(5));
        // Free text that matches no button leaves the session in place.
        assert_eq!(route_button(&buttons, 1, "maybe later"), None);
    }

    #[test]
    fn button_cap_applies_to_routing() {
        let buttons: Vec<FlowButton> = (0..5)
            .map(|i| FlowButton { label: format!("b{i}"), next_step: None })
            .collect();
        assert_eq!(route_button(&buttons, 0, "b2"), Some(1));
        // Buttons past the cap were never presented, so they never route.
        assert_eq!(route_button(&buttons, 0, "b4"), None);
    }

    #[test]
    fn email_shapes() {
        assert!(looks_like_email("fan@example.com"));
        assert!(looks_like_email("  fan+tag@mail.example.co  "));
        assert!(!looks_like_email("not an email"));
        assert!(!looks_like_email("fan@nodot"));
        assert!(!looks_like_email("@example.com"));
        assert!(!looks_like_email("fan@.com"));
    }

    #[test]
    fn session_variables_override_event_metadata() {
        let vars = template_vars(
            &json!({"email": "fan@example.com", "username": "corrected"}),
            Some("from_event"),
        );
        assert_eq!(vars["username"], "corrected");
        assert_eq!(vars["name"], "from_event");
        assert_eq!(vars["email"], "fan@example.com");
    }
}
