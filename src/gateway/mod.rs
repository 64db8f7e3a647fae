//! Event gateway: webhook verification and delivery intake.
//!
//! The POST contract is "always acknowledge, fail inward": once the
//! signature checks out (and even when it does not), the platform gets a
//! 200 with a minimal JSON body, because any non-2xx triggers upstream
//! retry storms and duplicate side effects. Internal failures are logged
//! at the per-entry/per-event boundary and go no further. The GET
//! handshake is the single path allowed to return a rejection status.

pub mod events;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use hmac::{Hmac, Mac};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;

use crate::automation::AutomationService;
use crate::integrations;
use crate::shared::state::AppState;
use events::WebhookEnvelope;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Deserialize)]
pub struct HubChallenge {
    #[serde(rename = "hub.mode")]
    pub hub_mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub hub_verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub hub_challenge: Option<String>,
}

pub fn compute_signature(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    let digest = hex::encode(mac.finalize().into_bytes());
    format!("{SIGNATURE_PREFIX}{digest}")
}

pub fn verify_signature(secret: &str, header: Option<&str>, body: &[u8]) -> bool {
    let Some(header) = header else {
        return false;
    };
    constant_time_compare(header, &compute_signature(secret, body))
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// One-time subscription handshake: echo the challenge on a token match.
pub async fn handle_verification(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HubChallenge>,
) -> Result<String, StatusCode> {
    if let (Some(mode), Some(token), Some(challenge)) = (
        &params.hub_mode,
        &params.hub_verify_token,
        &params.hub_challenge,
    ) {
        if mode == "subscribe" && token == &state.config.platform.verify_token {
            info!("webhook subscription verified");
            return Ok(challenge.clone());
        }
    }

    warn!("webhook verification failed");
    Err(StatusCode::FORBIDDEN)
}

/// Delivery intake. Authenticity failures drop the payload but still ack;
/// after that the response is hard-coded success no matter what dispatch
/// does, including timing out.
pub async fn handle_delivery(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let ack = (StatusCode::OK, Json(json!({ "status": "ok" })));

    let Some(secret) = state.config.platform.app_secret.clone() else {
        warn!("webhook secret not configured; dropping delivery");
        return ack;
    };
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    if !verify_signature(&secret, signature, &body) {
        warn!("webhook signature missing or invalid; dropping delivery");
        return ack;
    }

    let envelope: WebhookEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("unparseable webhook body: {e}");
            return ack;
        }
    };

    let dispatch_timeout = std::time::Duration::from_secs(state.config.request_timeout_secs);
    if tokio::time::timeout(dispatch_timeout, dispatch_envelope(state, envelope))
        .await
        .is_err()
    {
        error!("webhook dispatch timed out; acknowledging anyway");
    }

    ack
}

/// Fans an envelope out to its entries and sub-events. Every entry and
/// every event has its own error boundary: a failure is logged at that
/// scope and the siblings keep going.
pub async fn dispatch_envelope(state: Arc<AppState>, envelope: WebhookEnvelope) {
    let service = AutomationService::new(state.clone());

    for entry in &envelope.entry {
        let integration =
            match integrations::resolve_account(state.conn.clone(), &entry.id).await {
                Ok(Some(integration)) => integration,
                Ok(None) => {
                    debug!("no active integration for account {}; entry dropped", entry.id);
                    continue;
                }
                Err(e) => {
                    error!("creator resolution failed for account {}: {e}", entry.id);
                    continue;
                }
            };

        for event in entry.events() {
            if let Err(e) = service.handle_event(&integration, event).await {
                error!("event handler error for account {}: {e}", entry.id);
            }
        }
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/webhook", get(handle_verification).post(handle_delivery))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip() {
        let body = br#"{"entry":[]}"#;
        let signature = compute_signature("app_secret", body);
        assert!(signature.starts_with("sha256="));
        assert_eq!(signature.len(), SIGNATURE_PREFIX.len() + 64);
        assert!(verify_signature("app_secret", Some(&signature), body));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let signature = compute_signature("app_secret", br#"{"entry":[]}"#);
        assert!(!verify_signature(
            "app_secret",
            Some(&signature),
            br#"{"entry":[{}]}"#
        ));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let body = br#"{"entry":[]}"#;
        let signature = compute_signature("app_secret", body);
        assert!(!verify_signature("other_secret", Some(&signature), body));
    }

    #[test]
    fn missing_header_fails_verification() {
        assert!(!verify_signature("app_secret", None, b"{}"));
    }

    #[test]
    fn compare_is_length_sensitive() {
        assert!(constant_time_compare("sha256=ab", "sha256=ab"));
        assert!(!constant_time_compare("sha256=ab", "sha256=abc"));
        assert!(!constant_time_compare("sha256=ab", "sha256=ac"));
    }
}
