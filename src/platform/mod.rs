//! Outbound platform API client.
//!
//! Thin reqwest wrapper over the messaging platform's Graph-style API.
//! Only the two calls this engine needs: direct sends and the follower
//! check used by the follow gate. API-level rejections come back as a
//! failed [`SendOutcome`] rather than an error so callers treat them as
//! "do not proceed" instead of unwinding.

use log::error;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Clone)]
pub struct PlatformClient {
    http: Client,
    api_base: String,
}

#[derive(Debug, Clone, Default)]
pub struct SendOutcome {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("platform api error [{status}]: {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FollowCheckResponse {
    follows: bool,
}

// Platform cap on quick replies per message.
const MAX_QUICK_REPLIES: usize = 13;

fn quick_reply_buttons(labels: &[String]) -> Vec<serde_json::Value> {
    labels
        .iter()
        .take(MAX_QUICK_REPLIES)
        .map(|label| {
            json!({
                "content_type": "text",
                "title": label,
                "payload": label
            })
        })
        .collect()
}

impl PlatformClient {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_base: api_base.into(),
        }
    }

    pub async fn send_direct_message(
        &self,
        account_id: &str,
        recipient_id: &str,
        text: &str,
        quick_replies: &[String],
        access_token: &str,
    ) -> Result<SendOutcome, PlatformError> {
        let url = format!("{}/{}/messages", self.api_base, account_id);

        let mut message = json!({ "text": text });
        if !quick_replies.is_empty() {
            message["quick_replies"] = json!(quick_reply_buttons(quick_replies));
        }

        let payload = json!({
            "recipient": { "id": recipient_id },
            "message": message
        });

        let response = self
            .http
            .post(&url)
            .query(&[("access_token", access_token)])
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!("platform send failed ({}): {}", status, body);
            return Ok(SendOutcome {
                success: false,
                message_id: None,
                error: Some(body),
            });
        }

        let parsed: SendResponse = response.json().await.unwrap_or(SendResponse {
            message_id: None,
        });
        Ok(SendOutcome {
            success: true,
            message_id: parsed.message_id,
            error: None,
        })
    }

    pub async fn is_following(
        &self,
        account_id: &str,
        candidate_id: &str,
        access_token: &str,
    ) -> Result<bool, PlatformError> {
        let url = format!("{}/{}/followers/{}", self.api_base, account_id, candidate_id);

        let response = self
            .http
            .get(&url)
            .query(&[("access_token", access_token)])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(PlatformError::Api { status, message });
        }

        let parsed: FollowCheckResponse = response.json().await.map_err(PlatformError::from)?;
        Ok(parsed.follows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_returns_message_id_on_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/17841400001/messages")
            .match_query(mockito::Matcher::UrlEncoded(
                "access_token".into(),
                "tok".into(),
            ))
            .with_status(200)
            .with_body(r#"{"recipient_id":"9001","message_id":"mid.abc"}"#)
            .create_async()
            .await;

        let client = PlatformClient::new(server.url());
        let outcome = client
            .send_direct_message("17841400001", "9001", "hello", &[], "tok")
            .await
            .unwrap();

        mock.assert_async().await;
        assert!(outcome.success);
        assert_eq!(outcome.message_id.as_deref(), Some("mid.abc"));
    }

    #[tokio::test]
    async fn send_failure_is_a_result_not_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/17841400001/messages")
            .match_query(mockito::Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error":{"message":"invalid recipient"}}"#)
            .create_async()
            .await;

        let client = PlatformClient::new(server.url());
        let outcome = client
            .send_direct_message("17841400001", "9001", "hello", &[], "tok")
            .await
            .unwrap();

        assert!(!outcome.success);
        assert!(outcome.error.unwrap_or_default().contains("invalid recipient"));
    }

    #[tokio::test]
    async fn follower_check_parses_flag() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/17841400001/followers/9001")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"follows":true}"#)
            .create_async()
            .await;

        let client = PlatformClient::new(server.url());
        assert!(client.is_following("17841400001", "9001", "tok").await.unwrap());
    }

    #[test]
    fn quick_replies_are_capped() {
        let labels: Vec<String> = (0..20).map(|i| format!("option {i}")).collect();
        let buttons = quick_reply_buttons(&labels);
        assert_eq!(buttons.len(), MAX_QUICK_REPLIES);
        assert_eq!(buttons[0]["title"], "option 0");
    }
}
