//! Typed view of the webhook envelope.
//!
//! The platform posts a loosely-typed JSON envelope of entries, each with
//! optional `messaging` and `changes` arrays. Everything is parsed once,
//! here, into the [`InboundEvent`] union so downstream handlers match on
//! exhaustive variants instead of probing raw JSON. Sub-events that fail
//! to parse are skipped, never fatal.

use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WebhookEnvelope {
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WebhookEntry {
    pub id: String,
    pub time: Option<i64>,
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
    #[serde(default)]
    pub changes: Vec<ChangeEvent>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MessagingEvent {
    pub sender: Option<EventUser>,
    pub recipient: Option<EventUser>,
    pub timestamp: Option<i64>,
    pub message: Option<MessageContent>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventUser {
    pub id: String,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MessageContent {
    pub mid: Option<String>,
    pub text: Option<String>,
    #[serde(default)]
    pub is_echo: bool,
    pub quick_reply: Option<QuickReplyPayload>,
    pub reply_to: Option<ReplyTo>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct QuickReplyPayload {
    pub payload: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ReplyTo {
    pub story: Option<StoryRef>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StoryRef {
    pub id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ChangeEvent {
    pub field: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CommentValue {
    id: String,
    text: Option<String>,
    from: Option<EventUser>,
    media: Option<MediaRef>,
}

#[derive(Debug, Deserialize)]
struct MediaRef {
    id: Option<String>,
    media_product_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FollowValue {
    follower: Option<EventUser>,
}

#[derive(Debug, Deserialize)]
struct MentionValue {
    media_id: Option<String>,
    from: Option<EventUser>,
}

#[derive(Debug, Deserialize)]
struct StatusValue {
    mid: String,
    status: String,
}

/// One parsed sub-event, ready for dispatch.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    DirectMessage {
        sender_id: String,
        username: Option<String>,
        text: String,
        quick_reply: Option<String>,
        message_id: Option<String>,
    },
    StoryReply {
        sender_id: String,
        username: Option<String>,
        text: String,
        story_id: Option<String>,
    },
    Comment {
        comment_id: String,
        commenter_id: String,
        username: Option<String>,
        text: String,
        media_id: Option<String>,
        media_product_type: Option<String>,
    },
    Follow {
        follower_id: String,
        username: Option<String>,
    },
    StoryMention {
        sender_id: String,
        username: Option<String>,
        media_id: Option<String>,
    },
    StatusUpdate {
        platform_message_id: String,
        status: String,
    },
}

impl WebhookEntry {
    /// Flattens the entry's messaging and change events into typed events.
    /// Echoes of our own sends and malformed sub-events are dropped here.
    pub fn events(&self) -> Vec<InboundEvent> {
        let mut out = Vec::new();

        for messaging in &self.messaging {
            let Some(sender) = &messaging.sender else {
                continue;
            };
            let Some(message) = &messaging.message else {
                continue;
            };
            if message.is_echo {
                continue;
            }

            let text = message.text.clone().unwrap_or_default();
            let story = message.reply_to.as_ref().and_then(|r| r.story.as_ref());
            if let Some(story) = story {
                out.push(InboundEvent::StoryReply {
                    sender_id: sender.id.clone(),
                    username: sender.username.clone(),
                    text,
                    story_id: story.id.clone(),
                });
            } else {
                out.push(InboundEvent::DirectMessage {
                    sender_id: sender.id.clone(),
                    username: sender.username.clone(),
                    text,
                    quick_reply: message.quick_reply.as_ref().map(|q| q.payload.clone()),
                    message_id: message.mid.clone(),
                });
            }
        }

        for change in &self.changes {
            match change.field.as_str() {
                "comments" => {
                    let Ok(value) =
                        serde_json::from_value::<CommentValue>(change.value.clone())
                    else {
                        debug!("skipping malformed comment change");
                        continue;
                    };
                    let Some(from) = value.from else {
                        continue;
                    };
                    out.push(InboundEvent::Comment {
                        comment_id: value.id,
                        commenter_id: from.id,
                        username: from.username,
                        text: value.text.unwrap_or_default(),
                        media_id: value.media.as_ref().and_then(|m| m.id.clone()),
                        media_product_type: value
                            .media
                            .as_ref()
                            .and_then(|m| m.media_product_type.clone()),
                    });
                }
                "follow" => {
                    let Ok(value) = serde_json::from_value::<FollowValue>(change.value.clone())
                    else {
                        debug!("skipping malformed follow change");
                        continue;
                    };
                    let Some(follower) = value.follower else {
                        continue;
                    };
                    out.push(InboundEvent::Follow {
                        follower_id: follower.id,
                        username: follower.username,
                    });
                }
                "mention" => {
                    let Ok(value) = serde_json::from_value::<MentionValue>(change.value.clone())
                    else {
                        debug!("skipping malformed mention change");
                        continue;
                    };
                    let Some(from) = value.from else {
                        continue;
                    };
                    out.push(InboundEvent::StoryMention {
                        sender_id: from.id,
                        username: from.username,
                        media_id: value.media_id,
                    });
                }
                "message_status" => {
                    let Ok(value) = serde_json::from_value::<StatusValue>(change.value.clone())
                    else {
                        debug!("skipping malformed status change");
                        continue;
                    };
                    out.push(InboundEvent::StatusUpdate {
                        platform_message_id: value.mid,
                        status: value.status,
                    });
                }
                other => {
                    debug!("ignoring unhandled change field: {other}");
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> WebhookEnvelope {
        serde_json::from_str(body).expect("envelope should parse")
    }

    #[test]
    fn parses_direct_message() {
        let envelope = parse(
            r#"{
                "object": "instagram",
                "entry": [{
                    "id": "17841400001",
                    "time": 1700000000,
                    "messaging": [{
                        "sender": {"id": "9001", "username": "fan_account"},
                        "recipient": {"id": "17841400001"},
                        "timestamp": 1700000000,
                        "message": {"mid": "mid.1", "text": "HELP"}
                    }]
                }]
            }"#,
        );
        let events = envelope.entry[0].events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            InboundEvent::DirectMessage {
                sender_id, text, ..
            } => {
                assert_eq!(sender_id, "9001");
                assert_eq!(text, "HELP");
            }
            other => panic!("expected direct message, got {other:?}"),
        }
    }

    #[test]
    fn echo_messages_are_dropped() {
        let envelope = parse(
            r#"{
                "entry": [{
                    "id": "17841400001",
                    "time": 1,
                    "messaging": [{
                        "sender": {"id": "17841400001"},
                        "message": {"mid": "mid.2", "text": "our own reply", "is_echo": true}
                    }]
                }]
            }"#,
        );
        assert!(envelope.entry[0].events().is_empty());
    }

    #[test]
    fn story_reply_is_distinguished_from_dm() {
        let envelope = parse(
            r#"{
                "entry": [{
                    "id": "17841400001",
                    "time": 1,
                    "messaging": [{
                        "sender": {"id": "9001"},
                        "message": {
                            "mid": "mid.3",
                            "text": "love this",
                            "reply_to": {"story": {"id": "story_55"}}
                        }
                    }]
                }]
            }"#,
        );
        let events = envelope.entry[0].events();
        match &events[0] {
            InboundEvent::StoryReply { story_id, .. } => {
                assert_eq!(story_id.as_deref(), Some("story_55"));
            }
            other => panic!("expected story reply, got {other:?}"),
        }
    }

    #[test]
    fn parses_reel_comment_change() {
        let envelope = parse(
            r#"{
                "entry": [{
                    "id": "17841400001",
                    "time": 1,
                    "changes": [{
                        "field": "comments",
                        "value": {
                            "id": "c_1",
                            "text": "link please",
                            "from": {"id": "9002", "username": "commenter"},
                            "media": {"id": "m_1", "media_product_type": "REELS"}
                        }
                    }]
                }]
            }"#,
        );
        let events = envelope.entry[0].events();
        match &events[0] {
            InboundEvent::Comment {
                media_product_type, ..
            } => assert_eq!(media_product_type.as_deref(), Some("REELS")),
            other => panic!("expected comment, got {other:?}"),
        }
    }

    #[test]
    fn malformed_and_unknown_changes_are_skipped() {
        let envelope = parse(
            r#"{
                "entry": [{
                    "id": "17841400001",
                    "time": 1,
                    "changes": [
                        {"field": "comments", "value": {"text": 42}},
                        {"field": "story_insights", "value": {"impressions": 3}},
                        {"field": "follow", "value": {"follower": {"id": "9003"}}}
                    ]
                }]
            }"#,
        );
        let events = envelope.entry[0].events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], InboundEvent::Follow { follower_id, .. } if follower_id == "9003"));
    }
}
