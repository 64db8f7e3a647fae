use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raised when a stored enum column carries a value this build does not know.
#[derive(Debug, Clone)]
pub struct UnknownEnumValue(pub String);

impl std::fmt::Display for UnknownEnumValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown enum value: {}", self.0)
    }
}

impl std::error::Error for UnknownEnumValue {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Comment,
    ReelComment,
    Dm,
    DmKeyword,
    StoryMention,
    StoryReply,
    NewFollow,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Comment => write!(f, "comment"),
            Self::ReelComment => write!(f, "reel_comment"),
            Self::Dm => write!(f, "dm"),
            Self::DmKeyword => write!(f, "dm_keyword"),
            Self::StoryMention => write!(f, "story_mention"),
            Self::StoryReply => write!(f, "story_reply"),
            Self::NewFollow => write!(f, "new_follow"),
        }
    }
}

impl std::str::FromStr for TriggerType {
    type Err = UnknownEnumValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "comment" => Ok(Self::Comment),
            "reel_comment" => Ok(Self::ReelComment),
            "dm" => Ok(Self::Dm),
            "dm_keyword" => Ok(Self::DmKeyword),
            "story_mention" => Ok(Self::StoryMention),
            "story_reply" => Ok(Self::StoryReply),
            "new_follow" => Ok(Self::NewFollow),
            _ => Err(UnknownEnumValue(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    Contains,
    StartsWith,
    Regex,
}

impl std::fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Contains => write!(f, "contains"),
            Self::StartsWith => write!(f, "starts_with"),
            Self::Regex => write!(f, "regex"),
        }
    }
}

impl std::str::FromStr for MatchStrategy {
    type Err = UnknownEnumValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Self::Exact),
            "contains" => Ok(Self::Contains),
            "starts_with" => Ok(Self::StartsWith),
            "regex" => Ok(Self::Regex),
            _ => Err(UnknownEnumValue(s.to_string())),
        }
    }
}

/// Span during which a rule will not re-fire for the same recipient after a
/// prior successful delivery. `Never` disables suppression entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupWindow {
    Hour,
    Day,
    Week,
    Month,
    Lifetime,
    Never,
}

impl DedupWindow {
    /// Concrete span for the timed windows; `None` for lifetime/never.
    pub fn span(&self) -> Option<Duration> {
        match self {
            Self::Hour => Some(Duration::hours(1)),
            Self::Day => Some(Duration::hours(24)),
            Self::Week => Some(Duration::days(7)),
            Self::Month => Some(Duration::days(30)),
            Self::Lifetime | Self::Never => None,
        }
    }
}

impl std::fmt::Display for DedupWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hour => write!(f, "1h"),
            Self::Day => write!(f, "24h"),
            Self::Week => write!(f, "7d"),
            Self::Month => write!(f, "30d"),
            Self::Lifetime => write!(f, "lifetime"),
            Self::Never => write!(f, "never"),
        }
    }
}

impl std::str::FromStr for DedupWindow {
    type Err = UnknownEnumValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(Self::Hour),
            "24h" => Ok(Self::Day),
            "7d" => Ok(Self::Week),
            "30d" => Ok(Self::Month),
            "lifetime" => Ok(Self::Lifetime),
            "never" => Ok(Self::Never),
            _ => Err(UnknownEnumValue(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    WaitingFollow,
    Completed,
    Expired,
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WaitingFollow => write!(f, "waiting_follow"),
            Self::Completed => write!(f, "completed"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Active platform integration binding a creator to a business account.
#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = integrations)]
pub struct Integration {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub account_id: String,
    pub username: String,
    pub access_token: String,
    pub is_active: bool,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = automation_rules)]
pub struct AutomationRule {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub trigger_type: String,
    pub keywords: Vec<String>,
    pub match_strategy: String,
    pub priority: i32,
    pub reply_text: Option<String>,
    pub reply_variants: serde_json::Value,
    pub last_variant_index: Option<i32>,
    pub follow_required: bool,
    pub follow_prompt: Option<String>,
    pub follow_expiry_hours: i32,
    pub dedup_window: String,
    pub is_active: bool,
    pub trigger_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationRule {
    /// Reply pool: the variant list when present, else the single reply text.
    pub fn variants(&self) -> Vec<String> {
        let from_json: Option<Vec<String>> =
            serde_json::from_value(self.reply_variants.clone()).ok();
        match from_json {
            Some(list) if !list.is_empty() => list,
            _ => self.reply_text.clone().into_iter().collect(),
        }
    }

    pub fn window(&self) -> DedupWindow {
        self.dedup_window.parse().unwrap_or(DedupWindow::Never)
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = pending_follow_requests)]
pub struct PendingFollowRequest {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub recipient_id: String,
    pub recipient_username: Option<String>,
    pub rule_id: Uuid,
    pub trigger_type: String,
    pub content: String,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = delivery_logs)]
pub struct DeliveryLog {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub recipient_id: String,
    pub rule_id: Option<Uuid>,
    pub message: String,
    pub status: String,
    /// Receipt reported by the platform (delivered/read/failed), filled in
    /// later by status-update events.
    pub delivery_status: Option<String>,
    pub provider: String,
    pub source: String,
    pub platform_message_id: Option<String>,
    pub dedup_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = flow_definitions)]
pub struct FlowDefinition {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub name: String,
    pub trigger_type: String,
    pub trigger_keywords: Vec<String>,
    pub steps: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = flow_sessions)]
pub struct FlowSession {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub recipient_id: String,
    pub flow_id: Uuid,
    pub current_step: i32,
    pub variables: serde_json::Value,
    pub awaiting_input: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = queue_jobs)]
pub struct QueueJob {
    pub id: Uuid,
    pub job_type: String,
    pub status: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub mod schema {
    diesel::table! {
        integrations (id) {
            id -> Uuid,
            creator_id -> Uuid,
            account_id -> Text,
            username -> Text,
            access_token -> Text,
            is_active -> Bool,
            connected_at -> Timestamptz,
        }
    }

    diesel::table! {
        automation_rules (id) {
            id -> Uuid,
            creator_id -> Uuid,
            trigger_type -> Text,
            keywords -> Array<Text>,
            match_strategy -> Text,
            priority -> Int4,
            reply_text -> Nullable<Text>,
            reply_variants -> Jsonb,
            last_variant_index -> Nullable<Int4>,
            follow_required -> Bool,
            follow_prompt -> Nullable<Text>,
            follow_expiry_hours -> Int4,
            dedup_window -> Text,
            is_active -> Bool,
            trigger_count -> Int8,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        pending_follow_requests (id) {
            id -> Uuid,
            creator_id -> Uuid,
            recipient_id -> Text,
            recipient_username -> Nullable<Text>,
            rule_id -> Uuid,
            trigger_type -> Text,
            content -> Text,
            status -> Text,
            expires_at -> Timestamptz,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        delivery_logs (id) {
            id -> Uuid,
            creator_id -> Uuid,
            recipient_id -> Text,
            rule_id -> Nullable<Uuid>,
            message -> Text,
            status -> Text,
            delivery_status -> Nullable<Text>,
            provider -> Text,
            source -> Text,
            platform_message_id -> Nullable<Text>,
            dedup_key -> Nullable<Text>,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        flow_definitions (id) {
            id -> Uuid,
            creator_id -> Uuid,
            name -> Text,
            trigger_type -> Text,
            trigger_keywords -> Array<Text>,
            steps -> Jsonb,
            is_active -> Bool,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        flow_sessions (id) {
            id -> Uuid,
            creator_id -> Uuid,
            recipient_id -> Text,
            flow_id -> Uuid,
            current_step -> Int4,
            variables -> Jsonb,
            awaiting_input -> Bool,
            created_at -> Timestamptz,
            expires_at -> Timestamptz,
        }
    }

    diesel::table! {
        queue_jobs (id) {
            id -> Uuid,
            job_type -> Text,
            status -> Text,
            payload -> Jsonb,
            attempts -> Int4,
            next_run_at -> Timestamptz,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }
}

pub use schema::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_type_round_trips() {
        for t in [
            TriggerType::Comment,
            TriggerType::ReelComment,
            TriggerType::Dm,
            TriggerType::DmKeyword,
            TriggerType::StoryMention,
            TriggerType::StoryReply,
            TriggerType::NewFollow,
        ] {
            assert_eq!(t.to_string().parse::<TriggerType>().unwrap(), t);
        }
        assert!("reels".parse::<TriggerType>().is_err());
    }

    #[test]
    fn dedup_window_spans() {
        assert_eq!(
            "24h".parse::<DedupWindow>().unwrap().span(),
            Some(Duration::hours(24))
        );
        assert_eq!(DedupWindow::Lifetime.span(), None);
        assert_eq!(DedupWindow::Never.span(), None);
    }

    #[test]
    fn rule_variants_fall_back_to_reply_text() {
        let rule = AutomationRule {
            id: Uuid::new_v4(),
            creator_id: Uuid::new_v4(),
            trigger_type: "dm_keyword".into(),
            keywords: vec!["price".into()],
            match_strategy: "contains".into(),
            priority: 10,
            reply_text: Some("Here you go".into()),
            reply_variants: serde_json::json!([]),
            last_variant_index: None,
            follow_required: false,
            follow_prompt: None,
            follow_expiry_hours: 24,
            dedup_window: "24h".into(),
            is_active: true,
            trigger_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(rule.variants(), vec!["Here you go".to_string()]);

        let with_variants = AutomationRule {
            reply_variants: serde_json::json!(["a", "b", "c"]),
            ..rule
        };
        assert_eq!(with_variants.variants().len(), 3);
    }
}
