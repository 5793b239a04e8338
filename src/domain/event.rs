use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical delivery outcome, whatever the provider called it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Complained,
    Unsubscribed,
    Unknown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Delivered => "DELIVERED",
            EventType::Opened => "OPENED",
            EventType::Clicked => "CLICKED",
            EventType::Bounced => "BOUNCED",
            EventType::Complained => "COMPLAINED",
            EventType::Unsubscribed => "UNSUBSCRIBED",
            EventType::Unknown => "UNKNOWN",
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "DELIVERED" => Self::Delivered,
            "OPENED" => Self::Opened,
            "CLICKED" => Self::Clicked,
            "BOUNCED" => Self::Bounced,
            "COMPLAINED" => Self::Complained,
            "UNSUBSCRIBED" => Self::Unsubscribed,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BounceKind {
    Hard,
    Soft,
}

/// Provider-reported detail attached to a bounce.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BounceDetails {
    pub sub_type: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
}

/// One row of the append-only provider callback log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsletterEvent {
    pub id: Uuid,
    pub provider: String,
    pub provider_event_id: String,
    pub email: String,
    pub campaign_id: Option<Uuid>,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
