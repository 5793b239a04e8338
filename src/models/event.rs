use crate::domain::{EventType, NewsletterEvent};
use crate::schema::newsletter_events;
use chrono::{DateTime, Utc};

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = newsletter_events)]
pub struct EventRow {
    pub id: uuid::Uuid,
    pub provider: String,
    pub provider_event_id: String,
    pub email: String,
    pub campaign_id: Option<uuid::Uuid>,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<EventRow> for NewsletterEvent {
    fn from(row: EventRow) -> Self {
        NewsletterEvent {
            id: row.id,
            provider: row.provider,
            provider_event_id: row.provider_event_id,
            email: row.email,
            campaign_id: row.campaign_id,
            event_type: EventType::from(row.event_type.as_str()),
            occurred_at: row.occurred_at,
            payload: row.payload,
            created_at: row.created_at,
        }
    }
}

impl From<&NewsletterEvent> for EventRow {
    fn from(event: &NewsletterEvent) -> Self {
        EventRow {
            id: event.id,
            provider: event.provider.clone(),
            provider_event_id: event.provider_event_id.clone(),
            email: event.email.clone(),
            campaign_id: event.campaign_id,
            event_type: event.event_type.as_str().to_string(),
            occurred_at: event.occurred_at,
            payload: event.payload.clone(),
            created_at: event.created_at,
        }
    }
}
