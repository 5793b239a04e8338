use crate::domain::{BounceDetails, BounceKind, EventType};
use crate::webhooks::{fallback_event_id, parse_campaign_id, NormalizedEvent, ParsedBatch, Provider, WebhookError};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

#[derive(Deserialize)]
struct SendGridEvent {
    email: String,
    event: String,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    sg_event_id: Option<String>,
    #[serde(default)]
    sg_message_id: Option<String>,
    /// `bounce` or `blocked` on bounce events.
    #[serde(default, rename = "type")]
    bounce_type: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    /// Custom argument attached at send time.
    #[serde(default)]
    campaign_id: Option<String>,
}

pub(super) fn parse(payload: &serde_json::Value, now: DateTime<Utc>) -> Result<ParsedBatch, WebhookError> {
    let events = payload
        .as_array()
        .ok_or_else(|| WebhookError::MalformedPayload("expected a JSON array of events".into()))?;
    let mut batch = ParsedBatch::default();
    for raw in events {
        batch.push(normalize(raw, now), Provider::SendGrid);
    }
    Ok(batch)
}

fn normalize(raw: &serde_json::Value, now: DateTime<Utc>) -> Result<NormalizedEvent, serde_json::Error> {
    let event: SendGridEvent = serde_json::from_value(raw.clone())?;
    let (event_type, bounce_kind) = match event.event.as_str() {
        "delivered" => (EventType::Delivered, None),
        "open" => (EventType::Opened, None),
        "click" => (EventType::Clicked, None),
        "bounce" => {
            let kind = match event.bounce_type.as_deref() {
                Some("blocked") => BounceKind::Soft,
                _ => BounceKind::Hard,
            };
            (EventType::Bounced, Some(kind))
        }
        "spamreport" => (EventType::Complained, None),
        "unsubscribe" | "group_unsubscribe" => (EventType::Unsubscribed, None),
        _ => (EventType::Unknown, None),
    };
    Ok(NormalizedEvent {
        provider_event_id: event.sg_event_id.unwrap_or_else(|| fallback_event_id(raw)),
        email: event.email,
        event_type,
        occurred_at: event
            .timestamp
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or(now),
        campaign_id: parse_campaign_id(event.campaign_id.as_deref()),
        // "<message id>.filterNNNN.<...>"
        provider_message_id: event
            .sg_message_id
            .as_deref()
            .and_then(|id| id.split(".filter").next())
            .map(str::to_string),
        bounce_kind,
        bounce: BounceDetails {
            sub_type: event.bounce_type,
            code: event.status,
            message: event.reason,
        },
        raw: raw.clone(),
    })
}
