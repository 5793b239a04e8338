use crate::domain::{BounceDetails, BounceKind, EventType};
use crate::webhooks::{
    fallback_event_id, from_unix_seconds, parse_campaign_id, NormalizedEvent, ParsedBatch, Provider, WebhookError,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Deserialize)]
struct MailgunEvent {
    #[serde(default)]
    id: Option<String>,
    event: String,
    recipient: String,
    #[serde(default)]
    timestamp: Option<f64>,
    /// `permanent` or `temporary` on failures.
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<MailgunMessage>,
    #[serde(default, rename = "user-variables")]
    user_variables: HashMap<String, serde_json::Value>,
    #[serde(default, rename = "delivery-status")]
    delivery_status: Option<MailgunDeliveryStatus>,
}

#[derive(Deserialize)]
struct MailgunMessage {
    #[serde(default)]
    headers: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct MailgunDeliveryStatus {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

pub(super) fn parse(payload: &serde_json::Value, now: DateTime<Utc>) -> Result<ParsedBatch, WebhookError> {
    let raw = payload
        .get("event-data")
        .ok_or_else(|| WebhookError::MalformedPayload("missing event-data".into()))?;
    let mut batch = ParsedBatch::default();
    batch.push(normalize(raw, now), Provider::Mailgun);
    Ok(batch)
}

fn normalize(raw: &serde_json::Value, now: DateTime<Utc>) -> Result<NormalizedEvent, serde_json::Error> {
    let event: MailgunEvent = serde_json::from_value(raw.clone())?;
    let (event_type, bounce_kind) = match event.event.as_str() {
        "delivered" => (EventType::Delivered, None),
        "opened" => (EventType::Opened, None),
        "clicked" => (EventType::Clicked, None),
        "failed" => {
            let kind = match event.severity.as_deref() {
                Some("temporary") => BounceKind::Soft,
                _ => BounceKind::Hard,
            };
            (EventType::Bounced, Some(kind))
        }
        "complained" => (EventType::Complained, None),
        "unsubscribed" => (EventType::Unsubscribed, None),
        _ => (EventType::Unknown, None),
    };
    let status = event.delivery_status.unwrap_or(MailgunDeliveryStatus {
        code: None,
        message: None,
        description: None,
    });
    Ok(NormalizedEvent {
        provider_event_id: event.id.unwrap_or_else(|| fallback_event_id(raw)),
        email: event.recipient,
        event_type,
        occurred_at: event.timestamp.and_then(from_unix_seconds).unwrap_or(now),
        campaign_id: parse_campaign_id(event.user_variables.get("campaign_id").and_then(|v| v.as_str())),
        provider_message_id: event
            .message
            .and_then(|m| m.headers.get("message-id").and_then(|v| v.as_str()).map(str::to_string)),
        bounce_kind,
        bounce: BounceDetails {
            sub_type: event.severity.or(event.reason),
            code: status.code.map(|c| match c {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            }),
            message: status.description.filter(|d| !d.is_empty()).or(status.message),
        },
        raw: raw.clone(),
    })
}
