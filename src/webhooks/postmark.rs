use crate::domain::{BounceDetails, BounceKind, EventType};
use crate::webhooks::{
    fallback_event_id, from_rfc3339, parse_campaign_id, NormalizedEvent, ParsedBatch, Provider, WebhookError,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PostmarkEvent {
    record_type: String,
    #[serde(default, rename = "MessageID")]
    message_id: Option<String>,
    #[serde(default)]
    recipient: Option<String>,
    /// Bounce and spam-complaint records name the address `Email`.
    #[serde(default)]
    email: Option<String>,
    #[serde(default, rename = "Type")]
    bounce_type: Option<String>,
    #[serde(default)]
    type_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    delivered_at: Option<String>,
    #[serde(default)]
    bounced_at: Option<String>,
    #[serde(default)]
    received_at: Option<String>,
    #[serde(default)]
    changed_at: Option<String>,
    #[serde(default)]
    suppress_sending: Option<bool>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

pub(super) fn parse(payload: &serde_json::Value, now: DateTime<Utc>) -> Result<ParsedBatch, WebhookError> {
    let mut batch = ParsedBatch::default();
    match payload {
        serde_json::Value::Object(_) => batch.push(normalize(payload, now), Provider::Postmark),
        serde_json::Value::Array(records) => {
            for raw in records {
                batch.push(normalize(raw, now), Provider::Postmark);
            }
        }
        _ => return Err(WebhookError::MalformedPayload("expected a JSON object".into())),
    }
    Ok(batch)
}

fn hard_bounce(bounce_type: Option<&str>) -> bool {
    matches!(
        bounce_type,
        Some("HardBounce" | "BadEmailAddress" | "ManuallyDeactivated" | "AddressChange" | "DnsError")
    )
}

fn normalize(raw: &serde_json::Value, now: DateTime<Utc>) -> Result<NormalizedEvent, serde_json::Error> {
    let event: PostmarkEvent = serde_json::from_value(raw.clone())?;
    let (event_type, bounce_kind) = match event.record_type.as_str() {
        "Delivery" => (EventType::Delivered, None),
        "Open" => (EventType::Opened, None),
        "Click" => (EventType::Clicked, None),
        "Bounce" if event.bounce_type.as_deref() == Some("SpamComplaint") => (EventType::Complained, None),
        "Bounce" => {
            let kind = if hard_bounce(event.bounce_type.as_deref()) {
                BounceKind::Hard
            } else {
                BounceKind::Soft
            };
            (EventType::Bounced, Some(kind))
        }
        "SpamComplaint" => (EventType::Complained, None),
        "SubscriptionChange" if event.suppress_sending == Some(true) => (EventType::Unsubscribed, None),
        _ => (EventType::Unknown, None),
    };
    let occurred_at = [&event.delivered_at, &event.bounced_at, &event.received_at, &event.changed_at]
        .into_iter()
        .find_map(|at| from_rfc3339(at.as_deref()))
        .unwrap_or(now);
    let provider_event_id = match &event.message_id {
        Some(message_id) => format!("{}:{}", message_id, event.record_type),
        None => fallback_event_id(raw),
    };
    let email = event
        .recipient
        .or(event.email)
        .ok_or_else(|| <serde_json::Error as serde::de::Error>::missing_field("Recipient"))?;
    Ok(NormalizedEvent {
        provider_event_id,
        email,
        event_type,
        occurred_at,
        campaign_id: parse_campaign_id(event.metadata.get("campaign_id").map(String::as_str)),
        provider_message_id: event.message_id,
        bounce_kind,
        bounce: BounceDetails {
            sub_type: event.bounce_type,
            code: event.type_code.map(|c| c.to_string()),
            message: event.details.filter(|d| !d.is_empty()).or(event.description),
        },
        raw: raw.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bounce(kind: &str) -> serde_json::Value {
        json!({
            "RecordType": "Bounce",
            "MessageID": "883953f4-6105-42a2-a16a-77a8eac79483",
            "Type": kind,
            "TypeCode": 1,
            "Email": "john@example.com",
            "BouncedAt": "2019-11-05T16:33:54.9070259Z",
            "Details": "smtp;550 5.1.1 user unknown",
            "Metadata": {"campaign_id": "not-a-uuid"}
        })
    }

    #[test]
    fn bounce_types_map_to_kinds() {
        let hard = parse(&bounce("HardBounce"), Utc::now()).unwrap().events.remove(0);
        let soft = parse(&bounce("Transient"), Utc::now()).unwrap().events.remove(0);
        let spam = parse(&bounce("SpamComplaint"), Utc::now()).unwrap().events.remove(0);

        assert_eq!(hard.bounce_kind, Some(BounceKind::Hard));
        assert_eq!(soft.bounce_kind, Some(BounceKind::Soft));
        assert_eq!(spam.event_type, EventType::Complained);
        assert_eq!(hard.email, "john@example.com");
        assert_eq!(hard.provider_event_id, "883953f4-6105-42a2-a16a-77a8eac79483:Bounce");
        assert_eq!(hard.campaign_id, None);
        assert_eq!(hard.bounce.message.as_deref(), Some("smtp;550 5.1.1 user unknown"));
    }

    #[test]
    fn subscription_changes_only_count_when_suppressing() {
        let change = |suppress: bool| {
            json!({
                "RecordType": "SubscriptionChange",
                "MessageID": "m-1",
                "Recipient": "a@example.com",
                "SuppressSending": suppress
            })
        };
        let on = parse(&change(true), Utc::now()).unwrap().events.remove(0);
        let off = parse(&change(false), Utc::now()).unwrap().events.remove(0);

        assert_eq!(on.event_type, EventType::Unsubscribed);
        assert_eq!(off.event_type, EventType::Unknown);
    }

    #[test]
    fn records_without_an_address_are_malformed() {
        let batch = parse(&json!({"RecordType": "Open", "MessageID": "m-1"}), Utc::now()).unwrap();
        assert_eq!((batch.events.len(), batch.malformed), (0, 1));
    }
}
