use crate::domain::{BounceDetails, BounceKind, EventType};
use crate::webhooks::{
    fallback_event_id, from_rfc3339, parse_campaign_id, NormalizedEvent, ParsedBatch, Provider, WebhookError,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Deserialize)]
struct ResendEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created_at: Option<String>,
    data: ResendData,
}

#[derive(Deserialize)]
struct ResendData {
    #[serde(default)]
    email_id: Option<String>,
    #[serde(default)]
    to: Vec<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    tags: ResendTags,
    #[serde(default)]
    bounce: Option<ResendBounce>,
}

/// Resend has shipped tags both as a map and as a list of pairs.
#[derive(Deserialize)]
#[serde(untagged)]
enum ResendTags {
    Map(HashMap<String, String>),
    List(Vec<ResendTag>),
}

impl Default for ResendTags {
    fn default() -> Self {
        ResendTags::Map(HashMap::new())
    }
}

impl ResendTags {
    fn get(&self, name: &str) -> Option<&str> {
        match self {
            ResendTags::Map(tags) => tags.get(name).map(String::as_str),
            ResendTags::List(tags) => tags.iter().find(|t| t.name == name).map(|t| t.value.as_str()),
        }
    }
}

#[derive(Deserialize)]
struct ResendTag {
    name: String,
    value: String,
}

#[derive(Deserialize)]
struct ResendBounce {
    /// `Permanent` or `Transient`.
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default, rename = "subType")]
    sub_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub(super) fn parse(payload: &serde_json::Value, now: DateTime<Utc>) -> Result<ParsedBatch, WebhookError> {
    if !payload.is_object() {
        return Err(WebhookError::MalformedPayload("expected a JSON object".into()));
    }
    let mut batch = ParsedBatch::default();
    match normalize(payload, now) {
        Ok(events) => batch.events.extend(events),
        Err(e) => batch.push(Err(e), Provider::Resend),
    }
    Ok(batch)
}

/// One canonical event per recipient in `data.to`.
fn normalize(raw: &serde_json::Value, now: DateTime<Utc>) -> Result<Vec<NormalizedEvent>, serde_json::Error> {
    let event: ResendEvent = serde_json::from_value(raw.clone())?;
    if event.data.to.is_empty() {
        return Err(serde::de::Error::missing_field("data.to"));
    }
    let (event_type, bounce_kind) = match event.event_type.as_str() {
        "email.delivered" => (EventType::Delivered, None),
        "email.opened" => (EventType::Opened, None),
        "email.clicked" => (EventType::Clicked, None),
        "email.bounced" => {
            let kind = match event.data.bounce.as_ref().and_then(|b| b.kind.as_deref()) {
                Some("Transient") | Some("Undetermined") => BounceKind::Soft,
                _ => BounceKind::Hard,
            };
            (EventType::Bounced, Some(kind))
        }
        "email.complained" => (EventType::Complained, None),
        _ => (EventType::Unknown, None),
    };
    let occurred_at = from_rfc3339(event.created_at.as_deref())
        .or_else(|| from_rfc3339(event.data.created_at.as_deref()))
        .unwrap_or(now);
    let campaign_id = parse_campaign_id(event.data.tags.get("campaign_id"));
    let bounce = event
        .data
        .bounce
        .map(|b| BounceDetails {
            sub_type: b.sub_type.or(b.kind),
            code: None,
            message: b.message,
        })
        .unwrap_or_default();
    let base_id = match &event.data.email_id {
        Some(email_id) => format!("{}:{}", email_id, event.event_type),
        None => fallback_event_id(raw),
    };
    let many = event.data.to.len() > 1;

    Ok(event
        .data
        .to
        .into_iter()
        .map(|email| NormalizedEvent {
            provider_event_id: if many {
                format!("{}:{}", base_id, email)
            } else {
                base_id.clone()
            },
            email,
            event_type,
            occurred_at,
            campaign_id,
            provider_message_id: event.data.email_id.clone(),
            bounce_kind,
            bounce: bounce.clone(),
            raw: raw.clone(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn one_event_per_recipient() {
        let campaign_id = Uuid::new_v4();
        let payload = json!({
            "type": "email.bounced",
            "created_at": "2024-02-22T23:41:12.126Z",
            "data": {
                "email_id": "56761188-7520-42d8-8898-ff6fc54ce618",
                "to": ["a@example.com", "b@example.com"],
                "tags": [{"name": "campaign_id", "value": campaign_id.to_string()}],
                "bounce": {"type": "Transient", "subType": "MailboxFull", "message": "mailbox full"}
            }
        });

        let batch = parse(&payload, Utc::now()).unwrap();

        assert_eq!(batch.events.len(), 2);
        assert!(batch.events.iter().all(|e| e.bounce_kind == Some(BounceKind::Soft)));
        assert!(batch.events.iter().all(|e| e.campaign_id == Some(campaign_id)));
        assert_ne!(batch.events[0].provider_event_id, batch.events[1].provider_event_id);
        assert_eq!(batch.events[0].bounce.sub_type.as_deref(), Some("MailboxFull"));
    }

    #[test]
    fn map_tags_are_accepted() {
        let campaign_id = Uuid::new_v4();
        let payload = json!({
            "type": "email.delivered",
            "data": {
                "email_id": "e-1",
                "to": ["a@example.com"],
                "tags": {"campaign_id": campaign_id.to_string()}
            }
        });

        let event = parse(&payload, Utc::now()).unwrap().events.remove(0);

        assert_eq!(event.campaign_id, Some(campaign_id));
        assert_eq!(event.provider_event_id, "e-1:email.delivered");
    }

    #[test]
    fn events_without_recipients_are_malformed() {
        let payload = json!({"type": "email.sent", "data": {"email_id": "e-1", "to": []}});
        assert_eq!(parse(&payload, Utc::now()).unwrap().malformed, 1);
    }
}
