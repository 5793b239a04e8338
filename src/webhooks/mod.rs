//! Webhook Event Normalizer.
//!
//! Inbound callbacks go through rate limiting, origin verification, a
//! provider-specific parser and finally [`WebhookProcessor`], which records
//! each canonical event once and applies its side effects.

mod ingest;
mod mailgun;
mod postmark;
mod processor;
mod rate_limit;
mod resend;
mod sendgrid;
pub mod signature;

pub use ingest::WebhookIngest;
pub use processor::*;
pub use rate_limit::WebhookRateLimiter;
pub use signature::{SignatureVerifier, WebhookHeaders};

use crate::domain::{BounceDetails, BounceKind, EventType};
use crate::telemetry::error_chain_fmt;
use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(thiserror::Error)]
pub enum WebhookError {
    #[error("Unknown webhook provider: {0}")]
    UnknownProvider(String),
    #[error("Webhook signature is missing or invalid.")]
    InvalidSignature,
    #[error("Webhook timestamp is outside the replay window.")]
    ReplayWindowExpired,
    #[error("No webhook credentials are configured for {0}.")]
    NotConfigured(&'static str),
    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),
    #[error("Too many webhook requests.")]
    RateLimited { retry_after: std::time::Duration },
}

impl std::fmt::Debug for WebhookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    SendGrid,
    Mailgun,
    Postmark,
    Resend,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::SendGrid => "sendgrid",
            Provider::Mailgun => "mailgun",
            Provider::Postmark => "postmark",
            Provider::Resend => "resend",
        }
    }

    /// Turns a verified payload into canonical events. Individual malformed
    /// events are counted, not fatal; only an unusable envelope is an error.
    pub fn parse_events(&self, payload: &serde_json::Value, now: DateTime<Utc>) -> Result<ParsedBatch, WebhookError> {
        match self {
            Provider::SendGrid => sendgrid::parse(payload, now),
            Provider::Mailgun => mailgun::parse(payload, now),
            Provider::Postmark => postmark::parse(payload, now),
            Provider::Resend => resend::parse(payload, now),
        }
    }
}

impl TryFrom<&str> for Provider {
    type Error = WebhookError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "sendgrid" => Ok(Self::SendGrid),
            "mailgun" => Ok(Self::Mailgun),
            "postmark" => Ok(Self::Postmark),
            "resend" => Ok(Self::Resend),
            other => Err(WebhookError::UnknownProvider(other.to_string())),
        }
    }
}

/// One provider callback event in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub provider_event_id: String,
    pub email: String,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    pub campaign_id: Option<Uuid>,
    pub provider_message_id: Option<String>,
    pub bounce_kind: Option<BounceKind>,
    pub bounce: BounceDetails,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedBatch {
    pub events: Vec<NormalizedEvent>,
    pub malformed: usize,
}

impl ParsedBatch {
    fn push(&mut self, event: Result<NormalizedEvent, serde_json::Error>, provider: Provider) {
        match event {
            Ok(event) => self.events.push(event),
            Err(e) => {
                tracing::warn!(provider = provider.as_str(), error = %e, "Skipping malformed webhook event");
                self.malformed += 1;
            }
        }
    }
}

/// Stable id for events whose provider does not supply one.
fn fallback_event_id(raw: &serde_json::Value) -> String {
    let digest = Sha256::digest(raw.to_string().as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

fn parse_campaign_id(value: Option<&str>) -> Option<Uuid> {
    value.and_then(|v| Uuid::parse_str(v.trim()).ok())
}

fn from_unix_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    let whole = seconds.trunc() as i64;
    let nanos = (seconds.fract() * 1e9) as u32;
    Utc.timestamp_opt(whole, nanos).single()
}

fn from_rfc3339(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use claim::assert_err;

    #[test]
    fn provider_names_are_case_insensitive() {
        assert_eq!(Provider::try_from("SendGrid").unwrap(), Provider::SendGrid);
        assert_err!(Provider::try_from("sparkpost"));
    }

    #[test]
    fn fallback_ids_are_stable() {
        let raw = serde_json::json!({"event": "open", "email": "a@example.com"});
        assert_eq!(fallback_event_id(&raw), fallback_event_id(&raw.clone()));
        assert!(fallback_event_id(&raw).starts_with("sha256:"));
    }
}
