use crate::domain::{SubscriberEmail, SubscriptionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuppressionReason {
    HardBounce,
    SoftBounce,
    Complaint,
    Unsubscribe,
    Manual,
    InvalidEmail,
    Blocked,
}

impl SuppressionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressionReason::HardBounce => "HARD_BOUNCE",
            SuppressionReason::SoftBounce => "SOFT_BOUNCE",
            SuppressionReason::Complaint => "COMPLAINT",
            SuppressionReason::Unsubscribe => "UNSUBSCRIBE",
            SuppressionReason::Manual => "MANUAL",
            SuppressionReason::InvalidEmail => "INVALID_EMAIL",
            SuppressionReason::Blocked => "BLOCKED",
        }
    }

    /// What a matching subscription becomes once the address is suppressed.
    /// Manual suppressions leave the subscription alone.
    pub fn subscription_status(&self) -> Option<SubscriptionStatus> {
        match self {
            SuppressionReason::Unsubscribe => Some(SubscriptionStatus::Unsubscribed),
            SuppressionReason::HardBounce
            | SuppressionReason::SoftBounce
            | SuppressionReason::Complaint
            | SuppressionReason::InvalidEmail
            | SuppressionReason::Blocked => Some(SubscriptionStatus::Bounced),
            SuppressionReason::Manual => None,
        }
    }
}

impl TryFrom<&str> for SuppressionReason {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "HARD_BOUNCE" => Ok(Self::HardBounce),
            "SOFT_BOUNCE" => Ok(Self::SoftBounce),
            "COMPLAINT" => Ok(Self::Complaint),
            "UNSUBSCRIBE" => Ok(Self::Unsubscribe),
            "MANUAL" => Ok(Self::Manual),
            "INVALID_EMAIL" => Ok(Self::InvalidEmail),
            "BLOCKED" => Ok(Self::Blocked),
            other => Err(format!("{} is not a suppression reason.", other)),
        }
    }
}

/// A request to suppress an address.
#[derive(Debug, Clone)]
pub struct SuppressionEntry {
    pub email: SubscriberEmail,
    pub reason: SuppressionReason,
    /// Originating campaign id or the operator who added it.
    pub source: Option<String>,
    pub bounce_type: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl SuppressionEntry {
    pub fn new(email: SubscriberEmail, reason: SuppressionReason) -> Self {
        Self {
            email,
            reason,
            source: None,
            bounce_type: None,
            error_code: None,
            error_message: None,
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Suppression {
    pub email: String,
    pub reason: SuppressionReason,
    pub source: Option<String>,
    pub bounce_type: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
