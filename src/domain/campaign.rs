use crate::domain::SubscriptionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "DRAFT",
            CampaignStatus::Scheduled => "SCHEDULED",
            CampaignStatus::Sending => "SENDING",
            CampaignStatus::Sent => "SENT",
            CampaignStatus::Failed => "FAILED",
        }
    }

    /// Draft and Scheduled can flip back and forth (cancel / reschedule);
    /// once a campaign starts sending it only moves forward.
    pub fn can_transition_to(self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Scheduled, Draft)
                | (Scheduled, Sending)
                | (Sending, Sent)
                | (Sending, Failed)
        )
    }
}

impl TryFrom<&str> for CampaignStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "SCHEDULED" => Ok(Self::Scheduled),
            "SENDING" => Ok(Self::Sending),
            "SENT" => Ok(Self::Sent),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("{} is not a campaign status.", other)),
        }
    }
}

/// Which subscribers a campaign targets. Bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientFilter {
    #[serde(default = "default_statuses")]
    pub statuses: Vec<SubscriptionStatus>,
    #[serde(default)]
    pub subscribed_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subscribed_before: Option<DateTime<Utc>>,
}

fn default_statuses() -> Vec<SubscriptionStatus> {
    vec![SubscriptionStatus::Active]
}

impl Default for RecipientFilter {
    fn default() -> Self {
        Self {
            statuses: default_statuses(),
            subscribed_after: None,
            subscribed_before: None,
        }
    }
}

impl RecipientFilter {
    pub fn matches(&self, status: SubscriptionStatus, subscribed_at: DateTime<Utc>) -> bool {
        self.statuses.contains(&status)
            && self.subscribed_after.map_or(true, |after| subscribed_at >= after)
            && self.subscribed_before.map_or(true, |before| subscribed_at <= before)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: Uuid,
    pub title: String,
    pub subject: String,
    pub template_id: String,
    pub recipient_filter: RecipientFilter,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
    pub recipient_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == CampaignStatus::Scheduled && self.scheduled_at.map_or(false, |at| at <= now)
    }
}

/// A validated campaign creation request.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub title: String,
    pub subject: String,
    pub template_id: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub recipient_filter: RecipientFilter,
}

impl NewCampaign {
    pub fn parse(
        title: String,
        subject: String,
        template_id: String,
        scheduled_at: Option<DateTime<Utc>>,
        recipient_filter: Option<RecipientFilter>,
    ) -> Result<NewCampaign, String> {
        let title = non_empty("title", title)?;
        let subject = non_empty("subject", subject)?;
        let template_id = non_empty("templateId", template_id)?;
        let recipient_filter = recipient_filter.unwrap_or_default();
        if recipient_filter.statuses.is_empty() {
            return Err("recipientFilter.statuses must not be empty.".into());
        }
        if let (Some(after), Some(before)) = (
            recipient_filter.subscribed_after,
            recipient_filter.subscribed_before,
        ) {
            if after > before {
                return Err("recipientFilter.subscribedAfter is later than subscribedBefore.".into());
            }
        }
        Ok(NewCampaign {
            title,
            subject,
            template_id,
            scheduled_at,
            recipient_filter,
        })
    }

    pub fn initial_status(&self) -> CampaignStatus {
        match self.scheduled_at {
            Some(_) => CampaignStatus::Scheduled,
            None => CampaignStatus::Draft,
        }
    }

    pub fn into_campaign(self, now: DateTime<Utc>) -> Campaign {
        let status = self.initial_status();
        Campaign {
            id: Uuid::new_v4(),
            title: self.title,
            subject: self.subject,
            template_id: self.template_id,
            recipient_filter: self.recipient_filter,
            scheduled_at: self.scheduled_at,
            status,
            recipient_count: 0,
            created_at: now,
            updated_at: now,
            sent_at: None,
        }
    }
}

fn non_empty(field: &str, value: String) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(format!("{} must not be empty.", field))
    } else if trimmed.chars().count() > 256 {
        Err(format!("{} is longer than 256 characters.", field))
    } else {
        Ok(trimmed.to_string())
    }
}
