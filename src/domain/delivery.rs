use crate::domain::EventType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Queued,
    Sending,
    Delivered,
    Bounced,
    Complained,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Queued => "QUEUED",
            DeliveryStatus::Sending => "SENDING",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Bounced => "BOUNCED",
            DeliveryStatus::Complained => "COMPLAINED",
            DeliveryStatus::Failed => "FAILED",
        }
    }

    /// The complete transition table.
    ///
    /// `Sending -> Queued` is the transient-retry edge and `Failed -> Queued` is
    /// only taken by an operator re-drive. Post-delivery outcomes may still
    /// arrive late from providers, so a delivered message can later bounce or
    /// be reported as spam.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Queued, Sending)
                | (Sending, Queued)
                | (Sending, Delivered)
                | (Sending, Bounced)
                | (Sending, Complained)
                | (Sending, Failed)
                | (Delivered, Bounced)
                | (Delivered, Complained)
                | (Bounced, Complained)
                | (Failed, Queued)
        )
    }
}

impl TryFrom<&str> for DeliveryStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "SENDING" => Ok(Self::Sending),
            "DELIVERED" => Ok(Self::Delivered),
            "BOUNCED" => Ok(Self::Bounced),
            "COMPLAINED" => Ok(Self::Complained),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("{} is not a delivery status.", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Illegal delivery transition from {} to {}", .from.as_str(), .to.as_str())]
pub struct InvalidTransition {
    pub from: DeliveryStatus,
    pub to: DeliveryStatus,
}

/// How a synchronous send attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptFailure {
    /// Timeouts, throttling, 5xx: worth another attempt.
    Transient,
    /// The provider rejected the message outright.
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignDelivery {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub email: String,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub provider_message_id: Option<String>,
    pub last_error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub complained_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub dead_lettered_by: Option<String>,
    /// Last operator to send the delivery back from the DLQ.
    pub redriven_at: Option<DateTime<Utc>>,
    pub redriven_by: Option<String>,
    /// Optimistic-concurrency counter, bumped by every successful save.
    #[serde(skip)]
    pub version: i32,
}

impl CampaignDelivery {
    pub fn new(campaign_id: Uuid, email: String, max_attempts: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            email,
            status: DeliveryStatus::Queued,
            attempts: 0,
            max_attempts,
            provider_message_id: None,
            last_error: None,
            queued_at: now,
            next_attempt_at: now,
            claimed_at: None,
            last_attempt_at: None,
            sent_at: None,
            delivered_at: None,
            opened_at: None,
            clicked_at: None,
            bounced_at: None,
            complained_at: None,
            failed_at: None,
            dead_lettered_at: None,
            dead_lettered_by: None,
            redriven_at: None,
            redriven_by: None,
            version: 0,
        }
    }

    fn transition(&mut self, next: DeliveryStatus) -> Result<(), InvalidTransition> {
        if self.status.can_transition_to(next) {
            self.status = next;
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self.status,
                to: next,
            })
        }
    }

    fn expect_status(&self, expected: DeliveryStatus, to: DeliveryStatus) -> Result<(), InvalidTransition> {
        if self.status == expected {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self.status,
                to,
            })
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Queued && self.next_attempt_at <= now
    }

    /// Queued -> Sending. Attempts are counted separately by `begin_attempt`
    /// so a claim released by the throttle does not burn an attempt.
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(DeliveryStatus::Sending)?;
        self.claimed_at = Some(now);
        Ok(())
    }

    /// Hand a claimed delivery back untouched.
    pub fn release(&mut self) -> Result<(), InvalidTransition> {
        self.expect_status(DeliveryStatus::Sending, DeliveryStatus::Queued)?;
        if self.sent_at.is_some() {
            return Err(InvalidTransition {
                from: self.status,
                to: DeliveryStatus::Queued,
            });
        }
        self.transition(DeliveryStatus::Queued)?;
        self.claimed_at = None;
        Ok(())
    }

    /// Release, and keep the row out of the ready set until `until`.
    pub fn defer(&mut self, until: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.release()?;
        self.next_attempt_at = until;
        Ok(())
    }

    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.expect_status(DeliveryStatus::Sending, DeliveryStatus::Sending)?;
        self.attempts += 1;
        self.last_attempt_at = Some(now);
        Ok(())
    }

    /// The provider accepted the message. The row stays in Sending until a
    /// webhook reports the final outcome.
    pub fn mark_accepted(
        &mut self,
        provider_message_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.expect_status(DeliveryStatus::Sending, DeliveryStatus::Sending)?;
        self.sent_at = Some(now);
        self.provider_message_id = provider_message_id;
        self.last_error = None;
        Ok(())
    }

    /// Records a failed attempt and returns the resulting status: back to
    /// Queued (not before `retry_at`) while attempts remain, Failed otherwise.
    pub fn fail_attempt(
        &mut self,
        failure: AttemptFailure,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DeliveryStatus, InvalidTransition> {
        self.expect_status(DeliveryStatus::Sending, DeliveryStatus::Failed)?;
        self.last_error = Some(error.to_string());
        self.claimed_at = None;
        if failure == AttemptFailure::Permanent || self.attempts >= self.max_attempts {
            self.transition(DeliveryStatus::Failed)?;
            self.failed_at = Some(now);
        } else {
            self.transition(DeliveryStatus::Queued)?;
            self.next_attempt_at = retry_at;
        }
        Ok(self.status)
    }

    /// Claimed but never acknowledged by the provider before `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Sending
            && self.sent_at.is_none()
            && self.claimed_at.map_or(false, |claimed| claimed <= cutoff)
    }

    /// Applies a provider-reported outcome. Returns `Ok(false)` when the
    /// event carries nothing new (duplicate or tracking-only).
    pub fn apply_event(&mut self, event: EventType, at: DateTime<Utc>) -> Result<bool, InvalidTransition> {
        match event {
            EventType::Delivered => {
                if self.status == DeliveryStatus::Delivered {
                    return Ok(false);
                }
                self.transition(DeliveryStatus::Delivered)?;
                self.delivered_at = Some(at);
            }
            EventType::Bounced => {
                if self.status == DeliveryStatus::Bounced {
                    return Ok(false);
                }
                self.transition(DeliveryStatus::Bounced)?;
                self.bounced_at = Some(at);
            }
            EventType::Complained => {
                if self.status == DeliveryStatus::Complained {
                    return Ok(false);
                }
                self.transition(DeliveryStatus::Complained)?;
                self.complained_at = Some(at);
            }
            EventType::Opened => {
                if self.opened_at.is_some() {
                    return Ok(false);
                }
                // an open proves delivery even if that webhook never arrived
                if self.status == DeliveryStatus::Sending {
                    self.transition(DeliveryStatus::Delivered)?;
                    self.delivered_at = Some(at);
                }
                self.opened_at = Some(at);
            }
            EventType::Clicked => {
                if self.clicked_at.is_some() {
                    return Ok(false);
                }
                if self.status == DeliveryStatus::Sending {
                    self.transition(DeliveryStatus::Delivered)?;
                    self.delivered_at = Some(at);
                }
                self.clicked_at = Some(at);
            }
            EventType::Unsubscribed | EventType::Unknown => return Ok(false),
        }
        Ok(true)
    }

    pub fn is_dead_letter_eligible(&self) -> bool {
        self.status == DeliveryStatus::Failed && self.attempts >= self.max_attempts
    }

    pub fn mark_dead_lettered(&mut self, actor: &str, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.expect_status(DeliveryStatus::Failed, DeliveryStatus::Failed)?;
        self.dead_lettered_at = Some(now);
        self.dead_lettered_by = Some(actor.to_string());
        Ok(())
    }

    /// Failed -> Queued with a fresh budget of `extra_attempts`. The attempt
    /// counter itself is never reset.
    pub fn redrive(&mut self, extra_attempts: i32, actor: &str, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.expect_status(DeliveryStatus::Failed, DeliveryStatus::Queued)?;
        self.transition(DeliveryStatus::Queued)?;
        self.max_attempts = self.attempts + extra_attempts;
        self.next_attempt_at = now;
        self.claimed_at = None;
        self.failed_at = None;
        self.dead_lettered_at = None;
        self.dead_lettered_by = None;
        self.redriven_at = Some(now);
        self.redriven_by = Some(actor.to_string());
        Ok(())
    }
}
