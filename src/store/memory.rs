use crate::domain::{
    Campaign, CampaignDelivery, CampaignStatus, DeliveryStatus, NewsletterEvent, RecipientFilter,
    SubscriberEmail, SubscriptionStatus, Suppression, SuppressionEntry, SuppressionReason,
};
use crate::store::{
    CampaignStore, DeadLetterQuery, DeliveryStore, EventStore, Page, QueueStats, StoreError,
    SubscriberStore, SuppressionStore, UserStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

struct Subscriber {
    name: String,
    status: SubscriptionStatus,
    subscribed_at: DateTime<Utc>,
    unsubscribed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    campaigns: HashMap<Uuid, Campaign>,
    subscribers: HashMap<String, Subscriber>,
    deliveries: HashMap<Uuid, CampaignDelivery>,
    events: Vec<NewsletterEvent>,
    event_keys: HashSet<(String, String)>,
    suppressions: HashMap<String, Suppression>,
    users: HashMap<String, (Uuid, String)>,
}

/// Process-local store. Every operation runs under one lock, which gives the
/// same atomicity the conditional updates in `PgStore` provide.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    #[cfg(test)]
    fail_points: Mutex<HashMap<&'static str, usize>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a poisoned lock only means another test thread panicked mid-write
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg_attr(not(test), allow(unused_variables))]
    fn fail_point(&self, operation: &'static str) -> Result<(), StoreError> {
        #[cfg(test)]
        {
            let mut points = self.fail_points.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(remaining) = points.get_mut(operation).filter(|n| **n > 0) {
                *remaining -= 1;
                return Err(StoreError::Corrupt(format!("injected {} failure", operation)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
impl InMemoryStore {
    /// Makes the next `times` calls of `operation` return an error.
    pub(crate) fn fail_next(&self, operation: &'static str, times: usize) {
        self.fail_points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(operation, times);
    }
}

#[async_trait]
impl CampaignStore for InMemoryStore {
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        self.lock().campaigns.insert(campaign.id, campaign.clone());
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError> {
        Ok(self.lock().campaigns.get(&id).cloned())
    }

    async fn due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>, StoreError> {
        let mut due: Vec<Campaign> = self
            .lock()
            .campaigns
            .values()
            .filter(|c| c.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|c| c.scheduled_at);
        Ok(due)
    }

    async fn count_scheduled(&self) -> Result<u64, StoreError> {
        Ok(self
            .lock()
            .campaigns
            .values()
            .filter(|c| c.status == CampaignStatus::Scheduled)
            .count() as u64)
    }

    async fn campaigns_with_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>, StoreError> {
        Ok(self
            .lock()
            .campaigns
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect())
    }

    async fn transition_campaign(
        &self,
        id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.campaigns.get_mut(&id) {
            Some(campaign) if campaign.status == from && from.can_transition_to(to) => {
                campaign.status = to;
                campaign.updated_at = now;
                if to == CampaignStatus::Sent {
                    campaign.sent_at = Some(now);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn schedule_campaign(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.campaigns.get_mut(&id) {
            Some(campaign)
                if matches!(campaign.status, CampaignStatus::Draft | CampaignStatus::Scheduled) =>
            {
                campaign.status = CampaignStatus::Scheduled;
                campaign.scheduled_at = Some(at);
                campaign.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_recipient_count(&self, id: Uuid, count: i32, now: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(campaign) = self.lock().campaigns.get_mut(&id) {
            campaign.recipient_count = count;
            campaign.updated_at = now;
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriberStore for InMemoryStore {
    async fn insert_subscriber(
        &self,
        email: &SubscriberEmail,
        name: &str,
        status: SubscriptionStatus,
        subscribed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.lock().subscribers.insert(
            email.as_ref().to_string(),
            Subscriber {
                name: name.to_string(),
                status,
                subscribed_at,
                unsubscribed_at: None,
            },
        );
        Ok(())
    }

    async fn matching_subscribers(&self, filter: &RecipientFilter) -> Result<Vec<String>, StoreError> {
        self.fail_point("matching_subscribers")?;
        let mut emails: Vec<String> = self
            .lock()
            .subscribers
            .iter()
            .filter(|(_, s)| filter.matches(s.status, s.subscribed_at))
            .map(|(email, _)| email.clone())
            .collect();
        emails.sort();
        Ok(emails)
    }

    async fn subscription_status(&self, email: &str) -> Result<Option<SubscriptionStatus>, StoreError> {
        Ok(self.lock().subscribers.get(email).map(|s| s.status))
    }

    async fn set_subscription_status(
        &self,
        email: &str,
        status: SubscriptionStatus,
        unsubscribed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        match self.lock().subscribers.get_mut(email) {
            Some(subscriber) => {
                tracing::trace!(name = %subscriber.name, status = status.as_str(), "Updating subscription");
                subscriber.status = status;
                subscriber.unsubscribed_at = unsubscribed_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl DeliveryStore for InMemoryStore {
    async fn insert_deliveries(
        &self,
        campaign_id: Uuid,
        emails: &[SubscriberEmail],
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let existing: HashSet<String> = inner
            .deliveries
            .values()
            .filter(|d| d.campaign_id == campaign_id)
            .map(|d| d.email.clone())
            .collect();
        let mut inserted = 0;
        for email in emails {
            if existing.contains(email.as_ref()) {
                continue;
            }
            let delivery = CampaignDelivery::new(campaign_id, email.as_ref().to_string(), max_attempts, now);
            inner.deliveries.insert(delivery.id, delivery);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn claim_ready(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<CampaignDelivery>, StoreError> {
        let mut inner = self.lock();
        let mut ready: Vec<&mut CampaignDelivery> = inner
            .deliveries
            .values_mut()
            .filter(|d| d.is_ready(now))
            .collect();
        ready.sort_by_key(|d| (d.next_attempt_at, d.queued_at));
        let mut claimed = Vec::new();
        for delivery in ready.into_iter().take(limit) {
            delivery.claim(now)?;
            delivery.version += 1;
            claimed.push(delivery.clone());
        }
        Ok(claimed)
    }

    async fn save_delivery(&self, delivery: &mut CampaignDelivery) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.deliveries.get_mut(&delivery.id) {
            Some(stored) if stored.version == delivery.version => {
                delivery.version += 1;
                *stored = delivery.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_delivery(&self, id: Uuid) -> Result<Option<CampaignDelivery>, StoreError> {
        Ok(self.lock().deliveries.get(&id).cloned())
    }

    async fn find_delivery(&self, campaign_id: Uuid, email: &str) -> Result<Option<CampaignDelivery>, StoreError> {
        Ok(self
            .lock()
            .deliveries
            .values()
            .find(|d| d.campaign_id == campaign_id && d.email == email)
            .cloned())
    }

    async fn find_delivery_by_message_id(&self, message_id: &str) -> Result<Option<CampaignDelivery>, StoreError> {
        Ok(self
            .lock()
            .deliveries
            .values()
            .find(|d| d.provider_message_id.as_deref() == Some(message_id))
            .cloned())
    }

    async fn campaign_deliveries(&self, campaign_id: Uuid) -> Result<Vec<CampaignDelivery>, StoreError> {
        let mut deliveries: Vec<CampaignDelivery> = self
            .lock()
            .deliveries
            .values()
            .filter(|d| d.campaign_id == campaign_id)
            .cloned()
            .collect();
        deliveries.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(deliveries)
    }

    async fn stale_deliveries(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<CampaignDelivery>, StoreError> {
        Ok(self
            .lock()
            .deliveries
            .values()
            .filter(|d| d.is_stale(cutoff))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn failed_deliveries(&self, campaign_id: Uuid, min_attempts: i32) -> Result<Vec<CampaignDelivery>, StoreError> {
        Ok(self
            .lock()
            .deliveries
            .values()
            .filter(|d| {
                d.campaign_id == campaign_id
                    && d.status == DeliveryStatus::Failed
                    && d.attempts >= min_attempts
                    && d.dead_lettered_at.is_none()
            })
            .cloned()
            .collect())
    }

    async fn dead_letters(&self, query: DeadLetterQuery) -> Result<Page<CampaignDelivery>, StoreError> {
        let mut matching: Vec<CampaignDelivery> = self
            .lock()
            .deliveries
            .values()
            .filter(|d| query.campaign_id.map_or(true, |id| d.campaign_id == id))
            .filter(|d| d.is_dead_letter_eligible() || d.dead_lettered_at.is_some())
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then(a.email.cmp(&b.email)));
        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(Page::<CampaignDelivery>::offset(query.page, query.per_page))
            .take(query.per_page as usize)
            .collect();
        Ok(Page {
            items,
            total,
            page: query.page.max(1),
            per_page: query.per_page,
        })
    }

    async fn count_open(&self, campaign_id: Uuid) -> Result<u64, StoreError> {
        Ok(self
            .lock()
            .deliveries
            .values()
            .filter(|d| d.campaign_id == campaign_id)
            .filter(|d| {
                d.status == DeliveryStatus::Queued
                    || (d.status == DeliveryStatus::Sending && d.sent_at.is_none())
            })
            .count() as u64)
    }

    async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let inner = self.lock();
        let mut stats = QueueStats::default();
        for d in inner.deliveries.values() {
            match d.status {
                DeliveryStatus::Queued => stats.queued += 1,
                DeliveryStatus::Sending if d.sent_at.is_none() => stats.in_flight += 1,
                DeliveryStatus::Sending => stats.awaiting_outcome += 1,
                DeliveryStatus::Delivered => stats.delivered += 1,
                DeliveryStatus::Bounced => stats.bounced += 1,
                DeliveryStatus::Complained => stats.complained += 1,
                DeliveryStatus::Failed => stats.failed += 1,
            }
            if d.is_dead_letter_eligible() || d.dead_lettered_at.is_some() {
                stats.dead_lettered += 1;
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn insert_event(&self, event: &NewsletterEvent) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let key = (event.provider.clone(), event.provider_event_id.clone());
        if !inner.event_keys.insert(key) {
            return Ok(false);
        }
        inner.events.push(event.clone());
        Ok(true)
    }

    async fn delete_event(&self, provider: &str, provider_event_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let key = (provider.to_string(), provider_event_id.to_string());
        if !inner.event_keys.remove(&key) {
            return Ok(false);
        }
        inner
            .events
            .retain(|e| !(e.provider == provider && e.provider_event_id == provider_event_id));
        Ok(true)
    }

    async fn events_for(&self, email: &str) -> Result<Vec<NewsletterEvent>, StoreError> {
        Ok(self
            .lock()
            .events
            .iter()
            .filter(|e| e.email == email)
            .cloned()
            .collect())
    }

    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let (purged, kept): (Vec<NewsletterEvent>, Vec<NewsletterEvent>) = inner
            .events
            .drain(..)
            .partition(|e| e.created_at < cutoff);
        for event in &purged {
            inner
                .event_keys
                .remove(&(event.provider.clone(), event.provider_event_id.clone()));
        }
        inner.events = kept;
        Ok(purged.len() as u64)
    }
}

#[async_trait]
impl SuppressionStore for InMemoryStore {
    async fn upsert_suppression(&self, entry: &SuppressionEntry, now: DateTime<Utc>) -> Result<Suppression, StoreError> {
        self.fail_point("upsert_suppression")?;
        let mut inner = self.lock();
        let created_at = inner
            .suppressions
            .get(entry.email.as_ref())
            .map_or(now, |existing| existing.created_at);
        let suppression = Suppression {
            email: entry.email.as_ref().to_string(),
            reason: entry.reason,
            source: entry.source.clone(),
            bounce_type: entry.bounce_type.clone(),
            error_code: entry.error_code.clone(),
            error_message: entry.error_message.clone(),
            created_at,
            updated_at: now,
        };
        inner
            .suppressions
            .insert(suppression.email.clone(), suppression.clone());
        Ok(suppression)
    }

    async fn delete_suppression(&self, email: &str) -> Result<bool, StoreError> {
        Ok(self.lock().suppressions.remove(email).is_some())
    }

    async fn get_suppression(&self, email: &str) -> Result<Option<Suppression>, StoreError> {
        Ok(self.lock().suppressions.get(email).cloned())
    }

    async fn suppressed_among(&self, emails: &[String]) -> Result<HashSet<String>, StoreError> {
        let inner = self.lock();
        Ok(emails
            .iter()
            .filter(|e| inner.suppressions.contains_key(e.as_str()))
            .cloned()
            .collect())
    }

    async fn delete_soft_bounces_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let before = inner.suppressions.len();
        inner
            .suppressions
            .retain(|_, s| !(s.reason == SuppressionReason::SoftBounce && s.updated_at < cutoff));
        Ok((before - inner.suppressions.len()) as u64)
    }
}

#[async_trait]
impl UserStore for InMemoryStore {
    async fn insert_user(&self, username: &str, password_hash: &str) -> Result<Uuid, StoreError> {
        let user_id = Uuid::new_v4();
        self.lock()
            .users
            .insert(username.to_string(), (user_id, password_hash.to_string()));
        Ok(user_id)
    }

    async fn get_credentials(&self, username: &str) -> Result<Option<(Uuid, String)>, StoreError> {
        Ok(self.lock().users.get(username).cloned())
    }
}
