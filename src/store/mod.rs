//! Persistence boundary.
//!
//! The delivery core only talks to these traits. `PgStore` backs them with
//! diesel + Postgres in production; `InMemoryStore` is used by tests and by
//! local runs without a database.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use crate::domain::{
    Campaign, CampaignDelivery, CampaignStatus, InvalidTransition, NewsletterEvent,
    RecipientFilter, SubscriberEmail, SubscriptionStatus, Suppression, SuppressionEntry,
};
use crate::telemetry::error_chain_fmt;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(thiserror::Error)]
pub enum StoreError {
    #[error("Failed to execute query.")]
    Query(#[from] diesel::result::Error),
    #[error("Failed to get a connection from the pool.")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("Database task panicked or was cancelled.")]
    Task(#[from] tokio::task::JoinError),
    #[error("Stored row could not be decoded: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

impl std::fmt::Debug for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: u64,
    pub in_flight: u64,
    pub awaiting_outcome: u64,
    pub delivered: u64,
    pub bounced: u64,
    pub complained: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

impl<T> Page<T> {
    pub(crate) fn offset(page: u32, per_page: u32) -> usize {
        (page.max(1) as usize - 1) * per_page as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeadLetterQuery {
    pub campaign_id: Option<Uuid>,
    pub page: u32,
    pub per_page: u32,
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), StoreError>;

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError>;

    /// Scheduled campaigns whose scheduled time is at or before `now`.
    async fn due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>, StoreError>;

    async fn count_scheduled(&self) -> Result<u64, StoreError>;

    async fn campaigns_with_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>, StoreError>;

    /// Conditional status update. Returns false if the campaign was not in
    /// `from`, which is how a concurrent cancel wins over the scheduler.
    async fn transition_campaign(
        &self,
        id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Sets the schedule of a Draft or Scheduled campaign and marks it Scheduled.
    async fn schedule_campaign(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn set_recipient_count(&self, id: Uuid, count: i32, now: DateTime<Utc>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SubscriberStore: Send + Sync {
    async fn insert_subscriber(
        &self,
        email: &SubscriberEmail,
        name: &str,
        status: SubscriptionStatus,
        subscribed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn matching_subscribers(&self, filter: &RecipientFilter) -> Result<Vec<String>, StoreError>;

    async fn subscription_status(&self, email: &str) -> Result<Option<SubscriptionStatus>, StoreError>;

    async fn set_subscription_status(
        &self,
        email: &str,
        status: SubscriptionStatus,
        unsubscribed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Creates one Queued row per address, skipping pairs that already exist.
    async fn insert_deliveries(
        &self,
        campaign_id: Uuid,
        emails: &[SubscriberEmail],
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Atomically moves up to `limit` ready Queued rows to Sending. A row is
    /// handed to at most one caller.
    async fn claim_ready(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<CampaignDelivery>, StoreError>;

    /// Writes the delivery back if nobody else changed it since it was read.
    /// On success `delivery.version` is bumped to the stored value.
    async fn save_delivery(&self, delivery: &mut CampaignDelivery) -> Result<bool, StoreError>;

    async fn get_delivery(&self, id: Uuid) -> Result<Option<CampaignDelivery>, StoreError>;

    async fn find_delivery(&self, campaign_id: Uuid, email: &str) -> Result<Option<CampaignDelivery>, StoreError>;

    async fn find_delivery_by_message_id(&self, message_id: &str) -> Result<Option<CampaignDelivery>, StoreError>;

    async fn campaign_deliveries(&self, campaign_id: Uuid) -> Result<Vec<CampaignDelivery>, StoreError>;

    async fn stale_deliveries(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<CampaignDelivery>, StoreError>;

    /// Failed rows of one campaign with at least `min_attempts` attempts that
    /// are not yet dead-lettered.
    async fn failed_deliveries(&self, campaign_id: Uuid, min_attempts: i32) -> Result<Vec<CampaignDelivery>, StoreError>;

    async fn dead_letters(&self, query: DeadLetterQuery) -> Result<Page<CampaignDelivery>, StoreError>;

    /// Rows of a campaign that still need a send attempt.
    async fn count_open(&self, campaign_id: Uuid) -> Result<u64, StoreError>;

    async fn queue_stats(&self) -> Result<QueueStats, StoreError>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Returns false when an event with the same provider id already exists.
    async fn insert_event(&self, event: &NewsletterEvent) -> Result<bool, StoreError>;

    /// Drops a recorded event so a redelivery is treated as new again.
    async fn delete_event(&self, provider: &str, provider_event_id: &str) -> Result<bool, StoreError>;

    async fn events_for(&self, email: &str) -> Result<Vec<NewsletterEvent>, StoreError>;

    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait SuppressionStore: Send + Sync {
    async fn upsert_suppression(&self, entry: &SuppressionEntry, now: DateTime<Utc>) -> Result<Suppression, StoreError>;

    async fn delete_suppression(&self, email: &str) -> Result<bool, StoreError>;

    async fn get_suppression(&self, email: &str) -> Result<Option<Suppression>, StoreError>;

    /// Which of `emails` are suppressed, in a single lookup.
    async fn suppressed_among(&self, emails: &[String]) -> Result<HashSet<String>, StoreError>;

    async fn delete_soft_bounces_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert_user(&self, username: &str, password_hash: &str) -> Result<Uuid, StoreError>;

    /// The user id and PHC password hash for `username`.
    async fn get_credentials(&self, username: &str) -> Result<Option<(Uuid, String)>, StoreError>;
}

pub trait Store:
    CampaignStore + SubscriberStore + DeliveryStore + EventStore + SuppressionStore + UserStore
{
}

impl<T> Store for T where
    T: CampaignStore + SubscriberStore + DeliveryStore + EventStore + SuppressionStore + UserStore
{
}
