//! Dead Letter Queue view: administrative operations over deliveries that
//! exhausted their attempts.

use crate::clock::Clock;
use crate::domain::{CampaignDelivery, SubscriberEmail, SuppressionEntry, SuppressionReason};
use crate::store::{DeadLetterQuery, Page, Store, StoreError};
use crate::suppression::SuppressionRegistry;
use crate::telemetry::error_chain_fmt;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(thiserror::Error)]
pub enum DlqError {
    #[error("Attempts threshold must be at least 1, got {0}.")]
    InvalidThreshold(i32),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl std::fmt::Debug for DlqError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedDelivery {
    pub id: Uuid,
    pub reason: String,
}

/// Result of a per-id bulk action. One bad id does not stop the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqActionReport {
    pub succeeded: usize,
    pub skipped: Vec<SkippedDelivery>,
}

impl DlqActionReport {
    fn skip(&mut self, id: Uuid, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(delivery_id = %id, %reason, "Skipping DLQ action");
        self.skipped.push(SkippedDelivery { id, reason });
    }
}

pub struct DeadLetterQueue {
    store: Arc<dyn Store>,
    suppressions: SuppressionRegistry,
    clock: Arc<dyn Clock>,
    /// The configured attempt cap: default move threshold and the budget a
    /// redrive grants.
    max_attempts: i32,
}

impl DeadLetterQueue {
    pub fn new(
        store: Arc<dyn Store>,
        suppressions: SuppressionRegistry,
        clock: Arc<dyn Clock>,
        max_attempts: i32,
    ) -> Self {
        Self {
            store,
            suppressions,
            clock,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn default_threshold(&self) -> i32 {
        self.max_attempts
    }

    pub async fn list(
        &self,
        campaign_id: Option<Uuid>,
        page: u32,
        per_page: u32,
    ) -> Result<Page<CampaignDelivery>, DlqError> {
        let query = DeadLetterQuery {
            campaign_id,
            page: page.max(1),
            per_page: per_page.clamp(1, MAX_PAGE_SIZE),
        };
        Ok(self.store.dead_letters(query).await?)
    }

    /// Explicitly marks FAILED deliveries of one campaign with at least
    /// `min_attempts` attempts as dead-lettered by `actor`.
    #[tracing::instrument(name = "Moving deliveries to DLQ", skip(self))]
    pub async fn move_to_dlq(&self, campaign_id: Uuid, min_attempts: i32, actor: &str) -> Result<usize, DlqError> {
        if min_attempts < 1 {
            return Err(DlqError::InvalidThreshold(min_attempts));
        }
        let now = self.clock.now();
        let mut moved = 0;
        for mut delivery in self.store.failed_deliveries(campaign_id, min_attempts).await? {
            if let Err(e) = delivery.mark_dead_lettered(actor, now) {
                tracing::warn!(delivery_id = %delivery.id, error = %e, "Delivery left the failed state");
                continue;
            }
            if self.store.save_delivery(&mut delivery).await? {
                moved += 1;
            }
        }
        tracing::info!(moved, "Moved deliveries to DLQ");
        Ok(moved)
    }

    /// Puts dead letters back in the queue. Attempts are kept; the budget is
    /// raised instead.
    #[tracing::instrument(name = "Redriving dead letters", skip(self, ids), fields(count = ids.len()))]
    pub async fn redrive(&self, ids: &[Uuid], actor: &str) -> Result<DlqActionReport, DlqError> {
        let now = self.clock.now();
        let mut report = DlqActionReport::default();
        for &id in ids {
            let mut delivery = match self.dead_letter(id, &mut report).await? {
                Some(delivery) => delivery,
                None => continue,
            };
            if let Err(e) = delivery.redrive(self.max_attempts, actor, now) {
                report.skip(id, e.to_string());
                continue;
            }
            if self.store.save_delivery(&mut delivery).await? {
                tracing::info!(delivery_id = %id, attempts = delivery.attempts, "Redriven");
                report.succeeded += 1;
            } else {
                report.skip(id, "changed concurrently");
            }
        }
        Ok(report)
    }

    /// Manually suppresses the recipients of the given dead letters.
    #[tracing::instrument(name = "Suppressing dead letters", skip(self, ids), fields(count = ids.len()))]
    pub async fn suppress(&self, ids: &[Uuid], actor: &str) -> Result<DlqActionReport, DlqError> {
        let mut report = DlqActionReport::default();
        for &id in ids {
            let delivery = match self.dead_letter(id, &mut report).await? {
                Some(delivery) => delivery,
                None => continue,
            };
            let email = match SubscriberEmail::parse(&delivery.email) {
                Ok(email) => email,
                Err(e) => {
                    report.skip(id, e);
                    continue;
                }
            };
            let mut entry = SuppressionEntry::new(email, SuppressionReason::Manual).source(actor);
            entry.error_message = delivery.last_error.clone();
            self.suppressions.add(entry).await?;
            report.succeeded += 1;
        }
        Ok(report)
    }

    async fn dead_letter(&self, id: Uuid, report: &mut DlqActionReport) -> Result<Option<CampaignDelivery>, DlqError> {
        match self.store.get_delivery(id).await? {
            Some(d) if d.is_dead_letter_eligible() || d.dead_lettered_at.is_some() => Ok(Some(d)),
            Some(_) => {
                report.skip(id, "not in the dead letter queue");
                Ok(None)
            }
            None => {
                report.skip(id, "not found");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::domain::{AttemptFailure, DeliveryStatus};
    use crate::store::{DeliveryStore, InMemoryStore, SuppressionStore};
    use chrono::{DateTime, TimeZone, Utc};
    use claim::{assert_matches, assert_some};

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap()
    }

    fn spawn() -> (DeadLetterQueue, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(noon()));
        let suppressions = SuppressionRegistry::new(store.clone(), clock.clone(), 30, 100);
        (DeadLetterQueue::new(store.clone(), suppressions, clock, 2), store)
    }

    /// Inserts a delivery and fails it `attempts` times (max 2).
    async fn failed(store: &InMemoryStore, campaign_id: Uuid, email: &str, attempts: i32) -> CampaignDelivery {
        let address = SubscriberEmail::parse(email).unwrap();
        store.insert_deliveries(campaign_id, &[address], 2, noon()).await.unwrap();
        let mut delivery = store
            .campaign_deliveries(campaign_id)
            .await
            .unwrap()
            .into_iter()
            .find(|d| d.email == email)
            .unwrap();
        let failure = if attempts < 2 {
            AttemptFailure::Permanent
        } else {
            AttemptFailure::Transient
        };
        for _ in 0..attempts {
            delivery.claim(noon()).unwrap();
            delivery.begin_attempt(noon()).unwrap();
            delivery.fail_attempt(failure, "mailbox unavailable", noon(), noon()).unwrap();
        }
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert!(store.save_delivery(&mut delivery).await.unwrap());
        delivery
    }

    #[tokio::test]
    async fn move_to_dlq_respects_the_threshold() {
        let (dlq, store) = spawn();
        let campaign_id = Uuid::new_v4();
        let exhausted = failed(&store, campaign_id, "a@example.com", 2).await;
        failed(&store, campaign_id, "b@example.com", 1).await;

        assert_eq!(dlq.move_to_dlq(campaign_id, 2, "ops").await.unwrap(), 1);
        // a second run finds nothing new
        assert_eq!(dlq.move_to_dlq(campaign_id, 2, "ops").await.unwrap(), 0);

        let stored = store.get_delivery(exhausted.id).await.unwrap().unwrap();
        assert_eq!(stored.dead_lettered_by.as_deref(), Some("ops"));
        assert_some!(stored.dead_lettered_at);
        assert_matches!(dlq.move_to_dlq(campaign_id, 0, "ops").await, Err(DlqError::InvalidThreshold(0)));
    }

    #[tokio::test]
    async fn listing_is_paginated_and_filtered_by_campaign() {
        let (dlq, store) = spawn();
        let campaign_id = Uuid::new_v4();
        for n in 0..3 {
            failed(&store, campaign_id, &format!("r{}@example.com", n), 2).await;
        }
        failed(&store, Uuid::new_v4(), "other@example.com", 2).await;

        let page = dlq.list(Some(campaign_id), 2, 2).await.unwrap();

        assert_eq!((page.total, page.items.len()), (3, 1));
        assert!(page.items.iter().all(|d| d.campaign_id == campaign_id));
    }

    #[tokio::test]
    async fn redrive_requeues_with_a_fresh_budget() {
        let (dlq, store) = spawn();
        let campaign_id = Uuid::new_v4();
        let dead = failed(&store, campaign_id, "a@example.com", 2).await;
        let permanent = failed(&store, campaign_id, "b@example.com", 1).await;

        let report = dlq.redrive(&[dead.id, permanent.id, Uuid::new_v4()], "ops").await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.skipped.len(), 2);
        let stored = store.get_delivery(dead.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Queued);
        assert_eq!((stored.attempts, stored.max_attempts), (2, 4));
        assert_eq!(stored.redriven_by.as_deref(), Some("ops"));
        assert_eq!(stored.redriven_at, Some(noon()));
    }

    #[tokio::test]
    async fn suppress_adds_a_manual_entry_for_the_actor() {
        let (dlq, store) = spawn();
        let dead = failed(&store, Uuid::new_v4(), "a@example.com", 2).await;

        let report = dlq.suppress(&[dead.id], "ops").await.unwrap();

        assert_eq!(report.succeeded, 1);
        let entry = assert_some!(store.get_suppression("a@example.com").await.unwrap());
        assert_eq!(entry.reason, SuppressionReason::Manual);
        assert_eq!(entry.source.as_deref(), Some("ops"));
    }
}
