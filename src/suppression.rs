//! Suppression Registry: the hard gate in front of every send.

use crate::clock::Clock;
use crate::domain::{normalize, SubscriberEmail, Suppression, SuppressionEntry, SuppressionReason, SubscriptionStatus};
use crate::store::{Store, StoreError};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One line of a bulk import. The address is validated on the way in.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuppressionImport {
    pub email: String,
    pub reason: SuppressionReason,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkAddReport {
    pub added: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SuppressionRegistry {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    soft_bounce_retention: Duration,
    batch_size: usize,
}

impl SuppressionRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        soft_bounce_retention_days: i64,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            clock,
            soft_bounce_retention: Duration::days(soft_bounce_retention_days),
            batch_size: batch_size.max(1),
        }
    }

    #[tracing::instrument(name = "Checking suppression", skip(self))]
    pub async fn is_suppressed(&self, email: &str) -> Result<bool, StoreError> {
        Ok(self.store.get_suppression(&normalize(email)).await?.is_some())
    }

    pub async fn get(&self, email: &str) -> Result<Option<Suppression>, StoreError> {
        self.store.get_suppression(&normalize(email)).await
    }

    /// Upserts the entry and moves a matching subscription out of Active.
    #[tracing::instrument(
        name = "Adding suppression",
        skip(self, entry),
        fields(email = %entry.email, reason = entry.reason.as_str())
    )]
    pub async fn add(&self, entry: SuppressionEntry) -> Result<Suppression, StoreError> {
        let now = self.clock.now();
        let suppression = self.store.upsert_suppression(&entry, now).await?;
        if let Some(status) = entry.reason.subscription_status() {
            let unsubscribed_at = match status {
                SubscriptionStatus::Unsubscribed => Some(now),
                _ => None,
            };
            self.store
                .set_subscription_status(entry.email.as_ref(), status, unsubscribed_at)
                .await?;
        }
        Ok(suppression)
    }

    /// Returns false when the address was not suppressed.
    #[tracing::instrument(name = "Removing suppression", skip(self))]
    pub async fn remove(&self, email: &str) -> Result<bool, StoreError> {
        let email = normalize(email);
        let removed = self.store.delete_suppression(&email).await?;
        if removed {
            self.store
                .set_subscription_status(&email, SubscriptionStatus::Active, None)
                .await?;
        }
        Ok(removed)
    }

    /// The subset of `emails` that may be mailed, normalized and in input
    /// order. One store round-trip regardless of list size.
    #[tracing::instrument(name = "Filtering eligible recipients", skip(self, emails), fields(count = emails.len()))]
    pub async fn filter_eligible(&self, emails: Vec<String>) -> Result<Vec<String>, StoreError> {
        let emails: Vec<String> = emails.iter().map(|e| normalize(e)).collect();
        let suppressed = self.store.suppressed_among(&emails).await?;
        Ok(emails
            .into_iter()
            .filter(|e| !suppressed.contains(e))
            .collect())
    }

    /// Imports entries in fixed-size batches. A bad entry is logged and
    /// counted; the import always runs to the end.
    #[tracing::instrument(name = "Bulk adding suppressions", skip(self, imports), fields(count = imports.len()))]
    pub async fn bulk_add(&self, imports: Vec<SuppressionImport>) -> BulkAddReport {
        let mut report = BulkAddReport::default();
        for (batch_no, batch) in imports.chunks(self.batch_size).enumerate() {
            let mut batch_failures = 0;
            for import in batch {
                let entry = match SubscriberEmail::parse(&import.email) {
                    Ok(email) => {
                        let mut entry = SuppressionEntry::new(email, import.reason);
                        entry.source = import.source.clone();
                        entry
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping invalid suppression import");
                        batch_failures += 1;
                        continue;
                    }
                };
                match self.add(entry).await {
                    Ok(_) => report.added += 1,
                    Err(e) => {
                        tracing::warn!(error.cause_chain = ?e, email = %import.email, "Failed to import suppression");
                        batch_failures += 1;
                    }
                }
            }
            if batch_failures > 0 {
                tracing::warn!(batch = batch_no, failed = batch_failures, "Suppression batch partially failed");
            }
            report.failed += batch_failures;
        }
        report
    }

    /// Drops soft bounces older than the retention window so those
    /// addresses become eligible again.
    #[tracing::instrument(name = "Cleaning up soft bounces", skip(self))]
    pub async fn cleanup_soft_bounces(&self) -> Result<u64, StoreError> {
        let cutoff = self.clock.now() - self.soft_bounce_retention;
        let purged = self.store.delete_soft_bounces_before(cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, "Expired soft-bounce suppressions removed");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::{InMemoryStore, SubscriberStore};
    use chrono::Utc;
    use claim::{assert_ok, assert_some};
    use fake::faker::internet::en::SafeEmail;
    use fake::Fake;

    fn registry(store: Arc<InMemoryStore>, clock: Arc<FixedClock>) -> SuppressionRegistry {
        SuppressionRegistry::new(store, clock, 30, 2)
    }

    fn email(s: &str) -> SubscriberEmail {
        SubscriberEmail::parse(s).unwrap()
    }

    #[tokio::test]
    async fn add_then_remove_round_trips_and_updates_the_subscription() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let registry = registry(store.clone(), clock);
        store
            .insert_subscriber(&email("ursula@example.com"), "Ursula", SubscriptionStatus::Active, Utc::now())
            .await
            .unwrap();

        let entry = SuppressionEntry::new(email("ursula@example.com"), SuppressionReason::Unsubscribe);
        assert_ok!(registry.add(entry).await);
        assert!(registry.is_suppressed("  Ursula@Example.com ").await.unwrap());
        assert_eq!(
            store.subscription_status("ursula@example.com").await.unwrap(),
            Some(SubscriptionStatus::Unsubscribed)
        );

        assert!(registry.remove("ursula@example.com").await.unwrap());
        assert!(!registry.is_suppressed("ursula@example.com").await.unwrap());
        assert_eq!(
            store.subscription_status("ursula@example.com").await.unwrap(),
            Some(SubscriptionStatus::Active)
        );
    }

    #[tokio::test]
    async fn re_adding_overwrites_the_reason_and_keeps_created_at() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let registry = registry(store, clock.clone());

        let first = registry
            .add(SuppressionEntry::new(email("a@example.com"), SuppressionReason::SoftBounce))
            .await
            .unwrap();
        clock.advance(Duration::hours(1));
        let second = registry
            .add(SuppressionEntry::new(email("a@example.com"), SuppressionReason::HardBounce))
            .await
            .unwrap();

        assert_eq!(second.reason, SuppressionReason::HardBounce);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
    }

    #[tokio::test]
    async fn filter_eligible_drops_suppressed_addresses() {
        let store = Arc::new(InMemoryStore::new());
        let registry = registry(store, Arc::new(FixedClock::new(Utc::now())));
        registry
            .add(SuppressionEntry::new(email("gone@example.com"), SuppressionReason::HardBounce))
            .await
            .unwrap();

        let eligible = registry
            .filter_eligible(vec!["Gone@example.com".into(), "kept@example.com".into()])
            .await
            .unwrap();

        assert_eq!(eligible, vec!["kept@example.com".to_string()]);
    }

    #[tokio::test]
    async fn bulk_add_keeps_valid_entries_when_some_are_invalid() {
        let store = Arc::new(InMemoryStore::new());
        let registry = registry(store, Arc::new(FixedClock::new(Utc::now())));
        let mut imports: Vec<SuppressionImport> = (0..5)
            .map(|_| SuppressionImport {
                email: SafeEmail().fake(),
                reason: SuppressionReason::Manual,
                source: Some("import".into()),
            })
            .collect();
        imports.insert(
            2,
            SuppressionImport {
                email: "not-an-email".into(),
                reason: SuppressionReason::Manual,
                source: None,
            },
        );

        let report = registry.bulk_add(imports.clone()).await;

        assert_eq!(report, BulkAddReport { added: 5, failed: 1 });
        for import in imports.iter().filter(|i| i.email.contains('@')) {
            assert!(registry.is_suppressed(&import.email).await.unwrap());
        }
    }

    #[tokio::test]
    async fn only_expired_soft_bounces_are_cleaned_up() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let registry = registry(store, clock.clone());
        registry
            .add(SuppressionEntry::new(email("soft@example.com"), SuppressionReason::SoftBounce))
            .await
            .unwrap();
        registry
            .add(SuppressionEntry::new(email("hard@example.com"), SuppressionReason::HardBounce))
            .await
            .unwrap();

        clock.advance(Duration::days(29));
        assert_eq!(registry.cleanup_soft_bounces().await.unwrap(), 0);

        clock.advance(Duration::days(2));
        assert_eq!(registry.cleanup_soft_bounces().await.unwrap(), 1);
        assert!(!registry.is_suppressed("soft@example.com").await.unwrap());
        assert_some!(registry.get("hard@example.com").await.unwrap());
    }
}
