use crate::clock::Clock;
use crate::domain::{
    BounceKind, CampaignDelivery, EventType, NewsletterEvent, SubscriberEmail, SuppressionEntry,
    SuppressionReason,
};
use crate::store::{Store, StoreError};
use crate::suppression::SuppressionRegistry;
use crate::webhooks::{NormalizedEvent, ParsedBatch, Provider};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Concurrent writers (the batcher, another webhook) can bump the row
/// version between our read and our write.
const MAX_SAVE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReport {
    pub received: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Outcome {
    Applied,
    Duplicate,
}

/// What a negative outcome does to the suppression list.
pub fn suppression_reason(event_type: EventType, bounce_kind: Option<BounceKind>) -> Option<SuppressionReason> {
    match event_type {
        EventType::Bounced => match bounce_kind {
            Some(BounceKind::Soft) => Some(SuppressionReason::SoftBounce),
            _ => Some(SuppressionReason::HardBounce),
        },
        EventType::Complained => Some(SuppressionReason::Complaint),
        EventType::Unsubscribed => Some(SuppressionReason::Unsubscribe),
        EventType::Delivered | EventType::Opened | EventType::Clicked | EventType::Unknown => None,
    }
}

pub struct WebhookProcessor {
    store: Arc<dyn Store>,
    suppressions: SuppressionRegistry,
    clock: Arc<dyn Clock>,
}

impl WebhookProcessor {
    pub fn new(store: Arc<dyn Store>, suppressions: SuppressionRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            suppressions,
            clock,
        }
    }

    /// Records and applies every event of a verified batch. A failing event
    /// is logged and counted; it never aborts its siblings.
    #[tracing::instrument(
        name = "Processing webhook batch",
        skip(self, batch),
        fields(provider = provider.as_str(), events = batch.events.len())
    )]
    pub async fn process(&self, provider: Provider, batch: ParsedBatch) -> WebhookReport {
        let mut report = WebhookReport {
            received: batch.events.len() + batch.malformed,
            failed: batch.malformed,
            ..WebhookReport::default()
        };
        for event in batch.events {
            let email = match SubscriberEmail::parse(&event.email) {
                Ok(email) => email,
                Err(e) => {
                    tracing::warn!(provider_event_id = %event.provider_event_id, error = %e, "Skipping event without a usable recipient");
                    report.skipped += 1;
                    continue;
                }
            };
            let provider_event_id = event.provider_event_id.clone();
            match self.process_event(provider, email, event).await {
                Ok(Outcome::Applied) => report.processed += 1,
                Ok(Outcome::Duplicate) => report.duplicates += 1,
                Err(e) => {
                    tracing::error!(%provider_event_id, error.cause_chain = ?e, "Failed to process webhook event");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn process_event(
        &self,
        provider: Provider,
        email: SubscriberEmail,
        event: NormalizedEvent,
    ) -> Result<Outcome, StoreError> {
        let now = self.clock.now();
        let delivery = self.find_delivery(&event, email.as_ref()).await?;
        let campaign_id = event.campaign_id.or_else(|| delivery.as_ref().map(|d| d.campaign_id));

        let record = NewsletterEvent {
            id: Uuid::new_v4(),
            provider: provider.as_str().to_string(),
            provider_event_id: event.provider_event_id.clone(),
            email: email.as_ref().to_string(),
            campaign_id,
            event_type: event.event_type,
            occurred_at: event.occurred_at,
            payload: event.raw.clone(),
            created_at: now,
        };
        // the event row is the idempotency key: side effects only follow a fresh insert
        if !self.store.insert_event(&record).await? {
            tracing::info!(provider_event_id = %record.provider_event_id, "Duplicate webhook event");
            return Ok(Outcome::Duplicate);
        }

        let applied = self.apply_side_effects(provider, email, campaign_id, delivery, event).await;
        if let Err(e) = applied {
            // release the key so the provider's redelivery gets another go
            if let Err(undo) = self
                .store
                .delete_event(&record.provider, &record.provider_event_id)
                .await
            {
                tracing::error!(
                    provider_event_id = %record.provider_event_id,
                    error.cause_chain = ?undo,
                    "Failed to release event after its side effects failed"
                );
            }
            return Err(e);
        }
        Ok(Outcome::Applied)
    }

    async fn apply_side_effects(
        &self,
        provider: Provider,
        email: SubscriberEmail,
        campaign_id: Option<Uuid>,
        delivery: Option<CampaignDelivery>,
        event: NormalizedEvent,
    ) -> Result<(), StoreError> {
        if let Some(delivery) = delivery {
            self.update_delivery(delivery, event.event_type, event.occurred_at).await?;
        }

        if let Some(reason) = suppression_reason(event.event_type, event.bounce_kind) {
            let entry = SuppressionEntry {
                email,
                reason,
                source: Some(
                    campaign_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| provider.as_str().to_string()),
                ),
                bounce_type: event.bounce.sub_type,
                error_code: event.bounce.code,
                error_message: event.bounce.message,
            };
            self.suppressions.add(entry).await?;
        }
        Ok(())
    }

    async fn find_delivery(
        &self,
        event: &NormalizedEvent,
        email: &str,
    ) -> Result<Option<CampaignDelivery>, StoreError> {
        if let Some(campaign_id) = event.campaign_id {
            if let Some(delivery) = self.store.find_delivery(campaign_id, email).await? {
                return Ok(Some(delivery));
            }
        }
        match &event.provider_message_id {
            Some(message_id) => self.store.find_delivery_by_message_id(message_id).await,
            None => Ok(None),
        }
    }

    #[tracing::instrument(name = "Applying event to delivery", skip(self, delivery), fields(delivery_id = %delivery.id))]
    async fn update_delivery(
        &self,
        mut delivery: CampaignDelivery,
        event_type: EventType,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), StoreError> {
        for _ in 0..MAX_SAVE_ATTEMPTS {
            match delivery.apply_event(event_type, at) {
                Ok(false) => return Ok(()),
                Ok(true) => {}
                Err(e) => {
                    // providers do not guarantee ordering; a late DELIVERED after BOUNCED is dropped
                    tracing::info!(error = %e, "Ignoring out-of-order event");
                    return Ok(());
                }
            }
            if self.store.save_delivery(&mut delivery).await? {
                return Ok(());
            }
            delivery = match self.store.get_delivery(delivery.id).await? {
                Some(fresh) => fresh,
                None => return Ok(()),
            };
        }
        tracing::warn!("Gave up on delivery update after repeated version conflicts");
        Ok(())
    }
}
