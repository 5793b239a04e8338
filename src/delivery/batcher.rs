use crate::clock::Clock;
use crate::configuration::DeliverySettings;
use crate::delivery::{DeliveryError, EnqueueReport, ProcessReport, SendGate};
use crate::domain::{AttemptFailure, Campaign, CampaignDelivery, DeliveryStatus, SubscriberEmail};
use crate::email::{Email, OutboundEmail, SendError};
use crate::store::{QueueStats, Store};
use crate::suppression::SuppressionRegistry;
use crate::throttle::DomainThrottle;
use chrono::Duration;
use futures::stream::{self, StreamExt};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Accepted,
    Deferred,
    Retrying,
    Failed,
    Suppressed,
    /// Somebody else wrote the row first; our update was dropped.
    Conflict,
}

impl ProcessReport {
    fn record(&mut self, outcome: Result<Outcome, DeliveryError>) {
        match outcome {
            Ok(Outcome::Accepted) => self.accepted += 1,
            Ok(Outcome::Deferred) => self.deferred += 1,
            Ok(Outcome::Retrying) => self.retrying += 1,
            Ok(Outcome::Failed) => self.failed += 1,
            Ok(Outcome::Suppressed) => self.suppressed += 1,
            Ok(Outcome::Conflict) => self.conflicts += 1,
            Err(e) => {
                tracing::error!(error.cause_chain = ?e, "Failed to process a delivery");
                self.errors += 1;
            }
        }
    }
}

pub struct DeliveryBatcher {
    store: Arc<dyn Store>,
    email_client: Arc<dyn Email>,
    suppressions: SuppressionRegistry,
    throttle: Arc<DomainThrottle>,
    gate: Arc<SendGate>,
    clock: Arc<dyn Clock>,
    settings: DeliverySettings,
}

impl DeliveryBatcher {
    pub fn new(
        store: Arc<dyn Store>,
        email_client: Arc<dyn Email>,
        suppressions: SuppressionRegistry,
        throttle: Arc<DomainThrottle>,
        clock: Arc<dyn Clock>,
        settings: DeliverySettings,
    ) -> Self {
        let gate = Arc::new(SendGate::new(std::time::Duration::from_millis(
            settings.email_send_throttle_ms,
        )));
        Self {
            store,
            email_client,
            suppressions,
            throttle,
            gate,
            clock,
            settings,
        }
    }

    pub fn throttle(&self) -> &DomainThrottle {
        &self.throttle
    }

    /// Resolves the recipient filter, drops suppressed addresses and creates
    /// one Queued delivery per remaining recipient.
    #[tracing::instrument(name = "Enqueueing campaign", skip(self, campaign), fields(campaign_id = %campaign.id))]
    pub async fn enqueue_campaign(&self, campaign: &Campaign) -> Result<EnqueueReport, DeliveryError> {
        let candidates = self
            .store
            .matching_subscribers(&campaign.recipient_filter)
            .await?;
        let total = candidates.len();
        let eligible = self.suppressions.filter_eligible(candidates).await?;
        let suppressed = total - eligible.len();

        let mut recipients = Vec::with_capacity(eligible.len());
        for email in eligible {
            match SubscriberEmail::parse(&email) {
                Ok(email) => recipients.push(email),
                Err(e) => tracing::warn!(error = %e, "Skipping a subscriber with an invalid address"),
            }
        }

        let now = self.clock.now();
        let queued = self
            .store
            .insert_deliveries(campaign.id, &recipients, self.settings.max_attempts, now)
            .await?;
        self.store
            .set_recipient_count(campaign.id, recipients.len() as i32, now)
            .await?;
        tracing::info!(queued, suppressed, "Campaign enqueued");
        Ok(EnqueueReport {
            recipients: recipients.len(),
            queued,
            suppressed,
        })
    }

    /// Drains every ready delivery, one claimed batch at a time.
    #[tracing::instrument(name = "Processing delivery queue", skip(self))]
    pub async fn process_queue(&self) -> Result<ProcessReport, DeliveryError> {
        let mut report = ProcessReport::default();
        loop {
            let batch = self
                .store
                .claim_ready(self.settings.batch_size, self.clock.now())
                .await?;
            if batch.is_empty() {
                break;
            }
            report.claimed += batch.len();

            let emails: Vec<String> = batch.iter().map(|d| d.email.clone()).collect();
            let suppressed = self.store.suppressed_among(&emails).await?;
            let campaigns = self.campaigns_for(&batch).await?;

            let outcomes: Vec<Result<Outcome, DeliveryError>> = stream::iter(batch)
                .map(|delivery| {
                    let blocked = suppressed.contains(&delivery.email);
                    let campaign = campaigns.get(&delivery.campaign_id);
                    self.process_one(delivery, campaign, blocked)
                })
                .buffer_unordered(self.settings.max_concurrency.max(1))
                .collect()
                .await;
            for outcome in outcomes {
                report.record(outcome);
            }
        }
        if report.claimed > 0 {
            tracing::info!(?report, "Delivery queue pass finished");
        }
        Ok(report)
    }

    /// Administrative "process now": heal stale rows, then drain the queue.
    pub async fn process_email_queue(&self) -> Result<ProcessReport, DeliveryError> {
        let requeued_stale = self.requeue_stale().await?;
        let mut report = self.process_queue().await?;
        report.requeued_stale = requeued_stale;
        Ok(report)
    }

    pub async fn get_stats(&self) -> Result<QueueStats, DeliveryError> {
        Ok(self.store.queue_stats().await?)
    }

    /// Deliveries claimed but never acknowledged within the staleness window
    /// count as a failed attempt and go back to Queued while attempts remain.
    #[tracing::instrument(name = "Requeueing stale deliveries", skip(self))]
    pub async fn requeue_stale(&self) -> Result<usize, DeliveryError> {
        let now = self.clock.now();
        let cutoff = now - Duration::seconds(self.settings.stale_sending_timeout_secs);
        let mut requeued = 0;
        loop {
            let stale = self
                .store
                .stale_deliveries(cutoff, self.settings.batch_size)
                .await?;
            if stale.is_empty() {
                break;
            }
            let mut progressed = false;
            for mut delivery in stale {
                let status = match delivery.fail_attempt(
                    AttemptFailure::Transient,
                    "Send was not acknowledged before the staleness timeout.",
                    now,
                    now,
                ) {
                    Ok(status) => status,
                    Err(e) => {
                        tracing::warn!(delivery_id = %delivery.id, error = %e, "Skipping stale delivery");
                        continue;
                    }
                };
                if self.store.save_delivery(&mut delivery).await? {
                    progressed = true;
                    if status == DeliveryStatus::Queued {
                        requeued += 1;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        if requeued > 0 {
            tracing::warn!(requeued, "Requeued stale deliveries");
        }
        Ok(requeued)
    }

    async fn campaigns_for(&self, batch: &[CampaignDelivery]) -> Result<HashMap<Uuid, Campaign>, DeliveryError> {
        let ids: HashSet<Uuid> = batch.iter().map(|d| d.campaign_id).collect();
        let mut campaigns = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(campaign) = self.store.get_campaign(id).await? {
                campaigns.insert(id, campaign);
            }
        }
        Ok(campaigns)
    }

    #[tracing::instrument(
        name = "Processing delivery",
        skip(self, delivery, campaign),
        fields(delivery_id = %delivery.id, campaign_id = %delivery.campaign_id)
    )]
    async fn process_one(
        &self,
        mut delivery: CampaignDelivery,
        campaign: Option<&Campaign>,
        suppressed: bool,
    ) -> Result<Outcome, DeliveryError> {
        let now = self.clock.now();
        if suppressed {
            delivery.fail_attempt(AttemptFailure::Permanent, "Recipient is suppressed.", now, now)?;
            return self.save(delivery, Outcome::Suppressed).await;
        }
        let (campaign, recipient) = match (campaign, SubscriberEmail::parse(&delivery.email)) {
            (Some(campaign), Ok(recipient)) => (campaign, recipient),
            (None, _) => {
                delivery.fail_attempt(AttemptFailure::Permanent, "Campaign no longer exists.", now, now)?;
                return self.save(delivery, Outcome::Failed).await;
            }
            (_, Err(e)) => {
                delivery.fail_attempt(AttemptFailure::Permanent, &e, now, now)?;
                return self.save(delivery, Outcome::Failed).await;
            }
        };

        if let Err(denied) = self.throttle.check(recipient.domain(), now) {
            tracing::debug!(reason = %denied.reason, "Send deferred by throttle");
            delivery.defer(now + denied.retry_after)?;
            return self.save(delivery, Outcome::Deferred).await;
        }

        // the attempt is on record before the provider sees the message
        delivery.begin_attempt(now)?;
        if !self.store.save_delivery(&mut delivery).await? {
            return Ok(Outcome::Conflict);
        }

        self.gate.wait().await;
        let message = outbound(campaign, &delivery, recipient);
        let result = self.email_client.send_email(&message).await;

        let now = self.clock.now();
        let outcome = match result {
            Ok(receipt) => {
                delivery.mark_accepted(receipt.message_id, now)?;
                Outcome::Accepted
            }
            Err(e) => {
                let failure = match &e {
                    SendError::Transient(_) => AttemptFailure::Transient,
                    SendError::Permanent(_) => AttemptFailure::Permanent,
                };
                tracing::warn!(error.cause_chain = ?e, attempt = delivery.attempts, "Send attempt failed");
                let retry_at = now + self.backoff(delivery.attempts);
                match delivery.fail_attempt(failure, &e.to_string(), retry_at, now)? {
                    DeliveryStatus::Queued => Outcome::Retrying,
                    _ => Outcome::Failed,
                }
            }
        };
        self.save(delivery, outcome).await
    }

    async fn save(&self, mut delivery: CampaignDelivery, outcome: Outcome) -> Result<Outcome, DeliveryError> {
        if self.store.save_delivery(&mut delivery).await? {
            Ok(outcome)
        } else {
            tracing::warn!(delivery_id = %delivery.id, "Delivery changed concurrently, dropping update");
            Ok(Outcome::Conflict)
        }
    }

    /// Exponential backoff from `retry_base_secs`, capped at `retry_max_secs`,
    /// with up to 10% jitter.
    fn backoff(&self, attempts: i32) -> Duration {
        let exponent = (attempts.max(1) - 1).min(20) as u32;
        let max = self.settings.retry_max_secs.max(0);
        let secs = self
            .settings
            .retry_base_secs
            .saturating_mul(2_i64.saturating_pow(exponent))
            .clamp(0, max);
        let jitter = match secs / 10 {
            0 => 0,
            spread => rand::thread_rng().gen_range(0..=spread),
        };
        Duration::seconds((secs + jitter).min(max))
    }
}

fn outbound(campaign: &Campaign, delivery: &CampaignDelivery, recipient: SubscriberEmail) -> OutboundEmail {
    OutboundEmail {
        recipient,
        subject: campaign.subject.clone(),
        template_id: campaign.template_id.clone(),
        template_data: serde_json::json!({
            "campaignId": campaign.id,
            "title": campaign.title,
            "email": delivery.email,
        }),
        tags: vec![
            ("campaign_id".into(), campaign.id.to_string()),
            ("delivery_id".into(), delivery.id.to_string()),
        ],
    }
}
