//! Campaign Scheduler: the periodic driver in front of the batcher.

use crate::clock::Clock;
use crate::delivery::{DeliveryBatcher, DeliveryError, ProcessReport};
use crate::domain::{Campaign, CampaignStatus};
use crate::store::{Store, StoreError};
use crate::telemetry::error_chain_fmt;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(thiserror::Error)]
pub enum SchedulerError {
    #[error("A scheduler pass is already running.")]
    AlreadyRunning,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl std::fmt::Debug for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerRunError {
    pub campaign_id: Option<Uuid>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// In-memory only; a restart resets it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub scheduled_campaigns: u64,
    pub errors: Vec<SchedulerRunError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerRun {
    pub campaigns_started: usize,
    pub campaigns_completed: usize,
    pub campaigns_failed: usize,
    pub deliveries: ProcessReport,
}

/// Clears the running flag however the pass ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct CampaignScheduler {
    store: Arc<dyn Store>,
    batcher: Arc<DeliveryBatcher>,
    clock: Arc<dyn Clock>,
    interval_minutes: i64,
    /// Minute of the last boundary `should_run` said yes to.
    last_boundary: Mutex<Option<i64>>,
    running: AtomicBool,
    status: Mutex<SchedulerStatus>,
}

impl CampaignScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        batcher: Arc<DeliveryBatcher>,
        clock: Arc<dyn Clock>,
        interval_minutes: u32,
    ) -> Self {
        let interval_minutes = i64::from(interval_minutes.max(1));
        let next_run_at = next_boundary(clock.now(), interval_minutes);
        Self {
            store,
            batcher,
            clock,
            interval_minutes,
            last_boundary: Mutex::new(None),
            running: AtomicBool::new(false),
            status: Mutex::new(SchedulerStatus {
                is_running: false,
                last_run_at: None,
                next_run_at,
                scheduled_campaigns: 0,
                errors: Vec::new(),
            }),
        }
    }

    /// True once per interval boundary, so the caller can tick more often
    /// than once a minute without over-triggering.
    pub fn should_run(&self, now: DateTime<Utc>) -> bool {
        let minute = now.timestamp() / 60;
        if minute % self.interval_minutes != 0 {
            return false;
        }
        let mut last = self.last_boundary.lock().unwrap_or_else(|e| e.into_inner());
        if *last == Some(minute) {
            return false;
        }
        *last = Some(minute);
        true
    }

    pub fn get_scheduler_status(&self) -> SchedulerStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update_scheduler_status<F>(&self, update: F)
    where
        F: FnOnce(&mut SchedulerStatus),
    {
        update(&mut self.status.lock().unwrap_or_else(|e| e.into_inner()));
    }

    /// One scheduler pass. A second caller while a pass is active gets
    /// `AlreadyRunning` and nothing else happens.
    #[tracing::instrument(name = "Running campaign scheduler", skip(self))]
    pub async fn run_campaign_scheduler(&self) -> Result<SchedulerRun, SchedulerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("Scheduler triggered while a pass is still running, skipping");
            return Err(SchedulerError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let started_at = self.clock.now();
        self.update_scheduler_status(|status| {
            status.is_running = true;
            status.last_run_at = Some(started_at);
        });

        let mut errors = Vec::new();
        let run = self.run_pass(&mut errors).await;
        let scheduled_campaigns = match self.store.count_scheduled().await {
            Ok(count) => count,
            Err(e) => {
                errors.push(self.run_error(None, &e));
                0
            }
        };

        let finished_at = self.clock.now();
        let interval = self.interval_minutes;
        self.update_scheduler_status(move |status| {
            status.is_running = false;
            status.next_run_at = next_boundary(finished_at, interval);
            status.scheduled_campaigns = scheduled_campaigns;
            status.errors = errors;
        });
        Ok(run)
    }

    async fn run_pass(&self, errors: &mut Vec<SchedulerRunError>) -> SchedulerRun {
        let mut run = SchedulerRun::default();

        match self.batcher.requeue_stale().await {
            Ok(requeued) => run.deliveries.requeued_stale = requeued,
            Err(e) => errors.push(self.run_error(None, &e)),
        }

        let due = match self.store.due_campaigns(self.clock.now()).await {
            Ok(due) => due,
            Err(e) => {
                errors.push(self.run_error(None, &e));
                Vec::new()
            }
        };
        if !due.is_empty() {
            tracing::info!(due = due.len(), "Campaigns due for sending");
        }
        for campaign in due {
            match self.start_campaign(&campaign).await {
                Ok(true) => run.campaigns_started += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(campaign_id = %campaign.id, error.cause_chain = ?e, "Campaign send failed");
                    errors.push(self.run_error(Some(campaign.id), &e));
                    run.campaigns_failed += 1;
                    if let Err(e) = self
                        .store
                        .transition_campaign(campaign.id, CampaignStatus::Sending, CampaignStatus::Failed, self.clock.now())
                        .await
                    {
                        errors.push(self.run_error(Some(campaign.id), &e));
                    }
                }
            }
        }

        // retries and throttled leftovers of earlier passes
        match self.batcher.process_queue().await {
            Ok(report) => {
                let requeued_stale = run.deliveries.requeued_stale;
                run.deliveries = report;
                run.deliveries.requeued_stale = requeued_stale;
            }
            Err(e) => errors.push(self.run_error(None, &e)),
        }

        match self.complete_finished_campaigns().await {
            Ok(completed) => run.campaigns_completed = completed,
            Err(e) => errors.push(self.run_error(None, &e)),
        }
        run
    }

    /// Returns false when the campaign left Scheduled before we got to it.
    #[tracing::instrument(name = "Starting campaign", skip(self, campaign), fields(campaign_id = %campaign.id))]
    async fn start_campaign(&self, campaign: &Campaign) -> Result<bool, SchedulerError> {
        let started = self
            .store
            .transition_campaign(campaign.id, CampaignStatus::Scheduled, CampaignStatus::Sending, self.clock.now())
            .await?;
        if !started {
            tracing::info!("Campaign is no longer scheduled, skipping");
            return Ok(false);
        }
        self.batcher.enqueue_campaign(campaign).await?;
        Ok(true)
    }

    /// Sending campaigns with nothing left to hand to the provider are Sent.
    async fn complete_finished_campaigns(&self) -> Result<usize, SchedulerError> {
        let mut completed = 0;
        for campaign in self.store.campaigns_with_status(CampaignStatus::Sending).await? {
            if self.store.count_open(campaign.id).await? > 0 {
                continue;
            }
            if self
                .store
                .transition_campaign(campaign.id, CampaignStatus::Sending, CampaignStatus::Sent, self.clock.now())
                .await?
            {
                tracing::info!(campaign_id = %campaign.id, "Campaign sent");
                completed += 1;
            }
        }
        Ok(completed)
    }

    fn run_error(&self, campaign_id: Option<Uuid>, error: &dyn std::error::Error) -> SchedulerRunError {
        SchedulerRunError {
            campaign_id,
            message: error.to_string(),
            at: self.clock.now(),
        }
    }
}

fn next_boundary(now: DateTime<Utc>, interval_minutes: i64) -> DateTime<Utc> {
    let interval = interval_minutes * 60;
    let next = (now.timestamp() / interval + 1) * interval;
    now + Duration::seconds(next - now.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::configuration::{DeliverySettings, ThrottleSettings};
    use crate::domain::{DeliveryStatus, RecipientFilter, SubscriberEmail, SubscriptionStatus};
    use crate::email::testing::RecordingEmail;
    use crate::store::{CampaignStore, DeliveryStore, InMemoryStore, SubscriberStore};
    use crate::suppression::SuppressionRegistry;
    use crate::throttle::DomainThrottle;
    use chrono::{TimeZone, Timelike};
    use claim::{assert_matches, assert_ok};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 12, 3, 0).unwrap()
    }

    fn scheduler(store: Arc<InMemoryStore>) -> CampaignScheduler {
        let clock = Arc::new(FixedClock::new(start()));
        let suppressions = SuppressionRegistry::new(store.clone(), clock.clone(), 30, 100);
        let batcher = DeliveryBatcher::new(
            store.clone(),
            Arc::new(RecordingEmail::default()),
            suppressions,
            Arc::new(DomainThrottle::new(&ThrottleSettings::default(), start()).unwrap()),
            clock.clone(),
            DeliverySettings {
                email_send_throttle_ms: 0,
                ..DeliverySettings::default()
            },
        );
        CampaignScheduler::new(store, Arc::new(batcher), clock, 5)
    }

    fn campaign(status: CampaignStatus, scheduled_at: DateTime<Utc>) -> Campaign {
        Campaign {
            id: Uuid::new_v4(),
            title: "Weekly".into(),
            subject: "This week".into(),
            template_id: "weekly".into(),
            recipient_filter: RecipientFilter::default(),
            scheduled_at: Some(scheduled_at),
            status,
            recipient_count: 0,
            created_at: scheduled_at,
            updated_at: scheduled_at,
            sent_at: None,
        }
    }

    #[test]
    fn should_run_only_on_interval_boundaries() {
        let scheduler = scheduler(Arc::new(InMemoryStore::new()));
        assert!(!scheduler.should_run(start()));
        assert!(scheduler.should_run(start().with_minute(5).unwrap()));
        // a second tick inside the same boundary minute
        assert!(!scheduler.should_run(start().with_minute(5).unwrap().with_second(59).unwrap()));
        assert!(scheduler.should_run(start().with_minute(10).unwrap().with_second(30).unwrap()));
        assert_eq!(scheduler.get_scheduler_status().next_run_at, start().with_minute(5).unwrap());
    }

    #[tokio::test]
    async fn due_campaign_is_sent_to_every_recipient() {
        let store = Arc::new(InMemoryStore::new());
        for name in ["ann", "bob", "cid"] {
            let email = SubscriberEmail::parse(format!("{}@example.com", name)).unwrap();
            store
                .insert_subscriber(&email, name, SubscriptionStatus::Active, start())
                .await
                .unwrap();
        }
        let due = campaign(CampaignStatus::Scheduled, start() - Duration::hours(1));
        store.insert_campaign(&due).await.unwrap();
        let scheduler = scheduler(store.clone());

        let run = assert_ok!(scheduler.run_campaign_scheduler().await);

        assert_eq!(run.campaigns_started, 1);
        let campaign = store.get_campaign(due.id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Sent);
        assert_eq!(campaign.recipient_count, 3);
        let deliveries = store.campaign_deliveries(due.id).await.unwrap();
        assert_eq!(deliveries.len(), 3);
        assert!(deliveries
            .iter()
            .all(|d| matches!(d.status, DeliveryStatus::Sending | DeliveryStatus::Delivered)));

        let status = scheduler.get_scheduler_status();
        assert!(!status.is_running);
        assert_eq!(status.last_run_at, Some(start()));
        assert!(status.errors.is_empty());
    }

    #[tokio::test]
    async fn a_campaign_that_fails_to_start_does_not_hold_up_the_next() {
        let store = Arc::new(InMemoryStore::new());
        for name in ["ann", "bob"] {
            let email = SubscriberEmail::parse(format!("{}@example.com", name)).unwrap();
            store
                .insert_subscriber(&email, name, SubscriptionStatus::Active, start())
                .await
                .unwrap();
        }
        let broken = campaign(CampaignStatus::Scheduled, start() - Duration::hours(2));
        let healthy = campaign(CampaignStatus::Scheduled, start() - Duration::hours(1));
        store.insert_campaign(&broken).await.unwrap();
        store.insert_campaign(&healthy).await.unwrap();
        // the earlier campaign is started first and its recipient lookup fails
        store.fail_next("matching_subscribers", 1);
        let scheduler = scheduler(store.clone());

        let run = assert_ok!(scheduler.run_campaign_scheduler().await);

        assert_eq!((run.campaigns_started, run.campaigns_failed), (1, 1));
        let broken = store.get_campaign(broken.id).await.unwrap().unwrap();
        assert_eq!(broken.status, CampaignStatus::Failed);
        assert!(store.campaign_deliveries(broken.id).await.unwrap().is_empty());
        let healthy = store.get_campaign(healthy.id).await.unwrap().unwrap();
        assert_eq!(healthy.status, CampaignStatus::Sent);
        assert_eq!(store.campaign_deliveries(healthy.id).await.unwrap().len(), 2);
        let errors = scheduler.get_scheduler_status().errors;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].campaign_id, Some(broken.id));
    }

    #[tokio::test]
    async fn nothing_due_is_a_fast_no_op() {
        let store = Arc::new(InMemoryStore::new());
        let later = campaign(CampaignStatus::Scheduled, start() + Duration::days(1));
        store.insert_campaign(&later).await.unwrap();
        let scheduler = scheduler(store.clone());

        let run = scheduler.run_campaign_scheduler().await.unwrap();

        assert_eq!(run, SchedulerRun::default());
        assert_eq!(scheduler.get_scheduler_status().scheduled_campaigns, 1);
    }

    #[tokio::test]
    async fn a_second_trigger_during_a_pass_is_rejected() {
        let scheduler = scheduler(Arc::new(InMemoryStore::new()));
        scheduler.running.store(true, Ordering::Release);

        assert_matches!(
            scheduler.run_campaign_scheduler().await,
            Err(SchedulerError::AlreadyRunning)
        );

        scheduler.running.store(false, Ordering::Release);
        assert_ok!(scheduler.run_campaign_scheduler().await);
        assert!(!scheduler.running.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn cancelled_campaigns_are_left_alone() {
        let store = Arc::new(InMemoryStore::new());
        let draft = campaign(CampaignStatus::Draft, start() - Duration::minutes(1));
        store.insert_campaign(&draft).await.unwrap();
        let scheduler = scheduler(store.clone());

        scheduler.run_campaign_scheduler().await.unwrap();

        let stored = store.get_campaign(draft.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Draft);
        assert!(store.campaign_deliveries(draft.id).await.unwrap().is_empty());
    }
}
