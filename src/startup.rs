use crate::catchers::*;
use crate::clock::Clock;
use crate::configuration::Settings;
use crate::delivery::DeliveryBatcher;
use crate::dlq::DeadLetterQueue;
use crate::email::Email;
use crate::port_saver;
use crate::port_saver::Port;
use crate::routes::*;
use crate::scheduler::{CampaignScheduler, SchedulerError};
use crate::store::Store;
use crate::suppression::SuppressionRegistry;
use crate::throttle::DomainThrottle;
use crate::webhooks::{WebhookIngest, WebhookProcessor};
use anyhow::anyhow;
use chrono::Duration;
use rocket::config::LogLevel;
use rocket::{Config, Ignite, Rocket};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct Application {
    pub server: Rocket<Ignite>,
    pub port: Port,
    pub maintenance: Maintenance,
}

impl Application {
    /// Wires the delivery core together and ignites the HTTP server. The
    /// background loops are returned unstarted in `maintenance`.
    pub async fn build(
        configuration: &Settings,
        store: Arc<dyn Store>,
        email_client: Arc<dyn Email>,
        clock: Arc<dyn Clock>,
    ) -> Result<Application, anyhow::Error> {
        configuration.validate().map_err(|e| anyhow!(e))?;

        let suppressions = SuppressionRegistry::new(
            store.clone(),
            clock.clone(),
            configuration.suppression.soft_bounce_retention_days,
            configuration.suppression.bulk_batch_size,
        );
        let throttle = DomainThrottle::new(&configuration.throttle, clock.now()).map_err(|e| anyhow!(e))?;
        let batcher = Arc::new(DeliveryBatcher::new(
            store.clone(),
            email_client,
            suppressions.clone(),
            Arc::new(throttle),
            clock.clone(),
            configuration.delivery.clone(),
        ));
        let scheduler = Arc::new(CampaignScheduler::new(
            store.clone(),
            batcher.clone(),
            clock.clone(),
            configuration.scheduler.interval_minutes,
        ));
        let dlq = DeadLetterQueue::new(
            store.clone(),
            suppressions.clone(),
            clock.clone(),
            configuration.delivery.max_attempts,
        );
        let processor = WebhookProcessor::new(store.clone(), suppressions.clone(), clock.clone());
        let ingest = Arc::new(WebhookIngest::new(&configuration.webhooks, processor, clock.clone()));

        let maintenance = Maintenance {
            store: store.clone(),
            suppressions: suppressions.clone(),
            scheduler: scheduler.clone(),
            ingest: ingest.clone(),
            clock: clock.clone(),
            settings: configuration.clone(),
        };

        let (port_saver, port) = port_saver::create_pair();
        let server = rocket::custom(Config {
            address: configuration.application.host,
            port: configuration.application.port.unwrap_or(0),
            // tracing owns the logs
            log_level: LogLevel::Off,
            ..Config::debug_default()
        })
        .attach(port_saver)
        .manage(store)
        .manage(clock)
        .manage(suppressions)
        .manage(batcher)
        .manage(scheduler)
        .manage(dlq)
        .manage(ingest)
        .mount(
            "/",
            routes![
                health,
                receive_webhook,
                create_campaign,
                get_campaign,
                cancel_campaign,
                send_campaign,
                queue_overview,
                process_queue,
                scheduler_status,
                run_scheduler,
                list_dead_letters,
                move_to_dlq,
                redrive_dead_letters,
                suppress_dead_letters,
                get_suppression,
                add_suppression,
                remove_suppression,
                bulk_add_suppressions,
            ],
        )
        .register(
            "/",
            catchers![unauthorized_request_credentials, unprocessable_entity_to_bad_request],
        )
        .ignite()
        .await?;

        Ok(Application {
            server,
            port,
            maintenance,
        })
    }
}

/// Periodic work that runs next to the HTTP server.
pub struct Maintenance {
    store: Arc<dyn Store>,
    suppressions: SuppressionRegistry,
    scheduler: Arc<CampaignScheduler>,
    ingest: Arc<WebhookIngest>,
    clock: Arc<dyn Clock>,
    settings: Settings,
}

impl Maintenance {
    /// Starts the scheduler tick (when enabled) and the cleanup tick.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let maintenance = Arc::new(self);
        let mut handles = Vec::with_capacity(2);
        if maintenance.settings.scheduler.enabled {
            handles.push(tokio::spawn(maintenance.clone().scheduler_loop()));
        } else {
            tracing::info!("Campaign scheduler is disabled");
        }
        handles.push(tokio::spawn(maintenance.cleanup_loop()));
        handles
    }

    async fn scheduler_loop(self: Arc<Self>) {
        let tick = std::time::Duration::from_secs(self.settings.scheduler.tick_seconds.max(1));
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            if !self.scheduler.should_run(self.clock.now()) {
                continue;
            }
            match self.scheduler.run_campaign_scheduler().await {
                Ok(run) => tracing::info!(?run, "Scheduler pass finished"),
                Err(SchedulerError::AlreadyRunning) => tracing::debug!("Scheduler pass still running, skipping tick"),
                Err(e) => tracing::error!(error.cause_chain = ?e, "Scheduler pass failed"),
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let hours = self.settings.scheduler.cleanup_interval_hours.max(1);
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(hours * 60 * 60));
        loop {
            interval.tick().await;
            self.cleanup().await;
        }
    }

    /// Soft-bounce expiry, event retention and limiter housekeeping. Each
    /// step is independent of the others.
    #[tracing::instrument(name = "Running maintenance", skip(self))]
    pub async fn cleanup(&self) {
        match self.suppressions.cleanup_soft_bounces().await {
            Ok(removed) => tracing::info!(removed, "Expired soft-bounce suppressions"),
            Err(e) => tracing::error!(error.cause_chain = ?e, "Soft-bounce cleanup failed"),
        }
        let cutoff = self.clock.now() - Duration::days(self.settings.events.retention_days);
        match self.store.purge_events_before(cutoff).await {
            Ok(purged) => tracing::info!(purged, "Purged old webhook events"),
            Err(e) => tracing::error!(error.cause_chain = ?e, "Event purge failed"),
        }
        self.ingest.prune_rate_limits();
    }
}
