use crate::configuration::DatabaseSettings;
use crate::domain::{
    Campaign, CampaignDelivery, CampaignStatus, DeliveryStatus, NewsletterEvent, RecipientFilter,
    SubscriberEmail, SubscriptionStatus, Suppression, SuppressionEntry, SuppressionReason,
};
use crate::models::*;
use crate::schema::campaign_deliveries as cd;
use crate::schema::{campaigns, newsletter_events, subscriptions, suppressions, users};
use crate::store::{
    CampaignStore, DeadLetterQuery, DeliveryStore, EventStore, Page, QueueStats, StoreError,
    SubscriberStore, SuppressionStore, UserStore,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use secrecy::ExposeSecret;
use std::collections::HashSet;
use uuid::Uuid;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

/// Postgres bind parameters are capped at 65535 per statement.
const INSERT_CHUNK: usize = 500;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn connect(settings: &DatabaseSettings) -> Result<Self, StoreError> {
        let manager =
            ConnectionManager::<PgConnection>::new(settings.connection_string().expose_secret());
        let pool = Pool::builder()
            .max_size(settings.max_connections)
            .build(manager)?;
        Ok(Self::new(pool))
    }

    #[tracing::instrument(name = "Running pending migrations", skip(self))]
    pub async fn run_migrations(&self) -> Result<(), anyhow::Error> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .context("Failed to get a connection to run migrations.")?;
            conn.run_pending_migrations(MIGRATIONS)
                .map(|_| ())
                .map_err(|e| anyhow!(e))
        })
        .await
        .context("Migration task panicked.")?
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut PgConnection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

fn load_deliveries<'a>(
    query: cd::BoxedQuery<'a, Pg>,
    conn: &mut PgConnection,
) -> Result<Vec<CampaignDelivery>, StoreError> {
    let rows = query.load::<DeliveryRow>(conn)?;
    rows_into_deliveries(rows)
}

fn dead_letter_filter<'a>(campaign_id: Option<Uuid>) -> cd::BoxedQuery<'a, Pg> {
    let mut query = cd::table
        .filter(cd::status.eq(DeliveryStatus::Failed.as_str()))
        .filter(
            cd::attempts
                .ge(cd::max_attempts)
                .or(cd::dead_lettered_at.is_not_null()),
        )
        .into_boxed();
    if let Some(campaign_id) = campaign_id {
        query = query.filter(cd::campaign_id.eq(campaign_id));
    }
    query
}

#[async_trait]
impl CampaignStore for PgStore {
    #[tracing::instrument(name = "Saving new campaign", skip(self, campaign), fields(campaign_id = %campaign.id))]
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        let row = CampaignRow::try_from(campaign)?;
        self.run(move |conn| {
            diesel::insert_into(campaigns::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError> {
        self.run(move |conn| {
            campaigns::table
                .find(id)
                .select(CampaignRow::as_select())
                .first(conn)
                .optional()?
                .map(Campaign::try_from)
                .transpose()
        })
        .await
    }

    #[tracing::instrument(name = "Fetching due campaigns", skip(self))]
    async fn due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>, StoreError> {
        self.run(move |conn| {
            campaigns::table
                .filter(campaigns::status.eq(CampaignStatus::Scheduled.as_str()))
                .filter(campaigns::scheduled_at.le(now))
                .order(campaigns::scheduled_at.asc())
                .select(CampaignRow::as_select())
                .load(conn)?
                .into_iter()
                .map(Campaign::try_from)
                .collect()
        })
        .await
    }

    async fn count_scheduled(&self) -> Result<u64, StoreError> {
        self.run(|conn| {
            let count: i64 = campaigns::table
                .filter(campaigns::status.eq(CampaignStatus::Scheduled.as_str()))
                .count()
                .get_result(conn)?;
            Ok(count as u64)
        })
        .await
    }

    async fn campaigns_with_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>, StoreError> {
        self.run(move |conn| {
            campaigns::table
                .filter(campaigns::status.eq(status.as_str()))
                .select(CampaignRow::as_select())
                .load(conn)?
                .into_iter()
                .map(Campaign::try_from)
                .collect()
        })
        .await
    }

    #[tracing::instrument(name = "Transitioning campaign", skip(self))]
    async fn transition_campaign(
        &self,
        id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        self.run(move |conn| {
            let target = campaigns::table
                .filter(campaigns::id.eq(id))
                .filter(campaigns::status.eq(from.as_str()));
            let updated = if to == CampaignStatus::Sent {
                diesel::update(target)
                    .set((
                        campaigns::status.eq(to.as_str()),
                        campaigns::updated_at.eq(now),
                        campaigns::sent_at.eq(Some(now)),
                    ))
                    .execute(conn)?
            } else {
                diesel::update(target)
                    .set((
                        campaigns::status.eq(to.as_str()),
                        campaigns::updated_at.eq(now),
                    ))
                    .execute(conn)?
            };
            Ok(updated == 1)
        })
        .await
    }

    async fn schedule_campaign(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let updated = diesel::update(
                campaigns::table.filter(campaigns::id.eq(id)).filter(
                    campaigns::status.eq_any(vec![
                        CampaignStatus::Draft.as_str(),
                        CampaignStatus::Scheduled.as_str(),
                    ]),
                ),
            )
            .set((
                campaigns::status.eq(CampaignStatus::Scheduled.as_str()),
                campaigns::scheduled_at.eq(Some(at)),
                campaigns::updated_at.eq(now),
            ))
            .execute(conn)?;
            Ok(updated == 1)
        })
        .await
    }

    async fn set_recipient_count(&self, id: Uuid, count: i32, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.run(move |conn| {
            diesel::update(campaigns::table.find(id))
                .set((
                    campaigns::recipient_count.eq(count),
                    campaigns::updated_at.eq(now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SubscriberStore for PgStore {
    #[tracing::instrument(name = "Saving new subscriber details in the database", skip(self, name))]
    async fn insert_subscriber(
        &self,
        email: &SubscriberEmail,
        name: &str,
        status: SubscriptionStatus,
        subscribed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let email = email.as_ref().to_string();
        let name = name.to_string();
        self.run(move |conn| {
            diesel::insert_into(subscriptions::table)
                .values(NewSubscription {
                    id: &Uuid::new_v4(),
                    email: &email,
                    name: &name,
                    subscribed_at: &subscribed_at,
                    status: status.as_str(),
                })
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    #[tracing::instrument(name = "Resolving recipient filter", skip(self))]
    async fn matching_subscribers(&self, filter: &RecipientFilter) -> Result<Vec<String>, StoreError> {
        let filter = filter.clone();
        self.run(move |conn| {
            let statuses: Vec<&'static str> = filter.statuses.iter().map(|s| s.as_str()).collect();
            let mut query = subscriptions::table
                .select(subscriptions::email)
                .filter(subscriptions::status.eq_any(statuses))
                .into_boxed();
            if let Some(after) = filter.subscribed_after {
                query = query.filter(subscriptions::subscribed_at.ge(after));
            }
            if let Some(before) = filter.subscribed_before {
                query = query.filter(subscriptions::subscribed_at.le(before));
            }
            Ok(query.order(subscriptions::email.asc()).load::<String>(conn)?)
        })
        .await
    }

    async fn subscription_status(&self, email: &str) -> Result<Option<SubscriptionStatus>, StoreError> {
        let email = email.to_string();
        self.run(move |conn| {
            subscriptions::table
                .select(subscriptions::status)
                .filter(subscriptions::email.eq(email))
                .first::<String>(conn)
                .optional()?
                .map(|s| SubscriptionStatus::try_from(s.as_str()).map_err(StoreError::Corrupt))
                .transpose()
        })
        .await
    }

    async fn set_subscription_status(
        &self,
        email: &str,
        status: SubscriptionStatus,
        unsubscribed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let email = email.to_string();
        self.run(move |conn| {
            let updated = diesel::update(subscriptions::table.filter(subscriptions::email.eq(email)))
                .set((
                    subscriptions::status.eq(status.as_str()),
                    subscriptions::unsubscribed_at.eq(unsubscribed_at),
                ))
                .execute(conn)?;
            Ok(updated > 0)
        })
        .await
    }
}

#[async_trait]
impl DeliveryStore for PgStore {
    #[tracing::instrument(name = "Queueing deliveries", skip(self, emails), fields(recipients = emails.len()))]
    async fn insert_deliveries(
        &self,
        campaign_id: Uuid,
        emails: &[SubscriberEmail],
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let rows: Vec<DeliveryRow> = emails
            .iter()
            .map(|email| {
                let delivery =
                    CampaignDelivery::new(campaign_id, email.as_ref().to_string(), max_attempts, now);
                DeliveryRow::from(&delivery)
            })
            .collect();
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let mut inserted = 0;
                for chunk in rows.chunks(INSERT_CHUNK) {
                    inserted += diesel::insert_into(cd::table)
                        .values(chunk)
                        .on_conflict((cd::campaign_id, cd::email))
                        .do_nothing()
                        .execute(conn)?;
                }
                Ok(inserted)
            })
        })
        .await
    }

    #[tracing::instrument(name = "Claiming queued deliveries", skip(self))]
    async fn claim_ready(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<CampaignDelivery>, StoreError> {
        self.run(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let rows = cd::table
                    .filter(cd::status.eq(DeliveryStatus::Queued.as_str()))
                    .filter(cd::next_attempt_at.le(now))
                    .order((cd::next_attempt_at.asc(), cd::queued_at.asc()))
                    .limit(limit as i64)
                    .select(DeliveryRow::as_select())
                    .for_update()
                    .skip_locked()
                    .load::<DeliveryRow>(conn)?;
                let mut claimed = Vec::with_capacity(rows.len());
                for row in rows {
                    let mut delivery = CampaignDelivery::try_from(row)?;
                    delivery.claim(now)?;
                    delivery.version += 1;
                    diesel::update(cd::table.find(delivery.id))
                        .set(&DeliveryRow::from(&delivery))
                        .execute(conn)?;
                    claimed.push(delivery);
                }
                Ok(claimed)
            })
        })
        .await
    }

    async fn save_delivery(&self, delivery: &mut CampaignDelivery) -> Result<bool, StoreError> {
        let mut row = DeliveryRow::from(&*delivery);
        let expected = row.version;
        row.version += 1;
        let saved = self
            .run(move |conn| {
                let updated = diesel::update(
                    cd::table
                        .filter(cd::id.eq(row.id))
                        .filter(cd::version.eq(expected)),
                )
                .set(&row)
                .execute(conn)?;
                Ok(updated == 1)
            })
            .await?;
        if saved {
            delivery.version += 1;
        }
        Ok(saved)
    }

    async fn get_delivery(&self, id: Uuid) -> Result<Option<CampaignDelivery>, StoreError> {
        self.run(move |conn| {
            cd::table
                .find(id)
                .select(DeliveryRow::as_select())
                .first(conn)
                .optional()?
                .map(CampaignDelivery::try_from)
                .transpose()
        })
        .await
    }

    async fn find_delivery(&self, campaign_id: Uuid, email: &str) -> Result<Option<CampaignDelivery>, StoreError> {
        let email = email.to_string();
        self.run(move |conn| {
            cd::table
                .filter(cd::campaign_id.eq(campaign_id))
                .filter(cd::email.eq(email))
                .select(DeliveryRow::as_select())
                .first(conn)
                .optional()?
                .map(CampaignDelivery::try_from)
                .transpose()
        })
        .await
    }

    async fn find_delivery_by_message_id(&self, message_id: &str) -> Result<Option<CampaignDelivery>, StoreError> {
        let message_id = message_id.to_string();
        self.run(move |conn| {
            cd::table
                .filter(cd::provider_message_id.eq(message_id))
                .select(DeliveryRow::as_select())
                .first(conn)
                .optional()?
                .map(CampaignDelivery::try_from)
                .transpose()
        })
        .await
    }

    async fn campaign_deliveries(&self, campaign_id: Uuid) -> Result<Vec<CampaignDelivery>, StoreError> {
        self.run(move |conn| {
            let query = cd::table
                .filter(cd::campaign_id.eq(campaign_id))
                .order(cd::email.asc())
                .into_boxed();
            load_deliveries(query, conn)
        })
        .await
    }

    async fn stale_deliveries(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<CampaignDelivery>, StoreError> {
        self.run(move |conn| {
            let query = cd::table
                .filter(cd::status.eq(DeliveryStatus::Sending.as_str()))
                .filter(cd::sent_at.is_null())
                .filter(cd::claimed_at.le(cutoff))
                .limit(limit as i64)
                .into_boxed();
            load_deliveries(query, conn)
        })
        .await
    }

    async fn failed_deliveries(&self, campaign_id: Uuid, min_attempts: i32) -> Result<Vec<CampaignDelivery>, StoreError> {
        self.run(move |conn| {
            let query = cd::table
                .filter(cd::campaign_id.eq(campaign_id))
                .filter(cd::status.eq(DeliveryStatus::Failed.as_str()))
                .filter(cd::attempts.ge(min_attempts))
                .filter(cd::dead_lettered_at.is_null())
                .into_boxed();
            load_deliveries(query, conn)
        })
        .await
    }

    #[tracing::instrument(name = "Listing dead letters", skip(self))]
    async fn dead_letters(&self, query: DeadLetterQuery) -> Result<Page<CampaignDelivery>, StoreError> {
        self.run(move |conn| {
            let total: i64 = dead_letter_filter(query.campaign_id).count().get_result(conn)?;
            let page_query = dead_letter_filter(query.campaign_id)
                .order((cd::failed_at.desc(), cd::email.asc()))
                .offset(Page::<CampaignDelivery>::offset(query.page, query.per_page) as i64)
                .limit(i64::from(query.per_page));
            Ok(Page {
                items: load_deliveries(page_query, conn)?,
                total: total as u64,
                page: query.page.max(1),
                per_page: query.per_page,
            })
        })
        .await
    }

    async fn count_open(&self, campaign_id: Uuid) -> Result<u64, StoreError> {
        self.run(move |conn| {
            let count: i64 = cd::table
                .filter(cd::campaign_id.eq(campaign_id))
                .filter(
                    cd::status.eq(DeliveryStatus::Queued.as_str()).or(cd::status
                        .eq(DeliveryStatus::Sending.as_str())
                        .and(cd::sent_at.is_null())),
                )
                .count()
                .get_result(conn)?;
            Ok(count as u64)
        })
        .await
    }

    async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        #[derive(QueryableByName)]
        struct StatusCount {
            #[diesel(sql_type = diesel::sql_types::Text)]
            status: String,
            #[diesel(sql_type = diesel::sql_types::Bool)]
            unsent: bool,
            #[diesel(sql_type = diesel::sql_types::BigInt)]
            n: i64,
        }

        self.run(|conn| {
            let counts: Vec<StatusCount> = diesel::sql_query(
                "SELECT status, (sent_at IS NULL) AS unsent, COUNT(*) AS n \
                 FROM campaign_deliveries GROUP BY 1, 2",
            )
            .load(conn)?;
            let dead_lettered: i64 = dead_letter_filter(None).count().get_result(conn)?;

            let mut stats = QueueStats {
                dead_lettered: dead_lettered as u64,
                ..QueueStats::default()
            };
            for count in counts {
                let n = count.n as u64;
                match DeliveryStatus::try_from(count.status.as_str()).map_err(StoreError::Corrupt)? {
                    DeliveryStatus::Queued => stats.queued += n,
                    DeliveryStatus::Sending if count.unsent => stats.in_flight += n,
                    DeliveryStatus::Sending => stats.awaiting_outcome += n,
                    DeliveryStatus::Delivered => stats.delivered += n,
                    DeliveryStatus::Bounced => stats.bounced += n,
                    DeliveryStatus::Complained => stats.complained += n,
                    DeliveryStatus::Failed => stats.failed += n,
                }
            }
            Ok(stats)
        })
        .await
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn insert_event(&self, event: &NewsletterEvent) -> Result<bool, StoreError> {
        let row = EventRow::from(event);
        self.run(move |conn| {
            let inserted = diesel::insert_into(newsletter_events::table)
                .values(&row)
                .on_conflict((newsletter_events::provider, newsletter_events::provider_event_id))
                .do_nothing()
                .execute(conn)?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn delete_event(&self, provider: &str, provider_event_id: &str) -> Result<bool, StoreError> {
        let provider = provider.to_string();
        let provider_event_id = provider_event_id.to_string();
        self.run(move |conn| {
            let deleted = diesel::delete(
                newsletter_events::table
                    .filter(newsletter_events::provider.eq(provider))
                    .filter(newsletter_events::provider_event_id.eq(provider_event_id)),
            )
            .execute(conn)?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn events_for(&self, email: &str) -> Result<Vec<NewsletterEvent>, StoreError> {
        let email = email.to_string();
        self.run(move |conn| {
            let rows = newsletter_events::table
                .filter(newsletter_events::email.eq(email))
                .order(newsletter_events::occurred_at.asc())
                .select(EventRow::as_select())
                .load(conn)?;
            Ok(rows.into_iter().map(NewsletterEvent::from).collect())
        })
        .await
    }

    #[tracing::instrument(name = "Purging old newsletter events", skip(self))]
    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.run(move |conn| {
            let deleted = diesel::delete(
                newsletter_events::table.filter(newsletter_events::created_at.lt(cutoff)),
            )
            .execute(conn)?;
            Ok(deleted as u64)
        })
        .await
    }
}

#[async_trait]
impl SuppressionStore for PgStore {
    #[tracing::instrument(name = "Upserting suppression", skip(self, entry), fields(email = %entry.email))]
    async fn upsert_suppression(&self, entry: &SuppressionEntry, now: DateTime<Utc>) -> Result<Suppression, StoreError> {
        let entry = entry.clone();
        self.run(move |conn| {
            let changes = SuppressionChanges {
                reason: entry.reason.as_str(),
                source: entry.source.as_deref(),
                bounce_type: entry.bounce_type.as_deref(),
                error_code: entry.error_code.as_deref(),
                error_message: entry.error_message.as_deref(),
                updated_at: &now,
            };
            let row: SuppressionRow = diesel::insert_into(suppressions::table)
                .values(NewSuppression {
                    email: entry.email.as_ref(),
                    changes,
                    created_at: &now,
                })
                .on_conflict(suppressions::email)
                .do_update()
                .set(changes)
                .get_result(conn)?;
            Suppression::try_from(row)
        })
        .await
    }

    async fn delete_suppression(&self, email: &str) -> Result<bool, StoreError> {
        let email = email.to_string();
        self.run(move |conn| {
            let deleted = diesel::delete(suppressions::table.find(email)).execute(conn)?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn get_suppression(&self, email: &str) -> Result<Option<Suppression>, StoreError> {
        let email = email.to_string();
        self.run(move |conn| {
            suppressions::table
                .find(email)
                .select(SuppressionRow::as_select())
                .first(conn)
                .optional()?
                .map(Suppression::try_from)
                .transpose()
        })
        .await
    }

    async fn suppressed_among(&self, emails: &[String]) -> Result<HashSet<String>, StoreError> {
        if emails.is_empty() {
            return Ok(HashSet::new());
        }
        let emails = emails.to_vec();
        self.run(move |conn| {
            let found = suppressions::table
                .select(suppressions::email)
                .filter(suppressions::email.eq_any(emails))
                .load::<String>(conn)?;
            Ok(found.into_iter().collect())
        })
        .await
    }

    #[tracing::instrument(name = "Deleting expired soft bounces", skip(self))]
    async fn delete_soft_bounces_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.run(move |conn| {
            let deleted = diesel::delete(
                suppressions::table
                    .filter(suppressions::reason.eq(SuppressionReason::SoftBounce.as_str()))
                    .filter(suppressions::updated_at.lt(cutoff)),
            )
            .execute(conn)?;
            Ok(deleted as u64)
        })
        .await
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn insert_user(&self, username: &str, password_hash: &str) -> Result<Uuid, StoreError> {
        let username = username.to_string();
        let password_hash = password_hash.to_string();
        self.run(move |conn| {
            let user_id = Uuid::new_v4();
            diesel::insert_into(users::table)
                .values(NewUser {
                    user_id: &user_id,
                    username: &username,
                    password_hash: &password_hash,
                })
                .execute(conn)?;
            Ok(user_id)
        })
        .await
    }

    async fn get_credentials(&self, username: &str) -> Result<Option<(Uuid, String)>, StoreError> {
        let username = username.to_string();
        self.run(move |conn| {
            let user = users::table
                .select((users::user_id, users::password_hash))
                .filter(users::username.eq(username))
                .first::<User>(conn)
                .optional()?;
            Ok(user.map(|u| (u.user_id, u.password_hash)))
        })
        .await
    }
}
