use crate::domain::{CampaignDelivery, DeliveryStatus};
use crate::schema::campaign_deliveries;
use crate::store::StoreError;
use chrono::{DateTime, Utc};

#[derive(Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = campaign_deliveries, treat_none_as_null = true)]
pub struct DeliveryRow {
    pub id: uuid::Uuid,
    pub campaign_id: uuid::Uuid,
    pub email: String,
    pub status: String,
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
    pub redriven_at: Option<DateTime<Utc>>,
    pub redriven_by: Option<String>,
    pub version: i32,
}

impl TryFrom<DeliveryRow> for CampaignDelivery {
    type Error = StoreError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let status = DeliveryStatus::try_from(row.status.as_str()).map_err(StoreError::Corrupt)?;
        Ok(CampaignDelivery {
            id: row.id,
            campaign_id: row.campaign_id,
            email: row.email,
            status,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            provider_message_id: row.provider_message_id,
            last_error: row.last_error,
            queued_at: row.queued_at,
            next_attempt_at: row.next_attempt_at,
            claimed_at: row.claimed_at,
            last_attempt_at: row.last_attempt_at,
            sent_at: row.sent_at,
            delivered_at: row.delivered_at,
            opened_at: row.opened_at,
            clicked_at: row.clicked_at,
            bounced_at: row.bounced_at,
            complained_at: row.complained_at,
            failed_at: row.failed_at,
            dead_lettered_at: row.dead_lettered_at,
            dead_lettered_by: row.dead_lettered_by,
            redriven_at: row.redriven_at,
            redriven_by: row.redriven_by,
            version: row.version,
        })
    }
}

impl From<&CampaignDelivery> for DeliveryRow {
    fn from(d: &CampaignDelivery) -> Self {
        DeliveryRow {
            id: d.id,
            campaign_id: d.campaign_id,
            email: d.email.clone(),
            status: d.status.as_str().to_string(),
            attempts: d.attempts,
            max_attempts: d.max_attempts,
            provider_message_id: d.provider_message_id.clone(),
            last_error: d.last_error.clone(),
            queued_at: d.queued_at,
            next_attempt_at: d.next_attempt_at,
            claimed_at: d.claimed_at,
            last_attempt_at: d.last_attempt_at,
            sent_at: d.sent_at,
            delivered_at: d.delivered_at,
            opened_at: d.opened_at,
            clicked_at: d.clicked_at,
            bounced_at: d.bounced_at,
            complained_at: d.complained_at,
            failed_at: d.failed_at,
            dead_lettered_at: d.dead_lettered_at,
            dead_lettered_by: d.dead_lettered_by.clone(),
            redriven_at: d.redriven_at,
            redriven_by: d.redriven_by.clone(),
            version: d.version,
        }
    }
}

pub fn rows_into_deliveries(rows: Vec<DeliveryRow>) -> Result<Vec<CampaignDelivery>, StoreError> {
    rows.into_iter().map(CampaignDelivery::try_from).collect()
}
