use crate::domain::{Campaign, CampaignStatus};
use crate::schema::campaigns;
use crate::store::StoreError;
use chrono::{DateTime, Utc};

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = campaigns)]
pub struct CampaignRow {
    pub id: uuid::Uuid,
    pub title: String,
    pub subject: String,
    pub template_id: String,
    pub recipient_filter: serde_json::Value,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: String,
    pub recipient_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = StoreError;

    fn try_from(row: CampaignRow) -> Result<Self, Self::Error> {
        let status = CampaignStatus::try_from(row.status.as_str()).map_err(StoreError::Corrupt)?;
        let recipient_filter = serde_json::from_value(row.recipient_filter)
            .map_err(|e| StoreError::Corrupt(format!("campaign {} filter: {}", row.id, e)))?;
        Ok(Campaign {
            id: row.id,
            title: row.title,
            subject: row.subject,
            template_id: row.template_id,
            recipient_filter,
            scheduled_at: row.scheduled_at,
            status,
            recipient_count: row.recipient_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
            sent_at: row.sent_at,
        })
    }
}

impl TryFrom<&Campaign> for CampaignRow {
    type Error = StoreError;

    fn try_from(campaign: &Campaign) -> Result<Self, Self::Error> {
        let recipient_filter = serde_json::to_value(&campaign.recipient_filter)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(CampaignRow {
            id: campaign.id,
            title: campaign.title.clone(),
            subject: campaign.subject.clone(),
            template_id: campaign.template_id.clone(),
            recipient_filter,
            scheduled_at: campaign.scheduled_at,
            status: campaign.status.as_str().to_string(),
            recipient_count: campaign.recipient_count,
            created_at: campaign.created_at,
            updated_at: campaign.updated_at,
            sent_at: campaign.sent_at,
        })
    }
}
