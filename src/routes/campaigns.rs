use crate::clock::Clock;
use crate::domain::{Campaign, CampaignStatus, NewCampaign, RecipientFilter};
use crate::guards::AuthenticatedUser;
use crate::routes::json_error;
use crate::store::Store;
use crate::telemetry::error_chain_fmt;
use anyhow::Context;
use chrono::{DateTime, Utc};
use rocket::http::Status;
use rocket::response::Responder;
use rocket::serde::json::Json;
use rocket::{Request, State};
use std::sync::Arc;
use uuid::Uuid;

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignRequest {
    title: String,
    subject: String,
    template_id: String,
    #[serde(default)]
    scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    recipient_filter: Option<RecipientFilter>,
}

impl TryFrom<CampaignRequest> for NewCampaign {
    type Error = String;

    fn try_from(body: CampaignRequest) -> Result<Self, Self::Error> {
        NewCampaign::parse(
            body.title,
            body.subject,
            body.template_id,
            body.scheduled_at,
            body.recipient_filter,
        )
    }
}

#[tracing::instrument(
    name = "Creating a campaign",
    skip(body, store, clock, user),
    fields(username = %user.username, title = %body.title)
)]
#[post("/campaigns", data = "<body>")]
pub async fn create_campaign(
    body: Json<CampaignRequest>,
    store: &State<Arc<dyn Store>>,
    clock: &State<Arc<dyn Clock>>,
    user: AuthenticatedUser,
) -> Result<(Status, Json<Campaign>), CampaignError> {
    let new_campaign: NewCampaign = body.into_inner().try_into().map_err(CampaignError::ValidationError)?;
    let campaign = new_campaign.into_campaign(clock.now());
    store
        .insert_campaign(&campaign)
        .await
        .context("Failed to store the new campaign.")?;
    tracing::info!(campaign_id = %campaign.id, status = campaign.status.as_str(), "Campaign created");
    Ok((Status::Created, Json(campaign)))
}

#[get("/campaigns/<id>")]
pub async fn get_campaign(
    id: Uuid,
    store: &State<Arc<dyn Store>>,
    _user: AuthenticatedUser,
) -> Result<Json<Campaign>, CampaignError> {
    let campaign = load(store, id).await?;
    Ok(Json(campaign))
}

/// Scheduled -> Draft. A campaign that already started sending cannot be
/// cancelled.
#[tracing::instrument(name = "Cancelling a campaign", skip(store, clock, user), fields(username = %user.username))]
#[post("/campaigns/<id>/cancel")]
pub async fn cancel_campaign(
    id: Uuid,
    store: &State<Arc<dyn Store>>,
    clock: &State<Arc<dyn Clock>>,
    user: AuthenticatedUser,
) -> Result<Json<Campaign>, CampaignError> {
    let cancelled = store
        .transition_campaign(id, CampaignStatus::Scheduled, CampaignStatus::Draft, clock.now())
        .await
        .context("Failed to cancel the campaign.")?;
    let campaign = load(store, id).await?;
    if !cancelled {
        return Err(CampaignError::Conflict(format!(
            "A {} campaign cannot be cancelled.",
            campaign.status.as_str()
        )));
    }
    Ok(Json(campaign))
}

/// Makes the campaign due now; the next scheduler pass starts it.
#[tracing::instrument(name = "Sending a campaign now", skip(store, clock, user), fields(username = %user.username))]
#[post("/campaigns/<id>/send")]
pub async fn send_campaign(
    id: Uuid,
    store: &State<Arc<dyn Store>>,
    clock: &State<Arc<dyn Clock>>,
    user: AuthenticatedUser,
) -> Result<Json<Campaign>, CampaignError> {
    let now = clock.now();
    let scheduled = store
        .schedule_campaign(id, now, now)
        .await
        .context("Failed to schedule the campaign.")?;
    let campaign = load(store, id).await?;
    if !scheduled {
        return Err(CampaignError::Conflict(format!(
            "A {} campaign cannot be sent again.",
            campaign.status.as_str()
        )));
    }
    Ok(Json(campaign))
}

async fn load(store: &State<Arc<dyn Store>>, id: Uuid) -> Result<Campaign, CampaignError> {
    store
        .get_campaign(id)
        .await
        .context("Failed to load the campaign.")?
        .ok_or(CampaignError::NotFound(id))
}

#[derive(thiserror::Error)]
pub enum CampaignError {
    #[error("{0}")]
    ValidationError(String),
    #[error("Campaign {0} does not exist.")]
    NotFound(Uuid),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}

impl std::fmt::Debug for CampaignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl<'r> Responder<'r, 'static> for CampaignError {
    fn respond_to(self, _request: &'r Request<'_>) -> rocket::response::Result<'static> {
        tracing::warn!("CampaignError: {:?}", self);
        let status = match self {
            CampaignError::ValidationError(_) => Status::BadRequest,
            CampaignError::NotFound(_) => Status::NotFound,
            CampaignError::Conflict(_) => Status::Conflict,
            CampaignError::UnexpectedError(_) => Status::InternalServerError,
        };
        let message = match self {
            CampaignError::UnexpectedError(_) => "Internal error".to_string(),
            other => other.to_string(),
        };
        Ok(json_error(status, message))
    }
}
