use crate::clock::Clock;
use crate::delivery::{DeliveryBatcher, ProcessReport};
use crate::dlq::{DeadLetterQueue, DlqActionReport, DlqError};
use crate::domain::{CampaignDelivery, SubscriberEmail, Suppression, SuppressionEntry, SuppressionReason};
use crate::guards::AuthenticatedUser;
use crate::routes::json_error;
use crate::scheduler::{CampaignScheduler, SchedulerError, SchedulerRun, SchedulerStatus};
use crate::store::{Page, QueueStats};
use crate::suppression::{BulkAddReport, SuppressionImport, SuppressionRegistry};
use crate::telemetry::error_chain_fmt;
use crate::throttle::ClassUsage;
use anyhow::Context;
use rocket::http::Status;
use rocket::response::Responder;
use rocket::serde::json::Json;
use rocket::{Request, State};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOverview {
    stats: QueueStats,
    throttle: Vec<ClassUsage>,
    warmup_cap: Option<u32>,
}

#[get("/admin/queue")]
pub async fn queue_overview(
    batcher: &State<Arc<DeliveryBatcher>>,
    clock: &State<Arc<dyn Clock>>,
    _user: AuthenticatedUser,
) -> Result<Json<QueueOverview>, AdminError> {
    let now = clock.now();
    let stats = batcher.get_stats().await.context("Failed to read queue statistics.")?;
    Ok(Json(QueueOverview {
        stats,
        throttle: batcher.throttle().usage(now),
        warmup_cap: batcher.throttle().warmup_cap(now),
    }))
}

#[tracing::instrument(name = "Processing queue on demand", skip(batcher, user), fields(username = %user.username))]
#[post("/admin/queue/process")]
pub async fn process_queue(
    batcher: &State<Arc<DeliveryBatcher>>,
    user: AuthenticatedUser,
) -> Result<Json<ProcessReport>, AdminError> {
    let report = batcher
        .process_email_queue()
        .await
        .context("Failed to process the delivery queue.")?;
    Ok(Json(report))
}

#[get("/admin/scheduler")]
pub async fn scheduler_status(
    scheduler: &State<Arc<CampaignScheduler>>,
    _user: AuthenticatedUser,
) -> Json<SchedulerStatus> {
    Json(scheduler.get_scheduler_status())
}

#[tracing::instrument(name = "Running scheduler on demand", skip(scheduler, user), fields(username = %user.username))]
#[post("/admin/scheduler/run")]
pub async fn run_scheduler(
    scheduler: &State<Arc<CampaignScheduler>>,
    user: AuthenticatedUser,
) -> Result<Json<SchedulerRun>, AdminError> {
    match scheduler.run_campaign_scheduler().await {
        Ok(run) => Ok(Json(run)),
        Err(SchedulerError::AlreadyRunning) => Err(AdminError::Conflict("A scheduler pass is already running.".into())),
        Err(e) => Err(anyhow::Error::new(e).context("Scheduler pass failed.").into()),
    }
}

#[get("/admin/dlq?<campaign_id>&<page>&<per_page>")]
pub async fn list_dead_letters(
    campaign_id: Option<Uuid>,
    page: Option<u32>,
    per_page: Option<u32>,
    dlq: &State<DeadLetterQueue>,
    _user: AuthenticatedUser,
) -> Result<Json<Page<CampaignDelivery>>, AdminError> {
    let page = dlq
        .list(campaign_id, page.unwrap_or(1), per_page.unwrap_or(20))
        .await?;
    Ok(Json(page))
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveToDlqRequest {
    campaign_id: Uuid,
    #[serde(default)]
    min_attempts: Option<i32>,
}

#[derive(Serialize)]
pub struct MovedCount {
    moved: usize,
}

#[tracing::instrument(name = "Moving failed deliveries to DLQ", skip(body, dlq, user), fields(username = %user.username))]
#[post("/admin/dlq/move", data = "<body>")]
pub async fn move_to_dlq(
    body: Json<MoveToDlqRequest>,
    dlq: &State<DeadLetterQueue>,
    user: AuthenticatedUser,
) -> Result<Json<MovedCount>, AdminError> {
    let threshold = body.min_attempts.unwrap_or_else(|| dlq.default_threshold());
    let moved = dlq.move_to_dlq(body.campaign_id, threshold, &user.username).await?;
    Ok(Json(MovedCount { moved }))
}

#[derive(serde::Deserialize)]
pub struct DeliveryIds {
    ids: Vec<Uuid>,
}

#[tracing::instrument(name = "Redriving dead letters", skip(body, dlq, user), fields(username = %user.username))]
#[post("/admin/dlq/redrive", data = "<body>")]
pub async fn redrive_dead_letters(
    body: Json<DeliveryIds>,
    dlq: &State<DeadLetterQueue>,
    user: AuthenticatedUser,
) -> Result<Json<DlqActionReport>, AdminError> {
    Ok(Json(dlq.redrive(&body.ids, &user.username).await?))
}

#[tracing::instrument(name = "Suppressing dead letters", skip(body, dlq, user), fields(username = %user.username))]
#[post("/admin/dlq/suppress", data = "<body>")]
pub async fn suppress_dead_letters(
    body: Json<DeliveryIds>,
    dlq: &State<DeadLetterQueue>,
    user: AuthenticatedUser,
) -> Result<Json<DlqActionReport>, AdminError> {
    Ok(Json(dlq.suppress(&body.ids, &user.username).await?))
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuppressionRequest {
    email: String,
    #[serde(default = "manual")]
    reason: SuppressionReason,
}

fn manual() -> SuppressionReason {
    SuppressionReason::Manual
}

#[get("/admin/suppressions/<email>")]
pub async fn get_suppression(
    email: &str,
    suppressions: &State<SuppressionRegistry>,
    _user: AuthenticatedUser,
) -> Result<Json<Suppression>, AdminError> {
    suppressions
        .get(email)
        .await
        .context("Failed to look up the suppression.")?
        .map(Json)
        .ok_or_else(|| AdminError::NotFound(format!("{} is not suppressed.", email)))
}

#[tracing::instrument(name = "Adding a suppression", skip(body, suppressions, user), fields(username = %user.username))]
#[post("/admin/suppressions", data = "<body>")]
pub async fn add_suppression(
    body: Json<SuppressionRequest>,
    suppressions: &State<SuppressionRegistry>,
    user: AuthenticatedUser,
) -> Result<(Status, Json<Suppression>), AdminError> {
    let body = body.into_inner();
    let email = SubscriberEmail::parse(body.email).map_err(AdminError::ValidationError)?;
    let entry = SuppressionEntry::new(email, body.reason).source(user.username);
    let suppression = suppressions
        .add(entry)
        .await
        .context("Failed to store the suppression.")?;
    Ok((Status::Created, Json(suppression)))
}

#[tracing::instrument(name = "Removing a suppression", skip(suppressions, user), fields(username = %user.username))]
#[delete("/admin/suppressions/<email>")]
pub async fn remove_suppression(
    email: &str,
    suppressions: &State<SuppressionRegistry>,
    user: AuthenticatedUser,
) -> Result<Status, AdminError> {
    let removed = suppressions
        .remove(email)
        .await
        .context("Failed to remove the suppression.")?;
    match removed {
        true => Ok(Status::NoContent),
        false => Err(AdminError::NotFound(format!("{} is not suppressed.", email))),
    }
}

#[tracing::instrument(name = "Importing suppressions", skip(body, suppressions, user), fields(username = %user.username, count = body.len()))]
#[post("/admin/suppressions/bulk", data = "<body>")]
pub async fn bulk_add_suppressions(
    body: Json<Vec<SuppressionImport>>,
    suppressions: &State<SuppressionRegistry>,
    user: AuthenticatedUser,
) -> Json<BulkAddReport> {
    let imports = body
        .into_inner()
        .into_iter()
        .map(|mut import| {
            import.source = import.source.or_else(|| Some(user.username.clone()));
            import
        })
        .collect();
    Json(suppressions.bulk_add(imports).await)
}

#[derive(thiserror::Error)]
pub enum AdminError {
    #[error("{0}")]
    ValidationError(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}

impl From<DlqError> for AdminError {
    fn from(e: DlqError) -> Self {
        match e {
            DlqError::InvalidThreshold(_) => AdminError::ValidationError(e.to_string()),
            DlqError::Store(_) => AdminError::UnexpectedError(anyhow::Error::new(e)),
        }
    }
}

impl std::fmt::Debug for AdminError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl<'r> Responder<'r, 'static> for AdminError {
    fn respond_to(self, _request: &'r Request<'_>) -> rocket::response::Result<'static> {
        tracing::warn!("AdminError: {:?}", self);
        let status = match self {
            AdminError::ValidationError(_) => Status::BadRequest,
            AdminError::NotFound(_) => Status::NotFound,
            AdminError::Conflict(_) => Status::Conflict,
            AdminError::UnexpectedError(_) => Status::InternalServerError,
        };
        let message = match self {
            AdminError::UnexpectedError(_) => "Internal error".to_string(),
            other => other.to_string(),
        };
        Ok(json_error(status, message))
    }
}
