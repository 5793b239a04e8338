use crate::routes::json_error;
use crate::webhooks::{WebhookError, WebhookHeaders, WebhookIngest};
use rocket::data::{Data, ToByteUnit};
use rocket::http::{Header, Status};
use rocket::request::{FromRequest, Outcome};
use rocket::response::Responder;
use rocket::serde::json::Json;
use rocket::{Request, State};
use serde::Serialize;
use std::sync::Arc;

/// Largest callback body accepted. SendGrid batches are the big ones.
const MAX_BODY: u64 = 2;

/// Headers and caller address of an inbound callback.
pub struct WebhookOrigin {
    headers: WebhookHeaders,
    client: String,
}

#[async_trait]
impl<'r> FromRequest<'r> for WebhookOrigin {
    type Error = std::convert::Infallible;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let mut headers = WebhookHeaders::default();
        for header in request.headers().iter() {
            headers.insert(header.name.as_str(), header.value());
        }
        let client = request
            .client_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".into());
        Outcome::Success(WebhookOrigin { headers, client })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    success: bool,
    processed: usize,
    message: String,
}

#[tracing::instrument(name = "Receiving provider webhook", skip(origin, body, ingest), fields(client = %origin.client))]
#[post("/webhooks?<provider>", data = "<body>")]
pub async fn receive_webhook(
    provider: &str,
    origin: WebhookOrigin,
    body: Data<'_>,
    ingest: &State<Arc<WebhookIngest>>,
) -> Result<Json<WebhookAck>, WebhookError> {
    let body = body
        .open(MAX_BODY.mebibytes())
        .into_bytes()
        .await
        .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
    if !body.is_complete() {
        return Err(WebhookError::MalformedPayload("body too large".into()));
    }
    let report = ingest.ingest(provider, &origin.client, &origin.headers, &body).await?;
    Ok(Json(WebhookAck {
        success: true,
        processed: report.processed,
        message: format!(
            "{} received, {} processed, {} duplicate, {} skipped, {} failed",
            report.received, report.processed, report.duplicates, report.skipped, report.failed
        ),
    }))
}

impl<'r> Responder<'r, 'static> for WebhookError {
    fn respond_to(self, _request: &'r Request<'_>) -> rocket::response::Result<'static> {
        tracing::warn!("WebhookError: {:?}", self);
        let status = match &self {
            WebhookError::InvalidSignature | WebhookError::ReplayWindowExpired | WebhookError::NotConfigured(_) => {
                Status::Unauthorized
            }
            WebhookError::RateLimited { .. } => Status::TooManyRequests,
            WebhookError::UnknownProvider(_) | WebhookError::MalformedPayload(_) => Status::BadRequest,
        };
        // never echo verification details back to the caller
        let message = if status == Status::Unauthorized {
            "Unauthorized".to_string()
        } else {
            self.to_string()
        };
        let mut response = json_error(status, message);
        if let WebhookError::RateLimited { retry_after } = self {
            let seconds = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response.set_header(Header::new("Retry-After", seconds.max(1).to_string()));
        }
        Ok(response)
    }
}
