use crate::clock::Clock;
use crate::configuration::WebhookSettings;
use crate::webhooks::{
    Provider, SignatureVerifier, WebhookError, WebhookHeaders, WebhookProcessor, WebhookRateLimiter, WebhookReport,
};
use std::sync::Arc;

/// The full inbound path for one provider callback.
pub struct WebhookIngest {
    limiter: WebhookRateLimiter,
    verifier: SignatureVerifier,
    processor: WebhookProcessor,
    clock: Arc<dyn Clock>,
}

impl WebhookIngest {
    pub fn new(settings: &WebhookSettings, processor: WebhookProcessor, clock: Arc<dyn Clock>) -> Self {
        Self {
            limiter: WebhookRateLimiter::new(settings.rate_limit_per_minute),
            verifier: SignatureVerifier::new(settings),
            processor,
            clock,
        }
    }

    /// Rate limit, then verify, then parse and apply. Nothing in the body is
    /// acted upon before the signature check passes.
    #[tracing::instrument(name = "Ingesting webhook", skip(self, headers, body), fields(body_len = body.len()))]
    pub async fn ingest(
        &self,
        provider: &str,
        client: &str,
        headers: &WebhookHeaders,
        body: &[u8],
    ) -> Result<WebhookReport, WebhookError> {
        let provider = Provider::try_from(provider)?;
        self.limiter
            .check(&format!("{}:{}", provider.as_str(), client))
            .map_err(|retry_after| WebhookError::RateLimited { retry_after })?;

        // Mailgun signs fields inside the JSON body, so it has to be parsed first
        let payload: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
        let now = self.clock.now();
        self.verifier.verify(provider, headers, body, &payload, now)?;

        let batch = provider.parse_events(&payload, now)?;
        let report = self.processor.process(provider, batch).await;
        tracing::info!(
            processed = report.processed,
            duplicates = report.duplicates,
            failed = report.failed,
            "Webhook batch handled"
        );
        Ok(report)
    }

    pub fn prune_rate_limits(&self) {
        self.limiter.retain_recent();
    }
}
