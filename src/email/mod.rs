mod ses_email_client;

use crate::domain::SubscriberEmail;
use async_trait::async_trait;
pub use ses_email_client::SesEmailClient;

/// One rendered-by-provider campaign message.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub recipient: SubscriberEmail,
    pub subject: String,
    pub template_id: String,
    pub template_data: serde_json::Value,
    /// Correlation tags echoed back by provider webhooks.
    pub tags: Vec<(String, String)>,
}

/// What the provider told us when it accepted the message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendReceipt {
    pub message_id: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum SendError {
    /// Timeouts, throttling and provider-side outages.
    #[error("Transient send failure: {0}")]
    Transient(#[source] anyhow::Error),
    /// The provider refused this message and will keep refusing it.
    #[error("Permanent send failure: {0}")]
    Permanent(#[source] anyhow::Error),
}

#[async_trait]
pub trait Email: Send + Sync {
    async fn send_email(&self, email: &OutboundEmail) -> Result<SendReceipt, SendError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::domain::AttemptFailure;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Accepts everything except the recipients it was told to refuse.
    #[derive(Default)]
    pub struct RecordingEmail {
        sent: Mutex<Vec<OutboundEmail>>,
        failures: Mutex<HashMap<String, AttemptFailure>>,
    }

    impl RecordingEmail {
        pub fn fail_for(&self, recipient: &str, failure: AttemptFailure) {
            self.failures
                .lock()
                .unwrap()
                .insert(recipient.to_string(), failure);
        }

        pub fn sent_to(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.recipient.as_ref().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl Email for RecordingEmail {
        async fn send_email(&self, email: &OutboundEmail) -> Result<SendReceipt, SendError> {
            let failure = self
                .failures
                .lock()
                .unwrap()
                .get(email.recipient.as_ref())
                .copied();
            self.sent.lock().unwrap().push(email.clone());
            match failure {
                Some(AttemptFailure::Transient) => Err(SendError::Transient(anyhow::anyhow!("503"))),
                Some(AttemptFailure::Permanent) => Err(SendError::Permanent(anyhow::anyhow!("550"))),
                None => Ok(SendReceipt {
                    message_id: Some(format!("msg-{}", email.recipient)),
                }),
            }
        }
    }
}
