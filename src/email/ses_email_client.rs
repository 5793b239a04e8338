use crate::domain::SubscriberEmail;
use crate::email::{Email, OutboundEmail, SendError, SendReceipt};
use anyhow::anyhow;
use async_trait::async_trait;
use aws_sdk_sesv2 as ses;
use aws_sdk_sesv2::error::SendEmailError;
use aws_sdk_sesv2::model::{Destination, EmailContent, MessageTag, Template};
use aws_sdk_sesv2::SdkError;

pub struct SesEmailClient {
    ses_client: ses::Client,
    sender: SubscriberEmail,
}

impl SesEmailClient {
    pub fn new(ses_client: ses::Client, sender: SubscriberEmail) -> Self {
        Self { ses_client, sender }
    }
}

#[async_trait]
impl Email for SesEmailClient {
    #[tracing::instrument(name = "Sending email through SES", skip(self, email), fields(recipient = %email.recipient))]
    async fn send_email(&self, email: &OutboundEmail) -> Result<SendReceipt, SendError> {
        let mut data = email.template_data.clone();
        if let Some(fields) = data.as_object_mut() {
            fields.insert("subject".into(), email.subject.clone().into());
        }
        let template = Template::builder()
            .template_name(&email.template_id)
            .template_data(data.to_string())
            .build();
        let content = EmailContent::builder().template(template).build();
        let destination = Destination::builder()
            .to_addresses(email.recipient.as_ref())
            .build();

        let mut request = self
            .ses_client
            .send_email()
            .from_email_address(self.sender.as_ref())
            .destination(destination)
            .content(content);
        for (name, value) in &email.tags {
            request = request.email_tags(MessageTag::builder().name(name).value(value).build());
        }

        let output = request.send().await.map_err(classify)?;
        Ok(SendReceipt {
            message_id: output.message_id,
        })
    }
}

fn classify(error: SdkError<SendEmailError>) -> SendError {
    let permanent = match &error {
        SdkError::ServiceError { err, .. } => {
            err.is_message_rejected()
                || err.is_bad_request_exception()
                || err.is_mail_from_domain_not_verified_exception()
                || err.is_not_found_exception()
        }
        _ => false,
    };
    let error = anyhow!(error.to_string());
    match permanent {
        true => SendError::Permanent(error),
        false => SendError::Transient(error),
    }
}
