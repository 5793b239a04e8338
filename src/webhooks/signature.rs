//! Origin checks for inbound provider callbacks.

use crate::configuration::WebhookSettings;
use crate::guards::BasicAuth;
use crate::webhooks::{Provider, WebhookError};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

pub const SENDGRID_SIGNATURE_HEADER: &str = "x-twilio-email-event-webhook-signature";
pub const SENDGRID_TIMESTAMP_HEADER: &str = "x-twilio-email-event-webhook-timestamp";
pub const SVIX_ID_HEADER: &str = "svix-id";
pub const SVIX_TIMESTAMP_HEADER: &str = "svix-timestamp";
pub const SVIX_SIGNATURE_HEADER: &str = "svix-signature";

/// Request headers with lower-cased names.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders(HashMap<String, String>);

impl WebhookHeaders {
    pub fn insert(&mut self, name: &str, value: &str) {
        self.0.insert(name.to_lowercase(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_lowercase()).map(String::as_str)
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for WebhookHeaders {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut headers = WebhookHeaders::default();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

pub struct SignatureVerifier {
    sendgrid_secret: Option<Secret<String>>,
    mailgun_signing_key: Option<Secret<String>>,
    postmark_username: Option<String>,
    postmark_password: Option<Secret<String>>,
    resend_secret: Option<Secret<String>>,
    replay_tolerance: Option<Duration>,
}

impl SignatureVerifier {
    pub fn new(settings: &WebhookSettings) -> Self {
        Self {
            sendgrid_secret: settings.sendgrid_secret.clone(),
            mailgun_signing_key: settings.mailgun_signing_key.clone(),
            postmark_username: settings.postmark_username.clone(),
            postmark_password: settings.postmark_password.clone(),
            resend_secret: settings.resend_secret.clone(),
            replay_tolerance: settings.replay_tolerance_secs.map(Duration::seconds),
        }
    }

    /// Fails closed: a provider without configured credentials is rejected.
    pub fn verify(
        &self,
        provider: Provider,
        headers: &WebhookHeaders,
        body: &[u8],
        payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        match provider {
            Provider::SendGrid => {
                let secret = configured(&self.sendgrid_secret, provider)?;
                let signature = header(headers, SENDGRID_SIGNATURE_HEADER)?;
                let timestamp = header(headers, SENDGRID_TIMESTAMP_HEADER)?;
                self.check_timestamp(timestamp, now)?;
                let expected = decode_base64(signature)?;
                let mut mac = new_mac(secret.as_bytes())?;
                mac.update(timestamp.as_bytes());
                mac.update(body);
                mac.verify_slice(&expected)
                    .map_err(|_| WebhookError::InvalidSignature)
            }
            Provider::Mailgun => {
                let key = configured(&self.mailgun_signing_key, provider)?;
                let signature = &payload["signature"];
                let timestamp = json_str(&signature["timestamp"])?;
                let token = json_str(&signature["token"])?;
                let expected = hex::decode(json_str(&signature["signature"])?)
                    .map_err(|_| WebhookError::InvalidSignature)?;
                self.check_timestamp(&timestamp, now)?;
                let mut mac = new_mac(key.as_bytes())?;
                mac.update(timestamp.as_bytes());
                mac.update(token.as_bytes());
                mac.verify_slice(&expected)
                    .map_err(|_| WebhookError::InvalidSignature)
            }
            Provider::Postmark => {
                let (username, password) = match (&self.postmark_username, &self.postmark_password) {
                    (Some(username), Some(password)) => (username, password),
                    _ => return Err(WebhookError::NotConfigured(provider.as_str())),
                };
                let credentials = BasicAuth::decode(header(headers, "authorization")?)
                    .map_err(|_| WebhookError::InvalidSignature)?;
                // both halves are always compared
                let username_ok = secrets_match(credentials.username(), username);
                let password_ok = secrets_match(credentials.password().expose_secret(), password.expose_secret());
                match username_ok & password_ok {
                    true => Ok(()),
                    false => Err(WebhookError::InvalidSignature),
                }
            }
            Provider::Resend => {
                let secret = configured(&self.resend_secret, provider)?;
                let id = header(headers, SVIX_ID_HEADER)?;
                let timestamp = header(headers, SVIX_TIMESTAMP_HEADER)?;
                self.check_timestamp(timestamp, now)?;
                let key = svix_key(&Secret::new(secret.clone()))?;
                // several space-separated "v1,<sig>" entries during secret rotation
                let valid = header(headers, SVIX_SIGNATURE_HEADER)?
                    .split(' ')
                    .filter_map(|entry| entry.strip_prefix("v1,"))
                    .filter_map(|sig| base64::decode(sig).ok())
                    .any(|expected| {
                        new_mac(&key)
                            .map(|mut mac| {
                                mac.update(id.as_bytes());
                                mac.update(b".");
                                mac.update(timestamp.as_bytes());
                                mac.update(b".");
                                mac.update(body);
                                mac.verify_slice(&expected).is_ok()
                            })
                            .unwrap_or(false)
                    });
                match valid {
                    true => Ok(()),
                    false => Err(WebhookError::InvalidSignature),
                }
            }
        }
    }

    fn check_timestamp(&self, timestamp: &str, now: DateTime<Utc>) -> Result<(), WebhookError> {
        let tolerance = match self.replay_tolerance {
            Some(tolerance) => tolerance,
            None => return Ok(()),
        };
        // Mailgun sends integral seconds, but accept a fractional part
        let seconds = timestamp
            .split('.')
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(WebhookError::InvalidSignature)?;
        let skew = now.timestamp() - seconds;
        if skew.abs() > tolerance.num_seconds() {
            return Err(WebhookError::ReplayWindowExpired);
        }
        Ok(())
    }
}

/// `base64(HMAC-SHA256(secret, timestamp || body))`.
pub fn sendgrid_signature(secret: &str, timestamp: &str, body: &[u8]) -> Result<String, WebhookError> {
    let mut mac = new_mac(secret.as_bytes())?;
    mac.update(timestamp.as_bytes());
    mac.update(body);
    Ok(base64::encode(mac.finalize().into_bytes()))
}

/// `hex(HMAC-SHA256(key, timestamp || token))`.
pub fn mailgun_signature(signing_key: &str, timestamp: &str, token: &str) -> Result<String, WebhookError> {
    let mut mac = new_mac(signing_key.as_bytes())?;
    mac.update(timestamp.as_bytes());
    mac.update(token.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Svix header value `v1,<base64 HMAC of "id.timestamp.body">`.
pub fn resend_signature(secret: &str, id: &str, timestamp: &str, body: &[u8]) -> Result<String, WebhookError> {
    let key = svix_key(&Secret::new(secret.to_string()))?;
    let mut mac = new_mac(&key)?;
    mac.update(format!("{}.{}.", id, timestamp).as_bytes());
    mac.update(body);
    Ok(format!("v1,{}", base64::encode(mac.finalize().into_bytes())))
}

fn svix_key(secret: &Secret<String>) -> Result<Vec<u8>, WebhookError> {
    let secret = secret.expose_secret();
    let encoded = secret.strip_prefix("whsec_").unwrap_or(secret);
    base64::decode(encoded).map_err(|_| WebhookError::NotConfigured(Provider::Resend.as_str()))
}

fn new_mac(key: &[u8]) -> Result<HmacSha256, WebhookError> {
    HmacSha256::new_from_slice(key).map_err(|_| WebhookError::InvalidSignature)
}

/// Equality that takes the same time wherever the inputs differ. Both sides
/// are MACed under `expected`, so their lengths do not leak either.
fn secrets_match(given: &str, expected: &str) -> bool {
    let digest = |value: &str| {
        new_mac(expected.as_bytes()).map(|mut mac| {
            mac.update(value.as_bytes());
            mac
        })
    };
    match (digest(given), digest(expected)) {
        (Ok(given), Ok(expected)) => given.verify_slice(&expected.finalize().into_bytes()).is_ok(),
        _ => false,
    }
}

fn configured(secret: &Option<Secret<String>>, provider: Provider) -> Result<&String, WebhookError> {
    secret
        .as_ref()
        .map(|s| s.expose_secret())
        .ok_or(WebhookError::NotConfigured(provider.as_str()))
}

fn header<'h>(headers: &'h WebhookHeaders, name: &str) -> Result<&'h str, WebhookError> {
    headers.get(name).ok_or(WebhookError::InvalidSignature)
}

fn decode_base64(value: &str) -> Result<Vec<u8>, WebhookError> {
    base64::decode(value.trim()).map_err(|_| WebhookError::InvalidSignature)
}

fn json_str(value: &serde_json::Value) -> Result<String, WebhookError> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(WebhookError::InvalidSignature),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claim::{assert_matches, assert_ok};
    use serde_json::json;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(&WebhookSettings {
            sendgrid_secret: Some(Secret::new("sg-secret".into())),
            mailgun_signing_key: Some(Secret::new("mg-key".into())),
            postmark_username: Some("postmark".into()),
            postmark_password: Some(Secret::new("hunter2".into())),
            resend_secret: Some(Secret::new(format!("whsec_{}", base64::encode("resend-key")))),
            ..WebhookSettings::default()
        })
    }

    #[test]
    fn sendgrid_signature_covers_timestamp_and_body() {
        let now = Utc::now();
        let ts = now.timestamp().to_string();
        let body = br#"[{"event":"delivered"}]"#;
        let headers: WebhookHeaders = vec![
            ("X-Twilio-Email-Event-Webhook-Signature", sendgrid_signature("sg-secret", &ts, body).unwrap().as_str()),
            ("X-Twilio-Email-Event-Webhook-Timestamp", ts.as_str()),
        ]
        .into_iter()
        .collect();

        assert_ok!(verifier().verify(Provider::SendGrid, &headers, body, &json!([]), now));
        assert_matches!(
            verifier().verify(Provider::SendGrid, &headers, b"[]", &json!([]), now),
            Err(WebhookError::InvalidSignature)
        );
    }

    #[test]
    fn stale_timestamps_are_rejected() {
        let now = Utc::now();
        let ts = (now.timestamp() - 3600).to_string();
        let payload = json!({
            "signature": {
                "timestamp": ts,
                "token": "tok",
                "signature": mailgun_signature("mg-key", &ts, "tok").unwrap(),
            }
        });
        assert_matches!(
            verifier().verify(Provider::Mailgun, &WebhookHeaders::default(), b"", &payload, now),
            Err(WebhookError::ReplayWindowExpired)
        );
    }

    #[test]
    fn postmark_uses_basic_credentials() {
        let good = format!("Basic {}", base64::encode("postmark:hunter2"));
        let bad = format!("Basic {}", base64::encode("postmark:nope"));
        let headers = |value: &str| -> WebhookHeaders { vec![("Authorization", value)].into_iter().collect() };

        assert_ok!(verifier().verify(Provider::Postmark, &headers(&good), b"{}", &json!({}), Utc::now()));
        assert_matches!(
            verifier().verify(Provider::Postmark, &headers(&bad), b"{}", &json!({}), Utc::now()),
            Err(WebhookError::InvalidSignature)
        );
    }

    #[test]
    fn postmark_rejects_any_credential_mismatch() {
        let headers = |credentials: &str| -> WebhookHeaders {
            let value = format!("Basic {}", base64::encode(credentials));
            vec![("Authorization", value.as_str())].into_iter().collect()
        };

        for credentials in ["postmark:hunter", "postmark:hunter22", "postmarks:hunter2", ":hunter2", "postmark:"] {
            let outcome = verifier().verify(Provider::Postmark, &headers(credentials), b"{}", &json!({}), Utc::now());
            assert!(
                matches!(outcome, Err(WebhookError::InvalidSignature)),
                "{} was not rejected",
                credentials
            );
        }
    }

    #[test]
    fn secrets_match_only_on_exact_equality() {
        assert!(secrets_match("hunter2", "hunter2"));
        assert!(!secrets_match("hunter3", "hunter2"));
        assert!(!secrets_match("hunter", "hunter2"));
        assert!(!secrets_match("", "hunter2"));
        assert!(secrets_match("", ""));
    }

    #[test]
    fn signing_helpers_do_not_panic_on_empty_keys() {
        assert_ok!(sendgrid_signature("", "1", b"[]"));
        assert_ok!(mailgun_signature("", "1", "tok"));
    }

    #[test]
    fn resend_accepts_any_matching_rotated_signature() {
        let now = Utc::now();
        let ts = now.timestamp().to_string();
        let body = br#"{"type":"email.delivered"}"#;
        let secret = format!("whsec_{}", base64::encode("resend-key"));
        let valid = resend_signature(&secret, "msg_1", &ts, body).unwrap();
        let signature = format!("v1,bm9wZQ== {}", valid);
        let headers: WebhookHeaders = vec![
            ("svix-id", "msg_1"),
            ("svix-timestamp", ts.as_str()),
            ("svix-signature", signature.as_str()),
        ]
        .into_iter()
        .collect();

        assert_ok!(verifier().verify(Provider::Resend, &headers, body, &json!({}), now));
    }

    #[test]
    fn unconfigured_provider_is_rejected() {
        let verifier = SignatureVerifier::new(&WebhookSettings::default());
        assert_matches!(
            verifier.verify(Provider::SendGrid, &WebhookHeaders::default(), b"[]", &json!([]), Utc::now()),
            Err(WebhookError::NotConfigured(_))
        );
    }
}
