use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};
use async_trait::async_trait;
use chrono::Utc;
use newsletter_delivery::clock::{Clock, FixedClock};
use newsletter_delivery::configuration::{get_configuration, Settings};
use newsletter_delivery::domain::{SubscriberEmail, SubscriptionStatus};
use newsletter_delivery::email::{Email, OutboundEmail, SendReceipt, SendError};
use newsletter_delivery::startup::Application;
use newsletter_delivery::store::{InMemoryStore, SubscriberStore, UserStore};
use newsletter_delivery::telemetry::{get_subscriber, init_subscriber};
use newsletter_delivery::webhooks::signature::sendgrid_signature;
use once_cell::sync::Lazy;
use secrecy::Secret;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

static TRACING: Lazy<()> = Lazy::new(|| {
    let default_filter_level = "info".into();
    let subscriber_name = "test".into();
    if std::env::var("TEST_LOG").is_ok() {
        let subscriber = get_subscriber(subscriber_name, default_filter_level, std::io::stdout);
        init_subscriber(subscriber);
    } else {
        let subscriber = get_subscriber(subscriber_name, default_filter_level, std::io::sink);
        init_subscriber(subscriber);
    }
});

pub const SENDGRID_SECRET: &str = "sendgrid-test-secret";

/// Accepts every message and remembers it.
#[derive(Default)]
pub struct MockEmail {
    pub sent_emails: Mutex<Vec<OutboundEmail>>,
}

#[async_trait]
impl Email for MockEmail {
    async fn send_email(&self, email: &OutboundEmail) -> Result<SendReceipt, SendError> {
        let mut sent = self.sent_emails.lock().unwrap();
        sent.push(email.clone());
        Ok(SendReceipt {
            message_id: Some(format!("mock-{}", sent.len())),
        })
    }
}

pub struct TestUser {
    pub username: String,
    pub password: String,
}

impl TestUser {
    fn generate() -> Self {
        Self {
            username: Uuid::new_v4().to_string(),
            password: Uuid::new_v4().to_string(),
        }
    }

    async fn store(&self, store: &InMemoryStore) {
        let salt = SaltString::generate(&mut rand::thread_rng());
        let password_hash = Argon2::default()
            .hash_password(self.password.as_bytes(), &salt)
            .unwrap()
            .to_string();
        store.insert_user(&self.username, &password_hash).await.unwrap();
    }
}

pub struct TestApp {
    pub address: String,
    pub store: Arc<InMemoryStore>,
    pub email_client: Arc<MockEmail>,
    pub clock: Arc<FixedClock>,
    pub admin: TestUser,
    pub api_client: reqwest::Client,
}

impl TestApp {
    pub async fn add_subscriber(&self, email: &str) {
        let email = SubscriberEmail::parse(email).unwrap();
        self.store
            .insert_subscriber(&email, "reader", SubscriptionStatus::Active, self.clock.now())
            .await
            .unwrap();
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.api_client.post(&format!("{}{}", self.address, path))
    }

    pub fn admin_get(&self, path: &str) -> reqwest::RequestBuilder {
        self.api_client
            .get(&format!("{}{}", self.address, path))
            .basic_auth(&self.admin.username, Some(&self.admin.password))
    }

    pub fn admin_post(&self, path: &str) -> reqwest::RequestBuilder {
        self.post(path)
            .basic_auth(&self.admin.username, Some(&self.admin.password))
    }

    pub fn admin_delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.api_client
            .delete(&format!("{}{}", self.address, path))
            .basic_auth(&self.admin.username, Some(&self.admin.password))
    }

    pub async fn post_sendgrid(&self, body: &serde_json::Value) -> reqwest::Response {
        let body = body.to_string();
        let timestamp = self.clock.now().timestamp().to_string();
        let signature = sendgrid_signature(SENDGRID_SECRET, &timestamp, body.as_bytes()).unwrap();
        self.post("/webhooks?provider=sendgrid")
            .header("X-Twilio-Email-Event-Webhook-Signature", signature)
            .header("X-Twilio-Email-Event-Webhook-Timestamp", timestamp)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .expect("Failed to execute request.")
    }

    pub async fn create_campaign(&self, body: &serde_json::Value) -> reqwest::Response {
        self.admin_post("/campaigns")
            .json(body)
            .send()
            .await
            .expect("Failed to execute request.")
    }
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(|_| {}).await
}

pub async fn spawn_app_with(customise: impl FnOnce(&mut Settings)) -> TestApp {
    Lazy::force(&TRACING);

    let configuration = {
        let mut c = get_configuration().expect("Failed to read configuration.");
        c.application.port = None;
        c.application.host = "127.0.0.1".parse().unwrap();
        c.delivery.email_send_throttle_ms = 0;
        c.webhooks.sendgrid_secret = Some(Secret::new(SENDGRID_SECRET.into()));
        customise(&mut c);
        c
    };

    let store = Arc::new(InMemoryStore::new());
    let email_client = Arc::new(MockEmail::default());
    let clock = Arc::new(FixedClock::new(Utc::now()));
    let admin = TestUser::generate();
    admin.store(&store).await;

    let app = Application::build(&configuration, store.clone(), email_client.clone(), clock.clone())
        .await
        .expect("Failed to build application.");
    let _ = tokio::spawn(app.server.launch());
    TestApp {
        address: format!("http://127.0.0.1:{}", app.port.get().await.expect("Server never bound.")),
        store,
        email_client,
        clock,
        admin,
        api_client: reqwest::Client::new(),
    }
}
