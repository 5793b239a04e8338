use crate::domain::SubscriberEmail;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use serde;
use serde_aux::field_attributes::deserialize_number_from_string;
use serde_aux::field_attributes::deserialize_option_number_from_string;
use std::net::IpAddr;

#[derive(Debug)]
pub enum Environment {
    Local,
    Production,
}

#[derive(serde::Deserialize, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub application: ApplicationSettings,
    pub email_client: EmailClientSettings,
    #[serde(default)]
    pub delivery: DeliverySettings,
    #[serde(default)]
    pub throttle: ThrottleSettings,
    #[serde(default)]
    pub suppression: SuppressionSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub webhooks: WebhookSettings,
    #[serde(default)]
    pub events: EventSettings,
}

#[derive(serde::Deserialize, Clone)]
pub struct ApplicationSettings {
    #[serde(deserialize_with = "deserialize_option_number_from_string")]
    pub port: Option<u16>,
    pub host: IpAddr,
    pub base_url: String,
    /// Use the in-process store instead of Postgres.
    #[serde(default)]
    pub in_memory_store: bool,
}

#[derive(serde::Deserialize, Clone)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: Secret<String>,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
    pub database_name: String,
    pub require_ssl: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(serde::Deserialize, Clone)]
pub struct EmailClientSettings {
    pub sender_email: String,
    pub timeout_milliseconds: u64,
}

impl EmailClientSettings {
    pub fn sender(&self) -> Result<SubscriberEmail, String> {
        SubscriberEmail::parse(&self.sender_email)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_milliseconds)
    }
}

#[derive(serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DeliverySettings {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub batch_size: usize,
    /// Minimum gap between two consecutive provider calls, process-wide.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub email_send_throttle_ms: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_attempts: i32,
    pub max_concurrency: usize,
    pub stale_sending_timeout_secs: i64,
    pub retry_base_secs: i64,
    pub retry_max_secs: i64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            email_send_throttle_ms: 100,
            max_attempts: 3,
            max_concurrency: 4,
            stale_sending_timeout_secs: 15 * 60,
            retry_base_secs: 60,
            retry_max_secs: 60 * 60,
        }
    }
}

#[derive(serde::Deserialize, Clone, Debug, PartialEq)]
pub struct DomainClassSettings {
    pub name: String,
    pub domains: Vec<String>,
    pub daily_limit: u32,
    pub hourly_limit: u32,
}

impl DomainClassSettings {
    fn new(name: &str, domains: &[&str], daily_limit: u32, hourly_limit: u32) -> Self {
        Self {
            name: name.to_string(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
            daily_limit,
            hourly_limit,
        }
    }
}

#[derive(serde::Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct WarmupSettings {
    pub enabled: bool,
    /// Sends allowed per warm-up period at the start of the ramp.
    pub initial: u32,
    pub increment: u32,
    pub max: u32,
    pub period_hours: i64,
    /// When the sending identity started warming up.
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for WarmupSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            initial: 50,
            increment: 50,
            max: 10_000,
            period_hours: 24,
            started_at: None,
        }
    }
}

#[derive(serde::Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct QuietHoursSettings {
    pub enabled: bool,
    pub start_hour: u32,
    pub end_hour: u32,
    /// IANA zone name, e.g. `Europe/Berlin`.
    pub timezone: String,
}

impl Default for QuietHoursSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            start_hour: 22,
            end_hour: 8,
            timezone: "UTC".into(),
        }
    }
}

#[derive(serde::Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ThrottleSettings {
    pub domain_classes: Vec<DomainClassSettings>,
    /// Limits for domains outside every class; `None` means unlimited.
    pub default_daily_limit: Option<u32>,
    pub default_hourly_limit: Option<u32>,
    pub warmup: WarmupSettings,
    pub quiet_hours: QuietHoursSettings,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            domain_classes: vec![
                DomainClassSettings::new("gmail", &["gmail.com", "googlemail.com"], 2_000, 500),
                DomainClassSettings::new(
                    "microsoft",
                    &["outlook.com", "hotmail.com", "live.com", "msn.com"],
                    1_000,
                    250,
                ),
                DomainClassSettings::new("yahoo", &["yahoo.com", "ymail.com", "aol.com"], 1_000, 250),
                DomainClassSettings::new("apple", &["icloud.com", "me.com", "mac.com"], 1_000, 250),
            ],
            default_daily_limit: None,
            default_hourly_limit: None,
            warmup: WarmupSettings::default(),
            quiet_hours: QuietHoursSettings::default(),
        }
    }
}

#[derive(serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SuppressionSettings {
    pub soft_bounce_retention_days: i64,
    pub bulk_batch_size: usize,
}

impl Default for SuppressionSettings {
    fn default() -> Self {
        Self {
            soft_bounce_retention_days: 30,
            bulk_batch_size: 100,
        }
    }
}

#[derive(serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub interval_minutes: u32,
    pub tick_seconds: u64,
    pub cleanup_interval_hours: u64,
}

impl SchedulerSettings {
    fn validate(&self) -> Result<(), String> {
        if self.interval_minutes == 0 {
            return Err("scheduler.interval_minutes must be positive.".into());
        }
        // a coarser tick can step over a boundary minute entirely
        if !(1..=60).contains(&self.tick_seconds) {
            return Err("scheduler.tick_seconds must be within 1..=60.".into());
        }
        Ok(())
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 5,
            tick_seconds: 60,
            cleanup_interval_hours: 24,
        }
    }
}

#[derive(serde::Deserialize, Clone)]
#[serde(default)]
pub struct WebhookSettings {
    pub sendgrid_secret: Option<Secret<String>>,
    pub mailgun_signing_key: Option<Secret<String>>,
    pub postmark_username: Option<String>,
    pub postmark_password: Option<Secret<String>>,
    /// Svix-style `whsec_...` secret.
    pub resend_secret: Option<Secret<String>>,
    /// Reject signed timestamps older than this; `None` disables the check.
    pub replay_tolerance_secs: Option<i64>,
    pub rate_limit_per_minute: u32,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            sendgrid_secret: None,
            mailgun_signing_key: None,
            postmark_username: None,
            postmark_password: None,
            resend_secret: None,
            replay_tolerance_secs: Some(300),
            rate_limit_per_minute: 600,
        }
    }
}

#[derive(serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct EventSettings {
    pub retention_days: i64,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self { retention_days: 365 }
    }
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either 'local' or 'production'.",
                other
            )),
        }
    }
}

impl DatabaseSettings {
    pub fn connection_string(&self) -> Secret<String> {
        Secret::new(format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.username,
            self.password.expose_secret(),
            self.host,
            self.port,
            self.database_name,
            ssl_mode(self.require_ssl)
        ))
    }

    pub fn connection_string_without_database(&self) -> Secret<String> {
        Secret::new(format!(
            "postgres://{}:{}@{}:{}?sslmode={}",
            self.username,
            self.password.expose_secret(),
            self.host,
            self.port,
            ssl_mode(self.require_ssl)
        ))
    }
}

fn ssl_mode(require_ssl: bool) -> &'static str {
    match require_ssl {
        true => "require",
        false => "prefer",
    }
}

impl Settings {
    /// Startup checks that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        let delivery = &self.delivery;
        if delivery.batch_size == 0 || delivery.max_concurrency == 0 {
            return Err("delivery.batch_size and delivery.max_concurrency must be positive.".into());
        }
        if delivery.max_attempts < 1 {
            return Err("delivery.max_attempts must be at least 1.".into());
        }
        let warmup = &self.throttle.warmup;
        if warmup.enabled && (warmup.initial > warmup.max || warmup.period_hours < 1) {
            return Err("throttle.warmup needs initial <= max and period_hours >= 1.".into());
        }
        let quiet = &self.throttle.quiet_hours;
        if quiet.start_hour > 23 || quiet.end_hour > 23 {
            return Err("throttle.quiet_hours hours must be within 0..=23.".into());
        }
        quiet
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| format!("throttle.quiet_hours.timezone: {}", e))?;
        self.scheduler.validate()?;
        if self.suppression.bulk_batch_size == 0 {
            return Err("suppression.bulk_batch_size must be positive.".into());
        }
        self.email_client.sender()?;
        Ok(())
    }
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("Failed to determine the current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");
    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let mut settings = config::Config::default();
    settings.merge(config::File::from(configuration_directory.join("base")).required(true))?;
    settings.merge(
        config::File::from(configuration_directory.join(environment.as_str())).required(true),
    )?;
    settings.merge(config::Environment::with_prefix("app").separator("__"))?;
    settings.try_into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use claim::{assert_err, assert_ok};

    #[test]
    fn default_throttle_covers_the_big_four_mailbox_providers() {
        let names: Vec<String> = ThrottleSettings::default()
            .domain_classes
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["gmail", "microsoft", "yahoo", "apple"]);
    }

    #[test]
    fn unknown_environment_is_rejected() {
        assert_err!(Environment::try_from("staging".to_string()));
    }

    #[test]
    fn scheduler_tick_must_not_skip_boundary_minutes() {
        let mut scheduler = SchedulerSettings::default();
        assert_ok!(scheduler.validate());
        for tick_seconds in [0, 61, 300] {
            scheduler.tick_seconds = tick_seconds;
            assert_err!(scheduler.validate());
        }
    }

    #[test]
    fn quiet_hours_timezone_must_exist() {
        let zone = "Mars/Olympus_Mons".parse::<chrono_tz::Tz>();
        assert_err!(zone);
    }
}
