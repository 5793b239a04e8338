use anyhow::{anyhow, Context};
use aws_config::TimeoutConfig;
use aws_sdk_sesv2 as ses;
use newsletter_delivery::clock::SystemClock;
use newsletter_delivery::configuration::get_configuration;
use newsletter_delivery::email::SesEmailClient;
use newsletter_delivery::startup::Application;
use newsletter_delivery::store::{InMemoryStore, PgStore, Store};
use newsletter_delivery::telemetry::{get_subscriber, init_subscriber};
use std::sync::Arc;

#[rocket::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber("newsletter_delivery".into(), "info".into(), std::io::stdout);
    init_subscriber(subscriber);

    let configuration = get_configuration().context("Failed to read configuration.")?;

    let store: Arc<dyn Store> = if configuration.application.in_memory_store {
        tracing::warn!("Using the in-memory store; nothing survives a restart");
        Arc::new(InMemoryStore::new())
    } else {
        let store = PgStore::connect(&configuration.database).context("Failed to connect to Postgres.")?;
        store.run_migrations().await?;
        Arc::new(store)
    };

    let sender_email = configuration.email_client.sender().map_err(|e| anyhow!(e))?;
    let timeout_config =
        TimeoutConfig::new().with_api_call_timeout(Some(configuration.email_client.timeout()));
    let shared_config = aws_config::from_env()
        .timeout_config(timeout_config)
        .load()
        .await;
    let email_client = Arc::new(SesEmailClient::new(ses::Client::new(&shared_config), sender_email));

    let application = Application::build(&configuration, store, email_client, Arc::new(SystemClock)).await?;
    let _maintenance = application.maintenance.spawn();
    application.server.launch().await?;
    Ok(())
}
