#[macro_use]
extern crate diesel;
#[macro_use]
extern crate rocket;

pub mod catchers;
pub mod clock;
pub mod configuration;
pub mod delivery;
pub mod dlq;
pub mod domain;
pub mod email;
pub mod guards;
pub mod models;
pub mod port_saver;
pub mod routes;
pub mod scheduler;
pub mod schema;
pub mod startup;
pub mod store;
pub mod suppression;
pub mod telemetry;
pub mod throttle;
pub mod webhooks;
