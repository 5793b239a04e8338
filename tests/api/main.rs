mod admin;
mod campaigns;
mod health_check;
mod helpers;
mod webhooks;
