pub mod config;
pub mod coordinator;
pub mod db;
pub mod http;
pub mod mailer;
pub mod model;
pub mod queue;
pub mod shopify;
pub mod workers;
