pub mod commands;
pub mod config;
pub mod detect;
pub mod engine;
pub mod extract;
pub mod health;
pub mod messages;
pub mod notify;
pub mod scheduler;
pub mod scrape;
pub mod store;
pub mod types;
