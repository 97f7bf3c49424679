pub mod attributes;
pub mod config;
pub mod health;
pub mod metrics;
pub mod retry;
pub mod store;
pub mod time;
pub mod trip;
