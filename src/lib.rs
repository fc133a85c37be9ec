pub mod analytics;
pub mod api;
pub mod cache;
pub mod config;
pub mod enrichment;
pub mod events;
pub mod models;
pub mod recorder;
pub mod resolver;
pub mod routing;
pub mod storage;
pub mod webhooks;
