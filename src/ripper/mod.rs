//! Gallery download core
//! Scans forum galleries, queues their images and downloads them through per-host resolvers

pub mod auth;
pub mod broadcast;
pub mod config_loader;
pub mod data_service;
pub mod document;
pub mod download;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod hosts;
pub mod job_queue;
pub mod links;
pub mod logger;
pub mod models;
pub mod monitor;
pub mod retry;
pub mod scan_cache;
pub mod scanner;
pub mod store;
pub mod thanks;
pub mod transport;
pub mod worker_pool;

#[cfg(test)]
pub mod tests;

// Re-export commonly used types for convenience
pub use broadcast::{Notification, NotificationSink, Topic};

pub use config_loader::init_settings;

pub use engine::{RipperEngine, SubmitOutcome};

pub use error::error_chain;

pub use event_bus::EventBus;

pub use hosts::default_registry;

pub use logger::init_logging;

pub use models::PostStatus;

pub use store::{MemoryStore, SqliteStore, Store};

pub use transport::ReqwestTransport;
