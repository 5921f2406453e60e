//! Infrastructure layer: Postgres, Redis, configuration and the worker.

pub mod broker;
pub mod cache;
pub mod config;
pub mod event_bus;
pub mod store;
pub mod tasks;
pub mod worker;

pub use cache::{CacheService, EventTypeData};
pub use config::{ConfigError, FileBatchConfig, Settings};
pub use store::PostgresStore;
pub use tasks::BatchTasks;
pub use worker::{TaskOutcome, Worker, WorkerConfig, WorkerHandle, WorkerStats};

#[cfg(feature = "redis")]
pub use broker::{RedisBroker, RedisTelemetry};
#[cfg(feature = "redis")]
pub use event_bus::RedisCacheBus;

#[cfg(test)]
mod integration_tests;
