//! Infrastructure broker implementations.
//!
//! The broker boundary lives in `policybatch-batch` together with an
//! in-memory implementation. This module provides the Redis-backed one.

#[cfg(feature = "redis")]
pub mod redis_broker;

#[cfg(feature = "redis")]
pub use redis_broker::{RedisBroker, RedisTelemetry};
