//! Infrastructure event bus implementations.
//!
//! The bus abstraction lives in `policybatch-events`. This module provides a
//! Redis-backed one so cache invalidations reach every worker process.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisCacheBus};
