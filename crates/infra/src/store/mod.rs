//! Infrastructure store implementations.

pub mod postgres;

pub use postgres::{PostgresScope, PostgresStore};
