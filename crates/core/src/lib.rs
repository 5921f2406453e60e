//! `policybatch-core`: shared building blocks of the batch subsystem.
//!
//! This crate contains identifiers, record keys, parameter maps and the error
//! taxonomy. It has no knowledge of stores, brokers or workers.

pub mod error;
pub mod id;
pub mod params;
pub mod record;

pub use error::{BatchError, BatchResult, BrokerError, StoreError};
pub use id::{CompanyId, EventTypeId, TaskId, UserId};
pub use params::{ParamMap, ParamMapExt};
pub use record::{RecordKey, RecordUnit};
