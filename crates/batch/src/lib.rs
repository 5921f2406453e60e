//! `policybatch-batch`: batch generation, job execution and async task
//! dispatch.
//!
//! ## Components
//!
//! - `split`: chunking of record selections into jobs and sub-batches
//! - `control`: control parameters stripped from business parameters
//! - `store`: transactional store boundary and an in-memory implementation
//! - `broker`: task broker boundary and an in-memory implementation
//! - `registry`: explicit registry of batch operations and async methods
//! - `generator`: select, split and enqueue one job per chunk
//! - `executor`: run one job with retry on serialization conflicts
//! - `dispatch`: per-record async task tracking for model methods

pub mod broker;
pub mod context;
pub mod control;
pub mod dispatch;
pub mod executor;
pub mod generator;
pub mod identity;
pub mod operation;
pub mod registry;
pub mod split;
pub mod store;
pub mod telemetry;

pub use broker::{
    AsyncMethodArgs, BatchGenerateArgs, BatchJobArgs, ClaimedTask, EnqueueRequest,
    InMemoryBroker, TaskBroker, TaskState, TaskStatus, WorkerQueue, replay, resplit,
};
pub use context::ExecutionContext;
pub use control::{ControlParams, RetryBudget};
pub use dispatch::{
    AsyncDispatcher, AsyncMethodRunner, AsyncTaskRecord, DispatchOutcome, TaskInfo, UserWarning,
};
pub use executor::{JobExecutor, JobOrigin};
pub use generator::{BatchGenerator, ConfigSource, GenerationReport, NoConfig};
pub use identity::{AdminIdentity, FixedIdentity, IdentityResolver, StoredAdminIdentity};
pub use operation::{AsyncMethod, BatchOperation, DynBatch, Selection};
pub use registry::{OperationRegistry, QueueableModel};
pub use split::{split_batch, split_job};
pub use store::{
    InMemoryStore, StoreStats, TransactionScope, TransactionalStore, run_in_transaction,
};
pub use telemetry::{ChainReport, ChainStatus, InMemoryTelemetry, TelemetrySink};
