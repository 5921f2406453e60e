//! Execution of one batch job.
//!
//! A job is attempted in a fresh read-write scope. The chunk is cut into
//! `transaction_size` sub-batches, each executed then committed in order.
//! A serialization conflict rolls the attempt back and, while the retry
//! budget allows it, starts over from the first sub-batch. Any other error
//! ends the job on the spot.

use std::sync::Arc;

use chrono::Local;
use serde_json::Value as JsonValue;
use tracing::{error, info};

use policybatch_core::{BatchResult, ParamMap, RecordKey, UserId};

use crate::broker::{BatchJobArgs, EnqueueRequest};
use crate::context::ExecutionContext;
use crate::control::{ControlParams, RetryBudget};
use crate::identity::{IdentityResolver, StoredAdminIdentity};
use crate::operation::DynBatch;
use crate::registry::OperationRegistry;
use crate::split::split_job;
use crate::store::{TransactionScope, TransactionalStore, run_in_transaction};

/// Where a job runs and who hears about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOrigin {
    pub database: String,
    pub user_to_notify: Option<UserId>,
}

impl JobOrigin {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            user_to_notify: None,
        }
    }

    /// Read the origin from task kwargs, falling back to `default_database`.
    pub fn from_request(request: &EnqueueRequest, default_database: &str) -> Self {
        Self {
            database: request
                .database()
                .unwrap_or(default_database)
                .to_string(),
            user_to_notify: request.user(),
        }
    }
}

pub struct JobExecutor {
    registry: Arc<OperationRegistry>,
    store: Arc<dyn TransactionalStore>,
    identity: Arc<dyn IdentityResolver>,
}

impl JobExecutor {
    pub fn new(registry: Arc<OperationRegistry>, store: Arc<dyn TransactionalStore>) -> Self {
        Self {
            registry,
            store,
            identity: Arc::new(StoredAdminIdentity),
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = identity;
        self
    }

    /// Run one job. Returns one count per committed sub-batch.
    pub fn execute(&self, args: &BatchJobArgs, origin: &JobOrigin) -> BatchResult<Vec<u64>> {
        let name = args.name.as_str();
        info!(
            batch = %name,
            items = args.chunk.len(),
            database = %origin.database,
            params = ?args.params,
            "executing job"
        );

        let operation = self.registry.resolve_batch(name).inspect_err(|err| {
            error!(batch = %name, error = %err, "job execution crashed");
        })?;
        let mut business = operation.parse(args.params.clone())?;
        let control = ControlParams::extract(&mut business, Local::now().date_naive())?;

        let mut retries_left = control.retry.map(RetryBudget::retries);
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            let outcome = run_in_transaction(
                self.store.as_ref(),
                &origin.database,
                UserId::ROOT,
                false,
                |scope| self.attempt(scope, operation.as_ref(), &args.chunk, &business, &control, origin),
            );

            let err = match outcome {
                Ok(results) => {
                    info!(batch = %name, attempt, results = ?results, "job executed");
                    return Ok(results);
                }
                Err(err) => err,
            };

            if !err.is_recoverable_conflict() {
                error!(batch = %name, attempt, error = %err, "job execution crashed");
                return Err(err);
            }

            match retries_left {
                Some(0) => {
                    error!(
                        batch = %name,
                        retry = RetryBudget::to_param(control.retry),
                        error = %err,
                        "job execution crashed after retry"
                    );
                    return Err(err);
                }
                Some(left) => {
                    info!(batch = %name, attempts_left = left, "retrying job");
                    retries_left = Some(left - 1);
                }
                None => {
                    info!(batch = %name, attempt, "retrying job");
                }
            }
        }
    }

    fn attempt(
        &self,
        scope: &mut dyn TransactionScope,
        operation: &dyn DynBatch,
        chunk: &[RecordKey],
        business: &ParamMap,
        control: &ControlParams,
        origin: &JobOrigin,
    ) -> BatchResult<Vec<u64>> {
        let identity = self.identity.resolve(scope)?;
        scope.set_context(ExecutionContext {
            date: Some(control.connection_date),
            company: Some(identity.company),
            from_batch: true,
            auto_accept_warnings: true,
            user_to_notify: origin.user_to_notify,
            job_size: Some(control.job_size),
            transaction_size: Some(control.transaction_size),
            ..ExecutionContext::default()
        });

        let sub_batches: Vec<&[RecordKey]> = split_job(chunk, control.transaction_size).collect();
        let last = sub_batches.len().saturating_sub(1);
        let mut results = Vec::with_capacity(sub_batches.len());

        for (index, keys) in sub_batches.into_iter().enumerate() {
            let count = operation.execute_keys(scope, keys, business)?;
            results.push(count.unwrap_or(keys.len() as u64));
            // run_in_transaction commits the last one
            if index < last {
                scope.commit()?;
            }
        }
        Ok(results)
    }
}

/// Encode job results as a broker result value.
pub fn results_value(results: &[u64]) -> JsonValue {
    JsonValue::from(results.to_vec())
}
