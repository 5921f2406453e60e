//! Async dispatch of model methods with per-record task tracking.
//!
//! Every record touched by a dispatched method gets a row in
//! [`TASK_TABLE`] pointing at the broker task. While that task is pending
//! the record can be neither modified nor dispatched again. Running inline
//! clears the rows, so a stale failure does not linger once the method
//! eventually succeeds.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use policybatch_core::record::origin;
use policybatch_core::{BatchError, BatchResult, BrokerError, RecordKey, TaskId, UserId};

use crate::broker::{ASYNC_METHOD, AsyncMethodArgs, EnqueueRequest, TaskBroker, TaskState};
use crate::context::ExecutionContext;
use crate::registry::OperationRegistry;
use crate::store::{TransactionScope, TransactionalStore, read_row, run_in_transaction, write_row};

pub const TASK_TABLE: &str = "async.task";

/// Last broker task acting on one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncTaskRecord {
    pub origin: String,
    pub task_id: TaskId,
}

/// Non-blocking notice shown to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserWarning {
    pub key: String,
    pub message: String,
}

impl UserWarning {
    fn async_job(model: &str, records: &[RecordKey]) -> Self {
        let origins: Vec<String> = records.iter().map(|key| origin(model, key)).collect();
        Self {
            key: format!("async_job_{}", origins.join("|")),
            message: "This task will be applied in the background. You can come back \
                      later and refresh the record to check the result."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The method ran inline.
    Completed(JsonValue),
    /// The method was handed to the broker; only the ids come back.
    Enqueued {
        task_id: TaskId,
        ids: Vec<RecordKey>,
        warning: UserWarning,
    },
}

/// Status of the current task of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub state: TaskState,
    pub message: Option<String>,
}

pub struct AsyncDispatcher {
    registry: Arc<OperationRegistry>,
    broker: Arc<dyn TaskBroker>,
}

impl AsyncDispatcher {
    pub fn new(registry: Arc<OperationRegistry>, broker: Arc<dyn TaskBroker>) -> Self {
        Self { registry, broker }
    }

    /// Call `model.method` on `records`, inline or through the broker.
    pub fn call(
        &self,
        scope: &mut dyn TransactionScope,
        model: &str,
        method: &str,
        records: &[RecordKey],
        args: JsonValue,
    ) -> BatchResult<DispatchOutcome> {
        let handler = self.registry.resolve_method(model, method)?;
        self.guard_modification(scope, model, records)?;

        if scope.context().forces_synchronous() || !handler.eligible(scope, records, &args)? {
            let result = handler.run(scope, records, &args)?;
            self.clear_tasks(scope, model, records)?;
            return Ok(DispatchOutcome::Completed(result));
        }

        let warning = UserWarning::async_job(model, records);
        let payload = AsyncMethodArgs {
            ids: records.to_vec(),
            args,
        };
        let request =
            EnqueueRequest::async_method(model, method, &payload, scope.user(), scope.database())?;
        let task_id = self.broker.enqueue(request)?;

        for key in records {
            let row = AsyncTaskRecord {
                origin: origin(model, key),
                task_id,
            };
            write_row(scope, TASK_TABLE, &row.origin, &row)?;
        }
        info!(model = %model, method = %method, task_id = %task_id, records = records.len(), "method dispatched");

        Ok(DispatchOutcome::Enqueued {
            task_id,
            ids: payload.ids,
            warning,
        })
    }

    /// Refuse to touch records whose task is still pending.
    ///
    /// Async workers are exempt: they are the pending task.
    pub fn guard_modification(
        &self,
        scope: &mut dyn TransactionScope,
        model: &str,
        records: &[RecordKey],
    ) -> BatchResult<()> {
        if scope.context().async_worker {
            return Ok(());
        }

        let mut names = Vec::new();
        for key in records {
            let Some(row) = self.current_task(scope, model, key)? else {
                continue;
            };
            if self
                .poll(row.task_id)?
                .is_some_and(|(state, _)| state.is_pending())
            {
                names.push(row.origin);
            }
        }

        if names.is_empty() {
            Ok(())
        } else {
            Err(BatchError::PendingTasks { names })
        }
    }

    /// Current task of `record`, if the broker still knows it.
    pub fn task_info(
        &self,
        scope: &mut dyn TransactionScope,
        model: &str,
        record: &RecordKey,
    ) -> BatchResult<Option<TaskInfo>> {
        let Some(row) = self.current_task(scope, model, record)? else {
            return Ok(None);
        };
        let Some((state, traceback)) = self.poll(row.task_id)? else {
            return Ok(None);
        };

        let message = match state {
            TaskState::Pending => Some(format!(
                "This record has a pending background task (technical id: {} ).\n\
                 Please wait for this task to complete.",
                row.task_id
            )),
            TaskState::Failure => Some(format!(
                "The last background task failed. See below for technical details:\n{}",
                traceback.unwrap_or_default()
            )),
            _ => None,
        };

        Ok(Some(TaskInfo {
            task_id: row.task_id,
            state,
            message,
        }))
    }

    /// Delete the task rows of `records`.
    pub fn clear_tasks(
        &self,
        scope: &mut dyn TransactionScope,
        model: &str,
        records: &[RecordKey],
    ) -> BatchResult<()> {
        for key in records {
            if scope.delete(TASK_TABLE, &origin(model, key))? {
                debug!(model = %model, record = %key, "cleared async task");
            }
        }
        Ok(())
    }

    fn current_task(
        &self,
        scope: &mut dyn TransactionScope,
        model: &str,
        key: &RecordKey,
    ) -> BatchResult<Option<AsyncTaskRecord>> {
        read_row(scope, TASK_TABLE, &origin(model, key))
    }

    // A task the broker forgot is treated as finished.
    fn poll(&self, task_id: TaskId) -> BatchResult<Option<(TaskState, Option<String>)>> {
        match self.broker.status(task_id) {
            Ok(status) => Ok(Some((status.state, status.traceback))),
            Err(BrokerError::UnknownTask(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Worker side of `async_method_execution` tasks.
pub struct AsyncMethodRunner {
    dispatcher: AsyncDispatcher,
    store: Arc<dyn TransactionalStore>,
    database_retry: u32,
}

impl AsyncMethodRunner {
    pub fn new(
        registry: Arc<OperationRegistry>,
        broker: Arc<dyn TaskBroker>,
        store: Arc<dyn TransactionalStore>,
        database_retry: u32,
    ) -> Self {
        Self {
            dispatcher: AsyncDispatcher::new(registry, broker),
            store,
            database_retry,
        }
    }

    /// Run an enqueued method as the calling user.
    ///
    /// Operational store errors are retried up to `database_retry` times,
    /// each attempt in a fresh scope.
    pub fn run(&self, request: &EnqueueRequest) -> BatchResult<JsonValue> {
        let payload: AsyncMethodArgs = request.decode_args(ASYNC_METHOD)?;
        let model = request.kwarg_str("model_name")?;
        let method = request.kwarg_str("method_name")?;
        let database = request.kwarg_str("database")?;
        let user = request.user().unwrap_or(UserId::ROOT);

        let mut retries_left = self.database_retry;
        loop {
            let outcome = run_in_transaction(self.store.as_ref(), database, user, false, |scope| {
                scope.set_context(ExecutionContext::async_worker());
                match self
                    .dispatcher
                    .call(scope, model, method, &payload.ids, payload.args.clone())?
                {
                    DispatchOutcome::Completed(value) => Ok(value),
                    DispatchOutcome::Enqueued { task_id, .. } => Err(BatchError::operation(
                        format!("async worker re-dispatched {model}.{method} as {task_id}"),
                    )),
                }
            });

            match outcome {
                Err(err) if err.is_operational() && retries_left > 0 => {
                    warn!(
                        model = %model,
                        method = %method,
                        attempts_left = retries_left,
                        error = %err,
                        "retrying async method"
                    );
                    retries_left -= 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, TaskStatus, WorkerQueue};
    use crate::operation::AsyncMethod;
    use crate::store::InMemoryStore;
    use policybatch_core::StoreError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Terminates contracts; dispatched only for more than one record.
    struct Terminate {
        runs: Arc<AtomicUsize>,
    }

    impl AsyncMethod for Terminate {
        fn model(&self) -> &str {
            "contract"
        }

        fn name(&self) -> &str {
            "terminate"
        }

        fn eligible(
            &self,
            _scope: &mut dyn TransactionScope,
            keys: &[RecordKey],
            _args: &JsonValue,
        ) -> BatchResult<bool> {
            Ok(keys.len() > 1)
        }

        fn run(
            &self,
            scope: &mut dyn TransactionScope,
            keys: &[RecordKey],
            args: &JsonValue,
        ) -> BatchResult<JsonValue> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            for key in keys {
                scope.write("contract", &key.to_string(), args.clone())?;
            }
            Ok(json!(keys.len()))
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        broker: Arc<InMemoryBroker>,
        dispatcher: AsyncDispatcher,
        runs: Arc<AtomicUsize>,
        registry: Arc<OperationRegistry>,
    }

    fn fixture() -> Fixture {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = OperationRegistry::new();
        registry.register_async_method(Terminate { runs: runs.clone() });
        let registry = Arc::new(registry);
        let broker = InMemoryBroker::arc();
        Fixture {
            store: InMemoryStore::arc(),
            dispatcher: AsyncDispatcher::new(registry.clone(), broker.clone()),
            broker,
            runs,
            registry,
        }
    }

    fn keys(ids: &[i64]) -> Vec<RecordKey> {
        ids.iter().copied().map(RecordKey::Id).collect()
    }

    fn scope(f: &Fixture) -> Box<dyn TransactionScope> {
        f.store.start("db", UserId::new(5), false).unwrap()
    }

    #[test]
    fn eligible_call_is_enqueued_and_tracked() {
        let f = fixture();
        let mut s = scope(&f);

        let outcome = f
            .dispatcher
            .call(s.as_mut(), "contract", "terminate", &keys(&[1, 2]), json!("void"))
            .unwrap();
        s.commit().unwrap();

        let DispatchOutcome::Enqueued { task_id, ids, warning } = outcome else {
            panic!("expected an enqueued outcome");
        };
        assert_eq!(ids, keys(&[1, 2]));
        assert!(warning.key.starts_with("async_job_"));
        assert_eq!(f.runs.load(Ordering::SeqCst), 0);

        let (enqueued_id, request) = &f.broker.enqueued()[0];
        assert_eq!(*enqueued_id, task_id);
        assert_eq!(request.queue, "contract");
        assert_eq!(request.handler, ASYNC_METHOD);
        assert_eq!(request.user(), Some(UserId::new(5)));
        assert_eq!(request.kwarg_str("method_name").unwrap(), "terminate");
        assert_eq!(request.kwarg_str("model_name").unwrap(), "contract");
        assert_eq!(request.database(), Some("db"));

        let row = f.store.get("db", TASK_TABLE, "contract,2").unwrap();
        assert_eq!(row["task_id"], json!(task_id.to_string()));
    }

    #[test]
    fn ineligible_call_runs_inline_and_clears_stale_tasks() {
        let f = fixture();
        let stale = TaskId::new();
        f.store.seed(
            "db",
            TASK_TABLE,
            "contract,1",
            json!({"origin": "contract,1", "task_id": stale}),
        );
        f.broker.set_status(stale, TaskStatus::new(TaskState::Failure));

        let mut s = scope(&f);
        let outcome = f
            .dispatcher
            .call(s.as_mut(), "contract", "terminate", &keys(&[1]), json!("void"))
            .unwrap();
        s.commit().unwrap();

        assert_eq!(outcome, DispatchOutcome::Completed(json!(1)));
        assert_eq!(f.store.get("db", TASK_TABLE, "contract,1"), None);
        assert!(f.broker.enqueued().is_empty());
    }

    #[test]
    fn batch_and_forced_contexts_run_inline() {
        let f = fixture();
        for context in [
            ExecutionContext {
                from_batch: true,
                ..ExecutionContext::default()
            },
            ExecutionContext {
                force_synchronous: true,
                ..ExecutionContext::default()
            },
            ExecutionContext {
                will_be_rolled_back: true,
                ..ExecutionContext::default()
            },
        ] {
            let mut s = scope(&f);
            s.set_context(context);
            let outcome = f
                .dispatcher
                .call(s.as_mut(), "contract", "terminate", &keys(&[1, 2]), json!(null))
                .unwrap();
            assert!(matches!(outcome, DispatchOutcome::Completed(_)));
        }
        assert_eq!(f.runs.load(Ordering::SeqCst), 3);
        assert!(f.broker.enqueued().is_empty());
    }

    #[test]
    fn pending_task_blocks_without_contacting_the_broker() {
        let f = fixture();
        let mut s = scope(&f);
        f.dispatcher
            .call(s.as_mut(), "contract", "terminate", &keys(&[1, 2]), json!(null))
            .unwrap();
        s.commit().unwrap();

        let mut s = scope(&f);
        let err = f
            .dispatcher
            .call(s.as_mut(), "contract", "terminate", &keys(&[2, 3]), json!(null))
            .unwrap_err();

        assert_eq!(
            err,
            BatchError::PendingTasks {
                names: vec!["contract,2".to_string()]
            }
        );
        assert_eq!(f.broker.enqueued().len(), 1);
        assert!(f.dispatcher.guard_modification(s.as_mut(), "contract", &keys(&[1])).is_err());
        assert!(f.dispatcher.guard_modification(s.as_mut(), "contract", &keys(&[3])).is_ok());
    }

    #[test]
    fn completed_task_is_replaced() {
        let f = fixture();
        let mut s = scope(&f);
        let DispatchOutcome::Enqueued { task_id: first, .. } = f
            .dispatcher
            .call(s.as_mut(), "contract", "terminate", &keys(&[1, 2]), json!(null))
            .unwrap()
        else {
            panic!("expected an enqueued outcome");
        };
        s.commit().unwrap();
        f.broker.mark_succeeded(first, json!(2)).unwrap();

        let mut s = scope(&f);
        let DispatchOutcome::Enqueued { task_id: second, .. } = f
            .dispatcher
            .call(s.as_mut(), "contract", "terminate", &keys(&[1, 2]), json!(null))
            .unwrap()
        else {
            panic!("expected an enqueued outcome");
        };
        s.commit().unwrap();

        assert_ne!(first, second);
        let row = f.store.get("db", TASK_TABLE, "contract,1").unwrap();
        assert_eq!(row["task_id"], json!(second.to_string()));
    }

    #[test]
    fn async_workers_skip_the_pending_guard() {
        let f = fixture();
        let pending = f
            .broker
            .enqueue(EnqueueRequest {
                queue: "contract".to_string(),
                handler: ASYNC_METHOD.to_string(),
                args: json!({}),
                kwargs: Default::default(),
            })
            .unwrap();
        f.store.seed(
            "db",
            TASK_TABLE,
            "contract,1",
            json!({"origin": "contract,1", "task_id": pending}),
        );

        let mut s = scope(&f);
        s.set_context(ExecutionContext::async_worker());
        assert!(f.dispatcher.guard_modification(s.as_mut(), "contract", &keys(&[1])).is_ok());
    }

    #[test]
    fn task_info_messages() {
        let f = fixture();
        let mut s = scope(&f);
        f.dispatcher
            .call(s.as_mut(), "contract", "terminate", &keys(&[1, 2]), json!(null))
            .unwrap();
        s.commit().unwrap();
        let task_id = f.broker.enqueued()[0].0;

        let mut s = scope(&f);
        let info = f
            .dispatcher
            .task_info(s.as_mut(), "contract", &RecordKey::Id(1))
            .unwrap()
            .unwrap();
        assert_eq!(info.state, TaskState::Pending);
        assert!(info.message.unwrap().contains(&task_id.to_string()));

        f.broker.mark_failed(task_id, "Traceback: boom").unwrap();
        let info = f
            .dispatcher
            .task_info(s.as_mut(), "contract", &RecordKey::Id(1))
            .unwrap()
            .unwrap();
        assert_eq!(info.state, TaskState::Failure);
        assert!(info.message.unwrap().ends_with("details:\nTraceback: boom"));

        f.broker.forget(task_id);
        assert!(f
            .dispatcher
            .task_info(s.as_mut(), "contract", &RecordKey::Id(1))
            .unwrap()
            .is_none());
        assert!(f
            .dispatcher
            .task_info(s.as_mut(), "contract", &RecordKey::Id(9))
            .unwrap()
            .is_none());
    }

    #[test]
    fn runner_executes_inline_and_clears_rows() {
        let f = fixture();
        let mut s = scope(&f);
        f.dispatcher
            .call(s.as_mut(), "contract", "terminate", &keys(&[1, 2]), json!("void"))
            .unwrap();
        s.commit().unwrap();

        let claimed = f.broker.claim_next(&[]).unwrap().unwrap();
        let runner = AsyncMethodRunner::new(f.registry.clone(), f.broker.clone(), f.store.clone(), 3);
        let value = runner.run(&claimed.request).unwrap();

        assert_eq!(value, json!(2));
        assert_eq!(f.store.get("db", "contract", "1"), Some(json!("void")));
        assert_eq!(f.store.get("db", TASK_TABLE, "contract,1"), None);
        assert_eq!(f.broker.enqueued().len(), 1);
    }

    #[test]
    fn runner_retries_operational_errors() {
        let f = fixture();
        let request = EnqueueRequest::async_method(
            "contract",
            "terminate",
            &AsyncMethodArgs {
                ids: keys(&[1, 2]),
                args: json!("void"),
            },
            UserId::new(5),
            "db",
        )
        .unwrap();
        let runner = AsyncMethodRunner::new(f.registry.clone(), f.broker.clone(), f.store.clone(), 2);

        f.store.fail_next_commits(StoreError::operational("server closed the connection"), 2);
        assert_eq!(runner.run(&request).unwrap(), json!(2));
        assert_eq!(f.store.stats().started, 3);

        f.store.fail_next_commits(StoreError::operational("server closed the connection"), 3);
        assert!(runner.run(&request).unwrap_err().is_operational());
        assert_eq!(f.store.stats().started, 6);
    }

    #[test]
    fn runner_does_not_retry_conflicts() {
        let f = fixture();
        let request = EnqueueRequest::async_method(
            "contract",
            "terminate",
            &AsyncMethodArgs {
                ids: keys(&[1]),
                args: json!(null),
            },
            UserId::new(5),
            "db",
        )
        .unwrap();
        let runner = AsyncMethodRunner::new(f.registry.clone(), f.broker.clone(), f.store.clone(), 5);

        f.store.fail_next_commits(StoreError::conflict("40001"), 1);
        assert!(runner.run(&request).unwrap_err().is_recoverable_conflict());
        assert_eq!(f.store.stats().started, 1);
    }
}
