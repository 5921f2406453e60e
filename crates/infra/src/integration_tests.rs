//! Integration tests for the full batch pipeline.
//!
//! Tests: generate → broker → worker → executor → store
//!
//! Verifies:
//! - Generated jobs are executed by the worker and their hooks run
//! - Failed jobs land on the failure list and can be resplit
//! - Serialization conflicts are retried inside the worker
//! - Async method dispatch is tracked per record until the worker ran it

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Value as JsonValue, json};

    use policybatch_batch::dispatch::TASK_TABLE;
    use policybatch_batch::identity::{ADMIN_LOGIN, USER_TABLE};
    use policybatch_batch::{
        AsyncDispatcher, AsyncMethod, BatchJobArgs, BatchOperation, ChainStatus, DispatchOutcome,
        EnqueueRequest, InMemoryBroker, InMemoryStore, InMemoryTelemetry, OperationRegistry, Selection,
        TaskBroker, TaskState, TransactionScope, WorkerQueue, resplit, run_in_transaction,
    };
    use policybatch_core::params::params;
    use policybatch_core::{
        BatchError, BatchResult, ParamMap, RecordKey, RecordUnit, StoreError, UserId,
    };

    use policybatch_observability::LogFormat;

    use crate::config::Settings;
    use crate::tasks::BatchTasks;
    use crate::worker::Worker;

    const DB: &str = "policybatch";
    const LOG_TABLE: &str = "batch.log";

    /// Stamps contracts. Records listed in `poison` make the job fail.
    struct Stamp {
        ids: Vec<i64>,
        poison: Vec<i64>,
    }

    impl BatchOperation for Stamp {
        type Instance = i64;

        fn name(&self) -> &str {
            "contract.stamp"
        }

        fn select_ids<'a>(
            &'a self,
            _scope: &mut dyn TransactionScope,
            _params: &ParamMap,
        ) -> BatchResult<Selection<'a>> {
            Ok(Box::new(self.ids.iter().copied().map(RecordUnit::from)))
        }

        fn convert_to_instances(
            &self,
            _scope: &mut dyn TransactionScope,
            keys: &[RecordKey],
            _params: &ParamMap,
        ) -> BatchResult<Vec<i64>> {
            Ok(keys.iter().filter_map(RecordKey::as_id).collect())
        }

        fn execute(
            &self,
            scope: &mut dyn TransactionScope,
            instances: Vec<i64>,
            _keys: &[RecordKey],
            _params: &ParamMap,
        ) -> BatchResult<Option<u64>> {
            for id in &instances {
                if self.poison.contains(id) {
                    return Err(BatchError::operation(format!("contract {id} is locked")));
                }
                scope.write("contract", &id.to_string(), json!({"stamped": true}))?;
            }
            Ok(None)
        }

        fn on_job_success(
            &self,
            scope: &mut dyn TransactionScope,
            instances: Vec<i64>,
            _params: &ParamMap,
        ) -> BatchResult<()> {
            let user = scope.user();
            scope.write(LOG_TABLE, &format!("success:{instances:?}"), json!(user))?;
            Ok(())
        }

        fn on_job_fail(
            &self,
            scope: &mut dyn TransactionScope,
            instances: Vec<i64>,
            _params: &ParamMap,
            error: &str,
        ) -> BatchResult<()> {
            scope.write(LOG_TABLE, &format!("fail:{instances:?}"), json!(error))?;
            Ok(())
        }
    }

    /// Imports a ledger file; selects nothing.
    struct Import;

    impl BatchOperation for Import {
        type Instance = ();

        fn name(&self) -> &str {
            "ledger.import"
        }

        fn no_select(&self) -> bool {
            true
        }

        fn select_ids<'a>(
            &'a self,
            _scope: &mut dyn TransactionScope,
            _params: &ParamMap,
        ) -> BatchResult<Selection<'a>> {
            Ok(Box::new(std::iter::empty()))
        }

        fn convert_to_instances(
            &self,
            _scope: &mut dyn TransactionScope,
            _keys: &[RecordKey],
            _params: &ParamMap,
        ) -> BatchResult<Vec<()>> {
            Ok(Vec::new())
        }

        fn execute(
            &self,
            _scope: &mut dyn TransactionScope,
            _instances: Vec<()>,
            _keys: &[RecordKey],
            _params: &ParamMap,
        ) -> BatchResult<Option<u64>> {
            Ok(Some(0))
        }
    }

    /// Terminates contracts in the background.
    struct Terminate;

    impl AsyncMethod for Terminate {
        fn model(&self) -> &str {
            "contract"
        }

        fn name(&self) -> &str {
            "terminate"
        }

        fn run(
            &self,
            scope: &mut dyn TransactionScope,
            keys: &[RecordKey],
            args: &JsonValue,
        ) -> BatchResult<JsonValue> {
            for key in keys {
                scope.write("contract", &key.to_string(), json!({"terminated": args}))?;
            }
            Ok(json!(keys.len()))
        }
    }

    struct Pipeline {
        registry: Arc<OperationRegistry>,
        store: Arc<InMemoryStore>,
        broker: Arc<InMemoryBroker>,
        telemetry: Arc<InMemoryTelemetry>,
        tasks: Arc<BatchTasks>,
        worker: Worker,
    }

    fn pipeline(poison: Vec<i64>) -> Pipeline {
        policybatch_observability::init_with(LogFormat::Pretty);

        let mut registry = OperationRegistry::new();
        registry
            .register_batch(Stamp {
                ids: (1..=5).collect(),
                poison,
            })
            .register_batch(Import)
            .register_async_method(Terminate);
        let registry = Arc::new(registry);

        let store = InMemoryStore::arc();
        store.seed(DB, USER_TABLE, ADMIN_LOGIN, json!({"id": 1, "company": 1}));
        let broker = InMemoryBroker::arc();
        let telemetry = Arc::new(InMemoryTelemetry::new());

        let settings = Settings {
            database: DB.to_string(),
            database_retry: 2,
            ..Settings::default()
        };
        let tasks = Arc::new(BatchTasks::new(
            registry.clone(),
            store.clone(),
            broker.clone(),
            telemetry.clone(),
            &settings,
        ));
        let mut worker = Worker::new(broker.clone());
        tasks.register(&mut worker);

        Pipeline {
            registry,
            store,
            broker,
            telemetry,
            tasks,
            worker,
        }
    }

    fn stamped(p: &Pipeline, id: i64) -> bool {
        p.store
            .get(DB, "contract", &id.to_string())
            .is_some_and(|row| row["stamped"] == json!(true))
    }

    #[test]
    fn generated_jobs_are_executed_by_the_worker() {
        let p = pipeline(vec![]);
        let report = p
            .tasks
            .generator(DB)
            .generate("contract.stamp", params([("job_size", "2")]))
            .unwrap();
        assert_eq!(report.chunk_sizes, vec![2, 2, 1]);

        assert_eq!(p.worker.run_pending(&[]).unwrap(), 3);

        for id in 1..=5 {
            assert!(stamped(&p, id), "contract {id} not stamped");
        }
        for task_id in &report.task_ids {
            let status = p.broker.status(*task_id).unwrap();
            assert_eq!(status.state, TaskState::Success);
        }
        assert_eq!(
            p.broker.status(report.task_ids[2]).unwrap().result,
            Some(json!([1]))
        );
        assert_eq!(
            p.store.get(DB, LOG_TABLE, "success:[1, 2]"),
            Some(json!(1)),
            "success hook runs as the admin user"
        );
        assert!(p.store.get(DB, LOG_TABLE, "success:[5]").is_some());
        assert!(p.broker.failed_tasks().unwrap().is_empty());
    }

    #[test]
    fn hooks_run_as_the_notified_user() {
        let p = pipeline(vec![]);
        p.tasks
            .generator(DB)
            .notify_user(Some(UserId::new(7)))
            .generate("contract.stamp", params([("job_size", "5")]))
            .unwrap();
        p.worker.run_pending(&[]).unwrap();

        assert_eq!(
            p.store.get(DB, LOG_TABLE, "success:[1, 2, 3, 4, 5]"),
            Some(json!(7))
        );
    }

    #[test]
    fn failed_job_runs_the_fail_hook_and_is_listed() {
        let p = pipeline(vec![3]);
        let report = p
            .tasks
            .generator(DB)
            .generate("contract.stamp", params([("job_size", "2")]))
            .unwrap();
        p.worker.run_pending(&[]).unwrap();

        let failed = report.task_ids[1];
        assert_eq!(p.broker.failed_tasks().unwrap(), vec![failed]);
        let status = p.broker.status(failed).unwrap();
        assert_eq!(status.state, TaskState::Failure);
        assert_eq!(
            status.traceback.as_deref(),
            Some("operation failed: contract 3 is locked")
        );

        // the failed job committed nothing
        assert!(!stamped(&p, 3));
        assert!(!stamped(&p, 4));
        assert!(stamped(&p, 5));
        assert_eq!(
            p.store.get(DB, LOG_TABLE, "fail:[3, 4]"),
            Some(json!("operation failed: contract 3 is locked"))
        );
    }

    #[test]
    fn resplit_isolates_the_failing_record() {
        let p = pipeline(vec![3]);
        let report = p
            .tasks
            .generator(DB)
            .generate("contract.stamp", params([("job_size", "2")]))
            .unwrap();
        p.worker.run_pending(&[]).unwrap();

        let single_jobs = resplit(p.broker.as_ref(), report.task_ids[1]).unwrap();
        assert_eq!(single_jobs.len(), 2);
        p.worker.run_pending(&[]).unwrap();

        assert!(stamped(&p, 4));
        assert!(!stamped(&p, 3));
        assert_eq!(p.broker.status(single_jobs[0]).unwrap().state, TaskState::Failure);
        assert_eq!(p.broker.status(single_jobs[1]).unwrap().state, TaskState::Success);
    }

    #[test]
    fn conflicts_are_retried_inside_the_worker() {
        let p = pipeline(vec![]);
        p.tasks
            .generator(DB)
            .generate("contract.stamp", params([("job_size", "5"), ("retry", "3")]))
            .unwrap();

        p.store
            .fail_next_commits(StoreError::conflict("could not serialize access"), 2);
        p.worker.run_pending(&[]).unwrap();

        assert!(stamped(&p, 1));
        assert!(p.broker.failed_tasks().unwrap().is_empty());
        assert_eq!(p.store.stats().failed_commits, 2);
    }

    #[test]
    fn exhausted_retries_fail_the_task() {
        let p = pipeline(vec![]);
        let report = p
            .tasks
            .generator(DB)
            .generate("contract.stamp", params([("job_size", "5"), ("retry", "1")]))
            .unwrap();

        p.store
            .fail_next_commits(StoreError::conflict("could not serialize access"), 2);
        p.worker.run_pending(&[]).unwrap();

        assert!(!stamped(&p, 1));
        assert_eq!(p.broker.failed_tasks().unwrap(), report.task_ids);
    }

    #[test]
    fn no_select_batch_reports_zero_records() {
        let p = pipeline(vec![]);
        let report = p.tasks.generator(DB).generate("ledger.import", ParamMap::new()).unwrap();

        assert!(report.is_empty());
        let reports = p.telemetry.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].queue, "ledger.import");
        assert_eq!(reports[0].nb_jobs, 0);
        assert_eq!(reports[0].nb_records, 0);
        assert_eq!(reports[0].status, ChainStatus::Success);
    }

    #[test]
    fn no_select_jobs_skip_the_hooks() {
        let p = pipeline(vec![]);
        let args = BatchJobArgs {
            name: "ledger.import".to_string(),
            chunk: vec![RecordKey::Name("ledger.csv".to_string())],
            params: params([("job_size", "0")]),
        };
        let request = EnqueueRequest::batch_exec(&args, DB, None).unwrap();
        let task_id = p.broker.enqueue(request).unwrap();
        p.worker.run_pending(&[]).unwrap();

        assert_eq!(p.broker.status(task_id).unwrap().result, Some(json!([0])));
        let logged = run_in_transaction(p.store.as_ref(), DB, UserId::ROOT, true, |scope| {
            Ok(scope.keys(LOG_TABLE)?)
        })
        .unwrap();
        assert!(logged.is_empty());
    }

    #[test]
    fn generation_can_run_on_a_worker() {
        let p = pipeline(vec![]);
        let task_id = p
            .tasks
            .enqueue_generation("contract.stamp", params([("job_size", "3")]))
            .unwrap();

        // the generation task and the two jobs it enqueued
        assert_eq!(p.worker.run_pending(&[]).unwrap(), 3);

        let status = p.broker.status(task_id).unwrap();
        assert_eq!(status.state, TaskState::Success);
        let result = status.result.unwrap();
        assert_eq!(result["nb_jobs"], json!(2));
        assert_eq!(result["nb_records"], json!(5));
        assert!((1..=5).all(|id| stamped(&p, id)));
    }

    #[test]
    fn async_method_is_tracked_until_the_worker_ran_it() {
        let p = pipeline(vec![]);
        let dispatcher = AsyncDispatcher::new(p.registry.clone(), p.broker.clone());
        let records = vec![RecordKey::Id(1), RecordKey::Id(2)];

        let outcome = run_in_transaction(p.store.as_ref(), DB, UserId::new(4), false, |scope| {
            dispatcher.call(scope, "contract", "terminate", &records, json!("void"))
        })
        .unwrap();
        let DispatchOutcome::Enqueued { task_id, .. } = outcome else {
            panic!("expected the call to be enqueued");
        };
        assert!(p.store.get(DB, TASK_TABLE, "contract,1").is_some());

        let blocked = run_in_transaction(p.store.as_ref(), DB, UserId::new(4), false, |scope| {
            dispatcher.guard_modification(scope, "contract", &records)
        });
        assert!(matches!(blocked, Err(BatchError::PendingTasks { ref names }) if names.len() == 2));

        p.worker.run_pending(&["contract".to_string()]).unwrap();

        let status = p.broker.status(task_id).unwrap();
        assert_eq!(status.state, TaskState::Success);
        assert_eq!(status.result, Some(json!(2)));
        assert_eq!(
            p.store.get(DB, "contract", "2"),
            Some(json!({"terminated": "void"}))
        );
        assert_eq!(p.store.get(DB, TASK_TABLE, "contract,1"), None);
        assert_eq!(p.store.get(DB, TASK_TABLE, "contract,2"), None);

        run_in_transaction(p.store.as_ref(), DB, UserId::new(4), false, |scope| {
            dispatcher.guard_modification(scope, "contract", &records)
        })
        .unwrap();
    }

    #[test]
    fn failed_async_method_keeps_its_task_rows() {
        let p = pipeline(vec![]);
        let dispatcher = AsyncDispatcher::new(p.registry.clone(), p.broker.clone());
        let records = vec![RecordKey::Id(1), RecordKey::Id(2)];

        let outcome = run_in_transaction(p.store.as_ref(), DB, UserId::new(4), false, |scope| {
            dispatcher.call(scope, "contract", "terminate", &records, json!("void"))
        })
        .unwrap();
        let DispatchOutcome::Enqueued { task_id, .. } = outcome else {
            panic!("expected the call to be enqueued");
        };

        // more operational failures than the configured database_retry
        p.store
            .fail_next_commits(StoreError::operational("connection reset"), 3);
        p.worker.run_pending(&[]).unwrap();

        assert_eq!(p.broker.status(task_id).unwrap().state, TaskState::Failure);
        let info = run_in_transaction(p.store.as_ref(), DB, UserId::new(4), true, |scope| {
            dispatcher.task_info(scope, "contract", &RecordKey::Id(1))
        })
        .unwrap()
        .unwrap();
        assert_eq!(info.state, TaskState::Failure);
        assert!(info.message.unwrap().contains("connection reset"));
    }
}
