//! Worker-side handlers of the three task kinds.
//!
//! - `batch_exec`: run one job through the [`JobExecutor`], then the
//!   operation's lifecycle hook
//! - `async_method_execution`: run a dispatched model method
//! - `batch_generate`: generate a batch from a worker

use std::sync::Arc;

use chrono::Local;
use serde_json::{Value as JsonValue, json};
use tracing::{error, info};

use policybatch_batch::broker::{ASYNC_METHOD, BATCH_EXEC, BATCH_GENERATE};
use policybatch_batch::executor::results_value;
use policybatch_batch::{
    AsyncMethodRunner, BatchGenerateArgs, BatchGenerator, BatchJobArgs, ConfigSource,
    ControlParams, DynBatch, EnqueueRequest, ExecutionContext, IdentityResolver, JobExecutor,
    JobOrigin, NoConfig, OperationRegistry, StoredAdminIdentity, TaskBroker, TelemetrySink,
    TransactionalStore, run_in_transaction,
};
use policybatch_core::{BatchResult, ParamMap, TaskId, UserId};

use crate::config::Settings;
use crate::worker::Worker;

pub struct BatchTasks {
    registry: Arc<OperationRegistry>,
    store: Arc<dyn TransactionalStore>,
    broker: Arc<dyn TaskBroker>,
    telemetry: Arc<dyn TelemetrySink>,
    identity: Arc<dyn IdentityResolver>,
    config: Arc<dyn ConfigSource>,
    database: String,
    database_retry: u32,
}

impl BatchTasks {
    pub fn new(
        registry: Arc<OperationRegistry>,
        store: Arc<dyn TransactionalStore>,
        broker: Arc<dyn TaskBroker>,
        telemetry: Arc<dyn TelemetrySink>,
        settings: &Settings,
    ) -> Self {
        Self {
            registry,
            store,
            broker,
            telemetry,
            identity: Arc::new(StoredAdminIdentity),
            config: Arc::new(NoConfig),
            database: settings.database.clone(),
            database_retry: settings.database_retry,
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_config(mut self, config: Arc<dyn ConfigSource>) -> Self {
        self.config = config;
        self
    }

    /// Register every handler on `worker`.
    pub fn register(self: &Arc<Self>, worker: &mut Worker) {
        let tasks = self.clone();
        worker.register_handler(BATCH_EXEC, move |request| tasks.run_batch_job(request));
        let tasks = self.clone();
        worker.register_handler(ASYNC_METHOD, move |request| tasks.run_async_method(request));
        let tasks = self.clone();
        worker.register_handler(BATCH_GENERATE, move |request| tasks.run_generate(request));
    }

    /// Generator sharing this wiring.
    pub fn generator(&self, database: &str) -> BatchGenerator {
        BatchGenerator::new(
            self.registry.clone(),
            self.store.clone(),
            self.broker.clone(),
            self.telemetry.clone(),
            database,
        )
        .with_identity(self.identity.clone())
        .with_config(self.config.clone())
    }

    pub fn run_batch_job(&self, request: &EnqueueRequest) -> BatchResult<JsonValue> {
        let args: BatchJobArgs = request.decode_args(BATCH_EXEC)?;
        let origin = JobOrigin::from_request(request, &self.database);

        let outcome = JobExecutor::new(self.registry.clone(), self.store.clone())
            .with_identity(self.identity.clone())
            .execute(&args, &origin);

        if let Ok(operation) = self.registry.resolve_batch(&args.name) {
            if !operation.is_no_select() {
                let failure = outcome.as_ref().err().map(ToString::to_string);
                self.run_hook(operation.as_ref(), &args, &origin, failure);
            }
        }

        outcome.map(|results| results_value(&results))
    }

    /// Run `on_job_success` (no error) or `on_job_fail` in a fresh scope.
    /// Hook failures are logged and never change the job outcome.
    fn run_hook(
        &self,
        operation: &dyn DynBatch,
        args: &BatchJobArgs,
        origin: &JobOrigin,
        failure: Option<String>,
    ) {
        let name = operation.batch_name();
        let outcome = self.hook_user(origin).and_then(|user| {
            let mut business = operation.parse(args.params.clone())?;
            let control = ControlParams::extract(&mut business, Local::now().date_naive())?;

            run_in_transaction(self.store.as_ref(), &origin.database, user, false, |scope| {
                let identity = self.identity.resolve(scope)?;
                scope.set_context(ExecutionContext {
                    user_to_notify: origin.user_to_notify,
                    auto_accept_warnings: true,
                    ..ExecutionContext::for_batch(control.connection_date, identity.company)
                        .with_sizes(control.job_size, control.transaction_size)
                });
                match &failure {
                    None => operation.job_succeeded(scope, &args.chunk, &business),
                    Some(error) => operation.job_failed(scope, &args.chunk, &business, error),
                }
            })
        });

        if let Err(err) = outcome {
            let hook = if failure.is_none() { "on_job_success" } else { "on_job_fail" };
            error!(batch = %name, hook, error = %err, "job hook failed");
        }
    }

    /// The notified user, or the admin user.
    fn hook_user(&self, origin: &JobOrigin) -> BatchResult<UserId> {
        match origin.user_to_notify {
            Some(user) => Ok(user),
            None => run_in_transaction(self.store.as_ref(), &origin.database, UserId::ROOT, true, |scope| {
                Ok(self.identity.resolve(scope)?.user)
            }),
        }
    }

    pub fn run_async_method(&self, request: &EnqueueRequest) -> BatchResult<JsonValue> {
        AsyncMethodRunner::new(
            self.registry.clone(),
            self.broker.clone(),
            self.store.clone(),
            self.database_retry,
        )
        .run(request)
    }

    pub fn run_generate(&self, request: &EnqueueRequest) -> BatchResult<JsonValue> {
        let args: BatchGenerateArgs = request.decode_args(BATCH_GENERATE)?;
        let database = request.database().unwrap_or(&self.database);
        let report = self
            .generator(database)
            .notify_user(request.user())
            .generate(&args.name, args.params)?;

        info!(batch = %args.name, nb_jobs = report.nb_jobs(), "batch generated by worker");
        Ok(json!({
            "nb_jobs": report.nb_jobs(),
            "nb_records": report.nb_records(),
            "task_ids": report.task_ids.iter().map(ToString::to_string).collect::<Vec<_>>(),
        }))
    }

    /// Enqueue a `batch_generate` task.
    pub fn enqueue_generation(&self, name: &str, params: ParamMap) -> BatchResult<TaskId> {
        let args = BatchGenerateArgs {
            name: name.to_string(),
            params,
        };
        Ok(self
            .broker
            .enqueue(EnqueueRequest::batch_generate(&args, &self.database)?)?)
    }
}
