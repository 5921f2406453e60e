//! Batch generation: select, split, enqueue.

use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use tracing::{error, info, warn};

use policybatch_core::params::is_truthy;
use policybatch_core::{BatchResult, ParamMap, TaskId, UserId};

use crate::broker::{BatchJobArgs, EnqueueRequest, TaskBroker};
use crate::context::ExecutionContext;
use crate::control::{ControlParams, DISABLE};
use crate::identity::{IdentityResolver, StoredAdminIdentity};
use crate::operation::DynBatch;
use crate::registry::OperationRegistry;
use crate::split::split_batch;
use crate::store::{TransactionScope, TransactionalStore, rollback_quietly};
use crate::telemetry::{ChainReport, TelemetrySink};

/// Configuration-file parameters of a batch.
pub trait ConfigSource: Send + Sync {
    /// Parameters of the `default` section overlaid with the batch's own
    /// section. File-layout settings are not included.
    fn batch_params(&self, batch: &str) -> ParamMap;
}

/// No configuration file.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConfig;

impl ConfigSource for NoConfig {
    fn batch_params(&self, _batch: &str) -> ParamMap {
        ParamMap::new()
    }
}

/// What one generation enqueued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationReport {
    pub chunk_sizes: Vec<usize>,
    pub task_ids: Vec<TaskId>,
}

impl GenerationReport {
    pub fn nb_jobs(&self) -> usize {
        self.chunk_sizes.len()
    }

    pub fn nb_records(&self) -> usize {
        self.chunk_sizes.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_sizes.is_empty()
    }
}

pub struct BatchGenerator {
    registry: Arc<OperationRegistry>,
    store: Arc<dyn TransactionalStore>,
    broker: Arc<dyn TaskBroker>,
    telemetry: Arc<dyn TelemetrySink>,
    identity: Arc<dyn IdentityResolver>,
    config: Arc<dyn ConfigSource>,
    database: String,
    notify: Option<UserId>,
}

impl BatchGenerator {
    pub fn new(
        registry: Arc<OperationRegistry>,
        store: Arc<dyn TransactionalStore>,
        broker: Arc<dyn TaskBroker>,
        telemetry: Arc<dyn TelemetrySink>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            store,
            broker,
            telemetry,
            identity: Arc::new(StoredAdminIdentity),
            config: Arc::new(NoConfig),
            database: database.into(),
            notify: None,
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

    /// User notified by the jobs' lifecycle hooks.
    pub fn notify_user(mut self, user: Option<UserId>) -> Self {
        self.notify = user;
        self
    }

    pub fn generate(&self, name: &str, overrides: ParamMap) -> BatchResult<GenerationReport> {
        self.generate_at(name, overrides, Local::now().naive_local())
    }

    /// Generate as if launched at `now`.
    pub fn generate_at(
        &self,
        name: &str,
        overrides: ParamMap,
        now: NaiveDateTime,
    ) -> BatchResult<GenerationReport> {
        info!(batch = %name, arguments = ?overrides, "batch arguments");

        let operation = self.registry.resolve_batch(name).inspect_err(|err| {
            error!(batch = %name, error = %err, "cannot generate batch");
        })?;

        let mut scope = self
            .store
            .start(&self.database, UserId::ROOT, true)
            .inspect_err(|err| {
                error!(batch = %name, error = %err, "batch generation failed");
            })?;
        let report = match self.generate_in(scope.as_mut(), operation.as_ref(), overrides, now) {
            Ok(report) => report,
            Err(err) => {
                rollback_quietly(scope.as_mut());
                error!(batch = %name, error = %err, "batch generation failed");
                return Err(err);
            }
        };

        // The jobs are on the broker already.
        if let Err(err) = scope.commit() {
            warn!(batch = %name, error = %err, "generation scope did not close cleanly");
            rollback_quietly(scope.as_mut());
        }
        Ok(report)
    }

    fn generate_in(
        &self,
        scope: &mut dyn TransactionScope,
        operation: &dyn DynBatch,
        overrides: ParamMap,
        now: NaiveDateTime,
    ) -> BatchResult<GenerationReport> {
        let name = operation.batch_name();
        let identity = self.identity.resolve(scope)?;

        let mut params = operation.defaults();
        params.extend(self.config.batch_params(name));
        params.extend(operation.configuration(scope)?);
        if params.remove(DISABLE).is_some_and(|v| is_truthy(&v)) {
            info!(batch = %name, "this batch has been disabled");
            return Ok(GenerationReport::default());
        }
        params.extend(overrides);

        let mut params = operation.parse(params)?;
        let control = ControlParams::extract(&mut params, now.date())?;
        control.validate()?;
        let job_params = operation.serializable(control.into_job_params(&params))?;

        scope.set_context(
            ExecutionContext::for_batch(control.connection_date, identity.company)
                .with_sizes(control.job_size, control.transaction_size),
        );

        let report = match self.enqueue_all(scope, operation, &params, &job_params, &control, now) {
            Ok(report) => report,
            Err(err) => {
                error!(batch = %name, error = %err, "job generation crashed");
                self.record(&ChainReport::failed(&control.chain_name, name, now));
                return Err(err);
            }
        };

        info!(
            batch = %name,
            nb_jobs = report.nb_jobs(),
            nb_records = report.nb_records(),
            params = ?params,
            "jobs generated"
        );
        Ok(report)
    }

    fn enqueue_all(
        &self,
        scope: &mut dyn TransactionScope,
        operation: &dyn DynBatch,
        params: &ParamMap,
        job_params: &ParamMap,
        control: &ControlParams,
        now: NaiveDateTime,
    ) -> BatchResult<GenerationReport> {
        let name = operation.batch_name();
        let mut report = GenerationReport::default();

        for chunk in split_batch(operation.select(scope, params)?, control.job_size) {
            let size = chunk.len();
            let args = BatchJobArgs {
                name: name.to_string(),
                chunk,
                params: job_params.clone(),
            };
            let request = EnqueueRequest::batch_exec(&args, &self.database, self.notify)?;
            report.task_ids.push(self.broker.enqueue(request)?);
            report.chunk_sizes.push(size);
        }

        if report.is_empty() {
            self.record(&ChainReport::empty(&control.chain_name, name, now));
        }
        Ok(report)
    }

    fn record(&self, report: &ChainReport) {
        if let Err(err) = self.telemetry.record(report) {
            warn!(
                chain = %report.chain_name,
                queue = %report.queue,
                error = %err,
                "cannot record chain telemetry"
            );
        }
    }
}
