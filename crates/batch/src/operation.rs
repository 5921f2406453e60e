//! Batch operations and async-capable methods.
//!
//! Operations are registered explicitly in an
//! [`OperationRegistry`](crate::registry::OperationRegistry). The typed
//! [`BatchOperation`] trait is what implementors write; [`DynBatch`] is its
//! object-safe erasure used by the generator, the executor and the worker.

use serde_json::Value as JsonValue;

use policybatch_core::params::params;
use policybatch_core::{BatchResult, ParamMap, RecordKey, RecordUnit};

use crate::store::TransactionScope;

/// Lazy record selection.
pub type Selection<'a> = Box<dyn Iterator<Item = RecordUnit> + 'a>;

/// A named long-running business operation over a selection of records.
pub trait BatchOperation: Send + Sync + 'static {
    /// Business object materialized from record keys.
    type Instance;

    fn name(&self) -> &str;

    /// Batches that do not query records (imports, exports of a whole
    /// table) run as a single job and have no lifecycle hooks.
    fn no_select(&self) -> bool {
        false
    }

    /// Lowest-priority parameter layer.
    fn default_params(&self) -> ParamMap {
        let job_size = if self.no_select() { "0" } else { "1000" };
        params([("job_size", job_size), ("transaction_size", "0")])
    }

    /// Persisted configuration of this batch. May contain `disable`.
    fn batch_configuration(&self, _scope: &mut dyn TransactionScope) -> BatchResult<ParamMap> {
        Ok(ParamMap::new())
    }

    /// Normalize the merged parameters before control parameters are
    /// extracted.
    fn parse_params(&self, params: ParamMap) -> BatchResult<ParamMap> {
        Ok(params)
    }

    /// Convert job parameters into a form that survives the broker.
    fn serializable_params(&self, params: ParamMap) -> BatchResult<ParamMap> {
        Ok(params)
    }

    fn select_ids<'a>(
        &'a self,
        scope: &mut dyn TransactionScope,
        params: &ParamMap,
    ) -> BatchResult<Selection<'a>>;

    fn convert_to_instances(
        &self,
        scope: &mut dyn TransactionScope,
        keys: &[RecordKey],
        params: &ParamMap,
    ) -> BatchResult<Vec<Self::Instance>>;

    /// Process one sub-batch. `None` counts the sub-batch length.
    fn execute(
        &self,
        scope: &mut dyn TransactionScope,
        instances: Vec<Self::Instance>,
        keys: &[RecordKey],
        params: &ParamMap,
    ) -> BatchResult<Option<u64>>;

    fn on_job_success(
        &self,
        _scope: &mut dyn TransactionScope,
        _instances: Vec<Self::Instance>,
        _params: &ParamMap,
    ) -> BatchResult<()> {
        Ok(())
    }

    fn on_job_fail(
        &self,
        _scope: &mut dyn TransactionScope,
        _instances: Vec<Self::Instance>,
        _params: &ParamMap,
        _error: &str,
    ) -> BatchResult<()> {
        Ok(())
    }
}

/// Object-safe view of a [`BatchOperation`].
pub trait DynBatch: Send + Sync {
    fn batch_name(&self) -> &str;

    fn is_no_select(&self) -> bool;

    fn defaults(&self) -> ParamMap;

    fn configuration(&self, scope: &mut dyn TransactionScope) -> BatchResult<ParamMap>;

    fn parse(&self, params: ParamMap) -> BatchResult<ParamMap>;

    fn serializable(&self, params: ParamMap) -> BatchResult<ParamMap>;

    fn select<'a>(
        &'a self,
        scope: &mut dyn TransactionScope,
        params: &ParamMap,
    ) -> BatchResult<Selection<'a>>;

    /// Convert `keys` and execute them as one sub-batch.
    fn execute_keys(
        &self,
        scope: &mut dyn TransactionScope,
        keys: &[RecordKey],
        params: &ParamMap,
    ) -> BatchResult<Option<u64>>;

    fn job_succeeded(
        &self,
        scope: &mut dyn TransactionScope,
        keys: &[RecordKey],
        params: &ParamMap,
    ) -> BatchResult<()>;

    fn job_failed(
        &self,
        scope: &mut dyn TransactionScope,
        keys: &[RecordKey],
        params: &ParamMap,
        error: &str,
    ) -> BatchResult<()>;
}

impl<B> DynBatch for B
where
    B: BatchOperation,
{
    fn batch_name(&self) -> &str {
        self.name()
    }

    fn is_no_select(&self) -> bool {
        self.no_select()
    }

    fn defaults(&self) -> ParamMap {
        self.default_params()
    }

    fn configuration(&self, scope: &mut dyn TransactionScope) -> BatchResult<ParamMap> {
        self.batch_configuration(scope)
    }

    fn parse(&self, params: ParamMap) -> BatchResult<ParamMap> {
        self.parse_params(params)
    }

    fn serializable(&self, params: ParamMap) -> BatchResult<ParamMap> {
        self.serializable_params(params)
    }

    fn select<'a>(
        &'a self,
        scope: &mut dyn TransactionScope,
        params: &ParamMap,
    ) -> BatchResult<Selection<'a>> {
        self.select_ids(scope, params)
    }

    fn execute_keys(
        &self,
        scope: &mut dyn TransactionScope,
        keys: &[RecordKey],
        params: &ParamMap,
    ) -> BatchResult<Option<u64>> {
        let instances = self.convert_to_instances(scope, keys, params)?;
        self.execute(scope, instances, keys, params)
    }

    fn job_succeeded(
        &self,
        scope: &mut dyn TransactionScope,
        keys: &[RecordKey],
        params: &ParamMap,
    ) -> BatchResult<()> {
        let instances = self.convert_to_instances(scope, keys, params)?;
        self.on_job_success(scope, instances, params)
    }

    fn job_failed(
        &self,
        scope: &mut dyn TransactionScope,
        keys: &[RecordKey],
        params: &ParamMap,
        error: &str,
    ) -> BatchResult<()> {
        let instances = self.convert_to_instances(scope, keys, params)?;
        self.on_job_fail(scope, instances, params, error)
    }
}

/// A model method that may run in the background.
pub trait AsyncMethod: Send + Sync {
    fn model(&self) -> &str;

    fn name(&self) -> &str;

    /// Whether this call may be dispatched. `false` runs it inline.
    fn eligible(
        &self,
        _scope: &mut dyn TransactionScope,
        _keys: &[RecordKey],
        _args: &JsonValue,
    ) -> BatchResult<bool> {
        Ok(true)
    }

    fn run(
        &self,
        scope: &mut dyn TransactionScope,
        keys: &[RecordKey],
        args: &JsonValue,
    ) -> BatchResult<JsonValue>;
}
