//! Explicit registry of batch operations and async-capable methods.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use policybatch_core::{BatchError, BatchResult};

use crate::operation::{AsyncMethod, BatchOperation, DynBatch};

/// A model whose methods may be dispatched to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueableModel {
    pub model: String,
    pub label: String,
}

/// Name-indexed operations, resolved once at startup.
#[derive(Default)]
pub struct OperationRegistry {
    batches: HashMap<String, Arc<dyn DynBatch>>,
    models: BTreeMap<String, String>,
    methods: HashMap<(String, String), Arc<dyn AsyncMethod>>,
}

impl core::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("batches", &self.batch_names())
            .field("models", &self.models)
            .field("methods", &self.methods.len())
            .finish()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_batch<B: BatchOperation>(&mut self, operation: B) -> &mut Self {
        self.register_dyn_batch(Arc::new(operation))
    }

    pub fn register_dyn_batch(&mut self, operation: Arc<dyn DynBatch>) -> &mut Self {
        let name = operation.batch_name().to_string();
        debug!(batch = %name, "registered batch operation");
        self.batches.insert(name, operation);
        self
    }

    /// Declare `model` as queueable, displayed as `label`.
    pub fn register_model(&mut self, model: impl Into<String>, label: impl Into<String>) -> &mut Self {
        self.models.insert(model.into(), label.into());
        self
    }

    /// Register an async-capable method. Its model becomes queueable.
    pub fn register_async_method<M>(&mut self, method: M) -> &mut Self
    where
        M: AsyncMethod + 'static,
    {
        let model = method.model().to_string();
        let name = method.name().to_string();
        self.models
            .entry(model.clone())
            .or_insert_with(|| model.clone());
        debug!(model = %model, method = %name, "registered async method");
        self.methods.insert((model, name), Arc::new(method));
        self
    }

    /// Resolve a batch by name.
    ///
    /// A known model that is not a batch yields `NotBatch`.
    pub fn resolve_batch(&self, name: &str) -> BatchResult<Arc<dyn DynBatch>> {
        if let Some(op) = self.batches.get(name) {
            return Ok(Arc::clone(op));
        }
        if self.models.contains_key(name) {
            return Err(BatchError::NotBatch(name.to_string()));
        }
        Err(BatchError::not_found(format!("{name} is not a valid model name")))
    }

    pub fn resolve_method(&self, model: &str, method: &str) -> BatchResult<Arc<dyn AsyncMethod>> {
        self.methods
            .get(&(model.to_string(), method.to_string()))
            .cloned()
            .ok_or_else(|| BatchError::not_found(format!("{model}.{method}")))
    }

    /// Queueable models ordered by label.
    pub fn queueable_models(&self) -> Vec<QueueableModel> {
        let mut models: Vec<QueueableModel> = self
            .models
            .iter()
            .map(|(model, label)| QueueableModel {
                model: model.clone(),
                label: label.clone(),
            })
            .collect();
        models.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.model.cmp(&b.model)));
        models
    }

    pub fn batch_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.batches.keys().cloned().collect();
        names.sort();
        names
    }
}
