//! Process caches for registry-derived lookups.
//!
//! Entries live until a [`CacheEvent`] received on the bus invalidates them.
//! Pending events are applied at the start of every lookup, so a cache never
//! serves an entry older than the last event it was sent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use policybatch_batch::store::read_row;
use policybatch_batch::{OperationRegistry, QueueableModel, TransactionScope};
use policybatch_core::{BatchError, BatchResult, EventTypeId};
use policybatch_events::{CacheChange, CacheEvent, EventBus, Subscription};

/// Table of model descriptions, keyed by model name.
pub const MODEL_TABLE: &str = "ir.model";
/// Table of business event types, keyed by code.
pub const EVENT_TYPE_TABLE: &str = "event.type";

#[derive(Debug, Deserialize)]
struct ModelRow {
    name: String,
}

/// Cached data of one event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTypeData {
    pub id: EventTypeId,
    #[serde(default)]
    pub actions: Vec<JsonValue>,
}

#[derive(Debug, Default)]
struct Entries {
    queueable: Option<Vec<QueueableModel>>,
    event_types: HashMap<String, EventTypeData>,
}

pub struct CacheService {
    registry: Arc<OperationRegistry>,
    entries: Mutex<Entries>,
    subscription: Mutex<Subscription<CacheEvent>>,
}

impl CacheService {
    pub fn new<B>(registry: Arc<OperationRegistry>, bus: &B) -> Self
    where
        B: EventBus<CacheEvent> + ?Sized,
    {
        Self {
            registry,
            entries: Mutex::new(Entries::default()),
            subscription: Mutex::new(bus.subscribe()),
        }
    }

    /// Queueable models sorted by label. Labels stored in the model table
    /// win over the registered ones.
    pub fn queueable_models(&self, scope: &mut dyn TransactionScope) -> BatchResult<Vec<QueueableModel>> {
        self.sync();
        if let Some(models) = self.lock()?.queueable.clone() {
            return Ok(models);
        }

        let mut models = Vec::new();
        for mut model in self.registry.queueable_models() {
            if let Some(row) = read_row::<ModelRow>(scope, MODEL_TABLE, &model.model)? {
                model.label = row.name;
            }
            models.push(model);
        }
        models.sort_by(|a, b| a.label.cmp(&b.label));

        self.lock()?.queueable = Some(models.clone());
        Ok(models)
    }

    pub fn event_type(&self, scope: &mut dyn TransactionScope, code: &str) -> BatchResult<EventTypeData> {
        self.sync();
        if let Some(data) = self.lock()?.event_types.get(code) {
            return Ok(data.clone());
        }

        let data: EventTypeData = read_row(scope, EVENT_TYPE_TABLE, code)?
            .ok_or_else(|| BatchError::not_found(format!("event type {code}")))?;
        self.lock()?
            .event_types
            .insert(code.to_string(), data.clone());
        Ok(data)
    }

    pub fn invalidate(&self, change: &CacheChange) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        match change {
            CacheChange::QueueableModels => entries.queueable = None,
            CacheChange::EventType { code } => {
                entries.event_types.remove(code);
            }
            CacheChange::AllEventTypes => entries.event_types.clear(),
        }
        debug!(change = ?change, "cache invalidated");
    }

    /// Apply every invalidation received so far.
    pub fn sync(&self) {
        let events = match self.subscription.lock() {
            Ok(subscription) => subscription.drain(),
            Err(_) => return,
        };
        for event in events {
            self.invalidate(&event.change);
        }
    }

    fn lock(&self) -> BatchResult<std::sync::MutexGuard<'_, Entries>> {
        self.entries
            .lock()
            .map_err(|_| BatchError::operation("cache lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policybatch_batch::{InMemoryStore, TransactionalStore};
    use policybatch_core::UserId;
    use policybatch_events::InMemoryEventBus;
    use serde_json::json;

    fn registry() -> Arc<OperationRegistry> {
        let mut registry = OperationRegistry::new();
        registry
            .register_model("contract", "Contract")
            .register_model("claim", "Claim");
        Arc::new(registry)
    }

    fn scope(store: &InMemoryStore) -> Box<dyn TransactionScope> {
        store.start("db", UserId::ROOT, true).unwrap()
    }

    #[test]
    fn queueable_models_are_cached_until_invalidated() {
        let store = InMemoryStore::new();
        let bus = InMemoryEventBus::new();
        let cache = CacheService::new(registry(), &bus);

        let labels = |models: Vec<QueueableModel>| -> Vec<String> {
            models.into_iter().map(|m| m.label).collect()
        };
        assert_eq!(
            labels(cache.queueable_models(scope(&store).as_mut()).unwrap()),
            vec!["Claim", "Contract"]
        );

        store.seed("db", MODEL_TABLE, "contract", json!({"name": "Agreement"}));
        assert_eq!(
            labels(cache.queueable_models(scope(&store).as_mut()).unwrap()),
            vec!["Claim", "Contract"]
        );

        bus.publish(CacheEvent::queueable_models_changed()).unwrap();
        assert_eq!(
            labels(cache.queueable_models(scope(&store).as_mut()).unwrap()),
            vec!["Agreement", "Claim"]
        );
    }

    #[test]
    fn event_types_are_invalidated_per_code() {
        let store = InMemoryStore::new();
        store.seed("db", EVENT_TYPE_TABLE, "activated", json!({"id": 1}));
        store.seed("db", EVENT_TYPE_TABLE, "closed", json!({"id": 2}));
        let bus = InMemoryEventBus::new();
        let cache = CacheService::new(registry(), &bus);

        assert_eq!(
            cache.event_type(scope(&store).as_mut(), "activated").unwrap().id,
            EventTypeId::new(1)
        );
        cache.event_type(scope(&store).as_mut(), "closed").unwrap();

        store.seed("db", EVENT_TYPE_TABLE, "activated", json!({"id": 10, "actions": [{"code": "notify"}]}));
        store.seed("db", EVENT_TYPE_TABLE, "closed", json!({"id": 20}));
        bus.publish(CacheEvent::event_type_changed("activated")).unwrap();

        let activated = cache.event_type(scope(&store).as_mut(), "activated").unwrap();
        assert_eq!(activated.id, EventTypeId::new(10));
        assert_eq!(activated.actions, vec![json!({"code": "notify"})]);
        assert_eq!(
            cache.event_type(scope(&store).as_mut(), "closed").unwrap().id,
            EventTypeId::new(2)
        );

        bus.publish(CacheEvent::all_event_types_changed()).unwrap();
        assert_eq!(
            cache.event_type(scope(&store).as_mut(), "closed").unwrap().id,
            EventTypeId::new(20)
        );
    }

    #[test]
    fn unknown_event_type_is_not_found() {
        let store = InMemoryStore::new();
        let bus = InMemoryEventBus::new();
        let cache = CacheService::new(registry(), &bus);
        assert!(matches!(
            cache.event_type(scope(&store).as_mut(), "missing"),
            Err(BatchError::NotFound(_))
        ));
    }
}
