use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A domain-agnostic event.
///
/// Events are immutable facts carrying a stable type name and schema version.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "cache.queueable_models.changed").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred.
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// What changed in the data behind a process cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheChange {
    /// A queueable model was registered, renamed or removed.
    QueueableModels,
    /// One business event type was created, written or deleted.
    EventType { code: String },
    /// The whole event type table must be reloaded.
    AllEventTypes,
}

/// Invalidation event for the process caches.
///
/// Publishers emit one of these after committing a change that cached
/// lookups depend on; cache services drop the matching entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEvent {
    pub change: CacheChange,
    pub occurred_at: DateTime<Utc>,
}

impl CacheEvent {
    pub fn new(change: CacheChange) -> Self {
        Self {
            change,
            occurred_at: Utc::now(),
        }
    }

    pub fn queueable_models_changed() -> Self {
        Self::new(CacheChange::QueueableModels)
    }

    pub fn event_type_changed(code: impl Into<String>) -> Self {
        Self::new(CacheChange::EventType { code: code.into() })
    }

    pub fn all_event_types_changed() -> Self {
        Self::new(CacheChange::AllEventTypes)
    }
}

impl Event for CacheEvent {
    fn event_type(&self) -> &'static str {
        match self.change {
            CacheChange::QueueableModels => "cache.queueable_models.changed",
            CacheChange::EventType { .. } => "cache.event_type.changed",
            CacheChange::AllEventTypes => "cache.event_types.reloaded",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
