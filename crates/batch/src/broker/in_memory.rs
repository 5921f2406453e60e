use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;

use policybatch_core::{BrokerError, TaskId};

use super::{ClaimedTask, EnqueueRequest, TaskBroker, TaskState, TaskStatus, WorkerQueue};

#[derive(Debug, Default)]
struct Inner {
    waiting: VecDeque<TaskId>,
    log: HashMap<TaskId, EnqueueRequest>,
    states: HashMap<TaskId, TaskStatus>,
    order: Vec<TaskId>,
    failed: Vec<TaskId>,
}

/// In-memory broker for tests/dev.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of requests waiting on `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .waiting
                    .iter()
                    .filter(|id| inner.log.get(*id).is_some_and(|r| r.queue == queue))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Every request ever enqueued, in enqueue order.
    pub fn enqueued(&self) -> Vec<(TaskId, EnqueueRequest)> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .order
                    .iter()
                    .filter_map(|id| inner.log.get(id).map(|r| (*id, r.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Overwrite the state of a task.
    pub fn set_status(&self, task_id: TaskId, status: TaskStatus) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.states.insert(task_id, status);
        }
    }

    /// Drop every trace of a task, as when its result expires.
    pub fn forget(&self, task_id: TaskId) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.states.remove(&task_id);
            inner.log.remove(&task_id);
            inner.waiting.retain(|id| *id != task_id);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, BrokerError> {
        self.inner
            .lock()
            .map_err(|_| BrokerError::Connection("in-memory broker lock poisoned".to_string()))
    }
}

impl TaskBroker for InMemoryBroker {
    fn enqueue(&self, request: EnqueueRequest) -> Result<TaskId, BrokerError> {
        let task_id = TaskId::new();
        let mut inner = self.lock()?;
        inner.log.insert(task_id, request);
        inner.states.insert(task_id, TaskStatus::new(TaskState::Pending));
        inner.waiting.push_back(task_id);
        inner.order.push(task_id);
        Ok(task_id)
    }

    fn status(&self, task_id: TaskId) -> Result<TaskStatus, BrokerError> {
        self.lock()?
            .states
            .get(&task_id)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownTask(task_id.to_string()))
    }

    fn logged_job(&self, task_id: TaskId) -> Result<Option<EnqueueRequest>, BrokerError> {
        Ok(self.lock()?.log.get(&task_id).cloned())
    }
}

impl WorkerQueue for InMemoryBroker {
    fn claim_next(&self, queues: &[String]) -> Result<Option<ClaimedTask>, BrokerError> {
        let mut inner = self.lock()?;

        let position = if queues.is_empty() {
            (!inner.waiting.is_empty()).then_some(0)
        } else {
            queues.iter().find_map(|queue| {
                inner.waiting.iter().position(|id| {
                    inner
                        .log
                        .get(id)
                        .is_some_and(|request| &request.queue == queue)
                })
            })
        };

        let Some(task_id) = position.and_then(|pos| inner.waiting.remove(pos)) else {
            return Ok(None);
        };
        let request = inner
            .log
            .get(&task_id)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownTask(task_id.to_string()))?;
        inner.states.insert(task_id, TaskStatus::new(TaskState::Started));
        Ok(Some(ClaimedTask { task_id, request }))
    }

    fn mark_succeeded(&self, task_id: TaskId, result: JsonValue) -> Result<(), BrokerError> {
        let mut inner = self.lock()?;
        let status = TaskStatus {
            state: TaskState::Success,
            traceback: None,
            result: Some(result),
        };
        inner.states.insert(task_id, status);
        Ok(())
    }

    fn mark_failed(&self, task_id: TaskId, traceback: &str) -> Result<(), BrokerError> {
        let mut inner = self.lock()?;
        let status = TaskStatus {
            state: TaskState::Failure,
            traceback: Some(traceback.to_string()),
            result: None,
        };
        inner.states.insert(task_id, status);
        inner.failed.push(task_id);
        Ok(())
    }

    fn failed_tasks(&self) -> Result<Vec<TaskId>, BrokerError> {
        Ok(self.lock()?.failed.iter().rev().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(queue: &str) -> EnqueueRequest {
        EnqueueRequest {
            queue: queue.to_string(),
            handler: "batch_exec".to_string(),
            args: json!({}),
            kwargs: Default::default(),
        }
    }

    #[test]
    fn claimed_tasks_are_started_then_finished() {
        let broker = InMemoryBroker::new();
        let id = broker.enqueue(request("a")).unwrap();
        assert_eq!(broker.status(id).unwrap().state, TaskState::Pending);

        let claimed = broker.claim_next(&[]).unwrap().unwrap();
        assert_eq!(claimed.task_id, id);
        assert_eq!(broker.status(id).unwrap().state, TaskState::Started);

        broker.mark_succeeded(id, json!([3])).unwrap();
        let status = broker.status(id).unwrap();
        assert_eq!(status.state, TaskState::Success);
        assert_eq!(status.result, Some(json!([3])));
        assert!(broker.claim_next(&[]).unwrap().is_none());
    }

    #[test]
    fn claim_honours_queue_priority() {
        let broker = InMemoryBroker::new();
        let a = broker.enqueue(request("a")).unwrap();
        let b = broker.enqueue(request("b")).unwrap();

        let queues = vec!["b".to_string(), "a".to_string()];
        assert_eq!(broker.claim_next(&queues).unwrap().unwrap().task_id, b);
        assert_eq!(broker.claim_next(&queues).unwrap().unwrap().task_id, a);
        assert!(broker.claim_next(&["c".to_string()]).unwrap().is_none());
    }

    #[test]
    fn failures_are_listed_most_recent_first() {
        let broker = InMemoryBroker::new();
        let a = broker.enqueue(request("a")).unwrap();
        let b = broker.enqueue(request("a")).unwrap();
        broker.mark_failed(a, "Traceback: a").unwrap();
        broker.mark_failed(b, "Traceback: b").unwrap();

        assert_eq!(broker.failed_tasks().unwrap(), vec![b, a]);
        assert_eq!(
            broker.status(a).unwrap().traceback.as_deref(),
            Some("Traceback: a")
        );
    }

    #[test]
    fn forgotten_tasks_are_unknown() {
        let broker = InMemoryBroker::new();
        let id = broker.enqueue(request("a")).unwrap();
        broker.forget(id);
        assert!(matches!(broker.status(id), Err(BrokerError::UnknownTask(_))));
        assert_eq!(broker.queue_len("a"), 0);
    }
}
