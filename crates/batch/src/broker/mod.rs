//! Task broker boundary.
//!
//! The broker stores enqueued requests, hands them to workers and keeps
//! their state. Every enqueue is also logged so a job can be inspected,
//! replayed or resplit after the fact.

mod in_memory;

pub use in_memory::InMemoryBroker;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use policybatch_core::{BatchError, BatchResult, BrokerError, ParamMap, RecordKey, TaskId, UserId};

use crate::control::job_allows_split;

/// Handler of batch job requests.
pub const BATCH_EXEC: &str = "batch_exec";
/// Handler of batch generation requests.
pub const BATCH_GENERATE: &str = "batch_generate";
/// Handler of async model method requests.
pub const ASYNC_METHOD: &str = "async_method_execution";

/// Arguments of a `batch_exec` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJobArgs {
    pub name: String,
    pub chunk: Vec<RecordKey>,
    pub params: ParamMap,
}

/// Arguments of an `async_method_execution` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncMethodArgs {
    pub ids: Vec<RecordKey>,
    #[serde(default)]
    pub args: JsonValue,
}

/// Arguments of a `batch_generate` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchGenerateArgs {
    pub name: String,
    #[serde(default)]
    pub params: ParamMap,
}

/// A request to run `handler` on a worker listening to `queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub queue: String,
    pub handler: String,
    pub args: JsonValue,
    #[serde(default)]
    pub kwargs: ParamMap,
}

impl EnqueueRequest {
    pub fn batch_exec(args: &BatchJobArgs, database: &str, user: Option<UserId>) -> BatchResult<Self> {
        let mut kwargs = ParamMap::new();
        kwargs.insert("database".to_string(), JsonValue::from(database));
        if let Some(user) = user {
            kwargs.insert("user".to_string(), JsonValue::from(user.get()));
        }
        Ok(Self {
            queue: args.name.clone(),
            handler: BATCH_EXEC.to_string(),
            args: serde_json::to_value(args)?,
            kwargs,
        })
    }

    pub fn batch_generate(args: &BatchGenerateArgs, database: &str) -> BatchResult<Self> {
        let mut kwargs = ParamMap::new();
        kwargs.insert("database".to_string(), JsonValue::from(database));
        Ok(Self {
            queue: args.name.clone(),
            handler: BATCH_GENERATE.to_string(),
            args: serde_json::to_value(args)?,
            kwargs,
        })
    }

    /// Queue is the model name.
    pub fn async_method(
        model: &str,
        method: &str,
        args: &AsyncMethodArgs,
        user: UserId,
        database: &str,
    ) -> BatchResult<Self> {
        let mut kwargs = ParamMap::new();
        kwargs.insert("user".to_string(), JsonValue::from(user.get()));
        kwargs.insert("model_name".to_string(), JsonValue::from(model));
        kwargs.insert("method_name".to_string(), JsonValue::from(method));
        kwargs.insert("database".to_string(), JsonValue::from(database));
        Ok(Self {
            queue: model.to_string(),
            handler: ASYNC_METHOD.to_string(),
            args: serde_json::to_value(args)?,
            kwargs,
        })
    }

    pub fn database(&self) -> Option<&str> {
        self.kwargs.get("database").and_then(JsonValue::as_str)
    }

    pub fn user(&self) -> Option<UserId> {
        self.kwargs
            .get("user")
            .and_then(JsonValue::as_i64)
            .map(UserId::new)
    }

    pub fn kwarg_str(&self, name: &str) -> BatchResult<&str> {
        self.kwargs
            .get(name)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| BatchError::invalid_param(name, "missing from task kwargs"))
    }

    /// Decode the arguments of a `handler` request.
    pub fn decode_args<T>(&self, handler: &str) -> BatchResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        if self.handler != handler {
            return Err(BatchError::invalid_param(
                "handler",
                format!("expected {handler}, got {}", self.handler),
            ));
        }
        Ok(serde_json::from_value(self.args.clone())?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Started,
    Success,
    Failure,
    Retry,
    Revoked,
}

impl TaskState {
    /// States that block a new dispatch on the same records.
    pub fn is_pending(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Started | TaskState::Retry)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure | TaskState::Revoked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
            TaskState::Retry => "RETRY",
            TaskState::Revoked => "REVOKED",
        }
    }
}

impl core::fmt::Display for TaskState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TaskState {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskState::Pending),
            "STARTED" => Ok(TaskState::Started),
            "SUCCESS" => Ok(TaskState::Success),
            "FAILURE" => Ok(TaskState::Failure),
            "RETRY" => Ok(TaskState::Retry),
            "REVOKED" => Ok(TaskState::Revoked),
            other => Err(BrokerError::Serialization(format!("unknown task state {other:?}"))),
        }
    }
}

/// Polled state of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
}

impl TaskStatus {
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            traceback: None,
            result: None,
        }
    }
}

/// Producer side of the broker.
pub trait TaskBroker: Send + Sync {
    fn enqueue(&self, request: EnqueueRequest) -> Result<TaskId, BrokerError>;

    /// Fails with [`BrokerError::UnknownTask`] once the broker forgot the
    /// task (never enqueued, or its result expired).
    fn status(&self, task_id: TaskId) -> Result<TaskStatus, BrokerError>;

    fn logged_job(&self, task_id: TaskId) -> Result<Option<EnqueueRequest>, BrokerError>;
}

/// A request handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub task_id: TaskId,
    pub request: EnqueueRequest,
}

/// Consumer side of the broker.
pub trait WorkerQueue: Send + Sync {
    /// Take the oldest request of the first non-empty queue and mark it
    /// started. An empty `queues` slice listens to every queue.
    fn claim_next(&self, queues: &[String]) -> Result<Option<ClaimedTask>, BrokerError>;

    fn mark_succeeded(&self, task_id: TaskId, result: JsonValue) -> Result<(), BrokerError>;

    /// Record the failure and push the task on the failure list.
    fn mark_failed(&self, task_id: TaskId, traceback: &str) -> Result<(), BrokerError>;

    /// Failed task ids, most recent first.
    fn failed_tasks(&self) -> Result<Vec<TaskId>, BrokerError>;
}

impl<B> TaskBroker for std::sync::Arc<B>
where
    B: TaskBroker + ?Sized,
{
    fn enqueue(&self, request: EnqueueRequest) -> Result<TaskId, BrokerError> {
        (**self).enqueue(request)
    }

    fn status(&self, task_id: TaskId) -> Result<TaskStatus, BrokerError> {
        (**self).status(task_id)
    }

    fn logged_job(&self, task_id: TaskId) -> Result<Option<EnqueueRequest>, BrokerError> {
        (**self).logged_job(task_id)
    }
}

/// Enqueue a logged job again, unchanged.
pub fn replay<B>(broker: &B, task_id: TaskId) -> BatchResult<TaskId>
where
    B: TaskBroker + ?Sized,
{
    let request = broker
        .logged_job(task_id)?
        .ok_or_else(|| BatchError::not_found(format!("job {task_id}")))?;
    let replayed = broker.enqueue(request)?;
    info!(task_id = %task_id, replayed = %replayed, "job replayed");
    Ok(replayed)
}

/// Enqueue a logged `batch_exec` job again as one job per record.
pub fn resplit<B>(broker: &B, task_id: TaskId) -> BatchResult<Vec<TaskId>>
where
    B: TaskBroker + ?Sized,
{
    let not_splittable = || BatchError::NotSplittable(task_id.to_string());

    let request = broker.logged_job(task_id)?.ok_or_else(not_splittable)?;
    let args: BatchJobArgs = request
        .decode_args(BATCH_EXEC)
        .map_err(|_| not_splittable())?;
    if !job_allows_split(&args.params)? || args.chunk.len() <= 1 {
        return Err(not_splittable());
    }

    let mut task_ids = Vec::with_capacity(args.chunk.len());
    for key in &args.chunk {
        let single = BatchJobArgs {
            name: args.name.clone(),
            chunk: vec![key.clone()],
            params: args.params.clone(),
        };
        let mut split = request.clone();
        split.args = serde_json::to_value(&single)?;
        task_ids.push(broker.enqueue(split)?);
    }
    info!(task_id = %task_id, jobs = task_ids.len(), "job resplit");
    Ok(task_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use policybatch_core::params::params;
    use serde_json::json;

    fn job(chunk: Vec<i64>, split: bool) -> EnqueueRequest {
        let args = BatchJobArgs {
            name: "contract.renew".to_string(),
            chunk: chunk.into_iter().map(RecordKey::Id).collect(),
            params: params([("job_size", json!(10)), ("split", json!(split))]),
        };
        EnqueueRequest::batch_exec(&args, "prod", Some(UserId::new(3))).unwrap()
    }

    #[test]
    fn batch_exec_request_layout() {
        let request = job(vec![1, 2], true);
        assert_eq!(request.queue, "contract.renew");
        assert_eq!(request.handler, BATCH_EXEC);
        assert_eq!(request.database(), Some("prod"));
        assert_eq!(request.user(), Some(UserId::new(3)));

        let args: BatchJobArgs = request.decode_args(BATCH_EXEC).unwrap();
        assert_eq!(args.chunk, vec![RecordKey::Id(1), RecordKey::Id(2)]);
        assert!(request.decode_args::<BatchJobArgs>(ASYNC_METHOD).is_err());
    }

    #[test]
    fn pending_states() {
        assert!(TaskState::Pending.is_pending());
        assert!(TaskState::Started.is_pending());
        assert!(TaskState::Retry.is_pending());
        assert!(!TaskState::Success.is_pending());
        assert!(!TaskState::Failure.is_pending());
        assert!(!TaskState::Revoked.is_pending());
        assert_eq!("FAILURE".parse::<TaskState>().unwrap(), TaskState::Failure);
        assert_eq!(serde_json::to_value(TaskState::Started).unwrap(), json!("STARTED"));
    }

    #[test]
    fn replay_enqueues_the_same_request() {
        let broker = InMemoryBroker::new();
        let original = job(vec![1, 2, 3], true);
        let first = broker.enqueue(original.clone()).unwrap();

        let again = replay(&broker, first).unwrap();
        assert_ne!(again, first);
        assert_eq!(broker.logged_job(again).unwrap(), Some(original));
    }

    #[test]
    fn replay_of_unknown_job_is_not_found() {
        let broker = InMemoryBroker::new();
        assert!(matches!(replay(&broker, TaskId::new()), Err(BatchError::NotFound(_))));
    }

    #[test]
    fn resplit_enqueues_one_job_per_record() {
        let broker = InMemoryBroker::new();
        let first = broker.enqueue(job(vec![1, 2, 3], true)).unwrap();

        let split = resplit(&broker, first).unwrap();
        assert_eq!(split.len(), 3);

        let chunks: Vec<Vec<RecordKey>> = split
            .iter()
            .map(|id| {
                let request = broker.logged_job(*id).unwrap().unwrap();
                assert_eq!(request.kwargs, job(vec![], true).kwargs);
                request.decode_args::<BatchJobArgs>(BATCH_EXEC).unwrap().chunk
            })
            .collect();
        assert_eq!(
            chunks,
            vec![vec![RecordKey::Id(1)], vec![RecordKey::Id(2)], vec![RecordKey::Id(3)]]
        );
    }

    #[test]
    fn resplit_is_refused_when_the_job_cannot_split() {
        let broker = InMemoryBroker::new();
        let no_split = broker.enqueue(job(vec![1, 2, 3], false)).unwrap();
        let single = broker.enqueue(job(vec![1], true)).unwrap();

        assert!(matches!(resplit(&broker, no_split), Err(BatchError::NotSplittable(_))));
        assert!(matches!(resplit(&broker, single), Err(BatchError::NotSplittable(_))));
        assert!(matches!(resplit(&broker, TaskId::new()), Err(BatchError::NotSplittable(_))));
        assert_eq!(broker.queue_len("contract.renew"), 2);
    }
}
