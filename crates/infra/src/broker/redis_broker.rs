//! Redis-backed task broker and chain telemetry (optional).
//!
//! ## Key layout
//!
//! | Key | Type | Content |
//! |-----|------|---------|
//! | `<prefix>:queues` | set | names of every queue ever used |
//! | `<prefix>:queue:<queue>` | list | waiting task ids, pushed left, popped right |
//! | `<prefix>:job:<id>` | string | logged request, expires after the job TTL |
//! | `<prefix>:task:<id>` | string | task state, expires after the result TTL |
//! | `<prefix>:fail` | list | failed task ids, most recent first |
//! | `<prefix>:extra:<chain><queue><start>` | string | chain telemetry row |
//!
//! Requests are claimed with `RPOP`, so one request is handed to at most one
//! worker. A worker dying mid-task leaves the task `STARTED` until its state
//! expires; [`replay`](policybatch_batch::replay) re-enqueues it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};

use policybatch_batch::{
    ChainReport, ClaimedTask, EnqueueRequest, TaskBroker, TaskState, TaskStatus, TelemetrySink,
    WorkerQueue,
};
use policybatch_core::{BrokerError, TaskId};

use crate::config::Settings;

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "policybatch";

const LOG_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// A logged request, as stored under the job key.
#[derive(Debug, Serialize, Deserialize)]
struct LoggedJob {
    date: String,
    #[serde(flatten)]
    request: EnqueueRequest,
}

#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    fn queue(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn job(&self, task_id: TaskId) -> String {
        format!("{}:job:{}", self.prefix, task_id)
    }

    fn task(&self, task_id: TaskId) -> String {
        format!("{}:task:{}", self.prefix, task_id)
    }

    fn fail(&self) -> String {
        format!("{}:fail", self.prefix)
    }

    fn extra(&self, report: &ChainReport) -> String {
        format!("{}:extra:{}", self.prefix, report.key_suffix())
    }
}

fn connect(client: &redis::Client) -> Result<redis::Connection, BrokerError> {
    client
        .get_connection()
        .map_err(|e| BrokerError::Connection(e.to_string()))
}

fn command(e: redis::RedisError) -> BrokerError {
    BrokerError::Command(e.to_string())
}

fn serialization(e: serde_json::Error) -> BrokerError {
    BrokerError::Serialization(e.to_string())
}

pub struct RedisBroker {
    client: Arc<redis::Client>,
    keys: Keys,
    job_ttl: Duration,
    result_ttl: Duration,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("prefix", &self.keys.prefix)
            .field("job_ttl", &self.job_ttl)
            .field("result_ttl", &self.result_ttl)
            .finish()
    }
}

impl RedisBroker {
    /// Create a broker.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - key prefix (default: "policybatch")
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let defaults = Settings::default();
        Ok(Self {
            client: Arc::new(client),
            keys: Keys {
                prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            },
            job_ttl: defaults.job_ttl,
            result_ttl: defaults.job_result_ttl,
        })
    }

    /// Broker on `settings.redis_url` with the configured TTLs.
    pub fn from_settings(settings: &Settings) -> Result<Self, BrokerError> {
        let url = settings
            .redis_url
            .as_deref()
            .ok_or_else(|| BrokerError::Connection("REDIS_URL is not set".to_string()))?;
        Ok(Self::new(url, None)?.with_ttls(settings.job_ttl, settings.job_result_ttl))
    }

    pub fn with_ttls(mut self, job_ttl: Duration, result_ttl: Duration) -> Self {
        self.job_ttl = job_ttl;
        self.result_ttl = result_ttl;
        self
    }

    /// Telemetry sink writing to the same Redis with the same prefix.
    pub fn telemetry(&self) -> RedisTelemetry {
        RedisTelemetry {
            client: self.client.clone(),
            keys: self.keys.clone(),
        }
    }

    fn write_status(
        &self,
        conn: &mut redis::Connection,
        task_id: TaskId,
        status: &TaskStatus,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(status).map_err(serialization)?;
        redis::cmd("SETEX")
            .arg(self.keys.task(task_id))
            .arg(self.result_ttl.as_secs().max(1))
            .arg(payload)
            .query::<()>(conn)
            .map_err(command)
    }

    fn read_job(
        &self,
        conn: &mut redis::Connection,
        task_id: TaskId,
    ) -> Result<Option<EnqueueRequest>, BrokerError> {
        let payload: Option<String> = redis::cmd("GET")
            .arg(self.keys.job(task_id))
            .query(conn)
            .map_err(command)?;
        payload
            .map(|p| {
                serde_json::from_str::<LoggedJob>(&p)
                    .map(|logged| logged.request)
                    .map_err(serialization)
            })
            .transpose()
    }

    fn listened_queues(
        &self,
        conn: &mut redis::Connection,
        queues: &[String],
    ) -> Result<Vec<String>, BrokerError> {
        if !queues.is_empty() {
            return Ok(queues.to_vec());
        }
        let mut all: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.queues())
            .query(conn)
            .map_err(command)?;
        all.sort();
        Ok(all)
    }
}

impl TaskBroker for RedisBroker {
    #[instrument(skip(self, request), fields(queue = %request.queue, handler = %request.handler), err)]
    fn enqueue(&self, request: EnqueueRequest) -> Result<TaskId, BrokerError> {
        let task_id = TaskId::new();
        let queue = request.queue.clone();
        let logged = LoggedJob {
            date: Local::now().format(LOG_DATE_FORMAT).to_string(),
            request,
        };
        let payload = serde_json::to_string(&logged).map_err(serialization)?;
        let status = serde_json::to_string(&TaskStatus::new(TaskState::Pending)).map_err(serialization)?;

        let mut conn = connect(&self.client)?;
        redis::pipe()
            .atomic()
            .cmd("SETEX")
            .arg(self.keys.job(task_id))
            .arg(self.job_ttl.as_secs().max(1))
            .arg(payload)
            .ignore()
            .cmd("SETEX")
            .arg(self.keys.task(task_id))
            .arg(self.result_ttl.as_secs().max(1))
            .arg(status)
            .ignore()
            .cmd("SADD")
            .arg(self.keys.queues())
            .arg(&queue)
            .ignore()
            .cmd("LPUSH")
            .arg(self.keys.queue(&queue))
            .arg(task_id.to_string())
            .ignore()
            .query::<()>(&mut conn)
            .map_err(command)?;

        debug!(task_id = %task_id, queue = %queue, "task enqueued");
        Ok(task_id)
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    fn status(&self, task_id: TaskId) -> Result<TaskStatus, BrokerError> {
        let mut conn = connect(&self.client)?;
        let payload: Option<String> = redis::cmd("GET")
            .arg(self.keys.task(task_id))
            .query(&mut conn)
            .map_err(command)?;
        let payload = payload.ok_or_else(|| BrokerError::UnknownTask(task_id.to_string()))?;
        serde_json::from_str(&payload).map_err(serialization)
    }

    fn logged_job(&self, task_id: TaskId) -> Result<Option<EnqueueRequest>, BrokerError> {
        let mut conn = connect(&self.client)?;
        self.read_job(&mut conn, task_id)
    }
}

impl WorkerQueue for RedisBroker {
    fn claim_next(&self, queues: &[String]) -> Result<Option<ClaimedTask>, BrokerError> {
        let mut conn = connect(&self.client)?;

        for queue in self.listened_queues(&mut conn, queues)? {
            loop {
                let popped: Option<String> = redis::cmd("RPOP")
                    .arg(self.keys.queue(&queue))
                    .query(&mut conn)
                    .map_err(command)?;
                let Some(raw) = popped else {
                    break;
                };
                let task_id: TaskId = match raw.parse() {
                    Ok(id) => id,
                    Err(_) => {
                        warn!(queue = %queue, entry = %raw, "dropping malformed queue entry");
                        continue;
                    }
                };
                let Some(request) = self.read_job(&mut conn, task_id)? else {
                    warn!(queue = %queue, task_id = %task_id, "job expired before it was claimed");
                    continue;
                };
                self.write_status(&mut conn, task_id, &TaskStatus::new(TaskState::Started))?;
                return Ok(Some(ClaimedTask { task_id, request }));
            }
        }
        Ok(None)
    }

    #[instrument(skip(self, result), fields(task_id = %task_id), err)]
    fn mark_succeeded(&self, task_id: TaskId, result: JsonValue) -> Result<(), BrokerError> {
        let mut conn = connect(&self.client)?;
        let status = TaskStatus {
            state: TaskState::Success,
            traceback: None,
            result: Some(result),
        };
        self.write_status(&mut conn, task_id, &status)
    }

    #[instrument(skip(self, traceback), fields(task_id = %task_id), err)]
    fn mark_failed(&self, task_id: TaskId, traceback: &str) -> Result<(), BrokerError> {
        let mut conn = connect(&self.client)?;
        let status = TaskStatus {
            state: TaskState::Failure,
            traceback: Some(traceback.to_string()),
            result: None,
        };
        self.write_status(&mut conn, task_id, &status)?;
        redis::cmd("LPUSH")
            .arg(self.keys.fail())
            .arg(task_id.to_string())
            .query::<()>(&mut conn)
            .map_err(command)
    }

    fn failed_tasks(&self) -> Result<Vec<TaskId>, BrokerError> {
        let mut conn = connect(&self.client)?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.keys.fail())
            .arg(0)
            .arg(-1)
            .query(&mut conn)
            .map_err(command)?;
        Ok(raw.iter().filter_map(|id| id.parse().ok()).collect())
    }
}

/// Chain telemetry rows stored as plain Redis strings.
#[derive(Debug, Clone)]
pub struct RedisTelemetry {
    client: Arc<redis::Client>,
    keys: Keys,
}

impl RedisTelemetry {
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, BrokerError> {
        Ok(RedisBroker::new(redis_url, prefix)?.telemetry())
    }
}

impl TelemetrySink for RedisTelemetry {
    #[instrument(skip(self, report), fields(chain = %report.chain_name, queue = %report.queue), err)]
    fn record(&self, report: &ChainReport) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(report).map_err(serialization)?;
        let mut conn = connect(&self.client)?;
        redis::cmd("SET")
            .arg(self.keys.extra(report))
            .arg(payload)
            .query::<()>(&mut conn)
            .map_err(command)
    }
}
