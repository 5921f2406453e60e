//! In-process worker loop.
//!
//! Claims requests from a [`WorkerQueue`], runs the handler registered for
//! their handler name and records the outcome on the broker. Delivery is
//! at-least-once: a worker that dies mid-task leaves it `STARTED` and the
//! task may be replayed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use policybatch_batch::{ClaimedTask, EnqueueRequest, WorkerQueue};
use policybatch_core::{BatchError, BatchResult, BrokerError};

/// Task handler function type.
pub type TaskHandler = Box<dyn Fn(&EnqueueRequest) -> BatchResult<JsonValue> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to sleep when every queue is empty
    pub poll_interval: Duration,
    /// Number of polling threads
    pub threads: usize,
    /// Queues to listen to, by priority. Empty listens to all of them.
    pub queues: Vec<String>,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            threads: 1,
            queues: Vec::new(),
            name: "batch-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Handle to control running worker threads.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Vec<mpsc::Sender<()>>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for running tasks to finish.
    pub fn shutdown(self) {
        for tx in &self.shutdown {
            let _ = tx.send(());
        }
        for join in self.joins {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Handler result of one task, as recorded on the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded(JsonValue),
    Failed(BatchError),
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    /// Tasks whose outcome could not be written back; they stay `STARTED`.
    pub outcomes_unrecorded: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

pub struct Worker {
    queue: Arc<dyn WorkerQueue>,
    handlers: HashMap<String, TaskHandler>,
}

impl Worker {
    pub fn new(queue: Arc<dyn WorkerQueue>) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
        }
    }

    pub fn register_handler<F>(&mut self, handler: impl Into<String>, run: F)
    where
        F: Fn(&EnqueueRequest) -> BatchResult<JsonValue> + Send + Sync + 'static,
    {
        self.handlers.insert(handler.into(), Box::new(run));
    }

    pub fn handler_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run one claimed task and record its outcome on the broker.
    ///
    /// Handler errors are a [`TaskOutcome::Failed`]. An `Err` means the
    /// outcome never reached the broker.
    pub fn execute_one(&self, task: &ClaimedTask) -> Result<TaskOutcome, BrokerError> {
        let request = &task.request;
        let result = match self.handlers.get(&request.handler) {
            Some(run) => run(request),
            None => Err(BatchError::not_found(format!("handler {}", request.handler))),
        };

        let recorded = match &result {
            Ok(value) => {
                debug!(task_id = %task.task_id, queue = %request.queue, "task succeeded");
                self.queue.mark_succeeded(task.task_id, value.clone())
            }
            Err(err) => {
                error!(
                    task_id = %task.task_id,
                    queue = %request.queue,
                    handler = %request.handler,
                    error = %err,
                    "task failed"
                );
                self.queue.mark_failed(task.task_id, &err.to_string())
            }
        };
        if let Err(err) = recorded {
            error!(
                task_id = %task.task_id,
                queue = %request.queue,
                handler = %request.handler,
                error = %err,
                "cannot record task outcome"
            );
            return Err(err);
        }

        Ok(match result {
            Ok(value) => TaskOutcome::Succeeded(value),
            Err(err) => TaskOutcome::Failed(err),
        })
    }

    /// Claim and run tasks until `queues` are drained. Returns how many
    /// tasks ran. Stops at the first outcome the broker does not record.
    pub fn run_pending(&self, queues: &[String]) -> BatchResult<usize> {
        let mut ran = 0;
        while let Some(task) = self.queue.claim_next(queues)? {
            self.execute_one(&task)?;
            ran += 1;
        }
        Ok(ran)
    }

    /// Spawn the worker threads.
    pub fn spawn(self, config: WorkerConfig) -> std::io::Result<WorkerHandle> {
        let worker = Arc::new(self);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let mut shutdown = Vec::with_capacity(config.threads);
        let mut joins = Vec::with_capacity(config.threads);

        for index in 0..config.threads.max(1) {
            let (tx, rx) = mpsc::channel::<()>();
            let worker = worker.clone();
            let config = config.clone();
            let stats = stats.clone();
            let join = thread::Builder::new()
                .name(format!("{}-{index}", config.name))
                .spawn(move || worker_loop(&worker, &config, &rx, &stats))?;
            shutdown.push(tx);
            joins.push(join);
        }

        Ok(WorkerHandle {
            shutdown,
            joins,
            stats,
        })
    }
}

fn update_stats(stats: &Mutex<WorkerStats>, f: impl FnOnce(&mut WorkerStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}

fn worker_loop(
    worker: &Worker,
    config: &WorkerConfig,
    shutdown_rx: &mpsc::Receiver<()>,
    stats: &Mutex<WorkerStats>,
) {
    info!(worker = %config.name, queues = ?config.queues, "worker started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        update_stats(stats, |s| s.uptime_secs = start_time.elapsed().as_secs());

        match worker.queue.claim_next(&config.queues) {
            Ok(Some(task)) => {
                debug!(
                    worker = %config.name,
                    task_id = %task.task_id,
                    handler = %task.request.handler,
                    "claimed task"
                );
                update_stats(stats, |s| s.current_running += 1);

                let result = worker.execute_one(&task);

                update_stats(stats, |s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    s.tasks_processed += 1;
                    match result {
                        Ok(TaskOutcome::Succeeded(_)) => s.tasks_succeeded += 1,
                        Ok(TaskOutcome::Failed(_)) => s.tasks_failed += 1,
                        Err(_) => s.outcomes_unrecorded += 1,
                    }
                });
            }
            Ok(None) => thread::sleep(config.poll_interval),
            Err(e) => {
                warn!(worker = %config.name, error = %e, "failed to claim task");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(worker = %config.name, "worker stopped");
}
