//! Per-destination work queues.
//!
//! The router enqueues one job per outbound envelope copy onto
//! `queue_<platform>_out`. Each queue runs a bounded worker pool over a FIFO
//! deque with a token-bucket rate limit, exponential-backoff retries and a
//! dead-letter ring. Job ids deduplicate at the queue level: enqueueing an
//! id the queue already knows is a no-op. Workers enter the correlation
//! context of the job's envelope before invoking the processor, so egress
//! logs attribute to the originating message.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::context::{self, CorrelationContext};
use crate::envelope::Envelope;
use crate::error::{CoreError, Result};

#[derive(Debug, Clone)]
pub struct RateLimit {
    pub max: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub concurrency: usize,
    pub rate_limit: Option<RateLimit>,
    pub attempts: u32,
    pub backoff_ms: u64,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_limit: None,
            attempts: 3,
            backoff_ms: 1000,
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub envelope: Envelope,
    /// 1-based run counter; the first execution is attempt 1.
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
}

pub type Processor = Arc<dyn Fn(Job) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct TokenBucket {
    max: u32,
    duration: Duration,
    state: Mutex<(Instant, u32)>,
}

impl TokenBucket {
    fn new(limit: &RateLimit) -> Self {
        Self {
            max: limit.max.max(1),
            duration: Duration::from_millis(limit.duration_ms.max(1)),
            state: Mutex::new((Instant::now(), 0)),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("bucket lock");
                let now = Instant::now();
                if now.duration_since(state.0) >= self.duration {
                    *state = (now, 0);
                }
                if state.1 < self.max {
                    state.1 += 1;
                    return;
                }
                self.duration - now.duration_since(state.0)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<Job>,
    /// Ids of jobs that are pending, active or waiting out a retry delay.
    live: HashSet<String>,
    active: usize,
    completed: VecDeque<JobRecord>,
    completed_ids: HashSet<String>,
    failed: VecDeque<JobRecord>,
    failed_ids: HashSet<String>,
    completed_total: u64,
    failed_total: u64,
    retried_total: u64,
    registered: bool,
}

pub struct Queue {
    name: String,
    options: RwLock<QueueOptions>,
    bucket: RwLock<Option<Arc<TokenBucket>>>,
    inner: Mutex<QueueInner>,
    notify: Notify,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Queue {
    fn new(name: String, options: QueueOptions) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let bucket = options.rate_limit.as_ref().map(TokenBucket::new).map(Arc::new);
        Arc::new(Self {
            name,
            options: RwLock::new(options),
            bucket: RwLock::new(bucket),
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            shutdown,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a job. Returns false when the id is already known to the queue
    /// (live, retained completed or retained failed).
    pub fn enqueue(&self, job: Job) -> bool {
        let mut inner = self.inner.lock().expect("queue lock");
        if inner.live.contains(&job.id)
            || inner.completed_ids.contains(&job.id)
            || inner.failed_ids.contains(&job.id)
        {
            debug!(queue = %self.name, job_id = %job.id, "Duplicate job id, skipping");
            return false;
        }
        inner.live.insert(job.id.clone());
        inner.pending.push_back(job);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Register the single consumer and start the worker pool. A second
    /// registration is refused with a warning.
    pub fn process(self: Arc<Self>, processor: Processor, options: Option<QueueOptions>) {
        {
            let mut inner = self.inner.lock().expect("queue lock");
            if inner.registered {
                warn!(queue = %self.name, "Processor already registered, ignoring");
                return;
            }
            inner.registered = true;
        }

        if let Some(options) = options {
            *self.bucket.write().expect("bucket lock") = options
                .rate_limit
                .as_ref()
                .map(TokenBucket::new)
                .map(Arc::new);
            *self.options.write().expect("options lock") = options;
        }

        let concurrency = self.options.read().expect("options lock").concurrency.max(1);
        let mut handles = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let queue = Arc::clone(&self);
            let processor = Arc::clone(&processor);
            let shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(worker_loop(queue, processor, shutdown)));
        }
        self.workers.lock().expect("workers lock").extend(handles);
        info!(queue = %self.name, concurrency, "Queue workers started");
    }

    /// Signal workers to finish their current job and exit, then wait for
    /// them.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.notify.notify_waiters();
        let workers: Vec<_> = self.workers.lock().expect("workers lock").drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("queue lock");
        QueueStats {
            pending: inner.pending.len(),
            active: inner.active,
            completed: inner.completed_total,
            failed: inner.failed_total,
            retried: inner.retried_total,
        }
    }

    /// Snapshot of jobs waiting in the deque, oldest first.
    pub fn pending_jobs(&self) -> Vec<Job> {
        self.inner
            .lock()
            .expect("queue lock")
            .pending
            .iter()
            .cloned()
            .collect()
    }

    pub fn failed_records(&self) -> Vec<JobRecord> {
        self.inner
            .lock()
            .expect("queue lock")
            .failed
            .iter()
            .cloned()
            .collect()
    }

    fn pop(&self) -> Option<Job> {
        let mut inner = self.inner.lock().expect("queue lock");
        let job = inner.pending.pop_front();
        if job.is_some() {
            inner.active += 1;
        }
        job
    }

    fn complete(&self, job: &Job) {
        let keep = self.options.read().expect("options lock").keep_completed;
        let mut inner = self.inner.lock().expect("queue lock");
        inner.active -= 1;
        inner.live.remove(&job.id);
        inner.completed_total += 1;
        inner.completed_ids.insert(job.id.clone());
        inner.completed.push_back(JobRecord {
            id: job.id.clone(),
            attempts: job.attempt,
            error: None,
            finished_at: chrono::Utc::now().timestamp_millis(),
        });
        while inner.completed.len() > keep {
            if let Some(evicted) = inner.completed.pop_front() {
                inner.completed_ids.remove(&evicted.id);
            }
        }
    }

    fn fail(&self, job: &Job, err: &CoreError) {
        let keep = self.options.read().expect("options lock").keep_failed;
        let mut inner = self.inner.lock().expect("queue lock");
        inner.active -= 1;
        inner.live.remove(&job.id);
        inner.failed_total += 1;
        inner.failed_ids.insert(job.id.clone());
        inner.failed.push_back(JobRecord {
            id: job.id.clone(),
            attempts: job.attempt,
            error: Some(err.to_string()),
            finished_at: chrono::Utc::now().timestamp_millis(),
        });
        while inner.failed.len() > keep {
            if let Some(evicted) = inner.failed.pop_front() {
                inner.failed_ids.remove(&evicted.id);
            }
        }
        warn!(queue = %self.name, job_id = %job.id, attempts = job.attempt, error = %err, "Job dead-lettered");
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let backoff_ms = self.options.read().expect("options lock").backoff_ms;
        let doublings = attempt.saturating_sub(1).min(16);
        Duration::from_millis(backoff_ms.saturating_mul(1u64 << doublings))
    }
}

async fn worker_loop(queue: Arc<Queue>, processor: Processor, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let job = match queue.pop() {
            Some(job) => job,
            None => {
                tokio::select! {
                    _ = queue.notify.notified() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
        };

        let bucket = queue.bucket.read().expect("bucket lock").clone();
        if let Some(bucket) = bucket {
            bucket.acquire().await;
        }

        let ctx = CorrelationContext::with_source(
            job.envelope.head.correlation_id.clone(),
            job.envelope.source_token(),
        );
        let result = context::with_correlation(ctx, processor(job.clone())).await;
        settle(&queue, job, result);
    }
}

fn settle(queue: &Arc<Queue>, job: Job, result: Result<()>) {
    let attempts = queue.options.read().expect("options lock").attempts;
    match result {
        Ok(()) => queue.complete(&job),
        Err(CoreError::RateLimited { retry_after_ms }) if job.attempt < attempts => {
            // Delay at least as long as the platform asked for.
            let delay = queue
                .backoff_delay(job.attempt)
                .max(Duration::from_millis(retry_after_ms));
            schedule_retry(queue, job, delay);
        }
        Err(err) if err.is_retryable() && job.attempt < attempts => {
            let delay = queue.backoff_delay(job.attempt);
            schedule_retry(queue, job, delay);
        }
        Err(err) => queue.fail(&job, &err),
    }
}

fn schedule_retry(queue: &Arc<Queue>, mut job: Job, delay: Duration) {
    {
        let mut inner = queue.inner.lock().expect("queue lock");
        inner.active -= 1;
        inner.retried_total += 1;
        // id stays in `live` while the job waits out its delay
    }
    job.attempt += 1;
    debug!(
        queue = %queue.name,
        job_id = %job.id,
        attempt = job.attempt,
        delay_ms = delay.as_millis() as u64,
        "Retrying job"
    );
    let queue = Arc::clone(queue);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let mut inner = queue.inner.lock().expect("queue lock");
        inner.pending.push_back(job);
        drop(inner);
        queue.notify.notify_one();
    });
}

/// Owns one queue per destination platform.
pub struct QueueManager {
    default_options: QueueOptions,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new(QueueOptions::default())
    }
}

pub fn queue_name(platform: &str) -> String {
    format!("queue_{}_out", platform.to_lowercase())
}

impl QueueManager {
    pub fn new(default_options: QueueOptions) -> Self {
        Self {
            default_options,
            queues: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<Queue> {
        if let Some(queue) = self.queues.read().expect("queues lock").get(name) {
            return Arc::clone(queue);
        }
        let mut map = self.queues.write().expect("queues lock");
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Queue::new(name.to_string(), self.default_options.clone())),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.read().expect("queues lock").get(name).cloned()
    }

    /// Enqueue an outbound envelope copy toward a destination platform.
    pub fn enqueue(&self, platform: &str, job_id: String, envelope: Envelope) -> bool {
        let queue = self.get_or_create(&queue_name(platform));
        queue.enqueue(Job {
            id: job_id,
            envelope,
            attempt: 1,
        })
    }

    /// Register the consumer for a queue (creating it if needed).
    pub fn process(&self, name: &str, processor: Processor, options: Option<QueueOptions>) {
        let queue = self.get_or_create(name);
        queue.process(processor, options);
    }

    pub async fn stop_all(&self) {
        let queues: Vec<Arc<Queue>> = self
            .queues
            .read()
            .expect("queues lock")
            .values()
            .cloned()
            .collect();
        for queue in queues {
            queue.stop().await;
        }
        info!("All queues stopped");
    }

    pub fn snapshot(&self) -> HashMap<String, QueueStats> {
        self.queues
            .read()
            .expect("queues lock")
            .iter()
            .map(|(name, queue)| (name.clone(), queue.stats()))
            .collect()
    }
}
