use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{ProcessError, QueueError};
use crate::processor::TaskHandler;
use crate::queue::{Job, Queue, QueueName, TaskName};
use crate::telemetry::metric_inc;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent workers per registered queue.
    pub concurrency: usize,

    /// How long one `reserve` call waits for a job.
    pub reserve_wait_ms: u64,

    /// Re-enqueues allowed after infrastructure failures.
    pub max_queue_retries: u32,
    pub queue_retry_base_ms: u64,
    pub queue_retry_max_ms: u64,
    pub queue_retry_jitter_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            concurrency,
            reserve_wait_ms: 1_000,
            max_queue_retries: 5,
            queue_retry_base_ms: 500,
            queue_retry_max_ms: 60_000,
            queue_retry_jitter_ms: 250,
        }
    }
}

/// What to do with a job after its handler returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Ack,
    Requeue { job: Job, delay: Duration },
}

/// Map a handler result to a queue action.
pub fn disposition(
    job: &Job,
    result: &Result<(), ProcessError>,
    config: &WorkerConfig,
) -> Disposition {
    match result {
        Ok(()) => Disposition::Ack,
        Err(ProcessError::Retry(retry)) => Disposition::Requeue {
            job: job.requeued(0),
            delay: retry.delay,
        },
        Err(ProcessError::Validation(reason)) => {
            warn!(job_id = %job.id, task = %job.task, reason = %reason, "dropping invalid task");
            Disposition::Ack
        }
        Err(ProcessError::Repository(err)) => {
            if job.queue_retries >= config.max_queue_retries {
                error!(
                    job_id = %job.id,
                    task = %job.task,
                    queue_retries = job.queue_retries,
                    error = %err,
                    "giving up on task after repeated storage failures"
                );
                metric_inc("webhook.queue.dropped");
                return Disposition::Ack;
            }
            let attempt = job.queue_retries + 1;
            let delay =
                queue_retry_delay(attempt, config) + jitter_delay(config.queue_retry_jitter_ms);
            warn!(
                job_id = %job.id,
                task = %job.task,
                queue_retries = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "storage failure, requeueing task"
            );
            Disposition::Requeue {
                job: job.requeued(attempt),
                delay,
            }
        }
    }
}

fn queue_retry_delay(attempt: u32, config: &WorkerConfig) -> Duration {
    let base = config.queue_retry_base_ms.max(1);
    let max = config.queue_retry_max_ms.max(base);
    let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
    let exp = base.saturating_mul(pow);
    Duration::from_millis(exp.min(max))
}

fn jitter_delay(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::from_millis(0);
    }
    let jitter = fastrand::u64(0..=jitter_ms);
    Duration::from_millis(jitter)
}

/// Pulls jobs from a [`Queue`] and routes them to handlers by task name.
pub struct WorkerPool {
    queue: Arc<dyn Queue>,
    config: WorkerConfig,
    handlers: HashMap<TaskName, Arc<dyn TaskHandler>>,
    queues: Vec<QueueName>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn Queue>, config: WorkerConfig) -> Self {
        Self {
            queue,
            config,
            handlers: HashMap::new(),
            queues: Vec::new(),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Serve `queue` and route its `handler.task_name()` jobs to `handler`.
    pub fn register(mut self, queue: QueueName, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(handler.task_name(), handler);
        if !self.queues.contains(&queue) {
            self.queues.push(queue);
        }
        self
    }

    /// Spawn the workers. Calling it twice doubles the worker count.
    pub fn start(&self) {
        let shared = Arc::new(Shared {
            queue: self.queue.clone(),
            config: self.config.clone(),
            handlers: self.handlers.clone(),
        });

        for queue in &self.queues {
            for worker in 0..self.config.concurrency.max(1) {
                let shared = shared.clone();
                let cancel = self.cancel.clone();
                let queue = *queue;
                self.tracker.spawn(async move {
                    debug!(queue = %queue, worker, "worker started");
                    worker_loop(shared, queue, cancel).await;
                    debug!(queue = %queue, worker, "worker stopped");
                });
            }
        }

        info!(
            queues = self.queues.len(),
            concurrency = self.config.concurrency,
            "worker pool started"
        );
    }

    /// Stop pulling jobs, cancel in-flight work and wait for workers to exit.
    ///
    /// Jobs cancelled mid-flight are not acked.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("worker pool stopped");
    }
}

struct Shared {
    queue: Arc<dyn Queue>,
    config: WorkerConfig,
    handlers: HashMap<TaskName, Arc<dyn TaskHandler>>,
}

async fn worker_loop(shared: Arc<Shared>, queue: QueueName, cancel: CancellationToken) {
    let wait = Duration::from_millis(shared.config.reserve_wait_ms.max(1));

    loop {
        let reserved = tokio::select! {
            _ = cancel.cancelled() => break,
            reserved = shared.queue.reserve(queue, wait) => reserved,
        };

        let job = match reserved {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(QueueError::Shutdown) => break,
            Err(err) => {
                warn!(queue = %queue, error = %err, "reserve failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = handle_job(&shared, queue, job) => {}
        }
    }
}

async fn handle_job(shared: &Shared, queue: QueueName, job: Job) {
    let Some(handler) = shared.handlers.get(&job.task) else {
        error!(
            job_id = %job.id,
            task = %job.task,
            queue = %queue,
            "no handler registered for task"
        );
        ack(shared, queue, &job).await;
        return;
    };

    let result = handler.process(&job).await;
    match disposition(&job, &result, &shared.config) {
        Disposition::Ack => ack(shared, queue, &job).await,
        Disposition::Requeue { job: next, delay } => {
            match shared.queue.enqueue(queue, next, delay).await {
                Ok(()) => {
                    metric_inc("webhook.queue.requeued");
                    ack(shared, queue, &job).await;
                }
                // Left un-acked so a durable queue redelivers it.
                Err(err) => error!(job_id = %job.id, error = %err, "failed to requeue task"),
            }
        }
    }
}

async fn ack(shared: &Shared, queue: QueueName, job: &Job) {
    if let Err(err) = shared.queue.ack(queue, job).await {
        warn!(job_id = %job.id, queue = %queue, error = %err, "ack failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeliveryFailure, RepositoryError, RetryableError};
    use crate::types::MetaEventTask;

    fn job(queue_retries: u32) -> Job {
        let mut job = Job::new(
            TaskName::MetaEventProcessor,
            &MetaEventTask {
                meta_event_id: "m1".into(),
                project_id: "p1".into(),
            },
        )
        .unwrap();
        job.queue_retries = queue_retries;
        job
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            max_queue_retries: 3,
            queue_retry_base_ms: 100,
            queue_retry_max_ms: 1_000,
            queue_retry_jitter_ms: 0,
            ..WorkerConfig::default()
        }
    }

    #[test]
    fn domain_retry_uses_the_processor_delay() {
        let result = Err(ProcessError::Retry(RetryableError {
            reason: DeliveryFailure::MetaEventDeliveryFailed,
            delay: Duration::from_secs(20),
        }));
        match disposition(&job(2), &result, &config()) {
            Disposition::Requeue { job, delay } => {
                assert_eq!(delay, Duration::from_secs(20));
                assert_eq!(job.queue_retries, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn storage_failures_back_off_then_drop() {
        let result = Err(ProcessError::Repository(RepositoryError::Backend("down".into())));

        let delays: Vec<_> = (0..3)
            .map(|n| match disposition(&job(n), &result, &config()) {
                Disposition::Requeue { delay, job } => {
                    assert_eq!(job.queue_retries, n + 1);
                    delay
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );

        assert_eq!(disposition(&job(3), &result, &config()), Disposition::Ack);
    }

    #[test]
    fn validation_and_success_are_acked() {
        assert_eq!(disposition(&job(0), &Ok(()), &config()), Disposition::Ack);
        assert_eq!(
            disposition(&job(0), &Err(ProcessError::Validation("bad".into())), &config()),
            Disposition::Ack
        );
    }

    #[test]
    fn queue_retry_delay_is_capped() {
        assert_eq!(queue_retry_delay(20, &config()), Duration::from_millis(1_000));
    }
}
