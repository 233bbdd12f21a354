use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Instant};

use crate::error::QueueError;

/// Processor a job is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskName {
    EventProcessor,
    MetaEventProcessor,
}

impl TaskName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskName::EventProcessor => "EventProcessor",
            TaskName::MetaEventProcessor => "MetaEventProcessor",
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    EventQueue,
    MetaEventQueue,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::EventQueue => "event_queue",
            QueueName::MetaEventQueue => "meta_event_queue",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued unit of work. Carries ids only, never the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub task: TaskName,
    pub payload: serde_json::Value,

    /// Re-enqueues caused by infrastructure failures.
    #[serde(default)]
    pub queue_retries: u32,
}

impl Job {
    pub fn new<T: Serialize>(task: TaskName, payload: &T) -> Result<Self, QueueError> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            task,
            payload: serde_json::to_value(payload)?,
            queue_retries: 0,
        })
    }

    /// Copy of this job under a fresh id, for re-enqueueing.
    pub fn requeued(&self, queue_retries: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task: self.task,
            payload: self.payload.clone(),
            queue_retries,
        }
    }
}

/// At-least-once, unordered job queue with delayed delivery.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, queue: QueueName, job: Job, delay: Duration) -> Result<(), QueueError>;

    /// Wait up to `wait` for a due job.
    async fn reserve(&self, queue: QueueName, wait: Duration) -> Result<Option<Job>, QueueError>;

    /// Mark a reserved job as done.
    async fn ack(&self, queue: QueueName, job: &Job) -> Result<(), QueueError>;
}

struct TimedJob {
    ready_at: Instant,
    job: Job,
}

impl Eq for TimedJob {}

impl PartialEq for TimedJob {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at)
    }
}

impl Ord for TimedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.ready_at.cmp(&self.ready_at)
    }
}

impl PartialOrd for TimedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Lane {
    delayed: Mutex<BinaryHeap<TimedJob>>,
    in_flight: Mutex<HashMap<String, Job>>,
    notify: Notify,
}

/// Process-local queue.
///
/// Jobs reserved but never acked stay in flight until the process exits;
/// there is no visibility timeout.
pub struct MemoryQueue {
    lanes: HashMap<QueueName, Lane>,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        let mut lanes = HashMap::new();
        lanes.insert(QueueName::EventQueue, Lane::default());
        lanes.insert(QueueName::MetaEventQueue, Lane::default());
        Self {
            lanes,
            closed: AtomicBool::new(false),
        }
    }

    /// Refuse new work and wake every waiting reserver.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for lane in self.lanes.values() {
            lane.notify.notify_waiters();
        }
    }

    /// Jobs waiting in `queue` with the time left until each is due.
    pub async fn pending(&self, queue: QueueName) -> Vec<(Job, Duration)> {
        let Some(lane) = self.lanes.get(&queue) else {
            return Vec::new();
        };
        let now = Instant::now();
        let heap = lane.delayed.lock().await;
        let mut jobs: Vec<_> = heap
            .iter()
            .map(|t| (t.ready_at, t.job.clone()))
            .collect();
        jobs.sort_by_key(|(ready_at, _)| *ready_at);
        jobs.into_iter()
            .map(|(ready_at, job)| (job, ready_at.saturating_duration_since(now)))
            .collect()
    }

    pub async fn in_flight(&self, queue: QueueName) -> usize {
        match self.lanes.get(&queue) {
            Some(lane) => lane.in_flight.lock().await.len(),
            None => 0,
        }
    }

    fn lane(&self, queue: QueueName) -> Result<&Lane, QueueError> {
        self.lanes
            .get(&queue)
            .ok_or_else(|| QueueError::Backend(format!("unknown queue {queue}")))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, queue: QueueName, job: Job, delay: Duration) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Shutdown);
        }
        let lane = self.lane(queue)?;
        lane.delayed.lock().await.push(TimedJob {
            ready_at: Instant::now() + delay,
            job,
        });
        lane.notify.notify_waiters();
        Ok(())
    }

    async fn reserve(&self, queue: QueueName, wait: Duration) -> Result<Option<Job>, QueueError> {
        let lane = self.lane(queue)?;
        let deadline = Instant::now() + wait;

        loop {
            // Registered before inspecting the heap so an enqueue in between
            // still wakes us.
            let notified = lane.notify.notified();

            if self.is_closed() {
                return Err(QueueError::Shutdown);
            }

            let next_ready = {
                let mut heap = lane.delayed.lock().await;
                let now = Instant::now();
                match heap.peek().map(|next| next.ready_at) {
                    Some(ready_at) if ready_at <= now => {
                        if let Some(timed) = heap.pop() {
                            lane.in_flight
                                .lock()
                                .await
                                .insert(timed.job.id.clone(), timed.job.clone());
                            return Ok(Some(timed.job));
                        }
                        deadline
                    }
                    Some(ready_at) => ready_at.min(deadline),
                    None => deadline,
                }
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = notified => {}
                _ = sleep_until(next_ready) => {}
            }
        }
    }

    async fn ack(&self, queue: QueueName, job: &Job) -> Result<(), QueueError> {
        self.lane(queue)?.in_flight.lock().await.remove(&job.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetaEventTask;

    fn job() -> Job {
        Job::new(
            TaskName::MetaEventProcessor,
            &MetaEventTask {
                meta_event_id: "m1".into(),
                project_id: "p1".into(),
            },
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_is_not_reserved_early() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(QueueName::MetaEventQueue, job(), Duration::from_secs(20))
            .await
            .unwrap();

        let early = queue
            .reserve(QueueName::MetaEventQueue, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(early.is_none());

        let due = queue
            .reserve(QueueName::MetaEventQueue, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(due.is_some());
        assert_eq!(queue.in_flight(QueueName::MetaEventQueue).await, 1);
    }

    #[tokio::test]
    async fn ack_clears_in_flight() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(QueueName::EventQueue, job(), Duration::ZERO)
            .await
            .unwrap();
        let reserved = queue
            .reserve(QueueName::EventQueue, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        queue.ack(QueueName::EventQueue, &reserved).await.unwrap();
        assert_eq!(queue.in_flight(QueueName::EventQueue).await, 0);
    }

    #[tokio::test]
    async fn waiting_reserver_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(MemoryQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .reserve(QueueName::EventQueue, Duration::from_secs(10))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue
            .enqueue(QueueName::EventQueue, job(), Duration::ZERO)
            .await
            .unwrap();

        let reserved = waiter.await.unwrap().unwrap();
        assert!(reserved.is_some());
    }

    #[tokio::test]
    async fn closed_queue_refuses_work() {
        let queue = MemoryQueue::new();
        queue.close();
        assert!(matches!(
            queue.enqueue(QueueName::EventQueue, job(), Duration::ZERO).await,
            Err(QueueError::Shutdown)
        ));
        assert!(matches!(
            queue.reserve(QueueName::EventQueue, Duration::from_millis(10)).await,
            Err(QueueError::Shutdown)
        ));
    }

    #[test]
    fn requeued_job_gets_a_new_id() {
        let original = job();
        let again = original.requeued(2);
        assert_ne!(again.id, original.id);
        assert_eq!(again.payload, original.payload);
        assert_eq!(again.queue_retries, 2);
    }
}
