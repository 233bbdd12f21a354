use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn, Instrument};

use crate::backoff::{BackoffPolicy, Schedule, DEFAULT_MAX_BACKOFF};
use crate::dispatcher::Dispatch;
use crate::error::{DeliveryFailure, ProcessError, RepositoryError, RetryableError};
use crate::queue::{Job, TaskName};
use crate::state::{
    attempt_record, begin_processing, record_attempt, rejected_record, AttemptOutcome, Transition,
};
use crate::storage::{EndpointRepository, EntityRepository, ProjectRepository};
use crate::target::{render_request, EndpointTarget, MetaEventTarget, ResolveTarget, TargetError};
use crate::telemetry::{metric_inc, metric_inc_project};
use crate::types::{
    Dispatchable, EventDelivery, EventDeliveryTask, EventStatus, MetaEvent, MetaEventTask,
};

/// Deadline used when neither the destination nor the project sets one.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Handles one kind of job for the worker pool.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_name(&self) -> TaskName;

    async fn process(&self, job: &Job) -> Result<(), ProcessError>;
}

/// Ids carried by a task payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskIds {
    pub project_id: String,
    pub entity_id: String,
}

impl From<EventDeliveryTask> for TaskIds {
    fn from(task: EventDeliveryTask) -> Self {
        Self {
            project_id: task.project_id,
            entity_id: task.event_delivery_id,
        }
    }
}

impl From<MetaEventTask> for TaskIds {
    fn from(task: MetaEventTask) -> Self {
        Self {
            project_id: task.project_id,
            entity_id: task.meta_event_id,
        }
    }
}

type Decoder = fn(&serde_json::Value) -> Result<TaskIds, serde_json::Error>;

fn decode<T>(payload: &serde_json::Value) -> Result<TaskIds, serde_json::Error>
where
    T: DeserializeOwned + Into<TaskIds>,
{
    T::deserialize(payload).map(Into::into)
}

/// Turns a queued job into at most one dispatch and a persisted transition.
pub struct Processor<E: Dispatchable> {
    task_name: TaskName,
    failure: DeliveryFailure,
    decode: Decoder,
    projects: Arc<dyn ProjectRepository>,
    entities: Arc<dyn EntityRepository<E>>,
    target: Arc<dyn ResolveTarget<E>>,
    dispatcher: Arc<dyn Dispatch>,
    default_timeout: Duration,
    schedule: Option<Arc<dyn Schedule>>,
    max_backoff: Duration,
}

impl Processor<EventDelivery> {
    pub fn for_event_deliveries(
        projects: Arc<dyn ProjectRepository>,
        endpoints: Arc<dyn EndpointRepository>,
        deliveries: Arc<dyn EntityRepository<EventDelivery>>,
        dispatcher: Arc<dyn Dispatch>,
    ) -> Self {
        Self {
            task_name: TaskName::EventProcessor,
            failure: DeliveryFailure::EndpointDeliveryFailed,
            decode: decode::<EventDeliveryTask>,
            projects,
            entities: deliveries,
            target: Arc::new(EndpointTarget::new(endpoints)),
            dispatcher,
            default_timeout: DEFAULT_HTTP_TIMEOUT,
            schedule: None,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl Processor<MetaEvent> {
    pub fn for_meta_events(
        projects: Arc<dyn ProjectRepository>,
        meta_events: Arc<dyn EntityRepository<MetaEvent>>,
        dispatcher: Arc<dyn Dispatch>,
    ) -> Self {
        Self {
            task_name: TaskName::MetaEventProcessor,
            failure: DeliveryFailure::MetaEventDeliveryFailed,
            decode: decode::<MetaEventTask>,
            projects,
            entities: meta_events,
            target: Arc::new(MetaEventTarget),
            dispatcher,
            default_timeout: DEFAULT_HTTP_TIMEOUT,
            schedule: None,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl<E: Dispatchable> Processor<E> {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Use `schedule` for every entity, ignoring the recorded strategy.
    pub fn with_schedule(mut self, schedule: Arc<dyn Schedule>) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    fn policy_for(&self, entity: &E) -> BackoffPolicy {
        match &self.schedule {
            Some(schedule) => BackoffPolicy::new(schedule.clone()),
            None => BackoffPolicy::for_strategy(entity.metadata().strategy, self.max_backoff),
        }
    }

    async fn run(&self, ids: TaskIds) -> Result<(), ProcessError> {
        let project = self
            .projects
            .fetch_project_by_id(&ids.project_id)
            .await
            .map_err(missing_as_validation)?;
        let mut entity = self
            .entities
            .find_by_id(&ids.project_id, &ids.entity_id)
            .await
            .map_err(missing_as_validation)?;

        if entity.status().is_terminal() {
            debug!(status = %entity.status(), "already finished, skipping");
            return Ok(());
        }

        let metadata = entity.metadata();
        if metadata.num_trials >= metadata.retry_limit {
            warn!(
                num_trials = metadata.num_trials,
                retry_limit = metadata.retry_limit,
                "retry budget already spent, marking as failed"
            );
            self.entities
                .update_status(&entity, EventStatus::Failure)
                .await?;
            metric_inc("webhook.delivery.failed");
            return Ok(());
        }

        // Every read happens before the first write.
        let target = match self.target.resolve(&project, &entity).await {
            Err(TargetError::Repository(err)) => return Err(err.into()),
            resolved => resolved,
        };

        let now = Utc::now();
        begin_processing(&mut entity, now).map_err(|e| ProcessError::Validation(e.to_string()))?;
        self.entities
            .update_status(&entity, EventStatus::Processing)
            .await?;

        let rendered = target.and_then(|target| {
            render_request(&project, &entity, target, self.default_timeout, now)
        });

        let (attempt, outcome) = match rendered {
            Ok(request) => {
                let result = self.dispatcher.dispatch(&request).await;
                (
                    attempt_record(&request, &result, Utc::now()),
                    AttemptOutcome::classify(&result),
                )
            }
            Err(TargetError::Rejected { url, reason }) => (
                rejected_record(&url, &reason, Utc::now()),
                AttemptOutcome::Rejected(reason),
            ),
            Err(TargetError::Repository(err)) => return Err(err.into()),
        };

        let policy = self.policy_for(&entity);
        let transition =
            record_attempt(&mut entity, attempt.clone(), &outcome, &policy, Utc::now());
        self.entities.update_with_attempt(&entity, &attempt).await?;

        tracing::Span::current().record("status", transition.status().as_str());
        let num_trials = entity.metadata().num_trials;
        match transition {
            Transition::Delivered => {
                metric_inc("webhook.delivery.success");
                metric_inc_project("webhook.delivery.success.project", &ids.project_id);
                info!(num_trials, latency_ms = attempt.latency_ms, "delivered");
                Ok(())
            }
            Transition::Retry(delay) => {
                metric_inc("webhook.delivery.retry_scheduled");
                warn!(
                    num_trials,
                    delay_ms = delay.as_millis() as u64,
                    reason = entity.description(),
                    "attempt failed, retry scheduled"
                );
                Err(RetryableError {
                    reason: self.failure,
                    delay,
                }
                .into())
            }
            Transition::Exhausted => {
                metric_inc("webhook.delivery.failed");
                metric_inc_project("webhook.delivery.failed.project", &ids.project_id);
                error!(num_trials, reason = entity.description(), "retry limit exceeded");
                Ok(())
            }
            Transition::Discarded => {
                metric_inc("webhook.delivery.discarded");
                warn!(reason = entity.description(), "delivery discarded");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<E: Dispatchable> TaskHandler for Processor<E> {
    fn task_name(&self) -> TaskName {
        self.task_name
    }

    async fn process(&self, job: &Job) -> Result<(), ProcessError> {
        let ids = (self.decode)(&job.payload).map_err(|e| {
            ProcessError::Validation(format!("malformed {} payload: {e}", self.task_name))
        })?;

        let span = tracing::info_span!(
            "process",
            task = %self.task_name,
            job_id = %job.id,
            project_id = %ids.project_id,
            entity_id = %ids.entity_id,
            status = tracing::field::Empty,
        );
        self.run(ids).instrument(span).await
    }
}

fn missing_as_validation(err: RepositoryError) -> ProcessError {
    if err.is_not_found() {
        ProcessError::Validation(err.to_string())
    } else {
        ProcessError::Repository(err)
    }
}
