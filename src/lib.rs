//! Outbound delivery core for webhook events and meta events.
//!
//! A queued job names one entity. The worker hands it to the processor
//! for its task, which loads the entity, sends at most one HTTP request
//! through the [`HttpDispatcher`], records the attempt and either finishes
//! the entity or asks the queue to try again later.
//!
//! ## Guarantees
//! - At-least-once delivery
//! - Every processed attempt is persisted with its outcome
//! - Retry delays come from the entity's own retry settings
//! - Forward proxy and IP rules apply only when licensed
//!
//! ## Non-Guarantees
//! - Exactly-once delivery (receivers dedupe on `X-Webhook-Delivery-Id`)
//! - Ordering across deliveries
//! - Fan-out: each delivery targets exactly one destination
//!
//! Storage, queueing and licensing are traits. In-memory implementations
//! ship with the crate; Postgres repositories and a Redis queue and lock
//! store are behind the `postgres` and `redis` features.

mod backoff;
mod config;
mod dispatcher;
mod error;
mod ip_rules;
mod license;
mod lock;
mod processor;
mod queue;
mod signing;
mod state;
mod storage;
mod target;
mod telemetry;
mod types;
mod worker;

#[cfg(feature = "redis")]
mod storage_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use backoff::{
    BackoffPolicy, ExponentialSchedule, LinearSchedule, Schedule, Verdict, DEFAULT_MAX_BACKOFF,
};
pub use config::{Config, DispatcherConfig, RetryConfig};
pub use dispatcher::{
    proxy_address, Dispatch, DispatchRequest, DispatchResponse, DispatcherOptions, HttpDispatcher,
    DEFAULT_MAX_RESPONSE_SIZE, PROXY_DISABLED,
};
pub use error::{
    ConfigError, DeliveryFailure, DispatchError, LockError, ProcessError, QueueError,
    RepositoryError, RetryableError,
};
pub use ip_rules::{Cidr, CidrParseError, IpRules, IpRulesConfig};
pub use license::{Licenser, StaticLicenser};
pub use lock::{BackgroundRefresh, LockStore, MemoryLockStore, RefreshStatus};
pub use processor::{Processor, TaskHandler, TaskIds, DEFAULT_HTTP_TIMEOUT};
pub use queue::{Job, MemoryQueue, Queue, QueueName, TaskName};
pub use signing::{compute_signature, sign_payload, verify_signature, SignatureHeaders};
pub use state::{
    attempt_record, begin_processing, record_attempt, rejected_record, AttemptOutcome,
    InvalidTransition, Transition,
};
pub use storage::{EndpointRepository, EntityRepository, InMemoryStore, ProjectRepository};
pub use target::{
    render_request, EndpointTarget, MetaEventTarget, ResolveTarget, Target, TargetError,
    DELIVERY_ID_HEADER, EVENT_TYPE_HEADER,
};
pub use telemetry::{init_tracing, LogConfig};
pub use types::{
    DeliveryAttempt, Dispatchable, Endpoint, EndpointId, EndpointStatus, EventDelivery,
    EventDeliveryTask, EventId, EventStatus, MetaEvent, MetaEventConfig, MetaEventTask, Metadata,
    Project, ProjectConfig, ProjectId, RetryStrategy, SignatureConfig, SslConfig, TlsPolicy,
};
pub use worker::{disposition, Disposition, WorkerConfig, WorkerPool};

#[cfg(feature = "redis")]
pub use storage_redis::{RedisLockStore, RedisQueue};

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStore;
