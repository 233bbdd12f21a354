use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub String);

/// Unique identifier for an endpoint.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of endpoint IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub String);

/// Unique identifier for the source event of a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

macro_rules! id_display {
    ($($ty:ident),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl $ty {
                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl From<&str> for $ty {
                fn from(s: &str) -> Self {
                    $ty(s.to_string())
                }
            }
        )*
    };
}

id_display!(ProjectId, EndpointId, EventId);

/// Delivery lifecycle status shared by event deliveries and meta events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    Scheduled,
    Processing,
    Retry,
    Success,
    Failure,
    Discarded,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Scheduled => "Scheduled",
            EventStatus::Processing => "Processing",
            EventStatus::Retry => "Retry",
            EventStatus::Success => "Success",
            EventStatus::Failure => "Failure",
            EventStatus::Discarded => "Discarded",
        }
    }

    /// No further dispatch will be attempted from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Success | EventStatus::Failure | EventStatus::Discarded
        )
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    #[default]
    Linear,
    Exponential,
}

/// Payload and retry bookkeeping carried by every dispatchable entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Request body sent to the target.
    pub data: Vec<u8>,

    /// Original serialized form of the event.
    pub raw: String,

    #[serde(default)]
    pub strategy: RetryStrategy,

    pub num_trials: u64,
    pub retry_limit: u64,
    pub interval_seconds: u64,

    /// Earliest time the next attempt should run.
    pub next_send_time: DateTime<Utc>,
}

impl Metadata {
    pub fn new(data: impl Into<Vec<u8>>, retry_limit: u64, interval_seconds: u64) -> Self {
        let data = data.into();
        Self {
            raw: String::from_utf8_lossy(&data).into_owned(),
            data,
            strategy: RetryStrategy::Linear,
            num_trials: 0,
            retry_limit,
            interval_seconds,
            next_send_time: Utc::now(),
        }
    }

    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_num_trials(mut self, num_trials: u64) -> Self {
        self.num_trials = num_trials;
        self
    }
}

/// Immutable record of one dispatch outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub uid: String,
    pub url: String,
    pub method: String,

    /// Absent when no response was received.
    pub http_status: Option<u16>,

    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,

    /// Response body, cut at the dispatcher's size bound.
    pub response_data: String,
    pub truncated: bool,

    pub success: bool,
    pub error: String,
    pub latency_ms: u64,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One (event, endpoint) pairing awaiting or having undergone delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDelivery {
    pub uid: String,
    pub project_id: ProjectId,
    pub event_id: EventId,
    pub endpoint_id: EndpointId,
    pub event_type: String,

    /// Extra headers forwarded with the request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    pub status: EventStatus,
    pub metadata: Metadata,

    #[serde(default)]
    pub attempts: Vec<DeliveryAttempt>,
    #[serde(default)]
    pub description: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventDelivery {
    /// Create a scheduled delivery with a fresh id.
    pub fn new(
        project_id: impl Into<String>,
        event_id: impl Into<String>,
        endpoint_id: impl Into<String>,
        event_type: impl Into<String>,
        metadata: Metadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            project_id: ProjectId(project_id.into()),
            event_id: EventId(event_id.into()),
            endpoint_id: EndpointId(endpoint_id.into()),
            event_type: event_type.into(),
            headers: BTreeMap::new(),
            status: EventStatus::Scheduled,
            metadata,
            attempts: Vec::new(),
            description: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Internal lifecycle notification delivered to a project-level URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaEvent {
    pub uid: String,
    pub project_id: ProjectId,
    pub event_type: String,
    pub status: EventStatus,
    pub metadata: Metadata,

    #[serde(default)]
    pub attempts: Vec<DeliveryAttempt>,
    #[serde(default)]
    pub description: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MetaEvent {
    pub fn new(
        project_id: impl Into<String>,
        event_type: impl Into<String>,
        metadata: Metadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            project_id: ProjectId(project_id.into()),
            event_type: event_type.into(),
            status: EventStatus::Scheduled,
            metadata,
            attempts: Vec::new(),
            description: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }
}

/// Common view over entities the task processor can deliver.
pub trait Dispatchable: Clone + Send + Sync + 'static {
    fn uid(&self) -> &str;
    fn project_id(&self) -> &ProjectId;
    fn event_type(&self) -> &str;
    fn status(&self) -> EventStatus;
    fn set_status(&mut self, status: EventStatus);
    fn metadata(&self) -> &Metadata;
    fn metadata_mut(&mut self) -> &mut Metadata;
    fn attempts(&self) -> &[DeliveryAttempt];
    fn push_attempt(&mut self, attempt: DeliveryAttempt);
    fn description(&self) -> &str;
    fn set_description(&mut self, description: String);
    fn touch(&mut self, at: DateTime<Utc>);
}

macro_rules! impl_dispatchable {
    ($ty:ty) => {
        impl Dispatchable for $ty {
            fn uid(&self) -> &str {
                &self.uid
            }
            fn project_id(&self) -> &ProjectId {
                &self.project_id
            }
            fn event_type(&self) -> &str {
                &self.event_type
            }
            fn status(&self) -> EventStatus {
                self.status
            }
            fn set_status(&mut self, status: EventStatus) {
                self.status = status;
            }
            fn metadata(&self) -> &Metadata {
                &self.metadata
            }
            fn metadata_mut(&mut self) -> &mut Metadata {
                &mut self.metadata
            }
            fn attempts(&self) -> &[DeliveryAttempt] {
                &self.attempts
            }
            fn push_attempt(&mut self, attempt: DeliveryAttempt) {
                self.attempts.push(attempt);
            }
            fn description(&self) -> &str {
                &self.description
            }
            fn set_description(&mut self, description: String) {
                self.description = description;
            }
            fn touch(&mut self, at: DateTime<Utc>) {
                self.updated_at = at;
            }
        }
    };
}

impl_dispatchable!(EventDelivery);
impl_dispatchable!(MetaEvent);

/// Destination for event deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub uid: EndpointId,
    pub project_id: ProjectId,

    /// Target URL for webhook delivery.
    pub url: String,

    /// Optional secret for HMAC signing.
    pub secret: Option<String>,

    /// Per-endpoint deadline, overrides the project's.
    pub http_timeout_secs: Option<u64>,

    pub status: EndpointStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointStatus {
    Active,
    Inactive,
    Paused,
}

impl Endpoint {
    /// Create an active endpoint with no secret.
    pub fn new(
        uid: impl Into<String>,
        project_id: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            uid: EndpointId(uid.into()),
            project_id: ProjectId(project_id.into()),
            url: url.into(),
            secret: None,
            http_timeout_secs: None,
            status: EndpointStatus::Active,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_status(mut self, status: EndpointStatus) -> Self {
        self.status = status;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub uid: ProjectId,
    pub name: String,
    #[serde(default)]
    pub config: ProjectConfig,
}

impl Project {
    pub fn new(uid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uid: ProjectId(uid.into()),
            name: name.into(),
            config: ProjectConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ProjectConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub ssl: SslConfig,
    pub signature: SignatureConfig,
    pub meta_event: Option<MetaEventConfig>,

    /// Deadline for each dispatch when the endpoint sets none.
    pub http_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SslConfig {
    /// Reject targets that are not `https`.
    pub enforce_secure_endpoints: bool,

    /// Verify server certificates.
    pub verify_certificates: bool,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            enforce_secure_endpoints: true,
            verify_certificates: true,
        }
    }
}

impl SslConfig {
    /// Plain-http targets allowed. Meant for local receivers.
    pub fn insecure() -> Self {
        Self {
            enforce_secure_endpoints: false,
            verify_certificates: true,
        }
    }

    pub fn tls_policy(&self) -> TlsPolicy {
        if self.verify_certificates {
            TlsPolicy::Verify
        } else {
            TlsPolicy::AcceptInvalidCerts
        }
    }
}

/// Certificate verification mode. One connection pool exists per mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsPolicy {
    Verify,
    AcceptInvalidCerts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    /// Signature header name.
    pub header: String,

    /// Timestamp header name.
    pub timestamp_header: String,

    /// Whether to include timestamp in signatures.
    pub include_timestamp: bool,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            header: "X-Webhook-Signature".to_string(),
            timestamp_header: "X-Webhook-Timestamp".to_string(),
            include_timestamp: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaEventConfig {
    pub is_enabled: bool,
    pub url: String,
    pub secret: Option<String>,

    /// Event types the project subscribed to. Empty means all.
    pub event_types: Vec<String>,
}

impl MetaEventConfig {
    pub fn enabled(url: impl Into<String>) -> Self {
        Self {
            is_enabled: true,
            url: url.into(),
            secret: None,
            event_types: Vec::new(),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn accepts(&self, event_type: &str) -> bool {
        self.event_types.is_empty() || self.event_types.iter().any(|t| t == event_type)
    }
}

/// Queue payload for an event delivery job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDeliveryTask {
    pub event_delivery_id: String,
    pub project_id: String,
}

/// Queue payload for a meta event job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaEventTask {
    pub meta_event_id: String,
    pub project_id: String,
}
