//! Where an entity is delivered and how the request is built.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::dispatcher::DispatchRequest;
use crate::error::RepositoryError;
use crate::signing::sign_payload;
use crate::storage::EndpointRepository;
use crate::types::{Dispatchable, EndpointStatus, EventDelivery, MetaEvent, Project};

pub const DELIVERY_ID_HEADER: &str = "X-Webhook-Delivery-Id";
pub const EVENT_TYPE_HEADER: &str = "X-Webhook-Event-Type";

#[derive(Debug, Error)]
pub enum TargetError {
    /// The entity cannot be delivered under the current configuration.
    #[error("{reason}")]
    Rejected { url: String, reason: String },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl TargetError {
    pub fn rejected(url: impl Into<String>, reason: impl Into<String>) -> Self {
        TargetError::Rejected {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Resolved destination for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub url: String,
    pub secret: Option<String>,

    /// Destination-specific deadline, ahead of the project's.
    pub timeout: Option<Duration>,

    pub headers: BTreeMap<String, String>,
}

#[async_trait]
pub trait ResolveTarget<E: Dispatchable>: Send + Sync {
    async fn resolve(&self, project: &Project, entity: &E) -> Result<Target, TargetError>;
}

/// Event deliveries go to the endpoint they were created for.
pub struct EndpointTarget {
    endpoints: Arc<dyn EndpointRepository>,
}

impl EndpointTarget {
    pub fn new(endpoints: Arc<dyn EndpointRepository>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl ResolveTarget<EventDelivery> for EndpointTarget {
    async fn resolve(
        &self,
        project: &Project,
        delivery: &EventDelivery,
    ) -> Result<Target, TargetError> {
        let endpoint = match self
            .endpoints
            .find_endpoint_by_id(project.uid.as_str(), delivery.endpoint_id.as_str())
            .await
        {
            Ok(endpoint) => endpoint,
            Err(err) if err.is_not_found() => {
                return Err(TargetError::rejected(
                    "",
                    format!("endpoint {} not found", delivery.endpoint_id),
                ))
            }
            Err(err) => return Err(err.into()),
        };

        match endpoint.status {
            EndpointStatus::Active => {}
            EndpointStatus::Inactive => {
                return Err(TargetError::rejected(endpoint.url, "endpoint is inactive"))
            }
            EndpointStatus::Paused => {
                return Err(TargetError::rejected(endpoint.url, "endpoint is paused"))
            }
        }

        Ok(Target {
            url: endpoint.url,
            secret: endpoint.secret,
            timeout: endpoint.http_timeout_secs.map(Duration::from_secs),
            headers: delivery.headers.clone(),
        })
    }
}

/// Meta events go to the project's configured meta-event URL.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetaEventTarget;

#[async_trait]
impl ResolveTarget<MetaEvent> for MetaEventTarget {
    async fn resolve(
        &self,
        project: &Project,
        meta_event: &MetaEvent,
    ) -> Result<Target, TargetError> {
        let config = match &project.config.meta_event {
            Some(config) if config.is_enabled => config,
            _ => return Err(TargetError::rejected("", "meta events are disabled")),
        };
        if config.url.trim().is_empty() {
            return Err(TargetError::rejected("", "meta event url is not configured"));
        }
        if !config.accepts(&meta_event.event_type) {
            return Err(TargetError::rejected(
                config.url.clone(),
                format!("project is not subscribed to {}", meta_event.event_type),
            ));
        }

        Ok(Target {
            url: config.url.clone(),
            secret: config.secret.clone(),
            timeout: None,
            headers: BTreeMap::new(),
        })
    }
}

/// Build the outbound request for `entity`.
///
/// The deadline is the target's, then the project's, then `default_timeout`.
pub fn render_request<E: Dispatchable>(
    project: &Project,
    entity: &E,
    target: Target,
    default_timeout: Duration,
    now: DateTime<Utc>,
) -> Result<DispatchRequest, TargetError> {
    let ssl = &project.config.ssl;
    let url = url::Url::parse(&target.url)
        .map_err(|e| TargetError::rejected(target.url.clone(), format!("invalid url: {e}")))?;
    if ssl.enforce_secure_endpoints && url.scheme() != "https" {
        return Err(TargetError::rejected(
            target.url,
            "project only allows https endpoints",
        ));
    }

    let timeout = target
        .timeout
        .or(project.config.http_timeout_secs.map(Duration::from_secs))
        .unwrap_or(default_timeout);

    let body = entity.metadata().data.clone();
    let mut request = DispatchRequest::post(target.url, body, timeout)
        .with_tls(ssl.tls_policy())
        .with_header("Content-Type", "application/json")
        .with_header(DELIVERY_ID_HEADER, entity.uid())
        .with_header(EVENT_TYPE_HEADER, entity.event_type());

    for (name, value) in target.headers {
        request = request.with_header(name, value);
    }

    if let Some(secret) = target.secret.as_deref().filter(|s| !s.is_empty()) {
        let signed = sign_payload(
            &project.config.signature,
            secret,
            &request.body,
            now.timestamp(),
        );
        let (name, value) = signed.signature_header;
        request = request.with_header(name, value);
        if let Some((name, value)) = signed.timestamp_header {
            request = request.with_header(name, value);
        }
    }

    Ok(request)
}
