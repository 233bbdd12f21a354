#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use webhook_delivery::{
    DeliveryAttempt, DispatcherOptions, Dispatchable, Endpoint, EndpointRepository,
    EntityRepository, EventStatus, HttpDispatcher, InMemoryStore, RepositoryError, StaticLicenser,
};

pub fn http_dispatcher(licenser: StaticLicenser) -> Arc<HttpDispatcher> {
    let options = DispatcherOptions::default().with_proxy("nil");
    Arc::new(HttpDispatcher::new(Arc::new(licenser), options).unwrap())
}

/// Repository call as observed by [`Recording`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    UpdateStatus(EventStatus),
    UpdateWithAttempt(EventStatus),
}

/// Passes through to the in-memory store and records writes.
pub struct Recording {
    pub inner: Arc<InMemoryStore>,
    pub calls: Mutex<Vec<Call>>,
}

impl Recording {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl<E> EntityRepository<E> for Recording
where
    E: Dispatchable,
    InMemoryStore: EntityRepository<E>,
{
    async fn find_by_id(&self, project_id: &str, id: &str) -> Result<E, RepositoryError> {
        self.inner.find_by_id(project_id, id).await
    }

    async fn update_status(&self, entity: &E, status: EventStatus) -> Result<(), RepositoryError> {
        self.calls.lock().unwrap().push(Call::UpdateStatus(status));
        self.inner.update_status(entity, status).await
    }

    async fn update_with_attempt(
        &self,
        entity: &E,
        attempt: &DeliveryAttempt,
    ) -> Result<(), RepositoryError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::UpdateWithAttempt(entity.status()));
        self.inner.update_with_attempt(entity, attempt).await
    }
}

/// Reads succeed, every write fails.
pub struct FailingWrites {
    pub inner: Arc<InMemoryStore>,
}

#[async_trait]
impl<E> EntityRepository<E> for FailingWrites
where
    E: Dispatchable,
    InMemoryStore: EntityRepository<E>,
{
    async fn find_by_id(&self, project_id: &str, id: &str) -> Result<E, RepositoryError> {
        self.inner.find_by_id(project_id, id).await
    }

    async fn update_status(
        &self,
        _entity: &E,
        _status: EventStatus,
    ) -> Result<(), RepositoryError> {
        Err(RepositoryError::Backend("connection reset".into()))
    }

    async fn update_with_attempt(
        &self,
        _entity: &E,
        _attempt: &DeliveryAttempt,
    ) -> Result<(), RepositoryError> {
        Err(RepositoryError::Backend("connection reset".into()))
    }
}

/// Endpoint lookups fail as if the database dropped the connection.
pub struct UnreachableEndpoints;

#[async_trait]
impl EndpointRepository for UnreachableEndpoints {
    async fn find_endpoint_by_id(
        &self,
        _project_id: &str,
        _id: &str,
    ) -> Result<Endpoint, RepositoryError> {
        Err(RepositoryError::Backend("connection reset".into()))
    }
}
