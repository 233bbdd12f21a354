use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::RepositoryError;
use crate::types::{
    DeliveryAttempt, Dispatchable, Endpoint, EventDelivery, EventStatus, MetaEvent, Project,
};

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn fetch_project_by_id(&self, id: &str) -> Result<Project, RepositoryError>;
}

#[async_trait]
pub trait EndpointRepository: Send + Sync {
    async fn find_endpoint_by_id(
        &self,
        project_id: &str,
        id: &str,
    ) -> Result<Endpoint, RepositoryError>;
}

/// Persistence for one kind of dispatchable entity.
///
/// `update_with_attempt` must write status, description and metadata and
/// append the attempt as one atomic change.
#[async_trait]
pub trait EntityRepository<E: Dispatchable>: Send + Sync {
    async fn find_by_id(&self, project_id: &str, id: &str) -> Result<E, RepositoryError>;

    async fn update_status(&self, entity: &E, status: EventStatus) -> Result<(), RepositoryError>;

    async fn update_with_attempt(
        &self,
        entity: &E,
        attempt: &DeliveryAttempt,
    ) -> Result<(), RepositoryError>;
}

/// In-memory repositories for embedded use and tests.
#[derive(Default)]
pub struct InMemoryStore {
    projects: Mutex<HashMap<String, Project>>,
    endpoints: Mutex<HashMap<String, Endpoint>>,
    event_deliveries: Mutex<HashMap<String, EventDelivery>>,
    meta_events: Mutex<HashMap<String, MetaEvent>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_project(&self, project: Project) {
        self.projects.lock().await.insert(project.uid.0.clone(), project);
    }

    pub async fn insert_endpoint(&self, endpoint: Endpoint) {
        self.endpoints.lock().await.insert(endpoint.uid.0.clone(), endpoint);
    }

    pub async fn insert_event_delivery(&self, delivery: EventDelivery) {
        self.event_deliveries
            .lock()
            .await
            .insert(delivery.uid.clone(), delivery);
    }

    pub async fn insert_meta_event(&self, meta_event: MetaEvent) {
        self.meta_events
            .lock()
            .await
            .insert(meta_event.uid.clone(), meta_event);
    }

    pub async fn event_delivery(&self, id: &str) -> Option<EventDelivery> {
        self.event_deliveries.lock().await.get(id).cloned()
    }

    pub async fn meta_event(&self, id: &str) -> Option<MetaEvent> {
        self.meta_events.lock().await.get(id).cloned()
    }
}

#[async_trait]
impl ProjectRepository for InMemoryStore {
    async fn fetch_project_by_id(&self, id: &str) -> Result<Project, RepositoryError> {
        self.projects
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("project", id))
    }
}

#[async_trait]
impl EndpointRepository for InMemoryStore {
    async fn find_endpoint_by_id(
        &self,
        project_id: &str,
        id: &str,
    ) -> Result<Endpoint, RepositoryError> {
        self.endpoints
            .lock()
            .await
            .get(id)
            .filter(|e| e.project_id.0 == project_id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("endpoint", id))
    }
}

macro_rules! in_memory_entity_repository {
    ($entity:ty, $field:ident, $kind:literal) => {
        #[async_trait]
        impl EntityRepository<$entity> for InMemoryStore {
            async fn find_by_id(
                &self,
                project_id: &str,
                id: &str,
            ) -> Result<$entity, RepositoryError> {
                self.$field
                    .lock()
                    .await
                    .get(id)
                    .filter(|e| e.project_id.0 == project_id)
                    .cloned()
                    .ok_or_else(|| RepositoryError::not_found($kind, id))
            }

            async fn update_status(
                &self,
                entity: &$entity,
                status: EventStatus,
            ) -> Result<(), RepositoryError> {
                let mut guard = self.$field.lock().await;
                let stored = guard
                    .get_mut(entity.uid())
                    .ok_or_else(|| RepositoryError::not_found($kind, entity.uid()))?;
                stored.status = status;
                stored.updated_at = Utc::now();
                Ok(())
            }

            async fn update_with_attempt(
                &self,
                entity: &$entity,
                attempt: &DeliveryAttempt,
            ) -> Result<(), RepositoryError> {
                let mut guard = self.$field.lock().await;
                let stored = guard
                    .get_mut(entity.uid())
                    .ok_or_else(|| RepositoryError::not_found($kind, entity.uid()))?;
                stored.status = entity.status();
                stored.description = entity.description().to_string();
                stored.metadata = entity.metadata().clone();
                stored.updated_at = Utc::now();
                stored.attempts.push(attempt.clone());
                Ok(())
            }
        }
    };
}

in_memory_entity_repository!(EventDelivery, event_deliveries, "event delivery");
in_memory_entity_repository!(MetaEvent, meta_events, "meta event");
