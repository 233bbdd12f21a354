use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_postgres::Client;

use crate::error::RepositoryError;
use crate::storage::{EndpointRepository, EntityRepository, ProjectRepository};
use crate::types::{
    DeliveryAttempt, Dispatchable, Endpoint, EventDelivery, EventStatus, MetaEvent, Project,
};

const ENDPOINTS: &str = "webhook_endpoints";
const EVENT_DELIVERIES: &str = "webhook_event_deliveries";
const META_EVENTS: &str = "webhook_meta_events";

/// Repositories over JSONB documents, one table per kind.
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    pub async fn new(client: Client) -> Result<Self, RepositoryError> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_projects (
                    id TEXT PRIMARY KEY,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await
            .map_err(backend)?;

        for table in [ENDPOINTS, EVENT_DELIVERIES, META_EVENTS] {
            client
                .execute(
                    &*format!(
                        "CREATE TABLE IF NOT EXISTS {table} (
                            id TEXT PRIMARY KEY,
                            project_id TEXT NOT NULL,
                            payload JSONB NOT NULL
                        )"
                    ),
                    &[],
                )
                .await
                .map_err(backend)?;
        }

        Ok(Self { client })
    }

    pub async fn upsert_project(&self, project: &Project) -> Result<(), RepositoryError> {
        let payload = serde_json::to_value(project)?;
        self.client
            .execute(
                "INSERT INTO webhook_projects (id, payload)
                 VALUES ($1, $2)
                 ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload",
                &[&project.uid.as_str(), &payload],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    pub async fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<(), RepositoryError> {
        self.upsert(ENDPOINTS, endpoint.uid.as_str(), endpoint.project_id.as_str(), endpoint)
            .await
    }

    pub async fn upsert_event_delivery(
        &self,
        delivery: &EventDelivery,
    ) -> Result<(), RepositoryError> {
        self.upsert(EVENT_DELIVERIES, &delivery.uid, delivery.project_id.as_str(), delivery)
            .await
    }

    pub async fn upsert_meta_event(&self, meta_event: &MetaEvent) -> Result<(), RepositoryError> {
        self.upsert(META_EVENTS, &meta_event.uid, meta_event.project_id.as_str(), meta_event)
            .await
    }

    async fn upsert<T: Serialize + Sync>(
        &self,
        table: &str,
        id: &str,
        project_id: &str,
        value: &T,
    ) -> Result<(), RepositoryError> {
        let payload = serde_json::to_value(value)?;
        self.client
            .execute(
                &*format!(
                    "INSERT INTO {table} (id, project_id, payload)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload"
                ),
                &[&id, &project_id, &payload],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn find<T: DeserializeOwned>(
        &self,
        table: &str,
        kind: &'static str,
        project_id: &str,
        id: &str,
    ) -> Result<T, RepositoryError> {
        let row = self
            .client
            .query_opt(
                &*format!("SELECT payload FROM {table} WHERE id = $1 AND project_id = $2"),
                &[&id, &project_id],
            )
            .await
            .map_err(backend)?
            .ok_or_else(|| RepositoryError::not_found(kind, id))?;
        let payload: serde_json::Value = row.try_get(0).map_err(backend)?;
        Ok(serde_json::from_value(payload)?)
    }

    async fn set_status(
        &self,
        table: &str,
        kind: &'static str,
        entity: &impl Dispatchable,
        status: EventStatus,
    ) -> Result<(), RepositoryError> {
        let changed = self
            .client
            .execute(
                &*format!(
                    "UPDATE {table}
                     SET payload = payload || jsonb_build_object('status', $3::text, 'updated_at', $4::text)
                     WHERE id = $1 AND project_id = $2"
                ),
                &[
                    &entity.uid(),
                    &entity.project_id().as_str(),
                    &status.as_str(),
                    &Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(backend)?;
        if changed == 0 {
            return Err(RepositoryError::not_found(kind, entity.uid()));
        }
        Ok(())
    }

    /// Status, description and metadata are written and the attempt
    /// appended in a single statement.
    async fn append_attempt(
        &self,
        table: &str,
        kind: &'static str,
        entity: &impl Dispatchable,
        attempt: &DeliveryAttempt,
    ) -> Result<(), RepositoryError> {
        let metadata = serde_json::to_value(entity.metadata())?;
        let attempt = serde_json::to_value(attempt)?;
        let changed = self
            .client
            .execute(
                &*format!(
                    "UPDATE {table}
                     SET payload = payload
                         || jsonb_build_object(
                                'status', $3::text,
                                'description', $4::text,
                                'metadata', $5::jsonb,
                                'updated_at', $6::text)
                         || jsonb_build_object(
                                'attempts',
                                COALESCE(payload->'attempts', '[]'::jsonb) || jsonb_build_array($7::jsonb))
                     WHERE id = $1 AND project_id = $2"
                ),
                &[
                    &entity.uid(),
                    &entity.project_id().as_str(),
                    &entity.status().as_str(),
                    &entity.description(),
                    &metadata,
                    &Utc::now().to_rfc3339(),
                    &attempt,
                ],
            )
            .await
            .map_err(backend)?;
        if changed == 0 {
            return Err(RepositoryError::not_found(kind, entity.uid()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProjectRepository for PostgresStore {
    async fn fetch_project_by_id(&self, id: &str) -> Result<Project, RepositoryError> {
        let row = self
            .client
            .query_opt("SELECT payload FROM webhook_projects WHERE id = $1", &[&id])
            .await
            .map_err(backend)?
            .ok_or_else(|| RepositoryError::not_found("project", id))?;
        let payload: serde_json::Value = row.try_get(0).map_err(backend)?;
        Ok(serde_json::from_value(payload)?)
    }
}

#[async_trait]
impl EndpointRepository for PostgresStore {
    async fn find_endpoint_by_id(
        &self,
        project_id: &str,
        id: &str,
    ) -> Result<Endpoint, RepositoryError> {
        self.find(ENDPOINTS, "endpoint", project_id, id).await
    }
}

macro_rules! postgres_entity_repository {
    ($entity:ty, $table:expr, $kind:literal) => {
        #[async_trait]
        impl EntityRepository<$entity> for PostgresStore {
            async fn find_by_id(
                &self,
                project_id: &str,
                id: &str,
            ) -> Result<$entity, RepositoryError> {
                self.find($table, $kind, project_id, id).await
            }

            async fn update_status(
                &self,
                entity: &$entity,
                status: EventStatus,
            ) -> Result<(), RepositoryError> {
                self.set_status($table, $kind, entity, status).await
            }

            async fn update_with_attempt(
                &self,
                entity: &$entity,
                attempt: &DeliveryAttempt,
            ) -> Result<(), RepositoryError> {
                self.append_attempt($table, $kind, entity, attempt).await
            }
        }
    };
}

postgres_entity_repository!(EventDelivery, EVENT_DELIVERIES, "event delivery");
postgres_entity_repository!(MetaEvent, META_EVENTS, "meta event");

fn backend(err: tokio_postgres::Error) -> RepositoryError {
    RepositoryError::Backend(err.to_string())
}
