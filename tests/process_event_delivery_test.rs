mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{http_dispatcher, Call, Recording, UnreachableEndpoints};
use webhook_delivery::{
    verify_signature, DeliveryFailure, DispatcherOptions, Endpoint, EndpointStatus, EventDelivery,
    EventDeliveryTask, EventStatus, HttpDispatcher, InMemoryStore, IpRulesConfig, Job,
    LinearSchedule, Metadata, ProcessError, Processor, Project, ProjectConfig, RetryStrategy,
    RetryableError, SslConfig, StaticLicenser, TaskHandler, TaskName,
};
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PROJECT_ID: &str = "proj-1";
const DELIVERY_ID: &str = "delivery-1";
const ENDPOINT_ID: &str = "ep-1";
const PAYLOAD: &[u8] = br#"{"order_id":42,"state":"paid"}"#;

fn project() -> Project {
    Project::new(PROJECT_ID, "shop").with_config(ProjectConfig {
        ssl: SslConfig::insecure(),
        ..ProjectConfig::default()
    })
}

fn delivery(metadata: Metadata) -> EventDelivery {
    EventDelivery::new(PROJECT_ID, "evt-1", ENDPOINT_ID, "order.paid", metadata)
        .with_uid(DELIVERY_ID)
        .with_header("X-Tenant", "acme")
}

fn job() -> Job {
    Job::new(
        TaskName::EventProcessor,
        &EventDeliveryTask {
            event_delivery_id: DELIVERY_ID.into(),
            project_id: PROJECT_ID.into(),
        },
    )
    .unwrap()
}

async fn store_with(endpoint: Endpoint, delivery: EventDelivery) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.insert_project(project()).await;
    store.insert_endpoint(endpoint).await;
    store.insert_event_delivery(delivery).await;
    store
}

fn processor(
    store: &Arc<InMemoryStore>,
    dispatcher: Arc<HttpDispatcher>,
) -> Processor<EventDelivery> {
    Processor::for_event_deliveries(store.clone(), store.clone(), store.clone(), dispatcher)
}

#[tokio::test]
async fn signed_delivery_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(header("X-Tenant", "acme"))
        .and(header_exists("X-Webhook-Signature"))
        .and(header_exists("X-Webhook-Timestamp"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let endpoint = Endpoint::new(ENDPOINT_ID, PROJECT_ID, format!("{}/orders", server.uri()))
        .with_secret("whsec_test");
    let store = store_with(endpoint, delivery(Metadata::new(PAYLOAD.to_vec(), 3, 10))).await;

    processor(&store, http_dispatcher(StaticLicenser::none()))
        .process(&job())
        .await
        .unwrap();

    let received = server.received_requests().await.unwrap();
    let request = &received[0];
    let signature = request.headers.get("X-Webhook-Signature").unwrap().to_str().unwrap();
    let timestamp = request.headers.get("X-Webhook-Timestamp").unwrap().to_str().unwrap();
    assert_eq!(request.body, PAYLOAD);
    assert!(verify_signature(b"whsec_test", &request.body, Some(timestamp), signature));

    let stored = store.event_delivery(DELIVERY_ID).await.unwrap();
    assert_eq!(stored.status, EventStatus::Success);
    assert_eq!(stored.attempts[0].http_status, Some(202));
}

#[tokio::test]
async fn inactive_endpoint_is_discarded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let endpoint = Endpoint::new(ENDPOINT_ID, PROJECT_ID, server.uri())
        .with_status(EndpointStatus::Inactive);
    let store = store_with(endpoint, delivery(Metadata::new(PAYLOAD.to_vec(), 3, 10))).await;

    processor(&store, http_dispatcher(StaticLicenser::none()))
        .process(&job())
        .await
        .unwrap();

    let stored = store.event_delivery(DELIVERY_ID).await.unwrap();
    assert_eq!(stored.status, EventStatus::Discarded);
    assert_eq!(stored.description, "endpoint is inactive");
    assert_eq!(stored.attempts.len(), 1);
}

#[tokio::test]
async fn blocked_destination_is_discarded_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let endpoint = Endpoint::new(ENDPOINT_ID, PROJECT_ID, server.uri());
    let store = store_with(endpoint, delivery(Metadata::new(PAYLOAD.to_vec(), 5, 10))).await;

    let options = DispatcherOptions::default().with_ip_rules(IpRulesConfig {
        allow: vec!["203.0.113.0/24".into()],
        deny: Vec::new(),
    });
    let dispatcher =
        Arc::new(HttpDispatcher::new(Arc::new(StaticLicenser::all()), options).unwrap());

    processor(&store, dispatcher).process(&job()).await.unwrap();

    let stored = store.event_delivery(DELIVERY_ID).await.unwrap();
    assert_eq!(stored.status, EventStatus::Discarded);
    assert!(stored.description.starts_with("policy violation"));
    assert_eq!(stored.metadata.num_trials, 1);
}

#[tokio::test]
async fn exponential_strategy_grows_the_delay() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let endpoint = Endpoint::new(ENDPOINT_ID, PROJECT_ID, server.uri());
    let metadata = Metadata::new(PAYLOAD.to_vec(), 5, 10)
        .with_strategy(RetryStrategy::Exponential)
        .with_num_trials(2);
    let store = store_with(endpoint, delivery(metadata)).await;

    let err = processor(&store, http_dispatcher(StaticLicenser::none()))
        .process(&job())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ProcessError::Retry(RetryableError {
            reason: DeliveryFailure::EndpointDeliveryFailed,
            delay: Duration::from_secs(40),
        })
    );
}

#[tokio::test]
async fn injected_schedule_overrides_strategy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let endpoint = Endpoint::new(ENDPOINT_ID, PROJECT_ID, server.uri());
    let metadata = Metadata::new(PAYLOAD.to_vec(), 5, 10)
        .with_strategy(RetryStrategy::Exponential)
        .with_num_trials(2);
    let store = store_with(endpoint, delivery(metadata)).await;

    let err = processor(&store, http_dispatcher(StaticLicenser::none()))
        .with_schedule(Arc::new(LinearSchedule))
        .process(&job())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProcessError::Retry(RetryableError { delay, .. }) if delay == Duration::from_secs(10)
    ));
}

#[tokio::test]
async fn spent_budget_fails_without_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let endpoint = Endpoint::new(ENDPOINT_ID, PROJECT_ID, server.uri());
    let store = store_with(endpoint, delivery(Metadata::new(PAYLOAD.to_vec(), 0, 10))).await;

    processor(&store, http_dispatcher(StaticLicenser::none()))
        .process(&job())
        .await
        .unwrap();

    let stored = store.event_delivery(DELIVERY_ID).await.unwrap();
    assert_eq!(stored.status, EventStatus::Failure);
    assert!(stored.attempts.is_empty());
}

#[tokio::test]
async fn endpoint_timeout_bounds_the_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let endpoint =
        Endpoint::new(ENDPOINT_ID, PROJECT_ID, server.uri()).with_timeout(Duration::from_secs(1));
    let store = store_with(endpoint, delivery(Metadata::new(PAYLOAD.to_vec(), 3, 10))).await;

    let err = processor(&store, http_dispatcher(StaticLicenser::none()))
        .process(&job())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::Retry(_)));

    let stored = store.event_delivery(DELIVERY_ID).await.unwrap();
    assert_eq!(stored.status, EventStatus::Retry);
    assert_eq!(stored.attempts[0].http_status, None);
    assert!(stored.attempts[0].error.contains("timed out"));
}

#[tokio::test]
async fn endpoint_lookup_failure_leaves_the_delivery_untouched() {
    let endpoint = Endpoint::new(ENDPOINT_ID, PROJECT_ID, "http://127.0.0.1:9/hook");
    let store = store_with(endpoint, delivery(Metadata::new(PAYLOAD.to_vec(), 3, 10))).await;
    let repo = Arc::new(Recording::new(store.clone()));

    let processor = Processor::for_event_deliveries(
        store.clone(),
        Arc::new(UnreachableEndpoints),
        repo.clone(),
        http_dispatcher(StaticLicenser::none()),
    );
    let err = processor.process(&job()).await.unwrap_err();

    assert!(matches!(err, ProcessError::Repository(_)));
    assert_eq!(repo.calls(), Vec::<Call>::new());

    let stored = store.event_delivery(DELIVERY_ID).await.unwrap();
    assert_eq!(stored.status, EventStatus::Scheduled);
    assert_eq!(stored.metadata.num_trials, 0);
    assert!(stored.attempts.is_empty());
}
