use std::sync::Arc;
use std::time::Duration;

use webhook_delivery::{
    init_tracing, Config, Endpoint, EventDelivery, EventDeliveryTask, HttpDispatcher,
    InMemoryStore, Job, MemoryQueue, Metadata, Processor, Project, Queue, QueueName,
    StaticLicenser, TaskName, WorkerPool,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::default();
    config.apply_env()?;
    init_tracing(&config.log);

    let store = Arc::new(InMemoryStore::new());
    store.insert_project(Project::new("proj_1", "orders")).await;
    store
        .insert_endpoint(
            Endpoint::new("ep_1", "proj_1", "https://example.com/webhook")
                .with_secret("supersecret"),
        )
        .await;

    let delivery = EventDelivery::new(
        "proj_1",
        "evt_123",
        "ep_1",
        "order.created",
        Metadata::new(br#"{"id":123}"#.to_vec(), 3, 10),
    );
    let delivery_id = delivery.uid.clone();
    store.insert_event_delivery(delivery).await;

    let dispatcher = Arc::new(HttpDispatcher::new(
        Arc::new(StaticLicenser::none()),
        config.dispatcher_options(),
    )?);
    let processor = Processor::for_event_deliveries(
        store.clone(),
        store.clone(),
        store.clone(),
        dispatcher,
    )
    .with_default_timeout(config.default_timeout())
    .with_max_backoff(config.max_backoff());

    let queue = Arc::new(MemoryQueue::new());
    let pool = WorkerPool::new(queue.clone(), config.worker.clone())
        .register(QueueName::EventQueue, Arc::new(processor));
    pool.start();

    let task = EventDeliveryTask {
        event_delivery_id: delivery_id.clone(),
        project_id: "proj_1".into(),
    };
    queue
        .enqueue(QueueName::EventQueue, Job::new(TaskName::EventProcessor, &task)?, Duration::ZERO)
        .await?;

    tokio::time::sleep(Duration::from_secs(3)).await;
    pool.shutdown().await;

    if let Some(delivery) = store.event_delivery(&delivery_id).await {
        println!(
            "status={} trials={} description={:?}",
            delivery.status, delivery.metadata.num_trials, delivery.description
        );
    }
    Ok(())
}
