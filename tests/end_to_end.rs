//! Scheduler to worker, through the real stores and broker.

use chrono::{Duration, Utc};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use agentbeat::config::AppConfig;
use agentbeat::executors::TaskOutcome;
use agentbeat::scheduler::{BeatEngine, QueueName};
use agentbeat::storage::executions::ExecutionStore;
use agentbeat::storage::periodic_tasks::{NewPeriodicTask, ScheduleStore};
use agentbeat::storage::queue::Broker;
use agentbeat::storage::{open_broker_pool, open_store_pool, StoreHandle};
use agentbeat::{build_loader, build_worker, Services};

fn config(dir: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.path = dir.join("store.db");
    config.broker.path = dir.join("broker.db");
    config
}

#[tokio::test]
async fn test_http_row_runs_once_per_interval() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/y"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let pool = open_store_pool(&config.database.path).unwrap();
    let services = Services {
        store: StoreHandle::ready(pool.clone()),
        broker: Broker::new(open_broker_pool(&config.broker.path).unwrap()),
    };

    let extra = json!({
        "task_type": "http",
        "url": format!("{}/y", server.uri()),
        "method": "GET",
        "queue": "priority_high",
    });
    ScheduleStore::new(pool.clone())
        .insert(
            &NewPeriodicTask {
                task_name: "ping".to_string(),
                task_enabled: true,
                task_interval: Some(60),
                task_extra_config: Some(extra.to_string()),
                ..Default::default()
            },
            "2024-01-01 08:00:00",
        )
        .unwrap();

    let t0 = Utc::now();
    let mut engine = BeatEngine::new(
        build_loader(&config, services.store.clone()).unwrap(),
        services.broker.clone(),
    );

    assert!(engine.tick(t0).is_empty());
    assert!(engine.tick(t0 + Duration::seconds(30)).is_empty());

    let dispatched = engine.tick(t0 + Duration::seconds(60));
    assert_eq!(dispatched.len(), 1);
    let message = &dispatched[0];
    assert_eq!(message.queue, QueueName::PriorityHigh);
    assert_eq!(
        message.args,
        vec![json!(format!("{}/y", server.uri())), json!("GET"), json!(null), json!(null)]
    );
    assert!(engine.tick(t0 + Duration::seconds(61)).is_empty());

    let worker = build_worker(&config, &services, QueueName::ALL.to_vec()).unwrap();
    let processed = worker
        .process_next(t0 + Duration::seconds(61))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(processed.task_id, message.task_id);
    let TaskOutcome::Success { result } = processed.outcome else {
        panic!("expected success, got {:?}", processed.outcome);
    };
    assert_eq!(result["status_code"], 200);
    assert_eq!(result["body"], "pong");

    let record = ExecutionStore::new(pool).find(&message.task_id).unwrap().unwrap();
    assert_eq!(record.status, "SUCCESS");
    assert_eq!(record.task_name, "ping");
    assert!(worker.process_next(t0 + Duration::seconds(62)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_dispatch_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let pool = open_store_pool(&config.database.path).unwrap();
    let services = Services {
        store: StoreHandle::ready(pool.clone()),
        broker: Broker::new(open_broker_pool(&config.broker.path).unwrap()),
    };
    ScheduleStore::new(pool.clone())
        .insert(
            &NewPeriodicTask {
                task_name: "health".to_string(),
                task_path: "tasks.health_check".to_string(),
                task_enabled: true,
                task_interval: Some(60),
                ..Default::default()
            },
            "2024-01-01 08:00:00",
        )
        .unwrap();

    let t0 = Utc::now();
    let mut engine = BeatEngine::new(
        build_loader(&config, services.store.clone()).unwrap(),
        services.broker.clone(),
    );
    assert!(engine.tick(t0).is_empty());
    assert_eq!(engine.tick(t0 + Duration::seconds(60)).len(), 1);

    // Nobody consumed it within the dispatch TTL.
    let worker = build_worker(&config, &services, QueueName::ALL.to_vec()).unwrap();
    let late = t0 + Duration::seconds(60 + 301);
    assert!(worker.process_next(late).await.unwrap().is_none());
    assert_eq!(services.broker.depth(QueueName::PriorityLow).unwrap(), 0);
}

#[tokio::test]
async fn test_store_down_at_boot_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    let blocker = dir.path().join("db");
    std::fs::write(&blocker, b"not a directory").unwrap();
    config.database.path = blocker.join("store.db");
    config.database.connect_attempts = 1;
    config.database.connect_retry_delay_secs = 0;

    let services = Services::connect(&config).await.unwrap();
    assert!(!services.store.is_connected());
    let mut engine = BeatEngine::new(
        build_loader(&config, services.store.clone()).unwrap(),
        services.broker.clone(),
    );
    let t0 = Utc::now();
    assert!(engine.tick(t0).is_empty());
    assert!(engine.loader().snapshot().is_fallback());

    std::fs::remove_file(&blocker).unwrap();
    std::fs::create_dir(&blocker).unwrap();
    let pool = open_store_pool(&config.database.path).unwrap();
    ScheduleStore::new(pool.clone())
        .insert(
            &NewPeriodicTask {
                task_name: "health".to_string(),
                task_path: "tasks.health_check".to_string(),
                task_enabled: true,
                task_interval: Some(60),
                task_extra_config: Some(r#"{"task_type":"system","queue":"system"}"#.to_string()),
                ..Default::default()
            },
            "2024-01-01 08:00:00",
        )
        .unwrap();

    assert!(engine.tick(t0 + Duration::seconds(30)).is_empty());
    assert_eq!(engine.loader().snapshot().len(), 1);
    let dispatched = engine.tick(t0 + Duration::seconds(90));
    assert_eq!(dispatched.len(), 1);

    let worker = build_worker(&config, &services, QueueName::ALL.to_vec()).unwrap();
    let processed = worker
        .process_next(t0 + Duration::seconds(91))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(processed.outcome, TaskOutcome::Success { .. }));
    let record = ExecutionStore::new(pool).find(&dispatched[0].task_id).unwrap().unwrap();
    assert_eq!(record.status, "SUCCESS");
}
