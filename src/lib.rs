//! agentbeat -- a database-backed periodic task scheduler and execution
//! tracker for agent operations.
//!
//! The schedule lives in a relational table, is hot-reloaded on change, and
//! fans work out over three named priority queues to a pool of workers that
//! record the lifecycle of every invocation.

pub mod api;
pub mod clock;
pub mod config;
pub mod executors;
pub mod scheduler;
pub mod storage;
pub mod tracker;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::clock::StoreClock;
use crate::config::AppConfig;
use crate::executors::{AgentExecutor, HttpExecutor, SystemTaskRegistry, TaskRouter};
use crate::scheduler::{BeatEngine, LoaderSettings, QueueName, ScheduleLoader};
use crate::storage::queue::Broker;
use crate::storage::StoreHandle;
use crate::tracker::ExecutionTracker;
use crate::worker::Worker;

/// `RUST_LOG`, or `info` when unset.
pub fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Install the global tracing subscriber.
pub fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter());
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Connections shared by every role in a process.
#[derive(Clone)]
pub struct Services {
    /// Reopened on use while the store is unreachable (degraded mode).
    pub store: StoreHandle,
    pub broker: Broker,
}

impl Services {
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let store = StoreHandle::connect(&config.database).await;
        let broker_pool = storage::open_broker_pool(&config.broker.path)
            .with_context(|| format!("failed to open broker at {}", config.broker.path.display()))?;
        Ok(Self {
            store,
            broker: Broker::new(broker_pool).with_claim_timeout(config.worker.claim_timeout()),
        })
    }
}

pub fn store_clock(config: &AppConfig) -> Result<StoreClock> {
    Ok(StoreClock::new(config.scheduler.store_offset()?))
}

/// Schedule loader over the store.
pub fn build_loader(config: &AppConfig, store: StoreHandle) -> Result<ScheduleLoader> {
    Ok(ScheduleLoader::new(
        Arc::new(store),
        store_clock(config)?,
        LoaderSettings::from_config(&config.scheduler),
    ))
}

/// Worker template with every executor wired in.
pub fn build_worker(config: &AppConfig, services: &Services, queues: Vec<QueueName>) -> Result<Worker> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("agentbeat/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let router = TaskRouter::new(
        AgentExecutor::new(
            client.clone(),
            services.store.clone(),
            store_clock(config)?,
            config.agent.clone(),
        ),
        HttpExecutor::new(client, config.http.clone()),
        SystemTaskRegistry::with_builtins(services.store.clone(), services.broker.clone()),
    );

    let observer = Arc::new(ExecutionTracker::new(services.store.clone()));

    Ok(Worker::new(0, services.broker.clone(), queues, Arc::new(router), observer))
}

/// Run the scheduler (beat) role until the process exits.
pub async fn run_beat(config: &AppConfig) -> Result<()> {
    let services = Services::connect(config).await?;
    let engine = BeatEngine::new(build_loader(config, services.store.clone())?, services.broker.clone());
    scheduler::run_beat_loop(engine, Duration::from_secs(config.scheduler.tick_secs.max(1))).await;
    Ok(())
}

/// Run the worker pool role until the process exits.
pub async fn run_workers(config: &AppConfig) -> Result<()> {
    let services = Services::connect(config).await?;
    let template = build_worker(config, &services, config.worker.queues.clone())?;
    worker::run_worker_pool(
        template,
        config.worker.concurrency,
        Duration::from_millis(config.worker.poll_interval_ms),
    )
    .await;
    Ok(())
}

/// Start everything in one process: API server, beat engine and worker pool.
pub async fn serve(config: &AppConfig, bind: &str) -> Result<()> {
    let services = Services::connect(config).await?;

    let loader = build_loader(config, services.store.clone())?;
    let schedule = loader.subscribe();
    let refresh = loader.refresh_handle();
    let engine = BeatEngine::new(loader, services.broker.clone());
    let tick = Duration::from_secs(config.scheduler.tick_secs.max(1));
    tokio::spawn(async move {
        scheduler::run_beat_loop(engine, tick).await;
    });

    let template = build_worker(config, &services, config.worker.queues.clone())?;
    let concurrency = config.worker.concurrency;
    let poll = Duration::from_millis(config.worker.poll_interval_ms);
    tokio::spawn(async move {
        worker::run_worker_pool(template, concurrency, poll).await;
    });

    let state = api::state::AppState {
        store: services.store.clone(),
        broker: services.broker.clone(),
        schedule,
        refresh,
    };
    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address '{bind}'"))?;
    let app = api::router(state);

    tracing::info!(%addr, "agentbeat listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
