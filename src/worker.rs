//! Worker pool: claims broker messages and runs them through the tracker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::executors::{Executor, TaskOutcome};
use crate::scheduler::queue::QueueName;
use crate::storage::queue::Broker;
use crate::tracker::{run_tracked, ExecutionObserver};

/// A processed message and what became of it.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub task_id: String,
    pub task_name: String,
    pub outcome: TaskOutcome,
}

#[derive(Clone)]
pub struct Worker {
    id: usize,
    broker: Broker,
    queues: Vec<QueueName>,
    executor: Arc<dyn Executor>,
    observer: Arc<dyn ExecutionObserver>,
}

impl Worker {
    pub fn new(
        id: usize,
        broker: Broker,
        queues: Vec<QueueName>,
        executor: Arc<dyn Executor>,
        observer: Arc<dyn ExecutionObserver>,
    ) -> Self {
        let mut queues = queues;
        queues.sort();
        queues.dedup();
        Self {
            id,
            broker,
            queues,
            executor,
            observer,
        }
    }

    /// Claim and run one ready message. `Ok(None)` when every queue is idle.
    pub async fn process_next(&self, now: DateTime<Utc>) -> Result<Option<Processed>> {
        let Some(delivery) = self.broker.claim_next(&self.queues, now)? else {
            return Ok(None);
        };
        let message = delivery.message;
        info!(worker = self.id, task=%message.task_name, task_id=%message.task_id, queue=%message.queue, retries = message.retries, "Task received");

        let outcome = run_tracked(self.observer.as_ref(), self.executor.as_ref(), &message).await;

        if let TaskOutcome::Retry { countdown_secs, .. } = &outcome {
            let retry = message.retry_after(chrono::Duration::seconds(*countdown_secs as i64), Utc::now());
            if let Err(e) = self.broker.enqueue(&retry) {
                error!(task=%message.task_name, task_id=%message.task_id, "Failed to enqueue retry: {:#}", e);
            }
        }
        if let Err(e) = self.broker.ack(delivery.id) {
            warn!(task=%message.task_name, task_id=%message.task_id, "Failed to ack task: {:#}", e);
        }

        Ok(Some(Processed {
            task_id: message.task_id,
            task_name: message.task_name,
            outcome,
        }))
    }

    async fn run(self, poll_interval: Duration) {
        info!(worker = self.id, queues = ?self.queues, "Worker started");
        loop {
            match self.process_next(Utc::now()).await {
                Ok(Some(_)) => continue,
                Ok(None) => tokio::time::sleep(poll_interval).await,
                Err(e) => {
                    error!(worker = self.id, "Failed to claim task: {:#}", e);
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }
}

/// Run `concurrency` workers until the process exits.
pub async fn run_worker_pool(template: Worker, concurrency: usize, poll_interval: Duration) {
    let handles: Vec<_> = (0..concurrency.max(1))
        .map(|id| {
            let worker = Worker { id, ..template.clone() };
            tokio::spawn(worker.run(poll_interval))
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!("Worker task exited: {}", e);
        }
    }
}
