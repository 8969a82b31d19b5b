//! Broker: a persistent multi-queue table shared by the scheduler and workers.
//!
//! The scheduler only enqueues. Workers claim the oldest ready message from
//! the highest-priority queue they consume, run it, then ack (delete) it.
//! Messages whose dispatch TTL has passed are dropped at claim time. A claim
//! that is never acked (the worker died) is released after the claim timeout.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use super::Pool;
use crate::clock::format_instant;
use crate::scheduler::queue::QueueName;

/// A unit of work travelling through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Correlation id; kept across retries.
    pub task_id: String,
    pub task_name: String,
    pub task_path: String,
    pub queue: QueueName,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub retries: u32,
    /// Not runnable before this instant.
    pub eta: Option<DateTime<Utc>>,
    /// Dropped instead of run once this instant has passed.
    pub expires: Option<DateTime<Utc>>,
}

impl TaskMessage {
    pub fn new(
        task_name: &str,
        task_path: &str,
        queue: QueueName,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            task_name: task_name.to_string(),
            task_path: task_path.to_string(),
            queue,
            args,
            kwargs,
            retries: 0,
            eta: None,
            expires: None,
        }
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    /// The follow-up message for a retry after `countdown`.
    /// A deliberately delayed retry carries no dispatch TTL.
    pub fn retry_after(&self, countdown: chrono::Duration, now: DateTime<Utc>) -> Self {
        Self {
            retries: self.retries + 1,
            eta: Some(now + countdown),
            expires: None,
            ..self.clone()
        }
    }
}

/// A claimed message and its broker row id (needed to ack).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub message: TaskMessage,
}

const DEFAULT_CLAIM_TIMEOUT_SECS: i64 = 900;

#[derive(Clone)]
pub struct Broker {
    pool: Pool,
    claim_timeout: Duration,
}

impl Broker {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            claim_timeout: Duration::seconds(DEFAULT_CLAIM_TIMEOUT_SECS),
        }
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn enqueue(&self, message: &TaskMessage) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO task_queue
                (task_id, task_name, task_path, queue, args_json, kwargs_json, retries, eta, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.task_id,
                message.task_name,
                message.task_path,
                message.queue.as_str(),
                serde_json::to_string(&message.args)?,
                serde_json::to_string(&message.kwargs)?,
                message.retries,
                message.eta.map(format_instant),
                message.expires.map(format_instant),
            ],
        )
        .context("Failed to enqueue task")?;
        Ok(())
    }

    /// Claim the next ready message, scanning `queues` in the given order.
    pub fn claim_next(&self, queues: &[QueueName], now: DateTime<Utc>) -> Result<Option<Delivery>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_str = format_instant(now);
        let mut claimed = None;

        let released = tx.execute(
            "UPDATE task_queue SET claimed = 0, claimed_at = NULL
             WHERE claimed = 1 AND (claimed_at IS NULL OR claimed_at < ?1)",
            params![format_instant(now - self.claim_timeout)],
        )?;
        if released > 0 {
            warn!(released, "Released messages whose claim timed out");
        }

        'queues: for queue in queues {
            loop {
                let row = tx
                    .query_row(
                        "SELECT id, task_id, task_name, task_path, args_json, kwargs_json,
                                retries, eta, expires_at
                         FROM task_queue
                         WHERE queue = ?1 AND claimed = 0 AND (eta IS NULL OR eta <= ?2)
                         ORDER BY id LIMIT 1",
                        params![queue.as_str(), now_str],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, String>(3)?,
                                row.get::<_, String>(4)?,
                                row.get::<_, String>(5)?,
                                row.get::<_, u32>(6)?,
                                row.get::<_, Option<String>>(7)?,
                                row.get::<_, Option<String>>(8)?,
                            ))
                        },
                    )
                    .optional()?;

                let Some((id, task_id, task_name, task_path, args, kwargs, retries, eta, expires)) =
                    row
                else {
                    continue 'queues;
                };

                let expires = expires.as_deref().map(parse_instant).transpose()?;
                if expires.is_some_and(|e| e < now) {
                    warn!(task=%task_name, %task_id, queue=%queue, "Dispatch expired before pickup, revoking");
                    tx.execute("DELETE FROM task_queue WHERE id = ?1", params![id])?;
                    continue;
                }

                let message = match (serde_json::from_str(&args), serde_json::from_str(&kwargs)) {
                    (Ok(args), Ok(kwargs)) => TaskMessage {
                        task_id,
                        task_name,
                        task_path,
                        queue: *queue,
                        args,
                        kwargs,
                        retries,
                        eta: eta.as_deref().map(parse_instant).transpose()?,
                        expires,
                    },
                    _ => {
                        // Never loop on a poisoned row.
                        warn!(task=%task_name, %task_id, "Undecodable message payload, dropping");
                        tx.execute("DELETE FROM task_queue WHERE id = ?1", params![id])?;
                        continue;
                    }
                };

                tx.execute(
                    "UPDATE task_queue SET claimed = 1, claimed_at = ?2 WHERE id = ?1",
                    params![id, now_str],
                )?;
                claimed = Some(Delivery { id, message });
                break 'queues;
            }
        }

        tx.commit()?;
        Ok(claimed)
    }

    /// Remove a processed message.
    pub fn ack(&self, id: i64) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM task_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Messages waiting (claimed or not) on a queue.
    pub fn depth(&self, queue: QueueName) -> Result<i64> {
        let conn = self.pool.get()?;
        let depth = conn.query_row(
            "SELECT COUNT(*) FROM task_queue WHERE queue = ?1",
            params![queue.as_str()],
            |row| row.get(0),
        )?;
        Ok(depth)
    }
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad broker timestamp '{raw}'"))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_broker_pool;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn broker() -> (tempfile::TempDir, Broker) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_broker_pool(&dir.path().join("broker.db")).unwrap();
        (dir, Broker::new(pool))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn message(name: &str, queue: QueueName) -> TaskMessage {
        TaskMessage::new(name, "tasks.health_check", queue, vec![json!(1)], Map::new())
    }

    #[test]
    fn test_claims_by_queue_priority() {
        let (_dir, broker) = broker();
        broker.enqueue(&message("low", QueueName::PriorityLow)).unwrap();
        broker.enqueue(&message("high", QueueName::PriorityHigh)).unwrap();
        broker.enqueue(&message("sys", QueueName::System)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| {
            broker
                .claim_next(&QueueName::ALL, now())
                .unwrap()
                .map(|d| d.message.task_name)
        })
        .collect();
        assert_eq!(order, vec!["sys", "high", "low"]);
    }

    #[test]
    fn test_only_consumes_requested_queues() {
        let (_dir, broker) = broker();
        broker.enqueue(&message("low", QueueName::PriorityLow)).unwrap();
        assert!(broker
            .claim_next(&[QueueName::System], now())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_expired_dispatch_is_dropped() {
        let (_dir, broker) = broker();
        let stale = message("stale", QueueName::PriorityLow).with_expires(now() - Duration::seconds(1));
        broker.enqueue(&stale).unwrap();

        assert!(broker.claim_next(&QueueName::ALL, now()).unwrap().is_none());
        assert_eq!(broker.depth(QueueName::PriorityLow).unwrap(), 0);
    }

    #[test]
    fn test_eta_delays_retry() {
        let (_dir, broker) = broker();
        let first = message("job", QueueName::PriorityLow);
        let retry = first.retry_after(Duration::seconds(60), now());
        assert_eq!(retry.task_id, first.task_id);
        assert_eq!(retry.retries, 1);
        broker.enqueue(&retry).unwrap();

        assert!(broker.claim_next(&QueueName::ALL, now()).unwrap().is_none());
        let delivery = broker
            .claim_next(&QueueName::ALL, now() + Duration::seconds(60))
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message, retry);

        broker.ack(delivery.id).unwrap();
        assert_eq!(broker.depth(QueueName::PriorityLow).unwrap(), 0);
    }

    #[test]
    fn test_unacked_claim_is_released_after_timeout() {
        let (_dir, broker) = broker();
        let broker = broker.with_claim_timeout(Duration::seconds(600));
        broker.enqueue(&message("orphan", QueueName::PriorityHigh)).unwrap();

        let first = broker.claim_next(&QueueName::ALL, now()).unwrap().unwrap();
        // The claiming worker never acks.
        assert!(broker
            .claim_next(&QueueName::ALL, now() + Duration::seconds(599))
            .unwrap()
            .is_none());

        let again = broker
            .claim_next(&QueueName::ALL, now() + Duration::seconds(601))
            .unwrap()
            .unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.message.task_id, first.message.task_id);

        broker.ack(again.id).unwrap();
        assert_eq!(broker.depth(QueueName::PriorityHigh).unwrap(), 0);
    }
}
