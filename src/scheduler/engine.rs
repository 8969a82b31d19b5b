use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use super::loader::ScheduleLoader;
use crate::storage::queue::{Broker, TaskMessage};

/// Per-task bookkeeping carried across reloads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunState {
    pub last_run_at: Option<DateTime<Utc>>,
    pub total_run_count: u64,
    /// First tick that saw the entry; a task that never ran is measured from here.
    pub first_seen: DateTime<Utc>,
}

impl RunState {
    fn new(first_seen: DateTime<Utc>) -> Self {
        Self {
            last_run_at: None,
            total_run_count: 0,
            first_seen,
        }
    }
}

/// The scheduler side: evaluates the published snapshot and enqueues due work.
/// Only ever produces broker messages; it never runs a task itself.
pub struct BeatEngine {
    loader: ScheduleLoader,
    broker: Broker,
    state: HashMap<String, RunState>,
}

impl BeatEngine {
    pub fn new(loader: ScheduleLoader, broker: Broker) -> Self {
        Self {
            loader,
            broker,
            state: HashMap::new(),
        }
    }

    pub fn loader(&self) -> &ScheduleLoader {
        &self.loader
    }

    pub fn state(&self, name: &str) -> Option<RunState> {
        self.state.get(name).copied()
    }

    /// One scheduler tick at `now`. Returns the messages enqueued.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<TaskMessage> {
        if self.loader.should_reload(now) {
            self.loader.reload(now);
        }
        let snapshot = self.loader.snapshot();
        let mut dispatched = Vec::new();

        for entry in snapshot.entries() {
            let state = self
                .state
                .entry(entry.name.clone())
                .or_insert_with(|| RunState::new(now));
            // The store may have moved on (a worker finished) or lag behind us.
            state.last_run_at = state.last_run_at.max(entry.last_run_at);
            state.total_run_count = state.total_run_count.max(entry.total_run_count);

            let reference = state.last_run_at.unwrap_or(state.first_seen);
            if !entry.predicate.is_due(reference, now) {
                continue;
            }

            let message = entry.to_message(now);
            match self.broker.enqueue(&message) {
                Ok(()) => {
                    info!(task=%entry.name, task_id=%message.task_id, queue=%entry.queue, "Task due, dispatched");
                    state.last_run_at = Some(now);
                    state.total_run_count += 1;
                    dispatched.push(message);
                }
                Err(e) => {
                    // Left due; it is tried again next tick.
                    error!(task=%entry.name, "Failed to enqueue task: {:#}", e);
                }
            }
        }

        // A fallback snapshot is not evidence that rows went away.
        if !snapshot.is_fallback() {
            self.state.retain(|name, _| snapshot.get(name).is_some());
        }
        dispatched
    }
}

/// Main scheduler loop. Ticks every `tick` until the process exits.
pub async fn run_beat_loop(mut engine: BeatEngine, tick: Duration) {
    info!(tick_secs = tick.as_secs(), "Beat engine started");

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let dispatched = engine.tick(Utc::now());
        if !dispatched.is_empty() {
            debug!(count = dispatched.len(), "Tick dispatched tasks");
        }
    }
}
