//! Runtime schedule entries and the immutable snapshot that holds them.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use super::cron::Crontab;
use super::queue::QueueName;
use crate::storage::queue::TaskMessage;

/// When an entry becomes due, relative to its last run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePredicate {
    Interval { seconds: u64 },
    Crontab(Crontab),
}

impl SchedulePredicate {
    /// The first firing after `last_run_at`.
    pub fn next_due(&self, last_run_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            SchedulePredicate::Interval { seconds } => {
                Some(last_run_at + Duration::seconds(*seconds as i64))
            }
            SchedulePredicate::Crontab(tab) => tab.next_after(last_run_at),
        }
    }

    pub fn is_due(&self, last_run_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.next_due(last_run_at).is_some_and(|due| due <= now)
    }
}

/// A resolved, runnable schedule entry. Rebuilt wholesale on every reload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleEntry {
    pub name: String,
    /// Row id in the Schedule Store.
    pub config_id: i64,
    /// Executor-specific path; not necessarily the stored `task_path`.
    pub task_path: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub predicate: SchedulePredicate,
    pub queue: QueueName,
    /// TTL of a dispatch, in seconds.
    pub expires_secs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub total_run_count: u64,
}

impl ScheduleEntry {
    /// Broker message for a firing at `now`.
    pub fn to_message(&self, now: DateTime<Utc>) -> TaskMessage {
        TaskMessage::new(
            &self.name,
            &self.task_path,
            self.queue,
            self.args.clone(),
            self.kwargs.clone(),
        )
        .with_expires(now + Duration::seconds(self.expires_secs as i64))
    }
}

/// An immutable view of every schedulable entry, keyed by task name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleSnapshot {
    entries: BTreeMap<String, ScheduleEntry>,
    /// Enabled rows seen when building, including skipped ones.
    source_rows: usize,
    loaded_at: Option<DateTime<Utc>>,
    /// Published after a failed reload; says nothing about which rows exist.
    fallback: bool,
}

impl ScheduleSnapshot {
    pub fn new(
        entries: BTreeMap<String, ScheduleEntry>,
        source_rows: usize,
        loaded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entries,
            source_rows,
            loaded_at: Some(loaded_at),
            fallback: false,
        }
    }

    /// The fallback snapshot published when a reload cannot reach the store.
    pub fn empty(loaded_at: DateTime<Utc>) -> Self {
        Self {
            fallback: true,
            ..Self::new(BTreeMap::new(), 0, loaded_at)
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    pub fn get(&self, name: &str) -> Option<&ScheduleEntry> {
        self.entries.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn source_rows(&self) -> usize {
        self.source_rows
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    /// Every firing in `(from, from + horizon]`, sorted by time.
    /// Entries that never ran are measured from `from`.
    pub fn preview(
        &self,
        from: DateTime<Utc>,
        horizon: Duration,
    ) -> Vec<(DateTime<Utc>, String, QueueName)> {
        const MAX_PER_ENTRY: usize = 1000;
        let end = from + horizon;
        let mut upcoming = Vec::new();

        for entry in self.entries() {
            let mut cursor = entry.last_run_at.unwrap_or(from);
            for _ in 0..MAX_PER_ENTRY {
                let Some(next) = entry.predicate.next_due(cursor) else {
                    break;
                };
                if next > end {
                    break;
                }
                // Overdue entries fire on the first tick.
                let at = next.max(from);
                upcoming.push((at, entry.name.clone(), entry.queue));
                cursor = at;
            }
        }

        upcoming.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        upcoming
    }
}
