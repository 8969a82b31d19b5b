//! Schedule Loader: turns enabled store rows into a published snapshot.
//!
//! Snapshots are immutable and published through a watch channel, so the tick
//! loop and the API always see either the previous map or the new one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::cron::Crontab;
use super::dispatch;
use super::entry::{ScheduleEntry, SchedulePredicate, ScheduleSnapshot};
use super::queue::QueueName;
use super::task_config::{ExtraConfig, TaskConfigError};
use crate::clock::StoreClock;
use crate::config::SchedulerConfig;
use crate::storage::periodic_tasks::{PeriodicTaskConfig, ScheduleSource, ScheduleVersion};

#[derive(Debug, Clone)]
pub struct LoaderSettings {
    /// Minimum time between two staleness queries.
    pub min_check_interval: Duration,
    /// Attempts per reload before publishing an empty snapshot.
    pub reload_attempts: u32,
    /// Dispatch TTL copied into every entry.
    pub expires_secs: u64,
}

impl LoaderSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            min_check_interval: Duration::seconds(config.reload_min_interval_secs as i64),
            reload_attempts: config.reload_attempts.max(1),
            expires_secs: config.dispatch_expires_secs,
        }
    }
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// Requests an immediate reload, bypassing the check interval.
#[derive(Debug, Clone, Default)]
pub struct RefreshHandle {
    force: Arc<AtomicBool>,
}

impl RefreshHandle {
    pub fn request(&self) {
        self.force.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.force.swap(false, Ordering::SeqCst)
    }
}

pub struct ScheduleLoader {
    source: Arc<dyn ScheduleSource>,
    clock: StoreClock,
    settings: LoaderSettings,
    publisher: watch::Sender<Arc<ScheduleSnapshot>>,
    refresh: RefreshHandle,
    last_checked: Option<DateTime<Utc>>,
    last_reload: Option<DateTime<Utc>>,
    /// Store version observed by the last successful reload.
    loaded_version: Option<ScheduleVersion>,
}

impl ScheduleLoader {
    pub fn new(source: Arc<dyn ScheduleSource>, clock: StoreClock, settings: LoaderSettings) -> Self {
        let (publisher, _) = watch::channel(Arc::new(ScheduleSnapshot::default()));
        Self {
            source,
            clock,
            settings,
            publisher,
            refresh: RefreshHandle::default(),
            last_checked: None,
            last_reload: None,
            loaded_version: None,
        }
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<ScheduleSnapshot> {
        self.publisher.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ScheduleSnapshot>> {
        self.publisher.subscribe()
    }

    pub fn refresh_handle(&self) -> RefreshHandle {
        self.refresh.clone()
    }

    pub fn last_reload(&self) -> Option<DateTime<Utc>> {
        self.last_reload
    }

    /// Rebuild and publish the snapshot. Store errors are retried a bounded
    /// number of times, after which an empty snapshot is published.
    pub fn reload(&mut self, now: DateTime<Utc>) -> Arc<ScheduleSnapshot> {
        self.last_checked = Some(now);
        self.last_reload = Some(now);
        self.loaded_version = None;

        // Read before the rows: an edit landing in between costs one extra
        // reload instead of being missed.
        let version = self.source.version().ok();
        let attempts = self.settings.reload_attempts.max(1);
        for attempt in 1..=attempts {
            match self.source.enabled_rows() {
                Ok(rows) => {
                    self.loaded_version = version;
                    let snapshot = Arc::new(self.build_snapshot(&rows, now));
                    info!(
                        entries = snapshot.len(),
                        rows = snapshot.source_rows(),
                        "Schedule reloaded"
                    );
                    self.publisher.send_replace(snapshot.clone());
                    return snapshot;
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Schedule reload attempt failed");
                }
            }
        }

        error!(attempts, "Schedule reload failed, publishing empty schedule");
        let empty = Arc::new(ScheduleSnapshot::empty(now));
        self.publisher.send_replace(empty.clone());
        empty
    }

    /// Whether the published snapshot is stale. Queries the store at most
    /// once per `min_check_interval` unless a refresh was requested.
    pub fn should_reload(&mut self, now: DateTime<Utc>) -> bool {
        if self.refresh.take() {
            debug!("Schedule refresh requested");
            return true;
        }
        let Some(last_reload) = self.last_reload else {
            return true;
        };
        if let Some(checked) = self.last_checked {
            if now - checked < self.settings.min_check_interval {
                return false;
            }
        }
        self.last_checked = Some(now);

        let version = match self.source.version() {
            Ok(version) => version,
            Err(e) => {
                warn!(error = %e, "Schedule version check failed");
                return true;
            }
        };

        if self.loaded_version.as_ref() != Some(&version) {
            return true;
        }
        // Store times have whole-second precision; an edit in the same second
        // as the last reload may not be part of it.
        match version.latest_update.as_deref() {
            None => false,
            Some(raw) => match self.clock.parse_local(raw) {
                Ok(updated) => updated >= last_reload.trunc_subsecs(0),
                Err(e) => {
                    warn!(update_time=%raw, error = %e, "Unparseable update_time, reloading");
                    true
                }
            },
        }
    }

    /// Build a snapshot from rows. Bad rows are logged and skipped.
    pub fn build_snapshot(&self, rows: &[PeriodicTaskConfig], now: DateTime<Utc>) -> ScheduleSnapshot {
        let mut entries = BTreeMap::new();
        for row in rows {
            match self.build_entry(row) {
                Ok(entry) => {
                    entries.insert(entry.name.clone(), entry);
                }
                Err(e) => {
                    warn!(task=%row.task_name, id = row.id, error = %e, "Skipping periodic task");
                }
            }
        }
        ScheduleSnapshot::new(entries, rows.len(), now)
    }

    fn build_entry(&self, row: &PeriodicTaskConfig) -> Result<ScheduleEntry, TaskConfigError> {
        let extra = ExtraConfig::parse(row.task_extra_config.as_deref())?;
        let target = dispatch::resolve(row, &extra.kind)?;

        let predicate = match row.task_interval {
            Some(seconds) if seconds > 0 => SchedulePredicate::Interval {
                seconds: seconds as u64,
            },
            Some(seconds) => return Err(TaskConfigError::InvalidInterval(seconds)),
            None if row.has_crontab() => SchedulePredicate::Crontab(Crontab::new(
                row.crontab_minute.as_deref(),
                row.crontab_hour.as_deref(),
                row.crontab_day_of_week.as_deref(),
                row.crontab_day_of_month.as_deref(),
                row.crontab_month_of_year.as_deref(),
            )?),
            None => return Err(TaskConfigError::Unschedulable),
        };

        let last_run_at = row.task_last_run_time.as_deref().and_then(|raw| {
            self.clock
                .parse_local(raw)
                .map_err(|e| warn!(task=%row.task_name, last_run=%raw, error = %e, "Ignoring bad last run time"))
                .ok()
        });

        Ok(ScheduleEntry {
            name: row.task_name.clone(),
            config_id: row.id,
            task_path: target.task_path,
            args: target.args,
            kwargs: target.kwargs,
            predicate,
            queue: QueueName::resolve(&row.task_name, extra.queue.as_deref()),
            expires_secs: self.settings.expires_secs,
            last_run_at,
            total_run_count: row.task_run_count.max(0) as u64,
        })
    }
}
