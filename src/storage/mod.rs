//! SQLite storage layer -- pools, schema, and data access for the stores.

pub mod executions;
pub mod periodic_tasks;
pub mod queue;
pub mod run_log;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::{error, info, warn};

use crate::config::DatabaseConfig;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

fn build_pool(path: &Path, migrate: fn(&Connection) -> Result<()>) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    // Every checkout is validated before it is handed out.
    let pool = R2D2Pool::builder()
        .test_on_check_out(true)
        .connection_timeout(Duration::from_secs(5))
        .build(manager)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    migrate(&conn)?;

    Ok(pool)
}

/// Open (or create) the Schedule/Execution store and return a connection pool.
pub fn open_store_pool(path: &Path) -> Result<Pool> {
    build_pool(path, schema::migrate_store)
}

/// Open (or create) the broker queue database.
pub fn open_broker_pool(path: &Path) -> Result<Pool> {
    build_pool(path, schema::migrate_broker)
}

/// Open the store with bounded retries.
///
/// Returns `None` once every attempt has failed; callers keep running with the
/// store-dependent paths (tracker, loader, agent tasks) degraded.
pub async fn connect_store_with_retry(config: &DatabaseConfig) -> Option<Pool> {
    let attempts = config.connect_attempts.max(1);
    for attempt in 1..=attempts {
        match open_store_pool(&config.path) {
            Ok(pool) => {
                info!(path = %config.path.display(), attempt, "Store database ready");
                return Some(pool);
            }
            Err(e) if attempt < attempts => {
                warn!(attempt, error = %e, "Store database unavailable, retrying");
                tokio::time::sleep(config.connect_retry_delay()).await;
            }
            Err(e) => {
                error!(attempts, error = %e, "Store database unavailable, continuing degraded");
            }
        }
    }
    None
}

/// Shared access to the store pool. When the store could not be opened at
/// startup, the pool is opened on a later use instead, at most once per
/// `retry_delay`.
#[derive(Clone)]
pub struct StoreHandle {
    path: PathBuf,
    retry_delay: Duration,
    state: Arc<Mutex<LazyPool>>,
}

struct LazyPool {
    pool: Option<Pool>,
    last_attempt: Option<Instant>,
}

impl StoreHandle {
    pub fn new(path: PathBuf, retry_delay: Duration, pool: Option<Pool>) -> Self {
        Self {
            path,
            retry_delay,
            state: Arc::new(Mutex::new(LazyPool {
                last_attempt: pool.is_none().then(Instant::now),
                pool,
            })),
        }
    }

    /// A handle over an already open pool.
    pub fn ready(pool: Pool) -> Self {
        Self::new(PathBuf::new(), Duration::ZERO, Some(pool))
    }

    /// Open the store with bounded retries; never fails, the handle keeps
    /// trying on later uses.
    pub async fn connect(config: &DatabaseConfig) -> Self {
        let pool = connect_store_with_retry(config).await;
        Self::new(config.path.clone(), config.connect_retry_delay(), pool)
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().is_ok_and(|state| state.pool.is_some())
    }

    /// The pool, opening it first if the store was unavailable until now.
    pub fn pool(&self) -> Result<Pool> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("store handle lock poisoned"))?;
        if let Some(pool) = &state.pool {
            return Ok(pool.clone());
        }
        if state
            .last_attempt
            .is_some_and(|at| at.elapsed() < self.retry_delay)
        {
            anyhow::bail!("store unavailable");
        }

        state.last_attempt = Some(Instant::now());
        match open_store_pool(&self.path) {
            Ok(pool) => {
                info!(path = %self.path.display(), "Store database recovered");
                state.pool = Some(pool.clone());
                Ok(pool)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Store database still unavailable");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");
        let pool = open_store_pool(&path).unwrap();
        assert!(path.exists());
        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM periodic_task_config", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_bounded_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let config = DatabaseConfig {
            path: blocker.join("store.db"),
            connect_attempts: 2,
            connect_retry_delay_secs: 0,
        };
        assert!(connect_store_with_retry(&config).await.is_none());
    }

    #[tokio::test]
    async fn test_handle_reopens_store_once_reachable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-yet");
        std::fs::write(&blocker, b"x").unwrap();
        let config = DatabaseConfig {
            path: blocker.join("store.db"),
            connect_attempts: 1,
            connect_retry_delay_secs: 0,
        };

        let handle = StoreHandle::connect(&config).await;
        assert!(!handle.is_connected());
        assert!(handle.pool().is_err());

        std::fs::remove_file(&blocker).unwrap();
        std::fs::create_dir(&blocker).unwrap();
        assert!(handle.pool().is_ok());
        assert!(handle.clone().is_connected());
    }

    #[test]
    fn test_handle_waits_between_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let handle = StoreHandle::new(dir.path().join("store.db"), Duration::from_secs(3600), None);
        // Reachable, but the last failed attempt was just now.
        assert!(handle.pool().is_err());
        assert!(!dir.path().join("store.db").exists());
    }
}
