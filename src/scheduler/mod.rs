//! Database-backed periodic scheduling: loading, dispatch resolution and the
//! beat loop that feeds the broker.

pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod entry;
pub mod loader;
pub mod queue;
pub mod task_config;

pub use self::engine::{run_beat_loop, BeatEngine};
pub use self::entry::{ScheduleEntry, ScheduleSnapshot};
pub use self::loader::{LoaderSettings, RefreshHandle, ScheduleLoader};
pub use self::queue::QueueName;
