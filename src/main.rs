use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};

use agentbeat::config::AppConfig;
use agentbeat::scheduler::cron::Crontab;
use agentbeat::scheduler::dispatch;
use agentbeat::scheduler::task_config::{ExtraConfig, TaskConfigError};
use agentbeat::scheduler::QueueName;
use agentbeat::storage::executions::ExecutionStore;
use agentbeat::storage::periodic_tasks::{NewPeriodicTask, PeriodicTaskConfig, ScheduleStore};
use agentbeat::storage::queue::Broker;
use agentbeat::storage::run_log::RunLogStore;
use agentbeat::storage::{self, Pool, StoreHandle};

#[derive(Parser)]
#[command(
    name = "agentbeat",
    about = "Database-backed periodic task scheduler and execution tracker",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (falls back to AGENTBEAT_CONFIG, then ./agentbeat.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run API server, scheduler and worker pool in one process
    Serve {
        /// Bind address (defaults to [api].bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run the scheduler only
    Beat,

    /// Run the worker pool only
    Worker {
        /// Number of concurrent task runners
        #[arg(long)]
        concurrency: Option<usize>,

        /// Queues to consume, e.g. system,priority_high
        #[arg(long, value_delimiter = ',')]
        queues: Option<Vec<QueueName>>,
    },

    /// Manage periodic task rows
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Run tasks and inspect their history
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all rows and whether they resolve to a runnable entry
    List,

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },

    /// Add a periodic task
    Add(AddArgs),

    /// Enable a periodic task
    Enable {
        #[arg(long)]
        name: String,
    },

    /// Disable a periodic task
    Disable {
        #[arg(long)]
        name: String,
    },
}

#[derive(Args)]
struct AddArgs {
    /// Unique task name
    #[arg(long)]
    name: String,

    /// Run every N seconds
    #[arg(long, conflicts_with = "cron", required_unless_present = "cron")]
    interval: Option<i64>,

    /// Cron expression (5-field, evaluated in UTC)
    #[arg(long)]
    cron: Option<String>,

    /// task_extra_config JSON, e.g. '{"task_type":"http","url":"..."}'
    #[arg(long)]
    extra_config: Option<String>,

    /// Registered callable for system tasks
    #[arg(long, default_value = "")]
    task_path: String,

    /// Stored kwargs JSON
    #[arg(long)]
    kwargs: Option<String>,

    #[arg(long)]
    description: Option<String>,

    /// Create the row disabled
    #[arg(long)]
    disabled: bool,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Enqueue a row immediately, bypassing its schedule
    RunNow {
        #[arg(long)]
        id: i64,
    },

    /// Show recent execution records
    Executions {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show recent run-log entries
    RunLogs {
        /// Only entries for this task
        #[arg(long)]
        name: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn open_store(config: &AppConfig) -> Result<Pool> {
    storage::open_store_pool(&config.database.path)
        .with_context(|| format!("failed to open store at {}", config.database.path.display()))
}

fn describe_schedule(row: &PeriodicTaskConfig) -> String {
    match row.task_interval {
        Some(secs) => format!("every {secs}s"),
        None if row.has_crontab() => Crontab::new(
            row.crontab_minute.as_deref(),
            row.crontab_hour.as_deref(),
            row.crontab_day_of_week.as_deref(),
            row.crontab_day_of_month.as_deref(),
            row.crontab_month_of_year.as_deref(),
        )
        .map(|tab| format!("cron {tab}"))
        .unwrap_or_else(|e| format!("invalid ({e})")),
        None => "-".to_string(),
    }
}

fn add_task(config: &AppConfig, args: AddArgs) -> Result<()> {
    if let Some(raw) = args.extra_config.as_deref() {
        ExtraConfig::parse(Some(raw)).context("invalid --extra-config")?;
    }
    let crontab = args
        .cron
        .as_deref()
        .map(Crontab::parse)
        .transpose()
        .context("invalid --cron")?;
    if let Some(secs) = args.interval.filter(|s| *s <= 0) {
        return Err(TaskConfigError::InvalidInterval(secs).into());
    }

    let field = |f: fn(&Crontab) -> &str| crontab.as_ref().map(|tab| f(tab).to_string());
    let task = NewPeriodicTask {
        task_name: args.name.clone(),
        task_path: args.task_path,
        task_enabled: !args.disabled,
        task_interval: args.interval,
        crontab_minute: field(Crontab::minute),
        crontab_hour: field(Crontab::hour),
        crontab_day_of_week: field(Crontab::day_of_week),
        crontab_day_of_month: field(Crontab::day_of_month),
        crontab_month_of_year: field(Crontab::month_of_year),
        task_kwargs: args.kwargs,
        task_extra_config: args.extra_config,
        task_description: args.description,
        create_by: Some("cli".to_string()),
        ..Default::default()
    };

    let clock = agentbeat::store_clock(config)?;
    let store = ScheduleStore::new(open_store(config)?);
    let id = store.insert(&task, &clock.format_local(Utc::now()))?;
    println!("Periodic task '{}' added with id {}.", args.name, id);
    Ok(())
}

fn schedule_command(config: &AppConfig, action: ScheduleAction) -> Result<()> {
    match action {
        ScheduleAction::List => {
            let pool = open_store(config)?;
            let store = ScheduleStore::new(pool);
            let rows = store.list()?;
            if rows.is_empty() {
                println!("No periodic tasks found.");
                return Ok(());
            }

            let loader = agentbeat::build_loader(config, StoreHandle::ready(store.pool().clone()))?;
            let enabled: Vec<_> = rows.iter().filter(|r| r.task_enabled).cloned().collect();
            let snapshot = loader.build_snapshot(&enabled, Utc::now());

            println!(
                "{:<5} | {:<24} | {:<22} | {:<14} | {:<8} | {:<6} | Last run",
                "ID", "Name", "Schedule", "Queue", "Enabled", "Runs"
            );
            println!("{:-<5}-|-{:-<24}-|-{:-<22}-|-{:-<14}-|-{:-<8}-|-{:-<6}-|-{:-<19}", "", "", "", "", "", "", "");
            for row in &rows {
                let queue = match snapshot.get(&row.task_name) {
                    Some(entry) => entry.queue.to_string(),
                    None if row.task_enabled => "SKIPPED".to_string(),
                    None => "-".to_string(),
                };
                println!(
                    "{:<5} | {:<24} | {:<22} | {:<14} | {:<8} | {:<6} | {}",
                    row.id,
                    row.task_name,
                    describe_schedule(row),
                    queue,
                    if row.task_enabled { "ENABLED" } else { "DISABLED" },
                    row.task_run_count,
                    row.task_last_run_time.as_deref().unwrap_or("never"),
                );
            }
        }
        ScheduleAction::DryRun { hours } => {
            let pool = open_store(config)?;
            let mut loader = agentbeat::build_loader(config, StoreHandle::ready(pool.clone()))?;
            let now = Utc::now();
            let snapshot = loader.reload(now);
            let preview = snapshot.preview(now, chrono::Duration::hours(hours as i64));
            if preview.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!("Upcoming runs (next {} hours):", hours);
                for (time, name, queue) in preview {
                    println!("{} : {} ({})", time.format("%Y-%m-%d %H:%M:%S UTC"), name, queue);
                }
            }
        }
        ScheduleAction::Add(args) => add_task(config, args)?,
        ScheduleAction::Enable { name } => {
            let clock = agentbeat::store_clock(config)?;
            ScheduleStore::new(open_store(config)?).set_enabled(&name, true, &clock.format_local(Utc::now()))?;
            println!("Periodic task '{}' enabled.", name);
        }
        ScheduleAction::Disable { name } => {
            let clock = agentbeat::store_clock(config)?;
            ScheduleStore::new(open_store(config)?).set_enabled(&name, false, &clock.format_local(Utc::now()))?;
            println!("Periodic task '{}' disabled.", name);
        }
    }
    Ok(())
}

fn task_command(config: &AppConfig, action: TaskAction) -> Result<()> {
    match action {
        TaskAction::RunNow { id } => {
            let store = ScheduleStore::new(open_store(config)?);
            let broker = Broker::new(storage::open_broker_pool(&config.broker.path)?);
            let message = dispatch::run_now(&store, &broker, id)?;
            println!(
                "Enqueued '{}' on {} (task id {}).",
                message.task_name, message.queue, message.task_id
            );
        }
        TaskAction::Executions { limit } => {
            let records = ExecutionStore::new(open_store(config)?).recent(limit)?;
            if records.is_empty() {
                println!("No executions recorded.");
            }
            for r in records {
                println!(
                    "{} | {:<24} | {:<8} | retries {} | {}",
                    r.start_time, r.task_name, r.status, r.retry_count, r.task_id
                );
                if let Some(tb) = r.traceback {
                    println!("    {}", tb.lines().next().unwrap_or_default());
                }
            }
        }
        TaskAction::RunLogs { name, limit } => {
            let entries = RunLogStore::new(open_store(config)?).recent(name.as_deref(), limit)?;
            if entries.is_empty() {
                println!("No run-log entries.");
            }
            for e in entries {
                println!(
                    "{} | {:<24} | {:<8} | {}ms | {}",
                    e.execution_time,
                    e.task_name,
                    e.status,
                    e.duration_ms.unwrap_or_default(),
                    e.error_message.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // The configured subscriber depends on the config, so resolving it logs
    // through a plain one.
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(agentbeat::env_filter())
        .finish();
    let mut config = tracing::subscriber::with_default(bootstrap, || AppConfig::resolve(cli.config.as_deref()))?;
    agentbeat::init_tracing(config.logging.json);

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.api.bind.clone());
            tracing::info!(%bind, "Starting agentbeat");
            agentbeat::serve(&config, &bind).await?;
        }
        Commands::Beat => {
            tracing::info!("Starting agentbeat scheduler");
            agentbeat::run_beat(&config).await?;
        }
        Commands::Worker { concurrency, queues } => {
            if let Some(n) = concurrency {
                config.worker.concurrency = n;
            }
            if let Some(queues) = queues {
                config.worker.queues = queues;
            }
            tracing::info!(concurrency = config.worker.concurrency, queues = ?config.worker.queues, "Starting agentbeat workers");
            agentbeat::run_workers(&config).await?;
        }
        Commands::Schedule { action } => schedule_command(&config, action)?,
        Commands::Task { action } => task_command(&config, action)?,
    }

    Ok(())
}
