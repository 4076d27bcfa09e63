// ABOUTME: Command line entry point for mongo-custodian
// ABOUTME: Runs the scheduler service or starts and follows individual jobs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use mongo_custodian::models::{BackupMode, TaskId, TaskProgress, TaskState};
use mongo_custodian::tasks::{Admission, CancelRequest, TaskHandle};
use mongo_custodian::{Config, Deletion, Engine};

#[derive(Parser)]
#[command(name = "mongo-custodian")]
#[command(
    version,
    about = "Backup, restore and import jobs for MongoDB with scheduled backup policies"
)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Serve,
    /// Manage target databases
    Database {
        #[command(subcommand)]
        action: DatabaseAction,
    },
    /// Manage scheduled backup policies
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
    /// Back up a database now
    Backup {
        #[arg(long)]
        database: i64,
        /// fast, balanced, compact or compatible
        #[arg(long, default_value = "balanced")]
        mode: String,
        /// Return once the task is admitted instead of following it
        #[arg(long)]
        detach: bool,
    },
    /// Restore a backup
    Restore {
        backup: i64,
        /// Database to restore into (defaults to the one the backup came from)
        #[arg(long)]
        into: Option<i64>,
        /// Drop collections before restoring them
        #[arg(long)]
        drop: bool,
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
    /// Copy one registered database into another
    Import {
        #[arg(long)]
        from: i64,
        #[arg(long)]
        into: i64,
    },
    /// Delete a backup record and its archive
    DeleteBackup { backup: i64 },
    /// List recorded backups
    Backups,
    /// Request cancellation of a running task
    Cancel { task: i64 },
    /// Show recent tasks
    Tasks {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum DatabaseAction {
    /// Register a database
    Add {
        name: String,
        /// MongoDB connection string
        uri: String,
        /// Logical database name on the server
        database: String,
    },
    /// List registered databases
    List,
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Create a backup policy
    Add {
        #[arg(long)]
        database: i64,
        /// Cron expression, 5 fields or 6/7 with seconds, evaluated in UTC
        #[arg(long)]
        cron: String,
        /// Delete backups this many days after they finish
        #[arg(long)]
        retention_days: Option<u32>,
        #[arg(long, default_value = "balanced")]
        mode: String,
    },
    /// List backup policies
    List,
    /// Delete a policy and its pending timers
    Remove { policy: i64 },
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config.log_filter);

    let engine = Engine::from_config(&config)?;

    match cli.command {
        Commands::Serve => serve(&engine).await,
        Commands::Database { action } => match action {
            DatabaseAction::Add {
                name,
                uri,
                database,
            } => {
                let store = engine.store();
                let db = store.insert_database(&name, &uri, &database).await?;
                println!("Registered database {} ({})", db.id, db.name);
                Ok(())
            }
            DatabaseAction::List => {
                for db in engine.store().list_databases().await? {
                    println!("{:>4}  {:<20} {}", db.id, db.name, db.database_name);
                }
                Ok(())
            }
        },
        Commands::Policy { action } => match action {
            PolicyAction::Add {
                database,
                cron,
                retention_days,
                mode,
            } => {
                let mode: BackupMode = mode.parse()?;
                let policy = engine
                    .create_policy(database, &cron, retention_days, mode)
                    .await?;
                match policy.next_run_at {
                    Some(next) => println!("Created policy {}, next run at {}", policy.id, next),
                    None => println!("Created policy {} with no future runs", policy.id),
                }
                Ok(())
            }
            PolicyAction::List => {
                for policy in engine.store().list_policies().await? {
                    println!(
                        "{:>4}  db {:<4} {:<20} {:<11} retention {:<6} next {}",
                        policy.id,
                        policy.database_id,
                        policy.cron_expression,
                        policy.mode.as_str(),
                        policy
                            .retention_days
                            .map(|d| format!("{}d", d))
                            .unwrap_or_else(|| "-".into()),
                        policy
                            .next_run_at
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "-".into()),
                    );
                }
                Ok(())
            }
            PolicyAction::Remove { policy } => {
                if !engine.delete_policy(policy).await? {
                    bail!("Policy {} does not exist", policy);
                }
                println!("Removed policy {}", policy);
                Ok(())
            }
        },
        Commands::Backup {
            database,
            mode,
            detach,
        } => {
            let mode: BackupMode = mode.parse()?;
            let admission = engine.start_backup(database, mode).await?;
            follow_admission(&engine, admission, detach).await
        }
        Commands::Restore {
            backup,
            into,
            drop,
            yes,
        } => {
            if !yes {
                let prompt = format!(
                    "Restore backup {} now? Data in the target database may be overwritten",
                    backup
                );
                let confirmed = Confirm::new()
                    .with_prompt(prompt)
                    .default(false)
                    .interact()
                    .context("Failed to read confirmation")?;
                if !confirmed {
                    println!("Restore aborted");
                    return Ok(());
                }
            }
            let admission = engine.start_restore(backup, into, drop).await?;
            follow_admission(&engine, admission, false).await
        }
        Commands::Import { from, into } => {
            let admission = engine.start_import(from, into).await?;
            follow_admission(&engine, admission, false).await
        }
        Commands::DeleteBackup { backup } => match engine.start_delete(backup).await? {
            Deletion::Task(admission) => follow_admission(&engine, admission, false).await,
            Deletion::Immediate => {
                println!("Deleted backup {}", backup);
                Ok(())
            }
        },
        Commands::Backups => {
            for backup in engine.store().list_backups().await? {
                println!(
                    "{:>4}  db {:<4} {:<11} {:>12} bytes  {}  {}",
                    backup.id,
                    backup
                        .database_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".into()),
                    backup.mode.as_str(),
                    backup.size_bytes,
                    backup.finished_at.to_rfc3339(),
                    backup.archive_path.display()
                );
            }
            Ok(())
        }
        Commands::Cancel { task } => {
            match engine.cancel_task(task).await? {
                CancelRequest::Requested => println!("Cancellation requested for task {}", task),
                CancelRequest::NotCancellable => bail!("Task {} cannot be cancelled", task),
                CancelRequest::AlreadyComplete => println!("Task {} has already finished", task),
                CancelRequest::NotFound => bail!("Task {} does not exist", task),
            }
            Ok(())
        }
        Commands::Tasks { limit } => {
            for task in engine.store().list_tasks(limit).await? {
                println!(
                    "{:>5}  db {:<4} {:<16} {:<10} {}  {}",
                    task.id,
                    task.database_id,
                    task.task_type.as_str(),
                    task.state.as_str(),
                    task.started_at.to_rfc3339(),
                    task.progress.message()
                );
            }
            Ok(())
        }
    }
}

async fn serve(engine: &Engine) -> Result<()> {
    engine.start().await?;
    println!("mongo-custodian is running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    println!("Shutting down");
    Ok(())
}

async fn follow_admission(engine: &Engine, admission: Admission, detach: bool) -> Result<()> {
    match admission {
        Admission::Rejected(reason) => bail!("{}", reason),
        Admission::Accepted { task_id, handle } => {
            if detach {
                println!("Started task {}", task_id);
                return Ok(());
            }
            follow(engine, task_id, handle).await
        }
    }
}

/// Render task progress until it finishes. Ctrl+C asks for cancellation once.
async fn follow(engine: &Engine, task_id: TaskId, handle: TaskHandle) -> Result<()> {
    let spinner_style = ProgressStyle::with_template("{spinner:.green} {msg}")?;
    let bar_template = "{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len} {prefix}";
    let bar_style = ProgressStyle::with_template(bar_template)?
        .progress_chars("=> ");

    let bar = ProgressBar::new_spinner();
    bar.set_style(spinner_style.clone());
    bar.enable_steady_tick(Duration::from_millis(120));

    let wait = handle.wait();
    tokio::pin!(wait);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut cancel_sent = false;

    let completion = loop {
        tokio::select! {
            completion = &mut wait => break completion?,
            _ = ticker.tick() => {
                if let Some(task) = engine.store().get_task(task_id).await? {
                    match task.progress {
                        TaskProgress::Uncertain { message } => {
                            bar.set_style(spinner_style.clone());
                            bar.set_message(message);
                        }
                        TaskProgress::Detailed { message, current, total, unit_name } => {
                            bar.set_style(bar_style.clone());
                            bar.set_length(total);
                            bar.set_position(current);
                            bar.set_prefix(unit_name);
                            bar.set_message(message);
                        }
                    }
                }
            }
            signal = tokio::signal::ctrl_c(), if !cancel_sent => {
                signal.context("Failed to listen for Ctrl+C")?;
                cancel_sent = true;
                let answer = engine.cancel_task(task_id).await?;
                bar.println(cancel_notice(answer));
            }
        }
    };
    bar.finish_and_clear();

    let message = completion.message;
    match completion.state {
        TaskState::Successful => {
            println!("Task {} succeeded: {}", task_id, message);
            if let Some(backup_id) = completion.backup_id {
                println!("Backup id: {}", backup_id);
            }
            Ok(())
        }
        state => bail!("Task {} finished as {}: {}", task_id, state, message),
    }
}

fn cancel_notice(answer: CancelRequest) -> &'static str {
    match answer {
        CancelRequest::Requested => "Cancellation requested",
        CancelRequest::NotCancellable => "This task cannot be cancelled",
        CancelRequest::AlreadyComplete | CancelRequest::NotFound => "Task already finished",
    }
}
