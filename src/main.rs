use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use warehouse_extractor::config::{Settings, DEFAULT_CONFIG_PATH};
use warehouse_extractor::extract::{parse_job_spec, TableRef};
use warehouse_extractor::storage::{enqueue_task, upsert_column, Database, SqliteColumnCatalog};
use warehouse_extractor::worker::{connect_warehouse, run_single_job, run_worker};

#[derive(Debug, Parser)]
#[command(name = "warehouse-extractor", version, about = "Partitioned BigQuery to CSV extraction worker")]
struct Cli {
    /// Settings file (TOML). Environment variables prefixed EXTRACTOR__ override it.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Overrides logging.level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Overrides logging.format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll the task queue until continue_running is false
    Run,
    /// Run one job directly, bypassing the queue
    Extract {
        #[arg(long)]
        job_id: i64,
        /// Job payload JSON, or @path to read it from a file
        #[arg(long)]
        payload: String,
    },
    /// Add a pending task to the queue
    Enqueue {
        /// Job payload JSON, or @path to read it from a file
        #[arg(long)]
        payload: String,
        /// Defaults to the configured task_type_id
        #[arg(long)]
        task_type: Option<i64>,
        #[arg(long)]
        client_family: Option<i64>,
    },
    /// Record the declared type of a warehouse column
    SeedColumn {
        /// project.dataset.table
        #[arg(long)]
        table: String,
        #[arg(long)]
        column: String,
        #[arg(long = "type")]
        data_type: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let settings = Settings::load(&cli.config)
        .with_context(|| format!("Failed to load settings: {}", cli.config.display()))?;

    let log_level = cli.log_level.as_deref().unwrap_or(&settings.logging.level);
    let log_format = cli.log_format.as_deref().unwrap_or(&settings.logging.format);
    init_logging(log_level, log_format)?;

    match cli.command {
        Command::Run => {
            run_worker(&cli.config).await.context("Worker stopped with an error")?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Extract { job_id, payload } => {
            let payload = read_payload(&payload)?;
            let db = Database::init(settings.database_path.clone())
                .await
                .context("Failed to open the column catalog")?;
            let warehouse = connect_warehouse(&settings)
                .await
                .context("Failed to connect to the warehouse")?;

            let outcome = run_single_job(
                &settings,
                Arc::new(warehouse),
                Arc::new(SqliteColumnCatalog::new(db)),
                job_id,
                &payload,
            )
            .await
            .with_context(|| format!("Job {job_id} was rejected"))?;

            println!("{}", serde_json::to_string_pretty(&outcome)?);

            if outcome.succeeded() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Enqueue {
            payload,
            task_type,
            client_family,
        } => {
            let payload = read_payload(&payload)?;
            parse_job_spec(&payload, chrono::Local::now().date_naive())
                .context("Payload is not a valid job")?;

            let db = Database::init(settings.database_path.clone())
                .await
                .context("Failed to open the task queue")?;
            let id = enqueue_task(
                &db,
                task_type.unwrap_or(settings.task_type_id),
                client_family,
                &payload,
            )
            .await?;

            println!("{id}");
            Ok(ExitCode::SUCCESS)
        }
        Command::SeedColumn {
            table,
            column,
            data_type,
        } => {
            let table = TableRef::parse(&table)?;
            let db = Database::init(settings.database_path.clone())
                .await
                .context("Failed to open the column catalog")?;
            upsert_column(&db, &table, &column, &data_type).await?;

            info!("Recorded {}.{} as {}", table, column, data_type);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Reads a payload argument: inline JSON, or `@path` for a file.
fn read_payload(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read payload file: {path}")),
        None => Ok(arg.to_string()),
    }
}

fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
                .context("Failed to initialize JSON logging")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
                .try_init()
                .context("Failed to initialize pretty logging")?;
        }
        _ => {
            return Err(anyhow::anyhow!("Unsupported log format: {log_format}"));
        }
    }

    Ok(())
}
