use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use paycycle::application::attempts::AttemptLedger;
use paycycle::application::context::RunContext;
use paycycle::application::dispatch::{QueueTarget, WebhookConfig, WebhookQueueRunner};
use paycycle::application::ingest::{IngestSummary, WebhookIngestor};
use paycycle::application::instalments::{
    ChargeRequest, GenerateRequest, InstalmentOrchestrator,
};
use paycycle::application::reconcile::{
    ReconcileRequest, ReconciliationOrchestrator, StuckThreshold,
};
use paycycle::application::registry::HandlerRegistry;
use paycycle::application::webhook_log::WebhookLog;
use paycycle::domain::ports::{SharedAttemptStore, SharedWebhookStore, SharedWorkQueue};
use paycycle::domain::processor::ProcessorType;
use paycycle::infrastructure::event_bus::InProcessEventBus;
use paycycle::infrastructure::in_memory::{
    InMemoryAttemptStore, InMemoryLedger, InMemoryWebhookStore, InMemoryWorkQueue,
};
use paycycle::interfaces::csv::summary_writer::SummaryWriter;
use paycycle::interfaces::csv::webhook_reader::WebhookReader;
use std::fs::File;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, env = "PAYCYCLE_DB_PATH", global = true)]
    db_path: Option<PathBuf>,

    /// JSON snapshot of contributions and recurring schedules, saved back after the run.
    #[arg(long, env = "PAYCYCLE_LEDGER", global = true)]
    ledger: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Log and enqueue webhook events from a CSV file
    IngestWebhooks {
        /// Input webhook events CSV file
        input: PathBuf,
    },
    /// Drain webhook queues
    RunWebhooks {
        /// Processor type, or "all"
        #[arg(long, default_value = "all")]
        processor: QueueTarget,
        #[arg(long, default_value_t = 50)]
        batch_size: usize,
        /// Ingest this CSV file before running
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Create pending instalments for due recurring schedules
    GenerateInstalments {
        #[arg(long)]
        processor: ProcessorType,
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
        /// Reference date, defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Claim due instalments and publish charge batches
    ChargeInstalments {
        #[arg(long = "processor", required = true)]
        processors: Vec<ProcessorType>,
        /// Per processor type
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
        #[arg(long, default_value_t = 3)]
        max_retry_count: u32,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Ask processors about attempts stuck in processing
    Reconcile {
        /// processor=days, repeatable; order sets budget priority
        #[arg(long = "threshold", required = true)]
        thresholds: Vec<StuckThreshold>,
        /// Shared across all processors
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
        #[arg(long, default_value_t = 3)]
        max_retry_count: u32,
    },
}

struct Stores {
    attempts: SharedAttemptStore,
    webhooks: SharedWebhookStore,
    queue: SharedWorkQueue,
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    use paycycle::infrastructure::rocksdb::RocksDBStore;

    if let Some(db_path) = db_path {
        info!(path = %db_path.display(), "using RocksDB storage");
        let store = RocksDBStore::open(db_path)?;
        return Ok(Stores {
            attempts: Arc::new(store.clone()),
            webhooks: Arc::new(store.clone()),
            queue: Arc::new(store),
        });
    }
    Ok(in_memory_stores())
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    if db_path.is_some() {
        tracing::warn!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(in_memory_stores())
}

fn in_memory_stores() -> Stores {
    Stores {
        attempts: Arc::new(InMemoryAttemptStore::new()),
        webhooks: Arc::new(InMemoryWebhookStore::new()),
        queue: Arc::new(InMemoryWorkQueue::new()),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(io::stderr().is_terminal()),
        )
        .init();
}

fn load_ledger(path: Option<&Path>) -> Result<InMemoryLedger> {
    match path {
        Some(path) => Ok(InMemoryLedger::load(path)?),
        None => Ok(InMemoryLedger::new()),
    }
}

async fn save_ledger(ledger: &InMemoryLedger, path: Option<&Path>) -> Result<()> {
    if let Some(path) = path {
        ledger.save(path).await?;
    }
    Ok(())
}

async fn ingest_file(ingestor: &WebhookIngestor, input: &Path) -> Result<IngestSummary> {
    let file = File::open(input).into_diagnostic()?;
    let mut summary = IngestSummary::default();
    for row in WebhookReader::new(file).events() {
        match row {
            Ok((processor, event)) => match ingestor.ingest(&processor, event).await {
                Ok(outcome) => summary.add(outcome),
                Err(e) => error!("Error ingesting webhook event: {}", e),
            },
            Err(e) => error!("Error reading webhook event: {}", e),
        }
    }
    info!(
        received = summary.received,
        duplicates = summary.duplicates,
        "webhook file ingested"
    );
    Ok(summary)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let ctx = RunContext::system();
    let stores = open_stores(cli.db_path)?;
    let ledger_path = cli.ledger.as_deref();
    let config = WebhookConfig::default();
    let log = WebhookLog::new(stores.webhooks.clone(), ctx.clone(), config.retry);
    let stdout = io::stdout();
    let mut writer = SummaryWriter::new(stdout.lock());

    match cli.command {
        Command::IngestWebhooks { input } => {
            let ingestor = WebhookIngestor::new(log, stores.queue.clone());
            let summary = ingest_file(&ingestor, &input).await?;
            writer.write_rows([summary])?;
        }
        Command::RunWebhooks {
            processor,
            batch_size,
            input,
        } => {
            if let Some(input) = input {
                let ingestor = WebhookIngestor::new(log.clone(), stores.queue.clone());
                ingest_file(&ingestor, &input).await?;
            }
            let runner = WebhookQueueRunner::new(
                log,
                stores.queue.clone(),
                Arc::new(HandlerRegistry::new()),
                WebhookConfig {
                    batch_size,
                    ..config
                },
            );
            let summaries = runner.run(processor).await?;
            writer.write_rows(summaries)?;
        }
        Command::GenerateInstalments {
            processor,
            batch_size,
            date,
        } => {
            let ledger = load_ledger(ledger_path)?;
            let orchestrator = instalments(&stores, &ledger, &ctx);
            let summary = orchestrator
                .generate(&GenerateRequest {
                    processor_type: processor,
                    batch_size,
                    reference_date: date,
                })
                .await?;
            save_ledger(&ledger, ledger_path).await?;
            writer.write_rows([summary])?;
        }
        Command::ChargeInstalments {
            processors,
            batch_size,
            max_retry_count,
            date,
        } => {
            let ledger = load_ledger(ledger_path)?;
            let orchestrator = instalments(&stores, &ledger, &ctx);
            let summaries = orchestrator
                .charge(&ChargeRequest {
                    processor_types: processors,
                    batch_size,
                    max_retry_count,
                    as_of: date,
                })
                .await?;
            save_ledger(&ledger, ledger_path).await?;
            writer.write_rows(summaries)?;
        }
        Command::Reconcile {
            thresholds,
            batch_size,
            max_retry_count,
        } => {
            let ledger = load_ledger(ledger_path)?;
            let orchestrator = ReconciliationOrchestrator::new(
                AttemptLedger::new(stores.attempts.clone(), ctx.clone()),
                Arc::new(ledger.clone()),
                Arc::new(InProcessEventBus::new()),
                ctx.clone(),
            );
            let summary = orchestrator
                .run(&ReconcileRequest {
                    thresholds,
                    batch_size,
                    max_retry_count,
                })
                .await?;
            save_ledger(&ledger, ledger_path).await?;
            writer.write_rows(summary.processors)?;
        }
    }

    Ok(())
}

fn instalments(
    stores: &Stores,
    ledger: &InMemoryLedger,
    ctx: &RunContext,
) -> InstalmentOrchestrator {
    InstalmentOrchestrator::new(
        AttemptLedger::new(stores.attempts.clone(), ctx.clone()),
        Arc::new(ledger.clone()),
        Arc::new(InProcessEventBus::new()),
        ctx.clone(),
    )
}
