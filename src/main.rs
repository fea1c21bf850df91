// docflow CLI - coordinator, worker, and operational tooling
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use docflow::{
    derive_run_id, factory, init_logging_with_level, init_logging_with_name, Config, Coordinator,
    DeadLetterQueue, QueueItem, RunCoordinator, ValidatedDocumentId, ValidatedWorkerId, Worker,
    WorkerPool,
};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "docflow - distributed document ingestion and knowledge extraction",
    long_about = None,
    after_help = "QUICK START:
  1. Create the schema:      docflow queue init-schema --config config.yaml
  2. Start the coordinator:  docflow coordinator --config config.yaml
  3. Start workers:          docflow worker --config config.yaml --workers 4
  4. Inspect failures:       docflow deadletter --list --config config.yaml

EXAMPLES:
  # Single-process ingestion (coordinator drains its own queue)
  docflow coordinator --config single.yaml

  # Operational checks
  docflow queue status --run-id abc123def456
  docflow queue reclaim-stale --timeout 300
  docflow deadletter --analyze --run-id abc123def456"
)]
struct Cli {
    /// Enable verbose logging (DEBUG level)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all non-essential output (ERROR level logging only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator: enumerate sources, enqueue, monitor the run
    Coordinator {
        /// Path to configuration file (or $DOCFLOW_CONFIG_PATH)
        #[arg(short, long)]
        config: Option<String>,
        /// Maximum link depth to follow (overrides config)
        #[arg(short = 'd', long)]
        max_link_depth: Option<u32>,
        /// Logging level (debug/info/error)
        #[arg(short = 'l', long)]
        log_level: Option<String>,
    },

    /// Run one or more document workers draining the configured run
    Worker {
        /// Path to configuration file (or $DOCFLOW_CONFIG_PATH)
        #[arg(short, long)]
        config: Option<String>,
        /// Number of worker tasks to run in this process
        #[arg(short, long, default_value = "1")]
        workers: usize,
        /// Custom worker ID (auto-generated if not provided)
        #[arg(long)]
        worker_id: Option<String>,
        /// Maximum documents to process before stopping
        #[arg(short, long)]
        max_documents: Option<u64>,
        /// Logging level (debug/info/error)
        #[arg(short = 'l', long)]
        log_level: Option<String>,
    },

    /// Manage the dead-letter queue of terminally failed documents
    Deadletter {
        /// Path to configuration file (or $DOCFLOW_CONFIG_PATH)
        #[arg(short, long)]
        config: Option<String>,
        /// List dead-letter items
        #[arg(long)]
        list: bool,
        /// Retry a specific queue item by ID
        #[arg(long, value_name = "QUEUE_ID")]
        retry: Option<i64>,
        /// Retry all failed items for a run
        #[arg(long, value_name = "RUN_ID")]
        retry_run: Option<String>,
        /// Analyze failure patterns
        #[arg(long)]
        analyze: bool,
        /// Purge items older than the given number of days
        #[arg(long, value_name = "DAYS")]
        purge: Option<u32>,
        /// Export dead-letter data to a JSON file
        #[arg(long, value_name = "FILE")]
        export: Option<PathBuf>,
        /// Filter by run ID
        #[arg(long)]
        run_id: Option<String>,
        /// Maximum items to display
        #[arg(long, default_value = "50")]
        limit: usize,
        /// Show full error details per item
        #[arg(long)]
        details: bool,
        /// Skip confirmation prompts
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Operational queue tools
    Queue {
        /// Path to configuration file (or $DOCFLOW_CONFIG_PATH)
        #[arg(short, long)]
        config: Option<String>,
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Create the queue and document schema
    InitSchema {
        /// Drop existing tables first (destroys all data)
        #[arg(long)]
        force: bool,
    },
    /// Show queue counts by state
    Status {
        /// Run to inspect (defaults to the run derived from config)
        #[arg(long)]
        run_id: Option<String>,
    },
    /// List all processing runs
    ListRuns,
    /// Enqueue a single document
    AddDocument {
        doc_id: String,
        source: String,
        /// Run to enqueue into (defaults to the run derived from config)
        #[arg(long)]
        run_id: Option<String>,
        /// JSON metadata to attach to the queue item
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Return stale in-flight items to the queue
    ReclaimStale {
        /// Heartbeat timeout in seconds (defaults to config)
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match &cli.command {
        Commands::Coordinator { log_level, .. } | Commands::Worker { log_level, .. } => {
            log_level.clone()
        }
        _ => None,
    };
    let log_result = match log_level {
        Some(level) => init_logging_with_name(&level),
        None => init_logging_with_level(cli.verbose, cli.quiet),
    };
    if let Err(error) = log_result {
        eprintln!("Failed to initialize logging: {error:#}");
        std::process::exit(1);
    }

    match dispatch(cli).await {
        Ok(()) => {}
        Err(error) => {
            eprintln!("Error: {error:#}");
            std::process::exit(1);
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Coordinator {
            config,
            max_link_depth,
            ..
        } => run_coordinator(config.as_deref(), max_link_depth).await,
        Commands::Worker {
            config,
            workers,
            worker_id,
            max_documents,
            ..
        } => run_worker(config.as_deref(), workers, worker_id, max_documents).await,
        Commands::Deadletter {
            config,
            list,
            retry,
            retry_run,
            analyze,
            purge,
            export,
            run_id,
            limit,
            details,
            yes,
        } => {
            let action_count = usize::from(list)
                + usize::from(retry.is_some())
                + usize::from(retry_run.is_some())
                + usize::from(analyze)
                + usize::from(purge.is_some())
                + usize::from(export.is_some());
            if action_count != 1 {
                return Err(anyhow!(
                    "Exactly one of --list, --retry, --retry-run, --analyze, --purge, --export is required"
                ));
            }
            run_deadletter(
                config.as_deref(),
                DeadLetterAction {
                    list,
                    retry,
                    retry_run,
                    analyze,
                    purge,
                    export,
                    run_id,
                    limit,
                    details,
                    yes,
                },
            )
            .await
        }
        Commands::Queue { config, action } => run_queue(config.as_deref(), action).await,
    }
}

async fn run_coordinator(config_flag: Option<&str>, max_link_depth: Option<u32>) -> Result<()> {
    let config_path = Config::resolve_path(config_flag);
    let mut config = Config::load(&config_path)?;
    if let Some(depth) = max_link_depth {
        config.processing.max_link_depth = depth;
    }

    let store = factory::create_store(&config).await?;
    let shutdown = Arc::new(AtomicBool::new(false));
    Worker::install_signal_handler(shutdown.clone());

    let coordinator = Coordinator::new(config, store.clone(), shutdown).await?;
    let summary = coordinator.run().await?;
    store.close().await?;

    println!("Processing run completed");
    println!("  Run ID:              {}", summary.run_id);
    println!("  Documents queued:    {}", summary.documents_queued);
    println!("  Documents processed: {}", summary.documents_processed);
    println!("  Documents failed:    {}", summary.documents_failed);
    println!("  Runtime:             {:.1}s", summary.runtime_seconds);
    Ok(())
}

async fn run_worker(
    config_flag: Option<&str>,
    workers: usize,
    worker_id: Option<String>,
    max_documents: Option<u64>,
) -> Result<()> {
    if workers == 0 {
        return Err(anyhow!("--workers must be at least 1"));
    }
    let config_path = Config::resolve_path(config_flag);
    let config = Config::load(&config_path)?;

    let store = factory::create_store(&config).await?;
    let run_id = derive_run_id(&config)?;
    let runs = RunCoordinator::new(store.clone());
    runs.ensure_run_exists(run_id.as_str(), &config).await?;

    let (processor, queue) = factory::create_processor(&config, store.clone()).await?;
    let shutdown = Arc::new(AtomicBool::new(false));
    Worker::install_signal_handler(shutdown.clone());

    let base_id = worker_id.map(ValidatedWorkerId::new).transpose()?;
    let pool = WorkerPool::new(
        workers,
        base_id.as_ref(),
        queue,
        processor,
        shutdown,
        max_documents,
    )?;
    let stats = pool.run(run_id.as_str()).await?;
    store.close().await?;

    println!("Worker(s) completed");
    println!("  Run ID:                {}", run_id);
    println!("  Documents processed:   {}", stats.documents_processed);
    println!("  Documents failed:      {}", stats.documents_failed);
    println!("  Documents unchanged:   {}", stats.documents_unchanged);
    println!("  Elements created:      {}", stats.elements_created);
    println!("  Relationships created: {}", stats.relationships_created);
    println!("  Links discovered:      {}", stats.links_discovered);
    Ok(())
}

struct DeadLetterAction {
    list: bool,
    retry: Option<i64>,
    retry_run: Option<String>,
    analyze: bool,
    purge: Option<u32>,
    export: Option<PathBuf>,
    run_id: Option<String>,
    limit: usize,
    details: bool,
    yes: bool,
}

async fn run_deadletter(config_flag: Option<&str>, action: DeadLetterAction) -> Result<()> {
    let config_path = Config::resolve_path(config_flag);
    let config = Config::load(&config_path)?;
    let store = factory::create_store(&config).await?;
    let dlq = DeadLetterQueue::new(store.clone());
    let run_filter = action.run_id.as_deref();

    if action.list {
        let items = dlq.list(run_filter, action.limit).await?;
        display_dead_letter_items(&items, action.details);
        if items.len() == action.limit {
            println!("\nShowing first {} items; use --limit to see more.", action.limit);
        }
    } else if let Some(queue_id) = action.retry {
        if dlq.retry(queue_id).await? {
            println!("Queue item {queue_id} returned to pending");
        } else {
            return Err(anyhow!(
                "Queue item {queue_id} not retried: missing or not in failed state"
            ));
        }
    } else if let Some(run_id) = &action.retry_run {
        let total = dlq.list(Some(run_id), usize::MAX).await?.len();
        if total == 0 {
            println!("No dead-letter items for run {run_id}");
        } else if action.yes || confirm(&format!("Retry {total} failed documents for run {run_id}?"))? {
            let (requeued, total) = dlq.retry_run(run_id).await?;
            println!("Requeued {requeued}/{total} documents for run {run_id}");
        } else {
            println!("Cancelled");
        }
    } else if action.analyze {
        let patterns = dlq.analyze(run_filter).await?;
        if patterns.is_empty() {
            println!("No failure patterns found");
        }
        for pattern in patterns {
            println!("\n{}", pattern.error_type.trim());
            println!("  Frequency:          {}", pattern.frequency);
            println!("  Affected documents: {}", pattern.affected_documents);
            if let Some(first) = pattern.first_occurrence {
                println!("  First seen:         {}", format_timestamp(first));
            }
            if let Some(last) = pattern.last_occurrence {
                println!("  Last seen:          {}", format_timestamp(last));
            }
            for (index, message) in pattern.sample_messages.iter().enumerate() {
                println!("  Sample {}:           {}", index + 1, truncate(message, 80));
            }
            if !pattern.affected_sources.is_empty() {
                println!("  Sources:            {}", pattern.affected_sources.join(", "));
            }
        }
    } else if let Some(days) = action.purge {
        if action.yes
            || confirm(&format!(
                "Permanently delete dead-letter items older than {days} days?"
            ))?
        {
            let purged = dlq.purge(days).await?;
            println!("Purged {purged} dead-letter items");
        } else {
            println!("Cancelled");
        }
    } else if let Some(path) = &action.export {
        let exported = dlq.export(run_filter, path).await?;
        println!("Exported {exported} items to {}", path.display());
    }

    store.close().await?;
    Ok(())
}

async fn run_queue(config_flag: Option<&str>, action: QueueAction) -> Result<()> {
    let config_path = Config::resolve_path(config_flag);
    let config = Config::load(&config_path)?;
    let store = factory::create_store(&config).await?;

    match action {
        QueueAction::InitSchema { force } => {
            store.init_schema(force).await?;
            println!("Queue schema ready{}", if force { " (recreated)" } else { "" });
        }
        QueueAction::Status { run_id } => {
            if !store.schema_exists().await? {
                return Err(anyhow!("Schema not initialized; run `docflow queue init-schema`"));
            }
            let run_id = match run_id {
                Some(run_id) => run_id,
                None => derive_run_id(&config)?.as_str().to_string(),
            };
            let status = store.queue_status(&run_id).await?;
            println!("Queue status for run {run_id}");
            println!("  pending:    {}", status.pending);
            println!("  processing: {}", status.processing);
            println!("  retry:      {}", status.retry);
            println!("  completed:  {}", status.completed);
            println!("  failed:     {}", status.failed);
            println!("  total:      {}", status.total());
        }
        QueueAction::ListRuns => {
            let runs = store.list_runs().await?;
            if runs.is_empty() {
                println!("No processing runs");
            }
            for run in runs {
                println!(
                    "{}  {:<10} queued={} processed={} failed={} workers={} created={}",
                    run.run_id,
                    run.status,
                    run.documents_queued,
                    run.documents_processed,
                    run.documents_failed,
                    run.worker_count,
                    format_timestamp(run.created_at)
                );
            }
        }
        QueueAction::AddDocument {
            doc_id,
            source,
            run_id,
            metadata,
        } => {
            let doc_id = ValidatedDocumentId::new(doc_id)?.into_string();
            let run_id = match run_id {
                Some(run_id) => run_id,
                None => {
                    let derived = derive_run_id(&config)?;
                    RunCoordinator::new(store.clone())
                        .ensure_run_exists(derived.as_str(), &config)
                        .await?;
                    derived.as_str().to_string()
                }
            };
            let metadata = match metadata {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| anyhow!("Invalid --metadata JSON: {e}"))?,
                None => Default::default(),
            };
            let queue = factory::create_queue(&config, store.clone());
            let outcome = queue.add_document(&run_id, &doc_id, &source, metadata).await?;
            println!(
                "Queue item {} ({})",
                outcome.queue_id,
                if outcome.created { "created" } else { "already queued" }
            );
        }
        QueueAction::ReclaimStale { timeout } => {
            let queue = factory::create_queue(&config, store.clone());
            let timeout =
                timeout.unwrap_or(config.processing.heartbeat_timeout_seconds);
            let reclaimed = queue.reclaim_stale(timeout).await?;
            println!("Reclaimed {reclaimed} stale items (timeout {timeout}s)");
        }
    }

    store.close().await?;
    Ok(())
}

fn display_dead_letter_items(items: &[QueueItem], details: bool) {
    if items.is_empty() {
        println!("No items in dead-letter queue");
        return;
    }
    println!("DEAD LETTER QUEUE ({} items)", items.len());

    if details {
        for (index, item) in items.iter().enumerate() {
            println!("\n[{}] {}", index + 1, item.doc_id);
            println!("    Queue ID:    {}", item.queue_id);
            println!("    Run ID:      {}", item.run_id);
            println!("    Source:      {}", item.source_name);
            println!("    Retry count: {}", item.retry_count);
            if let Some(error) = &item.error_info {
                println!("    Failed at:   {}", format_timestamp(error.failed_at));
                println!("    Error:       {}", error.message);
                for detail in &error.details {
                    println!("      caused by: {detail}");
                }
            }
        }
    } else {
        println!(
            "{:<10} {:<30} {:<14} {:<16} {:<8} {}",
            "Queue ID", "Doc ID", "Run ID", "Source", "Retries", "Error"
        );
        for item in items {
            let error = item
                .error_info
                .as_ref()
                .map(|e| truncate(&e.message, 40))
                .unwrap_or_default();
            println!(
                "{:<10} {:<30} {:<14} {:<16} {:<8} {}",
                item.queue_id,
                truncate(&item.doc_id, 30),
                truncate(&item.run_id, 14),
                truncate(&item.source_name, 16),
                item.retry_count,
                error
            );
        }
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max.saturating_sub(3);
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    use std::io::Write;
    print!("{prompt} (y/N): ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    let answer = answer.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("exactly-ten", 11), "exactly-ten");
        let cut = truncate("éééééééééé", 8);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= 8);
    }

    #[test]
    fn test_cli_parses_spec_surface() {
        Cli::try_parse_from(["docflow", "coordinator", "--config", "c.yaml", "-d", "3"]).unwrap();
        Cli::try_parse_from([
            "docflow", "worker", "--config", "c.yaml", "--workers", "4", "--max-documents", "10",
        ])
        .unwrap();
        Cli::try_parse_from(["docflow", "deadletter", "--list", "--run-id", "abc", "--details"])
            .unwrap();
        Cli::try_parse_from(["docflow", "deadletter", "--retry", "42"]).unwrap();
        Cli::try_parse_from(["docflow", "queue", "init-schema", "--force"]).unwrap();
        Cli::try_parse_from([
            "docflow", "queue", "add-document", "doc-1", "docs", "--metadata", "{}",
        ])
        .unwrap();
        Cli::try_parse_from(["docflow", "queue", "reclaim-stale", "--timeout", "120"]).unwrap();
        assert!(Cli::try_parse_from(["docflow", "bogus"]).is_err());
    }
}
