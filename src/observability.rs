// Centralized Observability Infrastructure
// Structured logging setup and the counter structs that workers and
// coordinators aggregate over a run.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging and tracing infrastructure.
/// This should be called once at process startup.
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging with configurable verbosity.
///
/// Precedence: `quiet` always wins (errors only, RUST_LOG ignored), then an
/// explicit RUST_LOG, then the flag-derived default.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    let filter_level = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("docflow=debug,info")
    } else {
        // Default: informational for docflow, warnings and errors for
        // dependencies. Users can widen this with --verbose or RUST_LOG.
        EnvFilter::new("docflow=info,warn")
    };

    let env_filter = if quiet {
        EnvFilter::new("error")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or(filter_level)
    } else {
        filter_level
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_thread_ids(!quiet)
        .with_ansi(true);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            if !quiet {
                info!("docflow observability initialized");
            }
            Ok(())
        }
        Err(_) => {
            // Already initialized, which is fine in test environments
            Ok(())
        }
    }
}

/// Explicit log level names accepted on the CLI, mapped onto the
/// verbose/quiet initialization above.
pub fn init_logging_with_name(level: &str) -> Result<()> {
    match level.to_ascii_lowercase().as_str() {
        "debug" => init_logging_with_level(true, false),
        "error" => init_logging_with_level(false, true),
        _ => init_logging_with_level(false, false),
    }
}

/// Per-worker processing counters, merged into run totals at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub documents_processed: u64,
    pub documents_failed: u64,
    pub documents_unchanged: u64,
    pub elements_created: u64,
    pub relationships_created: u64,
    pub entities_created: u64,
    pub links_discovered: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &WorkerStats) {
        self.documents_processed += other.documents_processed;
        self.documents_failed += other.documents_failed;
        self.documents_unchanged += other.documents_unchanged;
        self.elements_created += other.elements_created;
        self.relationships_created += other.relationships_created;
        self.entities_created += other.entities_created;
        self.links_discovered += other.links_discovered;
    }
}

/// Coordinator-level run summary printed at completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub documents_queued: u64,
    pub documents_processed: u64,
    pub documents_failed: u64,
    pub runtime_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_stats_merge() {
        let mut a = WorkerStats {
            documents_processed: 3,
            documents_failed: 1,
            elements_created: 40,
            ..Default::default()
        };
        let b = WorkerStats {
            documents_processed: 2,
            links_discovered: 5,
            elements_created: 10,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.documents_processed, 5);
        assert_eq!(a.documents_failed, 1);
        assert_eq!(a.elements_created, 50);
        assert_eq!(a.links_discovered, 5);
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        assert!(init_logging().is_ok());
        assert!(init_logging_with_level(true, false).is_ok());
        assert!(init_logging_with_name("debug").is_ok());
    }
}
