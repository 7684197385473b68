//! CLI command implementations.
//!
//! Each `run_*` function backs one `mintel` subcommand. They open the
//! SQLite database, assemble a [`Pipeline`] through [`Runtime`], do their
//! work and print a plain-text report to stdout.
//!
//! Ledger entries recorded during a command are appended to the
//! `cost_ledger` table before the command returns, so spend and throttle
//! tiers carry over between runs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use crate::cache::{ExtractionCache, SqliteCacheBackend};
use crate::config::Config;
use crate::embedding::{create_service, EmbeddingService};
use crate::extractor::{create_extractor, StructuredExtractor};
use crate::ledger::{summarize, CostLedger, OperationKind};
use crate::migrate;
use crate::models::{Document, FailurePattern};
use crate::patterns::spawn_runner;
use crate::pipeline::{DocumentReport, Pipeline};
use crate::store::sqlite::SqliteStore;
use crate::store::{EventFilters, Store};

/// Everything a command needs, wired against the configured database.
struct Runtime {
    store: Arc<SqliteStore>,
    ledger: Arc<CostLedger>,
    pipeline: Arc<Pipeline>,
    /// Ledger length at startup; entries past it are new this run.
    flushed: usize,
}

impl Runtime {
    async fn open(config: &Config) -> Result<Self> {
        let pool = migrate::init_database(config).await?;
        let store = Arc::new(SqliteStore::new(pool.clone()));

        let history = store.cost_entries().await?;
        let flushed = history.len();
        let ledger = Arc::new(CostLedger::from_entries(config.costs.clone(), history));

        let cache = Arc::new(
            ExtractionCache::new(Arc::new(SqliteCacheBackend::new(pool)), ledger.clone())
                .with_ttl_days(config.extraction.cache_ttl_days),
        );
        let extractor: Arc<dyn StructuredExtractor> =
            Arc::from(create_extractor(&config.extraction)?);
        let embedder: Option<Arc<dyn EmbeddingService>> = if config.embedding.is_enabled() {
            Some(Arc::from(create_service(&config.embedding)?))
        } else {
            None
        };

        let pipeline = Arc::new(Pipeline::new(
            config,
            store.clone(),
            cache,
            ledger.clone(),
            extractor,
            embedder,
        )?);

        Ok(Self {
            store,
            ledger,
            pipeline,
            flushed,
        })
    }

    /// Persist ledger entries recorded since startup, then close the pool.
    async fn finish(self) -> Result<()> {
        let fresh = self.ledger.entries_since(self.flushed);
        if !fresh.is_empty() {
            self.store
                .append_costs(&fresh)
                .await
                .context("Failed to persist cost ledger")?;
        }
        self.store.pool().close().await;
        Ok(())
    }
}

/// `mintel init`: create the database and schema.
pub async fn run_init(config: &Config) -> Result<()> {
    let pool = migrate::init_database(config).await?;
    pool.close().await;
    println!("Database initialized at {}", config.db.path.display());
    Ok(())
}

/// `mintel ingest`: extract and embed each file as one document.
pub async fn run_ingest(config: &Config, files: &[PathBuf], plant: &str) -> Result<()> {
    let mut docs = Vec::with_capacity(files.len());
    for path in files {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        docs.push(Document::new(path.display().to_string(), plant, text));
    }

    let runtime = Runtime::open(config).await?;
    let reports = runtime.pipeline.process_all(docs).await;

    let mut ok = 0;
    for (path, report) in files.iter().zip(&reports) {
        print_report(&path.display().to_string(), report);
        if report.is_ok() {
            ok += 1;
        }
    }
    println!();
    println!("ingest: {} ok, {} failed", ok, reports.len() - ok);
    print_spend(&runtime.ledger);

    runtime.finish().await
}

/// `mintel retry`: re-run a failed document.
pub async fn run_retry(config: &Config, document_id: &str) -> Result<()> {
    let runtime = Runtime::open(config).await?;
    let result = runtime.pipeline.retry(document_id).await;
    if let Ok(report) = &result {
        print_report(document_id, report);
    }
    runtime.finish().await?;
    result.map(|_| ())
}

/// `mintel embed pending`: embed events whose vector is missing or stale.
pub async fn run_embed_pending(config: &Config, limit: Option<usize>) -> Result<()> {
    let runtime = Runtime::open(config).await?;
    let result = runtime.pipeline.embed_pending(limit).await;
    if let Ok(outcome) = &result {
        println!("embed pending");
        println!("  submitted: {}", outcome.submitted());
        println!("  embedded:  {}", outcome.succeeded());
        println!("  filtered:  {}", outcome.filtered());
        println!("  failed:    {}", outcome.failed());
        print_spend(&runtime.ledger);
    }
    runtime.finish().await?;
    result.map(|_| ())
}

/// `mintel search`: nearest failure events to a free-text query.
pub async fn run_search(
    config: &Config,
    query: &str,
    plant: Option<String>,
    equipment: Option<String>,
    limit: usize,
) -> Result<()> {
    let filters = EventFilters {
        plant_id: plant,
        equipment_tag: equipment,
        ..Default::default()
    };

    let runtime = Runtime::open(config).await?;
    let result = runtime.pipeline.search(query, limit, &filters).await;
    if let Ok(hits) = &result {
        if hits.is_empty() {
            println!("No results.");
        }
        for (i, hit) in hits.iter().enumerate() {
            let event = &hit.event;
            println!(
                "{}. [{:.3}] {} @ {}",
                i + 1,
                hit.score,
                event.equipment_tag,
                event.plant_id
            );
            println!("    reported: {}", event.reported_at.format("%Y-%m-%d"));
            println!("    failure: \"{}\"", event.description().replace('\n', " ").trim());
            if let Some(rc) = event.root_cause() {
                println!("    root cause: {}", rc);
            }
            println!("    document: {}", event.document_id);
            println!("    id: {}", event.id);
            println!();
        }
    }
    runtime.finish().await?;
    result.map(|_| ())
}

/// `mintel patterns detect`: one detection run over the last `days` days.
pub async fn run_patterns_detect(config: &Config, days: Option<i64>) -> Result<()> {
    let mut config = config.clone();
    if let Some(days) = days {
        config.patterns.window_days = days;
    }

    let runtime = Runtime::open(&config).await?;
    let detector = runtime.pipeline.pattern_detector();
    let window = EventFilters {
        since: Some(Utc::now() - Duration::days(config.patterns.window_days)),
        ..Default::default()
    };
    let result = detector.detect_patterns(&window).await;
    if let Ok(patterns) = &result {
        println!(
            "Detected {} pattern(s) over the last {} days",
            patterns.len(),
            config.patterns.window_days
        );
        println!();
        print_patterns(patterns);
    }
    runtime.finish().await?;
    result.map(|_| ())
}

/// `mintel patterns list`: patterns currently stored.
pub async fn run_patterns_list(config: &Config) -> Result<()> {
    let runtime = Runtime::open(config).await?;
    let result = runtime.store.patterns().await;
    if let Ok(patterns) = &result {
        if patterns.is_empty() {
            println!("No patterns stored. Run `mintel patterns detect`.");
        }
        print_patterns(patterns);
    }
    runtime.finish().await?;
    result.map(|_| ())
}

/// `mintel patterns watch`: run detection on a fixed cadence until Ctrl-C.
pub async fn run_patterns_watch(config: &Config) -> Result<()> {
    let runtime = Runtime::open(config).await?;
    let detector = Arc::new(runtime.pipeline.pattern_detector());
    let shutdown = CancellationToken::new();
    let runner = spawn_runner(detector, shutdown.clone());

    println!(
        "Watching for patterns every {}s (Ctrl-C to stop)",
        config.patterns.interval_secs
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    shutdown.cancel();
    runner.await.context("Pattern runner panicked")?;

    runtime.finish().await
}

/// `mintel costs`: persisted spend per operation kind.
pub async fn run_costs(config: &Config) -> Result<()> {
    let pool = migrate::init_database(config).await?;
    let store = SqliteStore::new(pool);
    let entries = store.cost_entries().await?;
    store.pool().close().await;

    let summary = summarize(&entries);
    println!("Cost Ledger");
    println!("===========");
    println!();
    println!("  {:<24} {:>8} {:>12} {:>12}", "KIND", "ENTRIES", "UNITS", "COST (USD)");
    for kind in [
        OperationKind::ExtractionCall,
        OperationKind::ExtractionCacheHit,
        OperationKind::EmbeddingCall,
        OperationKind::EmbeddingReuse,
    ] {
        let totals = summary.by_kind.get(&kind).cloned().unwrap_or_default();
        let label = if kind.is_avoided() {
            format!("{} (avoided)", kind.as_str())
        } else {
            kind.as_str().to_string()
        };
        println!(
            "  {:<24} {:>8} {:>12} {:>12.4}",
            label, totals.entries, totals.units, totals.cost_usd
        );
    }
    println!();
    println!("  Total spend: ${:.4}", summary.total_cost_usd);
    if let Some(soft) = config.costs.soft_budget_usd {
        println!("  Soft budget: ${:.2}", soft);
    }
    if let Some(hard) = config.costs.hard_budget_usd {
        println!("  Hard budget: ${:.2}", hard);
    }
    Ok(())
}

/// `mintel config`: the effective configuration as TOML.
pub fn run_config(config: &Config) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to render config")?;
    print!("{}", rendered);
    Ok(())
}

fn print_report(label: &str, report: &DocumentReport) {
    match &report.extraction {
        Ok(source) => {
            let embedded = report
                .embeddings
                .as_ref()
                .map(|o| {
                    format!(
                        ", {} embedded, {} filtered, {} failed",
                        o.succeeded(),
                        o.filtered(),
                        o.failed()
                    )
                })
                .unwrap_or_default();
            println!("  ok      {} ({:?}{})", label, source, embedded);
        }
        Err(failure) => println!("  FAILED  {}: {}", label, failure),
    }
    println!("          id: {}", report.document_id);
}

fn print_patterns(patterns: &[FailurePattern]) {
    for pattern in patterns {
        println!(
            "[{}] {} members, {}",
            pattern.id,
            pattern.member_count(),
            pattern.equipment_tags.join(", ")
        );
        println!(
            "    {} .. {}",
            pattern.first_occurrence.format("%Y-%m-%d"),
            pattern.last_occurrence.format("%Y-%m-%d")
        );
        println!("    {}", pattern.summary);
        println!();
    }
}

fn print_spend(ledger: &CostLedger) {
    let summary = ledger.summary();
    println!(
        "spend: ${:.4} total ({} extraction calls, {} cache hits, {} embedding calls, {} reused)",
        summary.total_cost_usd,
        summary.count(OperationKind::ExtractionCall),
        summary.count(OperationKind::ExtractionCacheHit),
        summary.count(OperationKind::EmbeddingCall),
        summary.count(OperationKind::EmbeddingReuse)
    );
}
