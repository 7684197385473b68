//! # Maintenance Intelligence CLI (`mintel`)
//!
//! The `mintel` binary drives the extraction → embedding → pattern
//! pipeline against a local SQLite database.
//!
//! ## Usage
//!
//! ```bash
//! mintel --config ./config/mintel.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mintel init` | Create the SQLite database and schema |
//! | `mintel ingest <files…> --plant <id>` | Extract and embed maintenance records |
//! | `mintel retry <id>` | Re-run a failed document |
//! | `mintel embed pending` | Backfill missing or stale failure embeddings |
//! | `mintel search "<text>"` | Find similar past failures |
//! | `mintel patterns detect` | Cluster recent failures into patterns |
//! | `mintel patterns list` | Show stored patterns |
//! | `mintel patterns watch` | Run detection on a fixed cadence |
//! | `mintel costs` | Spend and avoided calls per operation kind |
//! | `mintel config` | Print the effective configuration |
//!
//! ## Examples
//!
//! ```bash
//! # Ingest a month of work orders for one plant
//! mintel ingest records/2024-05/*.txt --plant north-mill
//!
//! # Similar failures on one pump
//! mintel search "mechanical seal leak after restart" --equipment P-12
//!
//! # Recurring issues over the last 30 days
//! mintel patterns detect --days 30
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use maintenance_intel::{commands, config};

/// Turn free-text maintenance records into searchable failure intelligence.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/mintel.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "mintel",
    about = "Maintenance intelligence: structured extraction, failure search and pattern detection",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mintel.toml")]
    config: PathBuf,

    /// Debug logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it on an existing database is safe.
    Init,

    /// Ingest maintenance record files.
    ///
    /// Each file becomes one document. Documents are extracted (from cache
    /// when the text was seen before) and their failure events embedded.
    Ingest {
        /// Text files to ingest.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Plant the records belong to.
        #[arg(long)]
        plant: String,
    },

    /// Re-run a document whose extraction failed.
    Retry {
        /// Document id.
        id: String,
    },

    /// Manage failure-event embeddings.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Search past failures by similarity.
    Search {
        /// Free-text description of the failure.
        query: String,

        /// Restrict to one plant.
        #[arg(long)]
        plant: Option<String>,

        /// Restrict to one equipment tag.
        #[arg(long)]
        equipment: Option<String>,

        /// Maximum results.
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Detect and inspect recurring failure patterns.
    Patterns {
        #[command(subcommand)]
        action: PatternAction,
    },

    /// Show spend and avoided calls recorded in the cost ledger.
    Costs,

    /// Print the effective configuration.
    Config,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed failure events with a missing or stale vector.
    Pending {
        /// Maximum number of events to embed.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand)]
enum PatternAction {
    /// Run detection once.
    Detect {
        /// Look-back window in days (defaults to patterns.window_days).
        #[arg(long)]
        days: Option<i64>,
    },
    /// List stored patterns.
    List,
    /// Run detection every patterns.interval_secs until Ctrl-C.
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Ingest { files, plant } => commands::run_ingest(&cfg, &files, &plant).await?,
        Commands::Retry { id } => commands::run_retry(&cfg, &id).await?,
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit } => commands::run_embed_pending(&cfg, limit).await?,
        },
        Commands::Search {
            query,
            plant,
            equipment,
            limit,
        } => commands::run_search(&cfg, &query, plant, equipment, limit).await?,
        Commands::Patterns { action } => match action {
            PatternAction::Detect { days } => commands::run_patterns_detect(&cfg, days).await?,
            PatternAction::List => commands::run_patterns_list(&cfg).await?,
            PatternAction::Watch => commands::run_patterns_watch(&cfg).await?,
        },
        Commands::Costs => commands::run_costs(&cfg).await?,
        Commands::Config => commands::run_config(&cfg)?,
    }

    Ok(())
}
