//! # Recall Index CLI (`recall`)
//!
//! The `recall` binary is the primary interface for Recall Index. It provides
//! commands for database initialization, agency syncs, run management,
//! barcode and fuzzy lookup, and starting the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! recall --config ./config/recall.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `recall init` | Create the SQLite database and run schema migrations |
//! | `recall agencies` | List configured agencies (or the known catalogue) |
//! | `recall sync <CODE\|all>` | Ingest recalls from one or every agency |
//! | `recall runs` | List recent ingestion runs |
//! | `recall run <id>` | Show one run |
//! | `recall cancel <id>` | Cancel a queued run |
//! | `recall recover` | Fail runs orphaned by a crashed process |
//! | `recall freshness [CODE]` | Last successful sync and staleness |
//! | `recall lookup <code>` | Exact barcode lookup |
//! | `recall similar` | Brand / name / identifier-prefix matching |
//! | `recall search "<query>"` | Free-text search |
//! | `recall get <id>` | Show one recall with its duplicate links |
//! | `recall stats` | Index statistics |
//! | `recall serve` | Start the HTTP server and scheduler |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! recall init --config ./config/recall.toml
//!
//! # Backfill CPSC from the start of 2024
//! recall sync CPSC --since 2024-01-01
//!
//! # Is this barcode recalled?
//! recall lookup 0-12345-67890-5
//!
//! # Fuzzy match when no exact barcode is on record
//! recall similar --brand "Fisher-Price" --name "Rock n Play Sleeper"
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use recall_index::matching::{PageRequest, SimilarQuery};
use recall_index::search::TextSearchArgs;
use recall_index::{config, get, migrate, search, server, sources, stats, sync};

/// Recall Index CLI: multi-agency product recall ingestion and matching.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/recall.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "recall",
    about = "Recall Index: multi-agency product recall ingestion and matching",
    version,
    long_about = "Recall Index ingests recall notices from government safety agencies \
    (CPSC, openFDA, and configurable JSON, RSS, and HTML feeds), normalizes them into one \
    schema, links duplicates across agencies, and answers barcode, fuzzy, and free-text \
    queries via a CLI and JSON HTTP server."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/recall.toml`. Database, ingestion, matching,
    /// server, and agency settings are read from this file.
    #[arg(long, global = true, default_value = "./config/recall.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent.
    Init,

    /// List configured agencies.
    Agencies {
        /// Show the full known-agency catalogue instead; configured
        /// agencies are marked with `*`.
        #[arg(long)]
        catalogue: bool,
    },

    /// Ingest recalls from an agency.
    ///
    /// Starts one run per agency, waits for it to finish, and prints a
    /// summary. By default each run resumes from the watermark of the
    /// agency's last completed run.
    Sync {
        /// Agency code (e.g. `CPSC`), or `all` for every configured agency.
        agency: String,

        /// Ignore the stored watermark and fetch everything the feed offers.
        #[arg(long)]
        full: bool,

        /// Fetch records published at or after this point (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        since: Option<String>,
    },

    /// List recent ingestion runs, newest first.
    Runs {
        #[arg(long)]
        agency: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one ingestion run as JSON.
    Run {
        /// Run UUID.
        id: String,
    },

    /// Cancel an ingestion run.
    ///
    /// Queued runs are cancelled immediately. A running run can only be
    /// cancelled by the process executing it (Ctrl-C in `recall sync`, or
    /// `POST /runs/{id}/cancel` on the server).
    Cancel {
        /// Run UUID.
        id: String,
    },

    /// Mark runs left PENDING or RUNNING by a crashed process as FAILED.
    ///
    /// Only run this while no other process is ingesting into the database.
    Recover,

    /// Show the last successful sync and staleness per agency.
    Freshness {
        /// Limit the report to one agency.
        agency: Option<String>,
    },

    /// Look up recalls carrying an exact barcode (UPC, EAN, GTIN, ISBN).
    Lookup {
        /// The code as printed; spaces and dashes are ignored.
        code: String,
    },

    /// Fuzzy match on brand, product name, and identifier prefix.
    ///
    /// At least one of `--brand`, `--name`, or `--prefix` is required.
    Similar {
        #[arg(long)]
        brand: Option<String>,

        #[arg(long)]
        name: Option<String>,

        /// Leading 6-14 digits of a barcode.
        #[arg(long)]
        prefix: Option<String>,

        #[command(flatten)]
        page: PageArgs,
    },

    /// Free-text search over product, brand, and hazard text.
    Search {
        /// The search query string.
        query: String,

        #[arg(long)]
        agency: Option<String>,

        /// Region code (e.g. `US`, `EU`, `DE`).
        #[arg(long)]
        region: Option<String>,

        /// Only recalls dated on or after this day (YYYY-MM-DD).
        #[arg(long)]
        from: Option<String>,

        /// Only recalls dated on or before this day (YYYY-MM-DD).
        #[arg(long)]
        to: Option<String>,

        #[command(flatten)]
        page: PageArgs,
    },

    /// Retrieve a recall by its ID.
    Get {
        /// Recall ID (`<AGENCY>:<native id>`).
        id: String,
    },

    /// Show index statistics.
    Stats,

    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind`, fails runs orphaned by a previous process,
    /// and starts scheduled syncs for agencies with `schedule_mins`.
    Serve,
}

/// Paging flags shared by `similar` and `search`.
#[derive(clap::Args)]
struct PageArgs {
    /// Maximum number of results to return.
    #[arg(long)]
    limit: Option<usize>,

    #[arg(long, default_value_t = 0)]
    offset: usize,

    /// Continuation cursor printed by a previous page.
    #[arg(long)]
    cursor: Option<String>,
}

impl From<PageArgs> for PageRequest {
    fn from(args: PageArgs) -> Self {
        PageRequest {
            limit: args.limit,
            offset: args.offset,
            cursor: args.cursor,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Agencies { catalogue } => {
            sources::list_agencies(&cfg, catalogue)?;
        }
        Commands::Sync {
            agency,
            full,
            since,
        } => {
            sync::run_sync(&cfg, &agency, full, since).await?;
        }
        Commands::Runs { agency, limit } => {
            sync::run_runs(&cfg, agency, limit).await?;
        }
        Commands::Run { id } => {
            sync::run_run_status(&cfg, &id).await?;
        }
        Commands::Cancel { id } => {
            sync::run_cancel(&cfg, &id).await?;
        }
        Commands::Recover => {
            sync::run_recover(&cfg).await?;
        }
        Commands::Freshness { agency } => {
            sync::run_freshness(&cfg, agency).await?;
        }
        Commands::Lookup { code } => {
            search::run_lookup(&cfg, &code).await?;
        }
        Commands::Similar {
            brand,
            name,
            prefix,
            page,
        } => {
            let query = SimilarQuery {
                brand,
                product_name: name,
                identifier_prefix: prefix,
            };
            search::run_similar(&cfg, query, page.into()).await?;
        }
        Commands::Search {
            query,
            agency,
            region,
            from,
            to,
            page,
        } => {
            let args = TextSearchArgs {
                agency,
                region,
                from,
                to,
            };
            search::run_search(&cfg, &query, args, page.into()).await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, &id).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
