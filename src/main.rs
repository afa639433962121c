//! # Jira Mirror CLI (`jmirror`)
//!
//! ## Usage
//!
//! ```bash
//! jmirror --config ./config/jmirror.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `jmirror init` | Create the SQLite database and run schema migrations |
//! | `jmirror sync` | Incremental sync (full on first run or with `--full`) |
//! | `jmirror search "<query>"` | Search mirrored issues |
//! | `jmirror suggest <prefix>` | Type-ahead suggestions |
//! | `jmirror validate "<query>"` | Check a query for syntax errors |
//! | `jmirror get <KEY>` | Show one issue in full |
//! | `jmirror status` | Counts, last sync, recent runs |
//! | `jmirror cleanup --days N` | Purge old tombstones |
//! | `jmirror test-connection` | Check Jira credentials |
//! | `jmirror serve` | Start the HTTP server |
//! | `jmirror export --format csv` | Write issues as CSV or JSON |
//! | `jmirror discover-fields` | List the instance's custom fields |
//! | `jmirror init-config` | Write a configuration template |
//! | `jmirror validate-config` | Check the configuration file |
//! | `jmirror backup -o <file>` | Snapshot the database |
//! | `jmirror restore -i <file>` | Replace the database with a backup |
//! | `jmirror reset-db --force` | Delete all mirrored data |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use jira_mirror::{
    backup, cleanup, config, config_cmd, export, fields_cmd, get, migrate, search, server, status,
    sync_cmd,
};

/// Jira Mirror: a local, searchable copy of Jira issues.
#[derive(Parser)]
#[command(
    name = "jmirror",
    about = "Jira Mirror: a local, searchable copy of Jira issues",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/jmirror.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent. Also re-derives stored status and priority codes when
    /// the normalization table version changed.
    Init,

    /// Sync issues from Jira.
    ///
    /// Incremental by default; the first sync of a scope is always full.
    /// An interrupted run resumes from its last committed page.
    Sync {
        /// Enumerate the whole scope and tombstone issues no longer present.
        #[arg(long)]
        full: bool,

        /// Sync this project instead of the configured scope.
        #[arg(long)]
        project: Option<String>,

        /// Sync issues matching this JQL instead of the configured scope.
        #[arg(long, conflicts_with = "project")]
        jql: Option<String>,

        /// Only count what would be fetched.
        #[arg(long)]
        dry_run: bool,
    },

    /// Search mirrored issues.
    Search {
        /// The query text.
        query: String,

        /// Query mode: `natural`, `jql`, or `regex`.
        #[arg(long, default_value = "natural")]
        mode: String,

        /// Maximum number of results (default from `[search] default_limit`).
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Include tombstoned issues.
        #[arg(long)]
        include_deleted: bool,

        /// Print the result page as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Type-ahead suggestions for a short prefix.
    Suggest {
        prefix: String,

        #[arg(long, default_value = "natural")]
        mode: String,
    },

    /// Check a query for syntax errors without running it.
    Validate {
        query: String,

        #[arg(long, default_value = "jql")]
        mode: String,
    },

    /// Show one issue, including tombstoned ones.
    Get {
        /// Issue key, e.g. `PROJ-123`.
        key: String,

        #[arg(long)]
        json: bool,
    },

    /// Show issue counts, checkpoints and recent sync runs.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Permanently delete tombstoned issues.
    Cleanup {
        /// Only purge tombstones older than this many days.
        #[arg(long, default_value_t = 30)]
        days: i64,

        /// List what would be purged without deleting.
        #[arg(long)]
        dry_run: bool,
    },

    /// Verify the Jira URL and credentials.
    TestConnection,

    /// Start the HTTP server on `[server] bind`.
    Serve,

    /// Export mirrored issues as CSV or JSON.
    Export {
        /// `csv` or `json`.
        #[arg(long, default_value = "csv")]
        format: String,

        /// Write to this file instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Only export issues matching this query.
        #[arg(long)]
        query: Option<String>,

        /// Mode of `--query`: `natural`, `jql`, or `regex`.
        #[arg(long, default_value = "natural")]
        mode: String,

        /// Include tombstoned issues.
        #[arg(long)]
        include_deleted: bool,
    },

    /// List custom fields defined in Jira and suggest which to mirror.
    DiscoverFields {
        /// Only list fields whose name contains this text.
        #[arg(long)]
        filter: Option<String>,

        /// Write a `[[custom_fields]]` section here (`-` for stdout).
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Write a configuration template to `--config`. Never overwrites.
    InitConfig {
        /// Only the required settings.
        #[arg(long)]
        minimal: bool,
    },

    /// Check the configuration file.
    ValidateConfig {
        /// Print a summary of the effective settings.
        #[arg(long)]
        detailed: bool,
    },

    /// Write a consistent snapshot of the database.
    Backup {
        #[arg(long, short)]
        output: PathBuf,
    },

    /// Replace the database with a backup.
    Restore {
        #[arg(long, short)]
        input: PathBuf,

        /// Replace an existing database.
        #[arg(long)]
        force: bool,
    },

    /// Delete the database and recreate an empty schema.
    ResetDb {
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "jira_mirror=debug"
    } else {
        "jira_mirror=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // These two work on the file itself and may run before it is valid.
    match &cli.command {
        Commands::InitConfig { minimal } => {
            return config_cmd::run_init_config(&cli.config, *minimal)
        }
        Commands::ValidateConfig { detailed } => {
            return config_cmd::run_validate_config(&cli.config, *detailed)
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync {
            full,
            project,
            jql,
            dry_run,
        } => {
            sync_cmd::run_sync(&cfg, full, project.as_deref(), jql.as_deref(), dry_run).await?;
        }
        Commands::Search {
            query,
            mode,
            limit,
            offset,
            include_deleted,
            json,
        } => {
            search::run_search(&cfg, &query, &mode, limit, offset, include_deleted, json).await?;
        }
        Commands::Suggest { prefix, mode } => {
            search::run_suggest(&cfg, &prefix, &mode).await?;
        }
        Commands::Validate { query, mode } => {
            search::run_validate(&cfg, &query, &mode).await?;
        }
        Commands::Get { key, json } => {
            get::run_get(&cfg, &key, json).await?;
        }
        Commands::Status { json } => {
            status::run_status(&cfg, json).await?;
        }
        Commands::Cleanup { days, dry_run } => {
            cleanup::run_cleanup(&cfg, days, dry_run).await?;
        }
        Commands::TestConnection => {
            sync_cmd::run_test_connection(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Export {
            format,
            output,
            query,
            mode,
            include_deleted,
        } => {
            export::run_export(
                &cfg,
                &format,
                output.as_deref(),
                query.as_deref(),
                &mode,
                include_deleted,
            )
            .await?;
        }
        Commands::DiscoverFields { filter, output } => {
            fields_cmd::run_discover_fields(&cfg, filter.as_deref(), output.as_deref()).await?;
        }
        Commands::Backup { output } => {
            backup::run_backup(&cfg, &output).await?;
        }
        Commands::Restore { input, force } => {
            backup::run_restore(&cfg, &input, force).await?;
        }
        Commands::ResetDb { force } => {
            backup::run_reset_db(&cfg, force).await?;
        }
        // Handled before loading.
        Commands::InitConfig { .. } | Commands::ValidateConfig { .. } => {}
    }

    Ok(())
}
