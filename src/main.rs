//! # codesync CLI
//!
//! ## Usage
//!
//! ```bash
//! codesync --config ./config/codesync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `codesync init` | Create the SQLite database and run schema migrations |
//! | `codesync sync <codebase>` | Incrementally sync one codebase into the vector index |
//! | `codesync status <codebase>` | Show the last synced commit and index state |
//! | `codesync purge <codebase>` | Delete a codebase's vectors and sync state |
//! | `codesync hook register <codebase> --url U` | Register a push webhook with the host |
//! | `codesync serve` | Start the webhook and job-polling HTTP server |
//!
//! Logs go to stderr through `tracing` (`RUST_LOG`, default `info`).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use codesync::app::AppContext;
use codesync::config;
use codesync::migrate;
use codesync::orchestrator::SyncRequest;
use codesync::progress::ProgressMode;
use codesync::server;
use codesync::webhook;

#[derive(Parser)]
#[command(
    name = "codesync",
    about = "Incremental repository-to-vector-index sync",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). See `config/codesync.example.toml`
    /// for a full example.
    #[arg(long, global = true, default_value = "./config/codesync.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to human when stderr is a TTY.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Human,
    Json,
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Sync one codebase into the vector index.
    ///
    /// Only files whose content changed since the last sync are fetched,
    /// chunked and embedded.
    Sync {
        /// Codebase id from `[[repositories]]`.
        codebase: String,

        /// Commit or branch to sync instead of the default branch head.
        #[arg(long = "ref")]
        git_ref: Option<String>,

        /// Ignore the previous sync: purge the codebase and index everything.
        #[arg(long)]
        full: bool,
    },

    /// Show sync state for a codebase.
    Status { codebase: String },

    /// Delete a codebase's vectors and sync state.
    Purge { codebase: String },

    /// Webhook management.
    Hook {
        #[command(subcommand)]
        action: HookAction,
    },

    /// Start the HTTP server.
    Serve,
}

#[derive(Subcommand)]
enum HookAction {
    /// Register a push webhook and store its secret.
    Register {
        codebase: String,
        /// Public base URL of this server; `/webhooks/<codebase>` is appended.
        /// Defaults to `[server].public_url`.
        #[arg(long)]
        url: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;
    let mode = match cli.progress {
        Some(ProgressArg::Human) => ProgressMode::Human,
        Some(ProgressArg::Json) => ProgressMode::Json,
        Some(ProgressArg::Off) => ProgressMode::Off,
        None => ProgressMode::default_for_tty(),
    };

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync {
            codebase,
            git_ref,
            full,
        } => {
            let ctx = AppContext::from_config(&cfg, vec![mode.observer()]).await?;
            let entry = ctx
                .catalog
                .get(&codebase)
                .ok_or_else(|| anyhow::anyhow!("unknown codebase '{}'", codebase))?;
            let report = ctx
                .orchestrator
                .run(SyncRequest::for_entry(&entry).at_ref(git_ref).full(full))
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Status { codebase } => {
            let ctx = AppContext::from_config(&cfg, Vec::new()).await?;
            if ctx.catalog.get(&codebase).is_none() {
                anyhow::bail!("unknown codebase '{}'", codebase);
            }
            let status = ctx.codebase_status(&codebase).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Purge { codebase } => {
            let ctx = AppContext::from_config(&cfg, Vec::new()).await?;
            let deleted = ctx.purge(&codebase).await?;
            println!("Purged {} vectors for '{}'.", deleted, codebase);
        }
        Commands::Hook {
            action: HookAction::Register { codebase, url },
        } => {
            let ctx = AppContext::from_config(&cfg, Vec::new()).await?;
            let base = url
                .or_else(|| cfg.server.public_url.clone())
                .ok_or_else(|| anyhow::anyhow!("--url or [server].public_url is required"))?;
            let hook_url = format!("{}/webhooks/{}", base.trim_end_matches('/'), codebase);
            let creds =
                webhook::register_webhook(
                    &ctx.catalog,
                    ctx.state.as_ref(),
                    &ctx.orchestrator,
                    &codebase,
                    &hook_url,
                )
                .await?;
            println!("Registered webhook {} → {}", creds.hook_id, hook_url);
        }
        Commands::Serve => {
            let ctx = AppContext::from_config(&cfg, Vec::new()).await?;
            server::run_server(ctx).await?;
        }
    }

    Ok(())
}
