//! # Code Bridge CLI (`cbridge`)
//!
//! Talks to the editor companion over its local WebSocket: lists workspace
//! files, fetches contents, ranks apply destinations for a code snippet, and
//! applies changes. `cbridge serve` exposes the same operations to browser
//! clients over a local HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! cbridge --config ./config/cbridge.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cbridge serve` | Start the local HTTP API |
//! | `cbridge files` | List workspace files |
//! | `cbridge get <path>` | Print one file's contents |
//! | `cbridge predict <snippet>` | Rank destinations for a snippet |
//! | `cbridge apply <snippet>` | Confirm a destination and apply |
//! | `cbridge status` | Show connection status |
//! | `cbridge set-port <port>` | Save a new companion port |
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`
//! (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use code_bridge::{commands, config, server};

/// Code Bridge: a command channel between browser assistants and your editor.
#[derive(Parser)]
#[command(
    name = "cbridge",
    about = "Command channel between browser assistants and a local editor companion",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/cbridge.toml`. A missing file means defaults.
    #[arg(long, global = true, default_value = "./config/cbridge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the local HTTP API.
    ///
    /// Binds to `[server].bind`, connects to the companion, and serves until
    /// interrupted.
    Serve,

    /// List the workspace files the companion reports.
    Files,

    /// Print the contents of one workspace file.
    Get {
        /// Workspace-relative file path.
        path: String,
    },

    /// Rank candidate destinations for a code snippet.
    ///
    /// Compares the snippet against the given files, or against every
    /// workspace file when none are given.
    Predict {
        /// The code snippet, or `-` to read it from stdin.
        snippet: String,

        /// Candidate file (repeatable).
        #[arg(long = "file")]
        files: Vec<String>,
    },

    /// Apply a code snippet to a workspace file.
    ///
    /// Without `--to`, ranks destinations and asks which one to use.
    Apply {
        /// The code snippet, or `-` to read it from stdin.
        snippet: String,

        /// Apply straight to this file, skipping prediction.
        #[arg(long)]
        to: Option<String>,

        /// Candidate file (repeatable).
        #[arg(long = "file")]
        files: Vec<String>,

        /// Accept the top-ranked destination without asking.
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Show connection status.
    Status,

    /// Save a new companion port and reconnect to it.
    SetPort {
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Files => {
            commands::run_files(&cfg).await?;
        }
        Commands::Get { path } => {
            commands::run_get(&cfg, &path).await?;
        }
        Commands::Predict { snippet, files } => {
            commands::run_predict(&cfg, &snippet, files).await?;
        }
        Commands::Apply {
            snippet,
            to,
            files,
            yes,
        } => {
            commands::run_apply(&cfg, &snippet, to, files, yes).await?;
        }
        Commands::Status => {
            commands::run_status(&cfg).await?;
        }
        Commands::SetPort { port } => {
            commands::run_set_port(&cfg, port).await?;
        }
    }

    Ok(())
}
