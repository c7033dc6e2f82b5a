//! PatchSync CLI
//!
//! Runs the synchronizer or an agent, and offers a few inspection tools.
//!
//! # Commands
//!
//! - `serve` - Follow a git reference and stream patch sets to agents
//! - `agent` - Keep a directory in sync with a synchronizer
//! - `diff` - Show the patch set between two revisions without serving it
//! - `digest` - Print the tree digest of a directory
//! - `token` - Issue an agent token for a shared secret
//! - `rollback` - List deliveries, pin an earlier revision or resume

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// PatchSync: keep remote trees identical to a git reference.
#[derive(Parser)]
#[command(name = "patchsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Write a default configuration file if `--config` does not exist
    #[arg(global = true, long)]
    init_config: bool,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a git reference and stream patch sets to agents
    Serve(commands::serve::ServeArgs),

    /// Keep a directory in sync with a synchronizer
    Agent(commands::agent::AgentArgs),

    /// Show the patch set between two revisions
    Diff {
        /// Git repository
        #[arg(short, long)]
        repo: PathBuf,

        /// Base revision; omit for a full sync
        #[arg(long)]
        from: Option<String>,

        /// Target revision or reference
        #[arg(long, default_value = "HEAD")]
        to: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the tree digest of a directory
    Digest {
        /// Directory to scan
        dir: PathBuf,

        /// List every file with its content hash
        #[arg(short, long)]
        list: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Issue an agent token
    Token {
        /// Shared secret configured on the synchronizer
        #[arg(short, long)]
        secret: String,

        /// Agent the token is issued for
        #[arg(short, long)]
        agent_id: Uuid,
    },

    /// List deliveries, pin an earlier revision or resume following
    Rollback(commands::rollback::RollbackArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve(args) => {
            let file = commands::config::load(cli.config.as_deref(), cli.init_config)?;
            commands::serve::run(file, args).await?;
        }
        Commands::Agent(args) => {
            let file = commands::config::load(cli.config.as_deref(), cli.init_config)?;
            commands::agent::run(file, args).await?;
        }
        Commands::Diff {
            repo,
            from,
            to,
            format,
        } => {
            commands::diff::run(&repo, from.as_deref(), &to, &format)?;
        }
        Commands::Digest { dir, list, format } => {
            commands::digest::run(&dir, list, &format)?;
        }
        Commands::Token { secret, agent_id } => {
            println!("{}", commands::token::issue(&secret, agent_id)?);
        }
        Commands::Rollback(args) => {
            let file = commands::config::load(cli.config.as_deref(), cli.init_config)?;
            commands::rollback::run(file, args)?;
        }
        Commands::Version => {
            println!("PatchSync v{}", env!("CARGO_PKG_VERSION"));
            println!("Protocol version {}", patchsync_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
