//! broadcast: propagate content between sites of a local network snapshot.
//!
//! # Usage
//!
//! ```bash
//! # Create an empty network with sites 1, 2 and 3
//! broadcast --state network.json init --sites 1,2,3
//!
//! # Broadcast item 10 of site 1 to sites 2 and 3
//! broadcast --state network.json run --site 1 --item 10 --to 2,3
//!
//! # Show the link entry of an item
//! broadcast links --site 1 --item 10
//!
//! # Trash an item and every linked copy
//! broadcast trash --site 1 --item 10
//!
//! # Cut the copy on site 3 loose, leaving its content in place
//! broadcast unlink --site 1 --item 10 --only 3
//! ```

mod commands;

use anyhow::Result;
use broadcast_core::{LinkAction, SiteId};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use commands::{RunFlags, Workspace};

#[derive(Parser, Debug)]
#[command(name = "broadcast")]
#[command(author = "Broadcast Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Multi-site content broadcast tool", long_about = None)]
struct Cli {
    /// Network snapshot (JSON)
    #[arg(long, global = true, default_value = "network.json")]
    state: PathBuf,

    /// Root directory of attachment files
    #[arg(long, global = true, default_value = "uploads")]
    uploads: PathBuf,

    /// Link registry database
    #[arg(long, global = true, default_value = "links.sqlite")]
    registry: PathBuf,

    /// Engine configuration (TOML)
    #[arg(long, global = true, default_value = "broadcast.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write an empty network snapshot
    Init {
        /// Sites to create
        #[arg(long, value_delimiter = ',', default_value = "1")]
        sites: Vec<SiteId>,
    },

    /// Broadcast an item to other sites
    Run {
        #[command(flatten)]
        target: ItemArgs,
        /// Target sites
        #[arg(long, value_delimiter = ',', required = true)]
        to: Vec<SiteId>,
        #[command(flatten)]
        flags: RunFlags,
    },

    /// Show the link entry of an item
    Links {
        #[command(flatten)]
        target: ItemArgs,
    },

    /// Trash an item and its linked copies
    Trash(CascadeArgs),

    /// Restore an item and its linked copies from the trash
    Restore(CascadeArgs),

    /// Delete an item and its linked copies
    Delete(CascadeArgs),

    /// Remove links without touching content
    Unlink(CascadeArgs),
}

#[derive(Args, Debug, Clone, Copy)]
struct ItemArgs {
    /// Site holding the item
    #[arg(long)]
    site: SiteId,
    /// Item ID
    #[arg(long)]
    item: u64,
}

#[derive(Args, Debug, Clone, Copy)]
struct CascadeArgs {
    #[command(flatten)]
    target: ItemArgs,
    /// Limit the cascade to the copy on this site
    #[arg(long)]
    only: Option<SiteId>,
}

fn init_logging(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("broadcast=debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("broadcast=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let workspace = Workspace {
        state: cli.state,
        uploads: cli.uploads,
        registry: cli.registry,
        config: cli.config,
    };

    let output = match cli.command {
        Commands::Init { sites } => blocking(move || workspace.init(&sites)).await?,
        Commands::Run { target, to, flags } => {
            blocking(move || workspace.run(target.site, target.item, &to, flags)).await?
        }
        Commands::Links { target } => {
            blocking(move || workspace.links(target.site, target.item)).await?
        }
        Commands::Trash(args) => cascade(workspace, LinkAction::Trash, args).await?,
        Commands::Restore(args) => cascade(workspace, LinkAction::Restore, args).await?,
        Commands::Delete(args) => cascade(workspace, LinkAction::Delete, args).await?,
        Commands::Unlink(args) => cascade(workspace, LinkAction::Unlink, args).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cascade(
    workspace: Workspace,
    action: LinkAction,
    args: CascadeArgs,
) -> Result<serde_json::Value> {
    blocking(move || {
        workspace.cascade(action, args.target.site, args.target.item, args.only)
    })
    .await
}

/// Run engine work off the async runtime
async fn blocking<F>(f: F) -> Result<serde_json::Value>
where
    F: FnOnce() -> Result<serde_json::Value> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
