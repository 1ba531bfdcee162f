//! Toolcrib Agent - tool crib client
//!
//! Keeps a local copy of the tool crib in a key-value store and mirrors it
//! with the kernel:
//! - `run` polls the server and pushes local edits until Ctrl-C
//! - one-shot commands edit or display the local copy, syncing around it
//! - display commands fall back to the last known state when offline

mod config;
mod kv_store;
mod sync;
mod view;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::AgentConfig;
use kv_store::{KvStore, SNAPSHOT_KEY};
use std::path::PathBuf;
use std::sync::Arc;
use sync::{PullOutcome, PushOutcome, SyncClient, Syncer};
use toolcrib_core::render::{self, PlacementFilter};
use toolcrib_core::{NewPlacement, Store, StoreOptions};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "toolcrib-agent")]
#[command(about = "Tool crib client: local store synced with the kernel")]
struct Cli {
    /// Config file (default: <config dir>/toolcrib-agent/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Kernel URL, overrides config and TOOLCRIB_SERVER_URL
    #[arg(long, global = true)]
    server: Option<String>,
    /// Skip the server, use the local copy only
    #[arg(long, global = true, default_value_t = false)]
    offline: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sync continuously until Ctrl-C
    Run {
        /// Print the tool table after every change
        #[arg(long, default_value_t = false)]
        show: bool,
    },
    /// Pull the server snapshot now
    Refresh,
    /// Push local changes now
    Push,
    /// Show sync bookkeeping
    Status,
    /// Show the cells of a machine
    Cells { machine: String },
    /// Show placed tools grouped by machine
    Table {
        #[arg(long)]
        machine: Option<String>,
        #[arg(long)]
        tool_type: Option<String>,
    },
    /// Place a tool in a cell
    Add {
        #[arg(long)]
        machine: String,
        #[arg(long)]
        tool_type: String,
        #[arg(long, default_value = "")]
        size: String,
        #[arg(long)]
        cell: String,
    },
    /// Remove the tool from a cell
    Delete {
        #[arg(long)]
        machine: String,
        #[arg(long)]
        cell: String,
    },
    /// List machines
    Machines,
    /// List tool types and their sizes
    ToolTypes,
    /// Write the current settings to the config file
    Init,
    /// Forget the local copy; the next pull reloads it from the server
    Reset,
}

async fn build_syncer(config: &AgentConfig) -> Result<Syncer> {
    let data_dir = config.data_dir()?;
    let kv = KvStore::open(&data_dir).with_context(|| format!("opening {}", data_dir.display()))?;
    let store = Store::open(Box::new(kv.snapshot_backend(SNAPSHOT_KEY)), StoreOptions::default())
        .context("opening local store")?;
    let client = SyncClient::new(&config.server_url, config.api_key.clone(), config.request_timeout())?;
    Ok(Syncer::new(Arc::new(store), kv, client))
}

/// Best-effort pull before reading or editing; offline keeps the local copy
async fn refresh_quietly(syncer: &mut Syncer, offline: bool) {
    if offline {
        return;
    }
    if let Err(e) = syncer.pull().await {
        warn!("[sync] server unavailable, using local copy: {e}");
    }
}

async fn push_quietly(syncer: &mut Syncer, offline: bool) {
    if offline {
        return;
    }
    match syncer.push().await {
        Ok(PushOutcome::Accepted { revision }) => info!("[sync] saved on server (revision {revision})"),
        Ok(PushOutcome::Conflict { adopted }) => {
            warn!("[sync] server had newer data (revision {adopted}), local edit discarded")
        }
        Err(e) => warn!("[sync] push failed, change kept locally: {e}"),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = AgentConfig::load(cli.config.as_deref()).await?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Command::Init = cli.command {
        let path = match cli.config {
            Some(p) => p,
            None => AgentConfig::config_file_path()?,
        };
        config.save(&path).await?;
        println!("Wrote {}", path.display());
        return Ok(());
    }
    if let Command::Reset = cli.command {
        let data_dir = config.data_dir()?;
        let kv = KvStore::open(&data_dir).with_context(|| format!("opening {}", data_dir.display()))?;
        if kv.forget_local_copy()? {
            println!("Local copy in {} removed.", data_dir.display());
        } else {
            println!("No local copy in {}.", data_dir.display());
        }
        return Ok(());
    }
    let mut syncer = build_syncer(&config).await?;
    let offline = cli.offline;

    match cli.command {
        Command::Run { show } => {
            info!("Toolcrib agent starting, data in {}", config.data_dir()?.display());
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("cannot listen for Ctrl-C: {e}");
                    std::future::pending::<()>().await;
                }
            };
            syncer
                .run(config.pull_interval(), config.push_interval(), shutdown, |store| {
                    if show {
                        let groups = render::group_by_machine(&store.tools(), chrono::Utc::now());
                        print!("{}", view::render_table(&groups));
                    } else {
                        info!("local copy at revision {}", store.revision());
                    }
                })
                .await?;
        }
        Command::Refresh => match syncer.pull().await? {
            PullOutcome::Applied { revision } => println!("Updated to server revision {revision}."),
            PullOutcome::UpToDate => println!("Already up to date."),
            PullOutcome::Discarded { revision, base } => {
                println!("Ignored server revision {revision} (local copy is at {base}).")
            }
        },
        Command::Push => {
            if !syncer.state().dirty {
                println!("Nothing to push.");
            } else {
                match syncer.push().await? {
                    PushOutcome::Accepted { revision } => println!("Pushed, server at revision {revision}."),
                    PushOutcome::Conflict { adopted } => {
                        println!("Server had newer data; adopted revision {adopted}, local edits dropped.")
                    }
                }
            }
        }
        Command::Status => {
            print!(
                "{}",
                view::render_status(&config.server_url, syncer.state(), syncer.store().revision())
            );
        }
        Command::Cells { machine } => {
            refresh_quietly(&mut syncer, offline).await;
            let snapshot = syncer.store().get_all();
            let options = render::cell_options(&snapshot.machines, &snapshot.tools, &machine);
            print!("{}", view::render_cells(&machine, &options));
        }
        Command::Table { machine, tool_type } => {
            refresh_quietly(&mut syncer, offline).await;
            let filter = PlacementFilter { machine, tool_type };
            let tools = render::filter_placements(&syncer.store().tools(), &filter);
            print!("{}", view::render_table(&render::group_by_machine(&tools, chrono::Utc::now())));
        }
        Command::Add {
            machine,
            tool_type,
            size,
            cell,
        } => {
            refresh_quietly(&mut syncer, offline).await;
            let added = syncer.store().add_placement(NewPlacement {
                machine,
                tool_type,
                tool_size: size,
                cell_number: cell,
            })?;
            syncer.mark_dirty()?;
            if let Some(note) = &added.note {
                println!("Note: {note}");
            }
            let p = &added.placement;
            println!("Placed {} {} in {} cell {}.", p.tool_type, p.tool_size, p.machine, p.cell_number);
            push_quietly(&mut syncer, offline).await;
        }
        Command::Delete { machine, cell } => {
            refresh_quietly(&mut syncer, offline).await;
            let removed = syncer.store().delete_placement(&machine, &cell)?;
            syncer.mark_dirty()?;
            println!("Removed {} from {} cell {}.", removed.tool_type, removed.machine, removed.cell_number);
            push_quietly(&mut syncer, offline).await;
        }
        Command::Machines => {
            refresh_quietly(&mut syncer, offline).await;
            print!("{}", view::render_machines(&syncer.store().machines()));
        }
        Command::ToolTypes => {
            refresh_quietly(&mut syncer, offline).await;
            print!("{}", view::render_tool_types(&syncer.store().tool_types()));
        }
        Command::Init | Command::Reset => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    run(Cli::parse()).await.context("toolcrib-agent failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_add_command() {
        let cli = Cli::parse_from([
            "toolcrib-agent",
            "--offline",
            "add",
            "--machine",
            "M1",
            "--tool-type",
            "End mill",
            "--cell",
            "3",
        ]);
        assert!(cli.offline);
        match cli.command {
            Command::Add { machine, size, cell, .. } => {
                assert_eq!(machine, "M1");
                assert_eq!(size, "");
                assert_eq!(cell, "3");
            }
            _ => panic!("expected add"),
        }
    }
}
