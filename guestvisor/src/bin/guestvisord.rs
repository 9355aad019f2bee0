//! guestvisord - KVM/QEMU guest orchestration daemon.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use guestvisor::models::parse_size;
use guestvisor::{CallContext, GuestRuntime, Manager, ResizeRequest, VirtConfig};

#[derive(Parser, Debug)]
#[command(name = "guestvisord")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile every local guest, then log lifecycle events until Ctrl-C
    Run,

    /// Boot a guest
    Start { id: String },

    /// Shut a guest down
    Stop {
        id: String,
        /// Skip the graceful shutdown
        #[arg(long)]
        force: bool,
    },

    /// Pause a running guest
    Suspend { id: String },

    /// Resume a paused guest
    Resume { id: String },

    /// Tear a guest down and delete its record
    Destroy {
        id: String,
        /// Ignore the host lock and teardown failures
        #[arg(long)]
        force: bool,
    },

    /// Change CPU, memory or data volumes
    Resize {
        id: String,
        /// New CPU count; 0 keeps the current one
        #[arg(long, default_value_t = 0)]
        cpu: u32,
        /// New memory size, e.g. `4G`
        #[arg(long)]
        memory: Option<String>,
        /// Desired data volume as `<mount_dir>=<size>`; repeatable
        #[arg(long = "volume")]
        volumes: Vec<String>,
    },

    /// Volume snapshots
    #[command(subcommand)]
    Snapshot(SnapshotCommands),

    /// Run a command through the guest agent
    Exec {
        id: String,
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SnapshotCommands {
    /// Snapshot a volume
    Create { id: String, volume: String },
    /// Merge a snapshot into its volume
    Commit {
        id: String,
        volume: String,
        snapshot: String,
    },
    /// Roll a volume back to a snapshot
    Restore {
        id: String,
        volume: String,
        snapshot: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => VirtConfig::load(path).context("failed to load configuration")?,
        None => VirtConfig::default(),
    };
    let config = config.prepare().context("invalid configuration")?;
    let _log_guard = guestvisor::logging::init_logging(&config.log)?;

    let rt = GuestRuntime::open(config).context("failed to open runtime")?;
    let manager = Manager::new(rt);
    let ctx = CallContext::background();

    match cli.command {
        Commands::Run => run(&manager, &ctx).await?,
        Commands::Start { id } => manager.start(&ctx, &id).await?,
        Commands::Stop { id, force } => manager.stop(&ctx, &id, force).await?,
        Commands::Suspend { id } => manager.suspend(&ctx, &id).await?,
        Commands::Resume { id } => manager.resume(&ctx, &id).await?,
        Commands::Destroy { id, force } => {
            let done = manager.destroy(&ctx, &id, force).await?;
            done.await
                .context("teardown task vanished")?
                .with_context(|| format!("failed to tear down {}", id))?;
        }
        Commands::Resize {
            id,
            cpu,
            memory,
            volumes,
        } => {
            let mut req = ResizeRequest {
                cpu,
                memory: memory.as_deref().map(parse_size).transpose()?.unwrap_or(0),
                ..ResizeRequest::default()
            };
            for spec in &volumes {
                req = req.with_volume(spec)?;
            }
            manager.resize(&ctx, &id, req).await?;
        }
        Commands::Snapshot(cmd) => match cmd {
            SnapshotCommands::Create { id, volume } => {
                manager.create_snapshot(&ctx, &id, &volume).await?
            }
            SnapshotCommands::Commit {
                id,
                volume,
                snapshot,
            } => manager.commit_snapshot(&ctx, &id, &volume, &snapshot).await?,
            SnapshotCommands::Restore {
                id,
                volume,
                snapshot,
            } => manager.restore_snapshot(&ctx, &id, &volume, &snapshot).await?,
        },
        Commands::Exec { id, cmd } => {
            let out = manager.execute_command(&ctx, &id, cmd).await?;
            std::io::stdout().write_all(&out.output)?;
            if out.exit_code != 0 {
                std::process::exit(out.exit_code);
            }
        }
    }

    Ok(())
}

async fn run(manager: &Manager, ctx: &CallContext) -> Result<()> {
    let failed = manager.reconcile_all(ctx).await?;
    if !failed.is_empty() {
        tracing::warn!(failed = failed.len(), "Some guests were not reconciled");
    }

    let mut watcher = manager.new_watcher();
    tracing::info!("guestvisord running");
    loop {
        tokio::select! {
            event = watcher.recv() => match event {
                Some(event) => tracing::info!(
                    guest_id = %event.id,
                    kind = %event.kind,
                    action = %event.action,
                    "Guest event"
                ),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    ctx.cancel();
    manager.stop_watchers();
    Ok(())
}
