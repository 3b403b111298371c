mod cleanup;
mod context;
mod copy;
mod meta;
mod node;
mod session;
mod volume;
mod wait;
mod workspace;

use std::io::Write as _;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::context::Ctx;
use crate::copy::CopyParams;
use crate::session::{LogsOptions, MountOption, RunOptions};
use crate::volume::{CreateOptions, VolumeRef};

/// Rent GPU machines the simple way: volumes are the disks, sessions are the
/// machines running on them. Volumes are addressed as `<node>/<volume>`.
#[derive(Parser, Debug)]
#[command(name = "garage", version, about, long_about = None)]
struct Cli {
    /// Workspace to operate in (defaults to the kubeconfig's namespace)
    #[arg(long, global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List nodes, volumes, sessions or workspaces
    #[command(subcommand)]
    Get(GetKind),

    /// Create a volume
    #[command(subcommand)]
    Create(CreateKind),

    /// Delete a volume or a session
    #[command(subcommand)]
    Delete(DeleteKind),

    /// Start a GPU session on an OS volume
    Run {
        /// OS volume to boot from, as <node>/<volume>
        volume: String,

        /// Number of GPUs to claim
        #[arg(long, default_value_t = 1)]
        gpus: i64,

        /// Extra volume to mount, as <node>/<volume>:<path> (repeatable)
        #[arg(long = "mount", value_name = "NODE/VOLUME:PATH")]
        mounts: Vec<String>,

        /// Command to run; an interactive shell when omitted
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Start a CPU-only maintenance session on an OS volume
    Edit {
        /// OS volume to boot from, as <node>/<volume>
        volume: String,

        /// Extra volume to mount, as <node>/<volume>:<path> (repeatable)
        #[arg(long = "mount", value_name = "NODE/VOLUME:PATH")]
        mounts: Vec<String>,
    },

    /// Attach a shell to a running session
    Attach {
        /// Volume whose session to attach to, as <node>/<volume>
        volume: String,
    },

    /// Print a session's logs
    Logs {
        /// Volume whose session to read logs from, as <node>/<volume>
        volume: String,

        /// Keep streaming new log lines
        #[arg(short, long)]
        follow: bool,

        /// Only show the last N lines
        #[arg(long, value_name = "N")]
        tail: Option<i64>,
    },

    /// Copy a volume to a new volume, possibly on another node
    Cp {
        /// Source volume, as <node>/<volume>
        source: String,

        /// Destination volume, as <node>/<volume>; must not exist yet
        destination: String,

        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum GetKind {
    /// List worker nodes and their resources
    Nodes,
    /// List volumes in the current workspace
    Volumes,
    /// List sessions in the current workspace
    Sessions,
    /// List workspaces
    Workspaces,
}

#[derive(Subcommand, Debug)]
enum CreateKind {
    /// Create a volume; pass --image (or --os) to make it bootable
    Volume {
        /// Volume to create, as <node>/<volume>
        volume: String,

        /// Requested size, e.g. 50Gi
        #[arg(long)]
        size: Option<String>,

        /// Boot image; makes this an OS volume
        #[arg(long)]
        image: Option<String>,

        /// Shorthand for --image with the default boot image
        #[arg(long, conflicts_with = "image")]
        os: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DeleteKind {
    /// Delete a volume (refused while it has a session)
    Volume {
        /// Volume to delete, as <node>/<volume>
        volume: String,
    },
    /// Delete a session, leaving its volumes intact
    Session {
        /// Volume whose session to delete, as <node>/<volume>
        volume: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let ctx = match Ctx::connect(cli.namespace).await {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("Error: failed to connect to cluster: {err:#}");
            std::process::exit(1);
        }
    };
    cleanup::install_interrupt_handler(ctx.cleanup.clone(), ctx.cancel.clone());

    if let Err(err) = dispatch(&ctx, cli.command).await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn dispatch(ctx: &Ctx, command: Command) -> Result<()> {
    match command {
        Command::Get(kind) => get(ctx, kind).await,
        Command::Create(CreateKind::Volume {
            volume,
            size,
            image,
            os,
        }) => {
            let vref = VolumeRef::parse(&volume)?;
            let image = image.or_else(|| os.then(|| meta::DEFAULT_BOOT_IMAGE.to_string()));
            let bootable = image.is_some();
            volume::create(ctx, &vref, CreateOptions { size, image }).await?;
            if bootable {
                println!("OS volume {vref} created");
            } else {
                println!("Volume {vref} created");
            }
            Ok(())
        }
        Command::Delete(DeleteKind::Volume { volume }) => {
            let vref = VolumeRef::parse(&volume)?;
            volume::delete(ctx, &vref).await?;
            println!("Volume {vref} deleted");
            Ok(())
        }
        Command::Delete(DeleteKind::Session { volume }) => {
            let vref = VolumeRef::parse(&volume)?;
            session::stop(ctx, &vref).await?;
            println!("Session on {vref} deleted");
            Ok(())
        }
        Command::Run {
            volume,
            gpus,
            mounts,
            command,
        } => {
            let vref = VolumeRef::parse(&volume)?;
            let mounts = parse_mounts(&mounts)?;
            let interactive = command.is_empty();
            let start = session::run(
                ctx,
                &vref,
                RunOptions {
                    gpus,
                    command,
                    mounts,
                },
            )
            .await?;
            if start.existing {
                println!("Session on {vref} is already running, attaching...");
            } else {
                println!("Session on {vref} started");
            }
            if interactive || start.existing {
                session::attach(ctx, &vref).await?;
            } else {
                println!("Follow it with: garage logs {vref} --follow");
            }
            Ok(())
        }
        Command::Edit { volume, mounts } => {
            let vref = VolumeRef::parse(&volume)?;
            let mounts = parse_mounts(&mounts)?;
            let start = session::edit(ctx, &vref, mounts).await?;
            if start.existing {
                println!("Session on {vref} is already running, attaching...");
            }
            session::attach(ctx, &vref).await
        }
        Command::Attach { volume } => {
            let vref = VolumeRef::parse(&volume)?;
            session::attach(ctx, &vref).await
        }
        Command::Logs {
            volume,
            follow,
            tail,
        } => {
            let vref = VolumeRef::parse(&volume)?;
            session::logs(ctx, &vref, LogsOptions { follow, tail }).await
        }
        Command::Cp {
            source,
            destination,
            force,
        } => {
            let src = VolumeRef::parse(&source)?;
            let dst = VolumeRef::parse(&destination)?;
            if !force {
                confirm_copy(&src, &dst)?;
            }
            copy::copy(ctx, &src, &dst, CopyParams::default()).await
        }
    }
}

async fn get(ctx: &Ctx, kind: GetKind) -> Result<()> {
    match kind {
        GetKind::Nodes => {
            let nodes = node::list_workers(ctx).await?;
            println!(
                "{:<20} {:<16} {:>5} {:>8} {:>5}  {}",
                "NAME", "GROUP", "CPU", "MEMORY", "GPUS", "STATUS"
            );
            for n in nodes {
                println!(
                    "{:<20} {:<16} {:>5} {:>8} {:>5}  {}",
                    n.name,
                    dash_if_empty(&n.group),
                    n.cpu_cores,
                    format!("{}Gi", n.memory_bytes >> 30),
                    n.gpus,
                    if n.ready { "Ready" } else { "NotReady" },
                );
            }
            Ok(())
        }
        GetKind::Volumes => {
            let volumes = volume::list(ctx).await?;
            println!(
                "{:<32} {:<14} {:>8}  {:<40} {}",
                "NAME", "STATUS", "SIZE", "IMAGE", "AGE"
            );
            for v in volumes {
                println!(
                    "{:<32} {:<14} {:>8}  {:<40} {}",
                    format!("{}/{}", v.node, v.volume),
                    v.status,
                    v.size,
                    v.image.as_deref().unwrap_or("-"),
                    v.age,
                );
            }
            Ok(())
        }
        GetKind::Sessions => {
            let sessions = session::list(ctx).await?;
            println!(
                "{:<32} {:<6} {:<12} {:>5}  {}",
                "NAME", "MODE", "STATUS", "GPUS", "AGE"
            );
            for s in sessions {
                println!(
                    "{:<32} {:<6} {:<12} {:>5}  {}",
                    format!("{}/{}", s.node, s.volume),
                    s.mode,
                    s.status,
                    s.gpus,
                    s.age,
                );
            }
            Ok(())
        }
        GetKind::Workspaces => {
            let workspaces = workspace::list(ctx).await?;
            println!("{:<24} {}", "NAME", "NODE GROUP");
            for ws in workspaces {
                println!("{:<24} {}", ws.name, dash_if_empty(&ws.node_group));
            }
            Ok(())
        }
    }
}

fn parse_mounts(args: &[String]) -> Result<Vec<MountOption>> {
    args.iter().map(|arg| MountOption::parse(arg)).collect()
}

/// Copies are slow and create a real volume, so require the user to type the
/// destination path back before proceeding.
fn confirm_copy(src: &VolumeRef, dst: &VolumeRef) -> Result<()> {
    println!("This will copy all data from {src} into a new volume {dst}.");
    print!("Type the destination volume path to confirm: ");
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    if line.trim() != dst.to_string() {
        bail!("confirmation did not match {dst}, aborting");
    }
    Ok(())
}

fn dash_if_empty(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}
