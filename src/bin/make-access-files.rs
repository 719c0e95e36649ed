//! Generates `authorized_keys` and `attributes.py` from the cluster manager's instances and the
//! per-instance key files.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vps_access::config::{Config, DEFAULT_CONFIG_PATH};
use vps_access::run::{self, RunContext};

#[derive(Parser)]
#[command(name = "make-access-files", about = "Generate SSH access files for VPS instances")]
struct Cli {
    /// Config file, JSON or YAML.
    #[arg(long, env = "MAKE_VPS_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Overrides `keydir` from the config file.
    #[arg(long)]
    keydir: Option<PathBuf>,

    /// Overrides `outdir` from the config file.
    #[arg(long)]
    outdir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Write authorized_keys and attributes.py (the default).
    Generate,

    /// Print the static information the cluster manager has for an instance.
    Info { instance: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(keydir) = cli.keydir {
        config.keydir = keydir;
    }
    if let Some(outdir) = cli.outdir {
        config.outdir = outdir;
    }

    let ctx = RunContext::from_config(config)?;

    match cli.command.unwrap_or(Command::Generate) {
        Command::Generate => {
            let summary = run::run(&ctx).await?;
            info!(
                instances = summary.instances,
                skipped = summary.skipped.len(),
                users = summary.users,
                conflicts = summary.conflicts,
                malformed_lines = summary.malformed_lines,
                "done",
            );
        }
        Command::Info { instance } => {
            let result = run::static_info(&ctx, &instance).await?;
            let rendered = result.render();
            if rendered.is_empty() {
                info!(%instance, "the cluster manager returned no information");
            } else {
                println!("{rendered}");
            }
        }
    }

    Ok(())
}
