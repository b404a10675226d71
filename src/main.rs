//! `git-drs` command line entry point.
//!
//! Git LFS starts `git-drs transfer` as a custom transfer agent:
//!
//! ```text
//! git config lfs.standalonetransferagent drs
//! git config lfs.customtransfer.drs.path git-drs
//! git config lfs.customtransfer.drs.args transfer
//! git config lfs.customtransfer.drs.concurrent true
//! ```

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use git_drs::config::{self, Config, LogConfig, TransferSettings};
use git_drs::remote::{RemoteClient, RemoteResolver};
use git_drs::{logging, Error, ObjectStore, TransferAgent};

#[derive(Parser, Debug)]
#[command(name = "git-drs", version, about = "Git LFS transfer agent for DRS object stores")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Speak the Git LFS custom transfer protocol on stdin/stdout.
    Transfer {
        /// Config file to read instead of `.git/drs/config.toml`.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Local LFS object directory downloads are written to.
        #[arg(long)]
        objects_dir: Option<PathBuf>,
    },
    /// Print the version and exit.
    Version,
}

fn main() -> anyhow::Result<()> {
    match Args::parse().command {
        Command::Transfer {
            config,
            objects_dir,
        } => transfer(config, objects_dir),
        Command::Version => {
            println!("git-drs {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn transfer(config_path: Option<PathBuf>, objects_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let config_path = config_path.unwrap_or_else(|| PathBuf::from(config::DEFAULT_PATH));
    let loaded = Config::load(&config_path);

    let log_config = match &loaded {
        Ok(config) => config.log.clone(),
        Err(_) => LogConfig::default(),
    };
    if let Err(e) = logging::init(&log_config) {
        eprintln!("git-drs: logging disabled: {}", e);
    }
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "starting transfer agent"
    );

    match loaded {
        Ok(config) => {
            let objects = objects_dir.unwrap_or_else(|| config.lfs_objects_dir.clone());
            let settings = config.transfer.clone();
            serve(config, objects, settings)
        }
        Err(err) => {
            // Still answer the handshake so Git LFS shows why nothing works.
            tracing::error!(error = %err, "failed to load configuration");
            let message = err.to_string();
            let resolver = move |_: &str| -> git_drs::Result<Arc<dyn RemoteClient>> {
                Err(Error::Config(message.clone()))
            };
            let objects = objects_dir.unwrap_or_else(|| Config::default().lfs_objects_dir);
            serve(resolver, objects, TransferSettings::default())
        }
    }
}

fn serve<R: RemoteResolver>(
    resolver: R,
    objects: PathBuf,
    settings: TransferSettings,
) -> anyhow::Result<()> {
    let agent = TransferAgent::new(resolver, ObjectStore::new(&objects), settings);
    let summary = agent.run(io::stdin().lock(), io::stdout())?;
    tracing::debug!(?summary, "transfer agent exiting");
    Ok(())
}
