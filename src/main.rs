use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ctmirror::client::HttpLogClient;
use ctmirror::config::load_config_from_file;
use ctmirror::logs::{load_known_logs, select_log};
use ctmirror::shard::Archive;
use ctmirror::sync::run_sync;
use ctmirror::torrent::package_shards;

#[derive(Parser)]
#[command(name = "ctmirror", version, about = "Mirror a CT log and republish it over BitTorrent")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Identifier of the log to operate on, as listed in the known-logs file
    #[arg(short = 'u', long = "url")]
    url: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch, verify, shard, and package new entries (the default)
    Auto,
    /// Re-emit torrents, magnets, and the RSS feed from the sealed shards of
    /// an existing archive; never touches the trusted STH
    RebuildTorrents,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config_from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;

    let known = load_known_logs(&config.log_list_file)?;
    let log = select_log(&known, &cli.url, config.batch_size)?;
    let archive = Archive::open(&config.archive_root, &log.name, config.shard_size)?;

    match cli.command.unwrap_or(Command::Auto) {
        Command::Auto => {
            let transport = Arc::new(HttpLogClient::new(&log, config.transport_options())?);

            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, draining in-flight work");
                    signal_cancel.cancel();
                }
            });

            let outcome =
                run_sync(&log, transport, &archive, &config.sync_options(), &cancel).await?;
            info!(
                log = %log.id,
                tree_size = outcome.trusted.tree_size,
                new_entries = outcome.new_entries,
                sealed = outcome.sealed.len(),
                "sync complete"
            );

            if !outcome.sealed.is_empty() {
                let packaged = package_shards(
                    &config.packager_config(),
                    &archive,
                    &log.name,
                    &outcome.sealed,
                )?;
                if packaged.len() < outcome.sealed.len() {
                    // The archive itself is fine; rebuild-torrents will
                    // retry the stragglers.
                    error!(
                        failed = outcome.sealed.len() - packaged.len(),
                        "some shards were not packaged"
                    );
                }
            }
        }
        Command::RebuildTorrents => {
            let manifests = archive.sealed_manifests()?;
            if manifests.is_empty() {
                info!(log = %log.id, "no sealed shards to package");
                return Ok(());
            }
            let packaged =
                package_shards(&config.packager_config(), &archive, &log.name, &manifests)?;
            info!(
                log = %log.id,
                shards = manifests.len(),
                packaged = packaged.len(),
                "torrents rebuilt"
            );
        }
    }

    Ok(())
}
