//! plsync - playlist audio acquisition
//!
//! Links remote playlists, downloads their songs through the configured
//! acquisition strategies and keeps the local copies in sync.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use plsync_common::config::{
    load_toml_config, resolve_config_path, resolve_root_folder, write_toml_config, TomlConfig,
};
use plsync_common::TrackDescriptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use plsync_dl::integrity::PlaylistIntegrityReport;
use plsync_dl::sync::{BatchReport, PlaylistSyncReport};
use plsync_dl::AppContext;

/// Command-line arguments for plsync
#[derive(Parser, Debug)]
#[command(name = "plsync")]
#[command(about = "Download and keep playlists in sync")]
#[command(version)]
struct Args {
    /// Root folder holding the catalog, settings and music
    #[arg(long, global = true, env = "PLSYNC_ROOT_FOLDER")]
    root: Option<PathBuf>,

    /// Config file (TOML)
    #[arg(long, global = true, env = "PLSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Link a remote playlist and download its songs
    Link {
        url: String,
        #[arg(long)]
        name: Option<String>,
        /// Only record the playlist
        #[arg(long)]
        no_download: bool,
    },
    /// Create an empty custom playlist
    Create { name: String },
    /// Download one track into a playlist
    Add {
        id: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        artist: String,
        #[arg(long)]
        url: String,
        /// Expected duration in seconds
        #[arg(long)]
        duration: Option<u64>,
    },
    /// List playlists
    List,
    /// List the songs of a playlist
    Songs { id: String },
    /// Check a linked playlist for new songs
    Update {
        id: String,
        #[arg(long)]
        download: bool,
    },
    /// Update every linked playlist
    Sync,
    /// Sync repeatedly until interrupted
    Watch {
        /// Seconds between sync passes
        #[arg(long, default_value = "3600")]
        interval: u64,
    },
    /// Verify downloaded files
    Check { id: Option<String> },
    /// Delete corrupted files and download broken or missing songs again
    Fix { id: String },
    /// Delete a playlist and its files
    Delete { id: String },
    /// Delete one song (0-based index as shown by `songs`)
    DeleteSong { id: String, index: usize },
    /// Show or change persisted settings
    Settings {
        #[arg(long, value_enum)]
        auto_download: Option<Toggle>,
        /// Print new songs found by `watch` passes
        #[arg(long, value_enum)]
        notify: Option<Toggle>,
        /// Strategy ids in priority order
        #[arg(long, num_args = 1.., value_delimiter = ',')]
        order: Option<Vec<String>>,
    },
    /// Refresh the proxy pool and show relay and governor status
    Proxies,
    /// Write the effective configuration to a file
    InitConfig { path: Option<PathBuf> },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref());
    let config = load_toml_config(config_path.as_deref()).context("Failed to load configuration")?;
    init_logging(&config)?;

    if let Command::InitConfig { path } = &args.command {
        let Some(target) = path.clone().or(config_path) else {
            bail!("No config path given and no default location available");
        };
        write_toml_config(&config, &target).context("Failed to write configuration")?;
        println!("Wrote {}", target.display());
        return Ok(());
    }

    let root_folder = resolve_root_folder(args.root.as_deref(), &config);
    let ctx = AppContext::build(config, root_folder).context("Failed to initialize")?;

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    run(args.command, &ctx, &cancel).await
}

async fn run(command: Command, ctx: &AppContext, cancel: &CancellationToken) -> Result<()> {
    let sync = &ctx.sync;
    match command {
        Command::Link {
            url,
            name,
            no_download,
        } => {
            let linked = sync.link_playlist(&url, name, !no_download, cancel).await?;
            println!(
                "Linked '{}' ({}) with {} songs",
                linked.record.name,
                linked.record.id,
                linked.remote.songs.len()
            );
            if let Some(batch) = &linked.batch {
                print_batch(batch);
            }
        }
        Command::Create { name } => {
            let record = sync.create_custom(&name).await?;
            println!("Created '{}' ({})", record.name, record.id);
        }
        Command::Add {
            id,
            title,
            artist,
            url,
            duration,
        } => {
            let track = TrackDescriptor::new(title, artist, url, duration)?;
            let batch = sync.add_track(&id, track, cancel).await?;
            print_batch(&batch);
        }
        Command::List => {
            let playlists = sync.list_playlists()?;
            if playlists.is_empty() {
                println!("No playlists");
            }
            for record in playlists {
                let kind = if record.is_custom { "custom" } else { record.source_kind.as_str() };
                println!("{}  {}  [{}]  {} songs", record.id, record.name, kind, record.songs.len());
            }
        }
        Command::Songs { id } => {
            let record = sync.playlist(&id)?;
            println!("{} ({} songs)", record.name, record.songs.len());
            for (i, song) in record.songs.iter().enumerate() {
                println!("{:>4}  {}  [{}]", i, song.display_name(), song.duration());
            }
        }
        Command::Update { id, download } => {
            let report = sync.update_playlist(&id, download, cancel).await?;
            print_sync_report(&report);
        }
        Command::Sync => {
            let summary = sync.sync_all(cancel).await?;
            for report in &summary.playlists {
                print_sync_report(report);
            }
            for (id, error) in &summary.errors {
                println!("{}: sync failed: {}", id, error);
            }
            if summary.cancelled {
                println!("Sync interrupted");
            }
        }
        Command::Watch { interval } => {
            let interval = Duration::from_secs(interval.max(1));
            info!(interval_secs = interval.as_secs(), "Watching playlists");
            loop {
                match sync.sync_all(cancel).await {
                    Ok(summary) => {
                        let notify = ctx.settings.load().map(|s| s.notify_sync_results).unwrap_or(true);
                        for report in summary
                            .playlists
                            .iter()
                            .filter(|r| notify && !r.new_songs.is_empty())
                        {
                            print_sync_report(report);
                        }
                        for (id, error) in &summary.errors {
                            warn!("{}: sync failed: {}", id, error);
                        }
                    }
                    Err(e) => warn!("Sync pass failed: {}", e),
                }
                if !plsync_dl::retry::sleep_or_cancel(interval, cancel).await {
                    break;
                }
            }
        }
        Command::Check { id } => {
            let reports = match id {
                Some(id) => vec![sync.check_integrity(&id).await?],
                None => sync.check_all().await?,
            };
            for report in &reports {
                print_integrity(report);
            }
        }
        Command::Fix { id } => {
            let fix = sync.fix_playlist(&id, cancel).await?;
            println!(
                "Deleted {} corrupted, fixed {}, removed {}",
                fix.deleted_corrupted,
                fix.fixed.len(),
                fix.removed.len()
            );
            for name in &fix.removed {
                println!("  removed: {}", name);
            }
            if fix.cancelled {
                println!("Repair interrupted");
            }
        }
        Command::Delete { id } => {
            let record = sync.delete_playlist(&id).await?;
            println!("Deleted '{}'", record.name);
        }
        Command::DeleteSong { id, index } => {
            let song = sync.delete_song(&id, index).await?;
            println!("Deleted {}", song.display_name());
        }
        Command::Settings {
            auto_download,
            notify,
            order,
        } => {
            if let Some(order) = &order {
                let known = ctx.orchestrator.strategy_ids();
                if let Some(unknown) = order.iter().find(|id| !known.contains(id)) {
                    bail!("Unknown strategy '{}' (available: {})", unknown, known.join(", "));
                }
            }
            let settings = if auto_download.is_some() || notify.is_some() || order.is_some() {
                ctx.settings.update(|s| {
                    if let Some(toggle) = auto_download {
                        s.auto_download_new = matches!(toggle, Toggle::On);
                    }
                    if let Some(toggle) = notify {
                        s.notify_sync_results = matches!(toggle, Toggle::On);
                    }
                    if let Some(order) = order {
                        s.strategy_order = order;
                    }
                })?
            } else {
                ctx.settings.load()?
            };
            println!("auto_download_new: {}", settings.auto_download_new);
            println!("notify:            {}", settings.notify_sync_results);
            println!("strategy_order:    {}", settings.strategy_order.join(", "));
            match settings.last_sync {
                Some(at) => println!("last_sync:         {}", at.to_rfc3339()),
                None => println!("last_sync:         never"),
            }
        }
        Command::Proxies => {
            match &ctx.proxy_pool {
                Some(pool) => {
                    let fetched = pool.refresh().await;
                    let relay = pool.acquire(false).await;
                    let stats = pool.stats().await;
                    println!(
                        "Candidates: {} fetched, {} working, {} excluded",
                        fetched, stats.working, stats.excluded
                    );
                    match relay {
                        Some(address) => println!("Current relay: {}", address),
                        None => println!("No working relay found"),
                    }
                }
                None => println!("Proxy routing disabled"),
            }
            for snapshot in ctx.governors.snapshots() {
                println!(
                    "{}: {} failures, interval {} ms{}",
                    snapshot.endpoint,
                    snapshot.failure_count,
                    snapshot.min_interval.as_millis(),
                    if snapshot.use_proxy { ", proxy routing" } else { "" }
                );
            }
        }
        Command::InitConfig { .. } => {}
    }
    Ok(())
}

fn init_logging(config: &TomlConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let file_layer = match &config.logging.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

/// First Ctrl+C cancels running work between tracks
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, stopping after the current track");
                cancel.cancel();
            }
            Err(e) => warn!("Failed to install Ctrl+C handler: {}", e),
        }
    });
}

fn print_batch(batch: &BatchReport) {
    println!(
        "Downloaded {}, already present {}, failed {}",
        batch.downloaded.len(),
        batch.adopted.len(),
        batch.failed.len()
    );
    for failed in &batch.failed {
        println!("  failed: {}", failed.name);
        for reason in &failed.reasons {
            println!("    {}", reason);
        }
    }
    if batch.cancelled {
        println!("Download interrupted");
    }
}

fn print_sync_report(report: &PlaylistSyncReport) {
    println!(
        "{}: {} new songs, {} missing entries dropped",
        report.playlist_name,
        report.new_songs.len(),
        report.ghosts_pruned
    );
    match &report.batch {
        Some(batch) => print_batch(batch),
        None => {
            for song in &report.new_songs {
                println!("  new: {}", song.display_name());
            }
        }
    }
}

fn print_integrity(report: &PlaylistIntegrityReport) {
    println!(
        "{}: {} valid, {} corrupted, {} missing",
        report.playlist_name,
        report.valid.len(),
        report.corrupted.len(),
        report.missing.len()
    );
    for (song, reason) in &report.corrupted {
        println!("  corrupted: {} ({})", song.display_name(), reason);
    }
    for song in &report.missing {
        println!("  missing: {}", song.display_name());
    }
}
