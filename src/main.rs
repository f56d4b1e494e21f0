use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use mediasync::assets::FsAssetProvider;
use mediasync::config::ClientConfig;
use mediasync::discovery::{dedup_devices, discover};
use mediasync::engine::{
    event_channel, EventReceiver, EventSender, ItemOutcome, MediaSync, SyncClient, SyncEvent,
    SyncReport,
};
use mediasync::ledger::{FileLedger, SyncLedger};
use mediasync::{CancelToken, MediaKind};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mediasync")]
#[command(about = "Sync photos and videos to a LAN media server", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: ~/.config/mediasync/config.toml)
    #[arg(long, global = true, env = "MEDIASYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Server address; discovered on the LAN when omitted
    #[arg(long, global = true, env = "MEDIASYNC_HOST")]
    host: Option<String>,

    /// Server TCP port (overrides config)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Device name announced to the server (overrides config)
    #[arg(long, global = true)]
    device_name: Option<String>,

    /// Ledger file (overrides config)
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,

    /// More logging (-v debug, -vv trace); RUST_LOG wins when set
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Broadcast a discovery query and list servers that answer
    Discover {
        /// Listen window in milliseconds
        #[arg(long)]
        window_ms: Option<u64>,

        /// Subnet broadcast target instead of the local subnet's
        #[arg(long)]
        target: Option<Ipv4Addr>,
    },
    /// Number of media items on the server
    Count,
    /// List one page of server thumbnails
    Thumbs {
        #[arg(long, default_value_t = 0)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        page_size: u32,
    },
    /// Upload individual files from a library directory
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Library root the files' ids are relative to (as `sync` would use)
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Upload everything in a directory the ledger hasn't seen
    Sync {
        dir: PathBuf,
        #[arg(long, value_enum, default_value_t = KindArg::All)]
        kind: KindArg,
    },
    /// Delete media on the server by id
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Download media from the server by id
    Download {
        #[arg(required = true)]
        ids: Vec<String>,
        /// Output directory
        #[arg(long, short, default_value = ".")]
        out: PathBuf,
    },
    /// Inspect or reset the sync ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },
    /// Write the effective configuration to the config file
    InitConfig,
}

#[derive(Subcommand)]
enum LedgerAction {
    List,
    Clear,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Photo,
    Video,
    All,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "mediasync=info",
        1 => "mediasync=debug",
        _ => "mediasync=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<(ClientConfig, Option<PathBuf>)> {
    let path = cli.config.clone().or_else(ClientConfig::default_path);
    let mut config = match &path {
        Some(p) => ClientConfig::load(p).with_context(|| format!("loading {}", p.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(port) = cli.port {
        config.server_port = port;
    }
    if let Some(name) = &cli.device_name {
        config.device_name = name.clone();
    }
    if let Some(ledger) = &cli.ledger {
        config.ledger_path = Some(ledger.clone());
    }
    Ok((config, path))
}

/// Cancel on Ctrl-C.
fn cancel_on_interrupt() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            token.cancel();
        }
    });
    cancel
}

async fn resolve_host(cli: &Cli, config: &ClientConfig, cancel: &CancelToken) -> anyhow::Result<String> {
    if let Some(host) = &cli.host {
        return Ok(host.clone());
    }
    info!("No --host given, discovering servers");
    let devices = dedup_devices(discover(&config.discovery, cancel.clone()).await?);
    match devices.first() {
        Some(device) => {
            if devices.len() > 1 {
                warn!("{} servers answered, using {}", devices.len(), device.name);
            }
            info!("Using {} at {}", device.name, device.ip_address);
            Ok(device.ip_address.to_string())
        }
        None => bail!("no server answered discovery; pass --host"),
    }
}

async fn connect(cli: &Cli, config: &ClientConfig, cancel: &CancelToken) -> anyhow::Result<SyncClient> {
    let host = resolve_host(cli, config, cancel).await?;
    let client = SyncClient::connect(&host, config)
        .await
        .with_context(|| format!("connecting to {}:{}", host, config.server_port))?;
    Ok(client)
}

fn bytes_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb
}

/// Render sync events until the sender side is dropped.
async fn show_progress(mut events: EventReceiver) {
    let pb = bytes_bar(0);
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::Started { file_id, total } => {
                pb.reset();
                pb.set_length(total);
                pb.set_message(file_id);
            }
            SyncEvent::Progress { sent, total, .. } => {
                pb.set_length(total);
                pb.set_position(sent);
            }
            SyncEvent::Uploaded { file_id } => pb.println(format!("  uploaded {}", file_id)),
            SyncEvent::Skipped { .. } => {}
            SyncEvent::Failed { file_id, error } => {
                pb.println(format!("  failed   {}: {}", file_id, error))
            }
        }
    }
    pb.finish_and_clear();
}

/// Upload the given files as assets of `provider`, recording each in the ledger.
async fn upload_files(
    sync: &mut MediaSync<'_>,
    provider: &FsAssetProvider,
    files: &[PathBuf],
    cancel: &CancelToken,
    events: &EventSender,
) -> anyhow::Result<SyncReport> {
    let mut report = SyncReport::default();
    for path in files {
        let asset = match provider.asset_at(path).await {
            Ok(asset) => asset,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                report.add(ItemOutcome::Failed);
                continue;
            }
        };
        report.add(sync.sync_asset(&asset, cancel, Some(events)).await?);
    }
    Ok(report)
}

fn open_ledger(config: &ClientConfig) -> anyhow::Result<FileLedger> {
    let path = config.ledger_path()?;
    FileLedger::open(&path).with_context(|| format!("opening ledger {}", path.display()))
}

async fn write_download(out: &Path, id: &str, data: &[u8]) -> anyhow::Result<PathBuf> {
    let name = Path::new(id)
        .file_name()
        .map(|n| n.to_os_string())
        .with_context(|| format!("unusable media id {:?}", id))?;
    let path = out.join(name);
    tokio::fs::write(&path, data)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let (mut config, config_path) = load_config(&cli)?;
    let cancel = cancel_on_interrupt();

    match &cli.command {
        Commands::Discover { window_ms, target } => {
            if let Some(ms) = window_ms {
                config.discovery.window_ms = *ms;
            }
            if target.is_some() {
                config.discovery.target_override = *target;
            }
            let devices = dedup_devices(discover(&config.discovery, cancel).await?);
            if devices.is_empty() {
                println!("No servers found");
            }
            for device in devices {
                println!("{}\t{}", device.name, device.ip_address);
            }
        }
        Commands::Count => {
            let mut client = connect(&cli, &config, &cancel).await?;
            let count = client.get_media_count(&cancel).await?;
            println!("{}", count);
        }
        Commands::Thumbs { page, page_size } => {
            let mut client = connect(&cli, &config, &cancel).await?;
            let thumbs = client.get_media_thumb_list(*page, *page_size, &cancel).await?;
            for thumb in &thumbs {
                println!("{}\t{}\t{} bytes", thumb.id, thumb.media, thumb.data.len());
            }
            info!("{} thumbnails on page {}", thumbs.len(), page);
        }
        Commands::Upload { files, root } => {
            let provider = FsAssetProvider::new(root);
            let mut ledger = open_ledger(&config)?;
            let mut client = connect(&cli, &config, &cancel).await?;
            client.send_sync_start(&config.device_name).await?;

            let (tx, rx) = event_channel();
            let progress = tokio::spawn(show_progress(rx));
            let result = {
                let mut sync = MediaSync::new(&mut client, &provider, &mut ledger);
                upload_files(&mut sync, &provider, files, &cancel, &tx).await
            };
            drop(tx);
            let _ = progress.await;

            let report = result.context("upload failed")?;
            println!(
                "{} uploaded, {} already synced, {} failed",
                report.uploaded, report.skipped, report.failed
            );
            if report.failed > 0 {
                bail!("{} uploads failed", report.failed);
            }
        }
        Commands::Sync { dir, kind } => {
            let provider = FsAssetProvider::new(dir);
            let mut ledger = open_ledger(&config)?;
            let mut client = connect(&cli, &config, &cancel).await?;
            client.send_sync_start(&config.device_name).await?;

            let (tx, rx) = event_channel();
            let progress = tokio::spawn(show_progress(rx));
            let result = {
                let mut sync = MediaSync::new(&mut client, &provider, &mut ledger);
                match kind {
                    KindArg::Photo => sync.sync_kind(MediaKind::Photo, &cancel, Some(&tx)).await,
                    KindArg::Video => sync.sync_kind(MediaKind::Video, &cancel, Some(&tx)).await,
                    KindArg::All => sync.sync_all(&cancel, Some(&tx)).await,
                }
            };
            drop(tx);
            let _ = progress.await;

            let report = result.context("sync failed")?;
            println!(
                "{} uploaded, {} already synced, {} failed",
                report.uploaded, report.skipped, report.failed
            );
            if report.failed > 0 {
                bail!("{} items failed", report.failed);
            }
        }
        Commands::Delete { ids } => {
            let mut client = connect(&cli, &config, &cancel).await?;
            let status = client.delete_media(ids, &cancel).await?;
            println!("{}", status.trim());
        }
        Commands::Download { ids, out } => {
            tokio::fs::create_dir_all(out).await?;
            let mut client = connect(&cli, &config, &cancel).await?;
            let items = client.download_media(ids, &cancel).await?;
            for item in &items {
                let path = write_download(out, &item.id, &item.data).await?;
                println!("{} -> {}", item.id, path.display());
            }
            if items.len() < ids.len() {
                warn!("Server returned {} of {} requested items", items.len(), ids.len());
            }
        }
        Commands::Ledger { action } => {
            let mut ledger = open_ledger(&config)?;
            match action {
                LedgerAction::List => {
                    for record in ledger.all_synced() {
                        println!("{}\t{}\t{}", record.synced_at.to_rfc3339(), record.kind, record.id);
                    }
                }
                LedgerAction::Clear => {
                    let n = ledger.all_synced().len();
                    ledger.clear()?;
                    println!("Cleared {} records", n);
                }
            }
        }
        Commands::InitConfig => {
            let Some(path) = config_path else {
                bail!("no config directory; pass --config");
            };
            config.save(&path)?;
            println!("Wrote {}", path.display());
        }
    }

    Ok(())
}
