use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing_subscriber::{fmt, EnvFilter};

use mdns_core::{MdnsAdvertiser, MdnsConnector};
use p2pconnect_core::config::validate_service_id;
use p2pconnect_core::{
    Advertiser, ChannelNotifier, ReceiverEvent, ReceiverMachine, ResourceDescriptor,
    SenderMachine, TransferBatch, TransferConfig,
};
use storage::LocalStorage;
use transport_tcp::{TcpAdvertiser, TcpConnector};

mod console;

use console::ConsoleProgress;

#[derive(Parser, Debug)]
#[command(name = "p2pconnect", version, about = "P2P Connect batch transfer")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Data directory for configuration and received files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize this device
    Init {
        /// Name shown to peers
        #[arg(long)]
        device_name: String,

        /// Service id; only peers using the same id see each other
        #[arg(long, default_value = "p2pconnect")]
        service: String,

        /// Port to accept sessions on
        #[arg(long, default_value_t = 9876)]
        port: u16,
    },

    /// Show device information
    Info,

    /// Discover receivers on the local network
    Discover {
        /// Discovery timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// List peers of every service id
        #[arg(long)]
        all: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send files to a peer as one batch
    Send {
        /// Transfer id the receiver is asked to accept
        #[arg(long)]
        transfer_id: Option<String>,

        /// Peer address (host:port); browse over mDNS when omitted
        #[arg(long)]
        peer: Option<String>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,

        /// Files to send, in order
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Wait for incoming transfers
    Receive {
        /// Accept every transfer without asking
        #[arg(long)]
        yes: bool,

        /// Exit after the first transfer finishes
        #[arg(long)]
        once: bool,

        /// Network interface to announce on
        #[arg(long)]
        interface: Option<String>,

        /// Accept sessions on the configured port without announcing over mDNS
        #[arg(long)]
        no_announce: bool,

        /// Seconds to wait for a decision before the transfer is dropped
        #[arg(long)]
        accept_timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".p2pconnect")
    });

    match cli.cmd {
        Commands::Init { device_name, service, port } => {
            validate_service_id(&service)
                .map_err(|reason| anyhow::anyhow!("Invalid service id {:?}: {}", service, reason))?;

            let mut cfg = TransferConfig::default()
                .with_service(service, device_name)
                .with_data_dir(data_dir.clone());
            cfg.listen_port = port;
            cfg.ensure_data_dir()?;
            save_config(&data_dir, &cfg)?;

            println!("✓ Device initialized");
            println!("  Device name: {}", cfg.device_name);
            println!("  Service id: {}", cfg.service_id);
            println!("  Data directory: {}", data_dir.display());
        }

        Commands::Info => {
            let cfg = load_config(&data_dir)?;

            println!("Device Information:");
            println!("  Device name: {}", cfg.device_name);
            println!("  Service id: {}", cfg.service_id);
            println!("  Protocol version: {}", cfg.supported_version);
            println!("  Listen port: {}", cfg.listen_port);
            println!("  Accept timeout: {}s", cfg.accept_timeout_secs);
            println!("  Received files: {}", cfg.incoming_dir().display());
        }

        Commands::Discover { timeout, all, json } => {
            let cfg = load_config(&data_dir)?;
            let timeout = timeout.unwrap_or(cfg.discovery_timeout_secs);
            discover_peers(&cfg, timeout, all, json).await?;
        }

        Commands::Send { transfer_id, peer, json, files } => {
            let cfg = load_config(&data_dir)?;
            let transfer_id = transfer_id.unwrap_or_else(|| default_transfer_id(&cfg));
            send_files(&cfg, transfer_id, peer.as_deref(), &files, json).await?;
        }

        Commands::Receive { yes, once, interface, no_announce, accept_timeout } => {
            let cfg = receive_config(load_config(&data_dir)?, accept_timeout);
            receive_transfers(&cfg, yes, once, interface, no_announce).await?;
        }
    }

    Ok(())
}

fn receive_config(cfg: TransferConfig, accept_timeout: Option<u64>) -> TransferConfig {
    match accept_timeout {
        Some(secs) => cfg.with_accept_timeout(Duration::from_secs(secs)),
        None => cfg,
    }
}

fn save_config(data_dir: &Path, cfg: &TransferConfig) -> Result<()> {
    let cfg_path = data_dir.join("config.json");
    let cfg_json = serde_json::to_string_pretty(cfg)?;
    std::fs::write(&cfg_path, cfg_json)
        .with_context(|| format!("Failed to write {}", cfg_path.display()))?;
    Ok(())
}

fn load_config(data_dir: &Path) -> Result<TransferConfig> {
    let cfg_path = data_dir.join("config.json");
    if !cfg_path.exists() {
        anyhow::bail!("Device not initialized. Run 'p2pconnect init' first.");
    }

    let cfg_json = std::fs::read_to_string(&cfg_path)?;
    let cfg: TransferConfig = serde_json::from_str(&cfg_json)
        .with_context(|| format!("Malformed {}", cfg_path.display()))?;
    cfg.ensure_data_dir()?;
    Ok(cfg)
}

fn default_transfer_id(cfg: &TransferConfig) -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("{}-{}", mdns_core::announce::host_label(&cfg.device_name), secs)
}

fn batch_from_files(transfer_id: String, files: &[PathBuf]) -> Result<TransferBatch> {
    let resources = files
        .iter()
        .map(|path| {
            if !path.is_file() {
                anyhow::bail!("Not a file: {}", path.display());
            }
            ResourceDescriptor::from_path(path)
                .ok_or_else(|| anyhow::anyhow!("Unusable file name: {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(TransferBatch::new(transfer_id, resources))
}

async fn discover_peers(cfg: &TransferConfig, timeout: u64, all: bool, json: bool) -> Result<()> {
    use mdns_core::discover::{browse_blocking, matching_service};
    use mdns_core::{SERVICE_TYPE, TXT_DEVICE, TXT_SERVICE};

    let wait = Duration::from_secs(timeout);
    let mut results = tokio::task::spawn_blocking(move || browse_blocking(SERVICE_TYPE, wait)).await??;
    if !all {
        results = matching_service(results, &cfg.service_id);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        println!("Discovered {} device(s):", results.len());
        for svc in results {
            println!(
                "\n  {} ({}) @ {}:{}",
                svc.txt_value(TXT_DEVICE).unwrap_or(&svc.instance_name),
                svc.txt_value(TXT_SERVICE).unwrap_or("?"),
                svc.host_name,
                svc.port
            );
            println!("    Addresses:");
            for addr in &svc.addresses {
                println!("      - {}", addr);
            }
        }
    }

    Ok(())
}

async fn send_files(
    cfg: &TransferConfig,
    transfer_id: String,
    peer: Option<&str>,
    files: &[PathBuf],
    json: bool,
) -> Result<()> {
    let batch = batch_from_files(transfer_id, files)?;
    println!("Sending {} file(s) as transfer {}", batch.len(), batch.transfer_id);

    let mut sender = SenderMachine::new(cfg.clone(), Arc::new(ConsoleProgress::default()));
    let outcome = match peer {
        Some(peer) => {
            let addr: SocketAddr = tokio::net::lookup_host(peer)
                .await
                .with_context(|| format!("Cannot resolve {}", peer))?
                .next()
                .ok_or_else(|| anyhow::anyhow!("No address for {}", peer))?;
            let connector = TcpConnector::new(addr, cfg.device_name.clone(), cfg.staging_dir());
            sender.send(batch, &connector).await
        }
        None => {
            let connector = MdnsConnector::new(
                cfg.device_name.clone(),
                cfg.staging_dir(),
                cfg.discovery_timeout(),
            );
            sender.send(batch, &connector).await
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    }
    match outcome.into_result() {
        Ok(()) => {
            println!("✓ Transfer complete");
            Ok(())
        }
        Err(e) => anyhow::bail!("Transfer failed ({}): {}", e.kind(), e),
    }
}

async fn receive_transfers(
    cfg: &TransferConfig,
    yes: bool,
    once: bool,
    interface: Option<String>,
    no_announce: bool,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    let tcp = TcpAdvertiser::bind(addr, cfg.device_name.clone(), cfg.staging_dir())
        .await
        .with_context(|| format!("Failed to listen on {}", addr))?;
    let advertiser: Arc<dyn Advertiser> = if no_announce {
        Arc::new(tcp)
    } else {
        Arc::new(MdnsAdvertiser::new(tcp, cfg.device_name.clone(), interface))
    };

    let storage = Arc::new(LocalStorage::new(cfg.data_dir.clone())?);
    let (notifier, mut events) = ChannelNotifier::new();
    let receiver = ReceiverMachine::new(
        cfg.clone(),
        advertiser,
        storage,
        Arc::new(notifier),
        Arc::new(ConsoleProgress::default()),
    )
    .spawn();

    receiver.start(&cfg.service_id).await?;
    println!("✓ Waiting for transfers on port {}", cfg.listen_port);
    println!("  Press Ctrl+C to stop");

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                receiver.stop().await;
                return Ok(());
            }
            event = events.recv() => event,
        };
        let Some(event) = event else {
            return Ok(());
        };

        match event {
            ReceiverEvent::AcceptTransfer { transfer_id } => {
                let accept = yes
                    || console::confirm(format!("Accept transfer {}?", transfer_id)).await?;
                receiver.decide_acceptance(&transfer_id, accept).await;
            }
            ReceiverEvent::TransferComplete(result) => {
                println!("✓ Received transfer {}", result.transfer_id);
                for resource in &result.resources {
                    println!("  {} -> {}", resource.id, resource.uri.display());
                }
                if once {
                    return Ok(());
                }
                receiver.start(&cfg.service_id).await?;
            }
            ReceiverEvent::TransferFailed(err) => {
                tracing::warn!("Transfer failed: {}", err);
                println!("✗ Transfer failed: {}", err);
                if once {
                    anyhow::bail!("Transfer failed: {}", err);
                }
                receiver.start(&cfg.service_id).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn send_command_collects_files_in_order() {
        let cli = Cli::try_parse_from([
            "p2pconnect", "send", "--transfer-id", "t1", "b.txt", "a.txt",
        ])
        .unwrap();
        match cli.cmd {
            Commands::Send { transfer_id, peer, files, .. } => {
                assert_eq!(transfer_id.as_deref(), Some("t1"));
                assert!(peer.is_none());
                assert_eq!(files, [PathBuf::from("b.txt"), PathBuf::from("a.txt")]);
            }
            other => panic!("parsed {:?}", other),
        }
        assert!(Cli::try_parse_from(["p2pconnect", "send"]).is_err());
    }

    #[test]
    fn receive_accept_timeout_overrides_config() {
        let cli = Cli::try_parse_from(["p2pconnect", "receive", "--accept-timeout", "7"]).unwrap();
        let Commands::Receive { accept_timeout, .. } = cli.cmd else {
            panic!("parsed {:?}", cli.cmd);
        };
        assert_eq!(accept_timeout, Some(7));

        let cfg = receive_config(TransferConfig::default(), accept_timeout);
        assert_eq!(cfg.accept_timeout(), Duration::from_secs(7));
        let untouched = receive_config(TransferConfig::default(), None);
        assert_eq!(untouched.accept_timeout_secs, 30);
    }

    #[test]
    fn config_survives_save_and_load() -> Result<()> {
        let temp = TempDir::new()?;
        let cfg = TransferConfig::default()
            .with_service("photos".into(), "Desk".into())
            .with_data_dir(temp.path().to_path_buf());
        save_config(temp.path(), &cfg)?;

        let loaded = load_config(temp.path())?;
        assert_eq!(loaded.service_id, "photos");
        assert_eq!(loaded.device_name, "Desk");
        assert!(loaded.incoming_dir().is_dir());
        Ok(())
    }

    #[test]
    fn uninitialized_data_dir_is_reported() {
        let temp = TempDir::new().unwrap();
        let err = load_config(temp.path()).unwrap_err();
        assert!(err.to_string().contains("p2pconnect init"));
    }

    #[test]
    fn batch_rejects_missing_files() -> Result<()> {
        let temp = TempDir::new()?;
        let present = temp.path().join("a.txt");
        std::fs::write(&present, "a")?;

        let batch = batch_from_files("t1".into(), &[present.clone()])?;
        assert_eq!(batch.resources[0].id, "a.txt");
        assert!(batch_from_files("t1".into(), &[present, temp.path().join("gone")]).is_err());
        Ok(())
    }
}
