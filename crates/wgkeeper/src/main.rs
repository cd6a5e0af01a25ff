use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use wgkeeper::{
    config::Settings, CliWgControl, DirProfileStore, FileConfigStore, JsonTrafficStore,
    PeerManager, PeerStatus,
};

type Manager = PeerManager<FileConfigStore, JsonTrafficStore, DirProfileStore, CliWgControl>;

fn load_settings(args: &Args) -> Settings {
    if let Some(path) = &args.config {
        Settings::load(path).unwrap_or_else(|e| {
            eprintln!(
                "Failed to load settings from {:?}: {:#}. Using defaults.",
                path, e
            );
            Settings::default()
        })
    } else {
        Settings::load_or_default()
    }
}

fn build_manager(settings: &Settings) -> Manager {
    let wg = CliWgControl::new(
        &settings.wireguard.interface,
        settings.timing.command_timeout(),
    )
    .with_binaries(&settings.wireguard.wg_bin, &settings.wireguard.wg_quick_bin);

    PeerManager::new(
        FileConfigStore::new(settings.config_path()),
        JsonTrafficStore::new(settings.store_path()),
        DirProfileStore::new(settings.profile_dir()),
        wg,
        settings.manager_options(),
    )
}

#[derive(Parser, Debug)]
#[command(
    name = "wgkeeper",
    version,
    about = "Manage the clients of a WireGuard server",
    long_about = "wgkeeper\n\n\
        Adds and removes clients in a WireGuard server configuration without\n\
        disturbing hand-written content, and keeps per-client traffic totals\n\
        that survive interface restarts.\n\n\
        Examples:\n  \
          wgkeeper list\n  \
          wgkeeper add laptop\n  \
          wgkeeper config laptop --out laptop.conf\n  \
          wgkeeper delete Unknown-dyYBz6EA"
)]
struct Args {
    /// Path to settings file
    #[arg(long, short = 'C', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show interface address, port, public key and state
    Info {
        #[arg(long)]
        json: bool,
    },
    /// List clients with live status and cumulative traffic
    List {
        #[arg(long)]
        json: bool,
    },
    /// Add a client, keep its configuration and print it (or copy it out)
    Add {
        name: String,
        /// Also write the client configuration here
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Print (or copy out) the saved configuration of a client
    Config {
        name: String,
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },
    /// Delete a client by name or Unknown-<key suffix>
    Delete { target: String },
    /// Show how each peer block is parsed and named
    Inspect {
        #[arg(long)]
        json: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn write_client_file(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context(format!("Failed to create {:?}", parent))?;
    }
    fs::write(path, text).context(format!("Failed to write {:?}", path))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context(format!("Failed to restrict permissions of {:?}", path))?;
    }
    Ok(())
}

async fn run(command: Command, manager: &Manager) -> Result<()> {
    match command {
        Command::Info { json } => {
            let info = manager.server_info().await?;
            if json {
                return print_json(&info);
            }
            println!("Interface:   {}", info.interface);
            println!("Address:     {}", info.address.as_deref().unwrap_or("N/A"));
            println!(
                "Listen port: {}",
                info.listen_port.map_or("N/A".to_string(), |p| p.to_string())
            );
            println!("Public key:  {}", info.public_key.as_deref().unwrap_or("N/A"));
            println!("Peers:       {}", info.peer_count);
            println!("Status:      {:?}", info.status);
        }
        Command::List { json } => {
            let clients = manager.list_clients().await?;
            if json {
                return print_json(&clients);
            }
            println!(
                "{:<20} {:<15} {:<8} {:<28} {:>12} {:>12}",
                "NAME", "IP", "STATUS", "HANDSHAKE", "TOTAL RX", "TOTAL TX"
            );
            for c in &clients {
                let status = match c.status {
                    PeerStatus::Online => "online",
                    PeerStatus::Offline => "offline",
                };
                let marker = if c.is_duplicate {
                    format!(" (duplicate x{})", c.duplicate_count)
                } else {
                    String::new()
                };
                println!(
                    "{:<20} {:<15} {:<8} {:<28} {:>12} {:>12}{}",
                    c.name,
                    c.ip.as_deref().unwrap_or("-"),
                    status,
                    c.last_handshake,
                    c.total_rx_human,
                    c.total_tx_human,
                    marker
                );
            }
        }
        Command::Add { name, out, json } => {
            let added = manager.add_client(&name).await?;
            if let Some(path) = manager.profiles().path_for(&added.name) {
                info!("Client configuration kept in {:?}", path);
            }
            if let Some(path) = &out {
                write_client_file(path, &added.config)?;
                info!("Client configuration copied to {:?}", path);
            }
            if json {
                return print_json(&added);
            }
            match out {
                Some(path) => println!("Added {} at {} ({:?})", added.name, added.address, path),
                None => print!("{}", added.config),
            }
        }
        Command::Config { name, out } => {
            let text = manager.client_config(&name).await?;
            match out {
                Some(path) => {
                    write_client_file(&path, &text)?;
                    println!("Wrote {:?}", path);
                }
                None => print!("{}", text),
            }
        }
        Command::Delete { target } => {
            let deleted = manager.delete_client(&target).await?;
            println!("Deleted {} ({})", deleted.name, deleted.public_key);
            if !deleted.traffic_pruned {
                info!("No traffic record was pruned for {}", deleted.name);
            }
            if !deleted.profile_removed {
                info!("No saved profile was removed for {}", deleted.name);
            }
        }
        Command::Inspect { json } => {
            let inspection = manager.inspect().await?;
            if json {
                return print_json(&inspection);
            }
            for peer in &inspection.peers {
                println!("=== Peer {} ===", peer.index);
                println!("{}", peer.raw_block);
                for (kind, name) in &peer.matches {
                    println!("  {} match: {}", kind, name);
                }
                println!("  resolved:    {}", peer.resolved_name);
                println!("  key suffix:  {}", peer.public_key_suffix);
                println!("  allowed ips: {}", peer.allowed_ips.join(", "));
            }
            for skipped in &inspection.report.skipped {
                warn!("Skipped block at line {}: {}", skipped.line, skipped.reason);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = load_settings(&args);
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.daemon.log_level.as_str()),
    )
    .init();

    info!(
        "Managing {} ({:?})",
        settings.wireguard.interface,
        settings.config_path()
    );
    let manager = build_manager(&settings);
    run(args.command, &manager).await
}
