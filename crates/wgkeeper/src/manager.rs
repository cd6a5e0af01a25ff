//! Transactions over the configuration, the traffic ledger and the live
//! interface.
//!
//! Each store sits behind its own async mutex. Operations that need both
//! take the configuration lock first. Every destructive write is preceded by
//! a backup, and a failed apply puts that backup back. Client profiles are
//! only touched with the configuration lock held.

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use tokio::sync::Mutex;

use crate::client::{render_client_config, ClientConfig, ClientProfile, RenderedClient};
use crate::conf::{ConfigModel, ParseReport, PeerBlock};
use crate::error::{KeeperError, Result};
use crate::identity::{self, HeaderLabel};
use crate::keys::{self, KeyPair};
use crate::peers::{self, NewPeer, PeerInspection};
use crate::size::{format_size, UnitFamily};
use crate::status::{self, ConnectionSample, PeerStatus};
use crate::store::{ConfigStore, ProfileStore, TrafficStore};
use crate::traffic::TrafficTotals;
use crate::wg::WgControl;

/// Whether `wg show` answered for the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub interface: String,
    pub address: Option<String>,
    pub listen_port: Option<u16>,
    pub public_key: Option<String>,
    pub peer_count: usize,
    pub status: ServiceStatus,
}

/// One row of the client list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientView {
    pub name: String,
    pub public_key: String,
    pub ip: Option<String>,
    pub status: PeerStatus,
    pub last_handshake: String,
    pub transfer_rx: String,
    pub transfer_tx: String,
    pub total_rx: u64,
    pub total_tx: u64,
    pub total_rx_human: String,
    pub total_tx_human: String,
    pub is_duplicate: bool,
    /// Peers sharing this row's public key or name, including itself.
    pub duplicate_count: usize,
}

/// Result of removing a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletedClient {
    pub name: String,
    pub public_key: String,
    pub traffic_pruned: bool,
    pub profile_removed: bool,
}

/// Output of [`PeerManager::inspect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigInspection {
    pub peers: Vec<PeerInspection>,
    pub report: ParseReport,
}

/// Knobs that do not come from the stores.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub interface: String,
    pub profile: ClientProfile,
    pub label: HeaderLabel,
    pub units: UnitFamily,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            profile: ClientProfile::default(),
            label: HeaderLabel::default(),
            units: UnitFamily::default(),
        }
    }
}

pub struct PeerManager<C, T, P, W> {
    config: Mutex<C>,
    traffic: Mutex<T>,
    profiles: P,
    wg: W,
    options: ManagerOptions,
}

impl<C, T, P, W> PeerManager<C, T, P, W>
where
    C: ConfigStore,
    T: TrafficStore,
    P: ProfileStore,
    W: WgControl,
{
    pub fn new(config: C, traffic: T, profiles: P, wg: W, options: ManagerOptions) -> Self {
        Self {
            config: Mutex::new(config),
            traffic: Mutex::new(traffic),
            profiles,
            wg,
            options,
        }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn profiles(&self) -> &P {
        &self.profiles
    }

    fn load_model(store: &C) -> Result<(ConfigModel, ParseReport)> {
        let (model, report) = ConfigModel::parse(&store.read()?);
        for skipped in &report.skipped {
            warn!(
                "Peer block at line {} is not a usable peer ({}); leaving it as is",
                skipped.line, skipped.reason
            );
        }
        Ok((model, report))
    }

    /// Model for a mutation; a placeholder configuration is refused.
    fn load_initialized(store: &C) -> Result<ConfigModel> {
        let (model, _) = Self::load_model(store)?;
        if model.is_placeholder() {
            return Err(KeeperError::NotInitialized);
        }
        Ok(model)
    }

    /// Live dump, or an empty one when `wg show` fails.
    async fn live_dump(&self) -> (String, ServiceStatus) {
        match self.wg.show().await {
            Ok(dump) => (dump, ServiceStatus::Active),
            Err(e) => {
                warn!("Live status unavailable for {}: {}", self.options.interface, e);
                (String::new(), ServiceStatus::Inactive)
            }
        }
    }

    pub async fn server_info(&self) -> Result<ServerInfo> {
        let model = {
            let store = self.config.lock().await;
            Self::load_initialized(&store)?
        };
        let public_key = model
            .interface
            .private_key
            .as_deref()
            .and_then(|k| keys::public_from_private(k).ok());
        let (_, status) = self.live_dump().await;

        Ok(ServerInfo {
            interface: self.options.interface.clone(),
            address: model.interface.address.clone(),
            listen_port: model.interface.listen_port,
            public_key,
            peer_count: model.peers.len(),
            status,
        })
    }

    /// Every configured peer with live status and cumulative traffic.
    ///
    /// The ledger is loaded once, updated for every peer and saved once.
    /// A placeholder configuration lists as empty.
    pub async fn list_clients(&self) -> Result<Vec<ClientView>> {
        let config = self.config.lock().await;
        let (model, _) = Self::load_model(&config)?;
        if model.is_placeholder() {
            debug!("Placeholder configuration, no clients to list");
            return Ok(Vec::new());
        }

        let (dump, _) = self.live_dump().await;
        let samples = status::parse_dump(&dump);
        let key_counts = peers::key_counts(&model);
        let name_counts = peers::name_counts(&model);

        let traffic = self.traffic.lock().await;
        let mut ledger = traffic.load()?;
        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut views = Vec::with_capacity(model.peers.len());

        for peer in &model.peers {
            let sample = samples.get(&peer.public_key).cloned().unwrap_or_default();
            let (rx, tx) = (sample.rx_bytes(), sample.tx_bytes());
            let totals = if seen.insert(peer.name.as_str()) {
                ledger.observe(&peer.name, rx, tx, now)
            } else {
                warn!(
                    "Name {} is used by more than one peer; traffic is only accounted for the first",
                    peer.name
                );
                TrafficTotals { rx, tx }
            };

            let duplicates = key_counts
                .get(peer.public_key.as_str())
                .copied()
                .unwrap_or(1)
                .max(name_counts.get(peer.name.as_str()).copied().unwrap_or(1));

            views.push(self.client_view(peer, sample, totals, duplicates));
        }

        traffic.save(&ledger)?;
        Ok(views)
    }

    fn client_view(
        &self,
        peer: &PeerBlock,
        sample: ConnectionSample,
        totals: TrafficTotals,
        duplicates: usize,
    ) -> ClientView {
        let units = self.options.units;
        ClientView {
            name: peer.name.clone(),
            public_key: peer.public_key.clone(),
            ip: peer.display_ip().map(str::to_string),
            status: sample.status,
            last_handshake: sample.last_handshake,
            transfer_rx: sample.transfer_rx,
            transfer_tx: sample.transfer_tx,
            total_rx: totals.rx,
            total_tx: totals.tx,
            total_rx_human: format_size(totals.rx, units),
            total_tx_human: format_size(totals.tx, units),
            is_duplicate: duplicates > 1,
            duplicate_count: duplicates,
        }
    }

    /// Write `model` after a backup, then apply it. Any failure after the
    /// backup restores it.
    async fn commit(&self, store: &C, model: &ConfigModel) -> Result<()> {
        let backup = store.backup()?;
        if let Err(e) = store.write(&model.serialize()) {
            if let Err(restore) = store.restore(&backup) {
                error!("Restoring {} failed: {}", backup.display(), restore);
            }
            return Err(e);
        }
        self.apply_or_rollback(store, &backup).await
    }

    async fn apply_or_rollback(&self, store: &C, backup: &Path) -> Result<()> {
        let reason = match self.wg.apply().await {
            Ok(()) => return Ok(()),
            Err(e) => e.to_string(),
        };
        error!("Applying configuration failed: {}", reason);

        let rolled_back = match store.restore(backup) {
            Ok(()) => {
                if let Err(e) = self.wg.apply().await {
                    warn!("Re-applying the restored configuration failed: {}", e);
                }
                true
            }
            Err(e) => {
                error!("Restoring {} failed: {}", backup.display(), e);
                false
            }
        };
        Err(KeeperError::ApplyFailure {
            reason,
            rolled_back,
        })
    }

    /// Add a client with a fresh key pair and return its profile.
    ///
    /// The profile is saved before the configuration is written: a peer
    /// whose private key was never stored is useless. If the commit fails
    /// the saved profile is removed again.
    pub async fn add_client(&self, name: &str) -> Result<RenderedClient> {
        let config = self.config.lock().await;
        let mut model = Self::load_initialized(&config)?;

        let server_private = model.interface.private_key.as_deref().ok_or_else(|| {
            KeeperError::InvalidInterface("[Interface] has no PrivateKey".to_string())
        })?;
        let server_public_key = keys::public_from_private(server_private)?;
        let listen_port = model.interface.listen_port;

        let pair = KeyPair::generate();
        let added = peers::add_peer(
            &mut model,
            NewPeer {
                name,
                public_key: &pair.public_key,
                label: self.options.label,
            },
        )?;

        let text = render_client_config(
            &self.options.profile,
            &ClientConfig {
                private_key: &pair.private_key,
                address: added.address,
                prefix_len: added.prefix_len,
                server_public_key: &server_public_key,
                listen_port,
            },
        );
        self.profiles.save(&added.name, &text)?;

        if let Err(e) = self.commit(&config, &model).await {
            if let Err(cleanup) = self.profiles.remove(&added.name) {
                error!("Removing the profile of {} failed: {}", added.name, cleanup);
            }
            return Err(e);
        }
        info!("Client {} added at {}", added.name, added.address);
        Ok(RenderedClient {
            name: added.name,
            address: added.address.to_string(),
            config: text,
        })
    }

    /// Remove a client by name or `Unknown-<suffix>` and prune its traffic
    /// record and saved profile.
    ///
    /// The ledger is loaded before the configuration is touched, so an
    /// unreadable ledger aborts the delete instead of leaving a stale record.
    /// Once the configuration is applied the delete has happened: cleanup
    /// failures after that point are logged, not returned.
    pub async fn delete_client(&self, target: &str) -> Result<DeletedClient> {
        let config = self.config.lock().await;
        let traffic = self.traffic.lock().await;

        let mut model = Self::load_initialized(&config)?;
        let mut ledger = traffic.load()?;
        let removed = peers::delete_peer(&mut model, target)?;

        self.commit(&config, &model).await?;

        // A peer still resolving to the same name keeps the record and profile.
        let still_named = model.peers.iter().any(|p| p.name == removed.name);
        let mut traffic_pruned = !still_named && ledger.remove(&removed.name).is_some();
        if traffic_pruned {
            if let Err(e) = traffic.save(&ledger) {
                warn!(
                    "{} was deleted but its traffic record could not be pruned: {}",
                    removed.name, e
                );
                traffic_pruned = false;
            }
        }

        let profile_removed = !still_named
            && match self.profiles.remove(&removed.name) {
                Ok(existed) => existed,
                Err(e) => {
                    warn!(
                        "{} was deleted but its profile could not be removed: {}",
                        removed.name, e
                    );
                    false
                }
            };

        Ok(DeletedClient {
            name: removed.name,
            public_key: removed.public_key,
            traffic_pruned,
            profile_removed,
        })
    }

    /// Saved profile of a configured client, by name or `Unknown-<suffix>`.
    pub async fn client_config(&self, target: &str) -> Result<String> {
        let config = self.config.lock().await;
        let (model, _) = Self::load_model(&config)?;
        let wanted = identity::sanitize_name(target);
        if wanted.is_empty() {
            return Err(KeeperError::InvalidName(target.to_string()));
        }
        let peer = peers::find_target(&model, &wanted)
            .map(|i| &model.peers[i])
            .ok_or_else(|| KeeperError::NotFound {
                target: target.to_string(),
                known: peers::known_peers(&model),
            })?;
        self.profiles
            .load(&peer.name)?
            .ok_or_else(|| KeeperError::MissingProfile(peer.name.clone()))
    }

    /// How the configuration is seen by the parser and name matchers.
    pub async fn inspect(&self) -> Result<ConfigInspection> {
        let config = self.config.lock().await;
        let (model, report) = Self::load_model(&config)?;
        Ok(ConfigInspection {
            peers: peers::inspect(&model),
            report,
        })
    }
}
