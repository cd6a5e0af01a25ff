//! # wgkeeper
//!
//! Safe editing of a WireGuard server's peer list and cumulative traffic
//! accounting for its clients.
//!
//! ## Key Components
//!
//! ### Configuration text
//! - [`ConfigModel`] - Parsed `[Interface]` plus ordered `[Peer]` blocks
//! - [`resolve_name`] - Display name of a peer from its header comment
//! - [`add_peer`] / [`delete_peer`] - Mutations with address allocation and validation
//!
//! ### Live status and traffic
//! - [`extract`] / [`parse_dump`] - Per-peer samples from `wg show`
//! - [`TrafficLedger`] - Totals that survive counter resets
//!
//! ### Orchestration
//! - [`PeerManager`] - Locked, backed-up, rolled-back transactions
//! - [`WgControl`] / [`CliWgControl`] - The running interface
//!
//! ## Example
//!
//! ```rust,ignore
//! use wgkeeper::{
//!     CliWgControl, DirProfileStore, FileConfigStore, JsonTrafficStore, PeerManager, Settings,
//! };
//!
//! let settings = Settings::load_or_default();
//! let manager = PeerManager::new(
//!     FileConfigStore::new(settings.config_path()),
//!     JsonTrafficStore::new(settings.store_path()),
//!     DirProfileStore::new(settings.profile_dir()),
//!     CliWgControl::new(&settings.wireguard.interface, settings.timing.command_timeout()),
//!     settings.manager_options(),
//! );
//!
//! for client in manager.list_clients().await? {
//!     println!("{} {:?} {}", client.name, client.status, client.total_rx_human);
//! }
//! ```

pub mod client;
pub mod conf;
pub mod config;
pub mod error;
pub mod identity;
pub mod keys;
pub mod manager;
pub mod peers;
pub mod size;
pub mod status;
pub mod store;
pub mod traffic;
pub mod wg;

// ============================================================================
// Settings
// ============================================================================

pub use config::{
    ClientSettings, DaemonSettings, Settings, TimingSettings, TrafficSettings, WireguardSettings,
};

// ============================================================================
// Errors
// ============================================================================

pub use error::{KeeperError, Result};

// ============================================================================
// Configuration Model
// ============================================================================

pub use conf::{
    parse, serialize, ConfigModel, InertBlock, InterfaceBlock, ParseReport, PeerBlock,
    SkippedBlock,
};

// ============================================================================
// Identity
// ============================================================================

pub use identity::{fallback_name, resolve_name, sanitize_name, HeaderLabel};

// ============================================================================
// Peer Mutation
// ============================================================================

pub use peers::{add_peer, delete_peer, inspect, validate, AddedPeer, NewPeer, PeerInspection, Subnet};

// ============================================================================
// Live Status
// ============================================================================

pub use status::{extract, parse_dump, ConnectionSample, PeerStatus};

// ============================================================================
// Traffic Accounting
// ============================================================================

pub use size::{format_size, parse_size, UnitFamily};
pub use traffic::{TrafficLedger, TrafficRecord, TrafficTotals};

// ============================================================================
// Stores
// ============================================================================

pub use store::{
    ConfigStore, DirProfileStore, FileConfigStore, JsonTrafficStore, MemoryConfigStore,
    MemoryProfileStore, MemoryTrafficStore, ProfileStore, TrafficStore,
};

// ============================================================================
// Keys and Client Profiles
// ============================================================================

pub use client::{render_client_config, ClientConfig, ClientProfile, RenderedClient};
pub use keys::{is_valid_key, public_from_private, KeyPair};

// ============================================================================
// Manager
// ============================================================================

pub use manager::{
    ClientView, ConfigInspection, DeletedClient, ManagerOptions, PeerManager, ServerInfo,
    ServiceStatus,
};

// ============================================================================
// WireGuard
// ============================================================================

pub use wg::{CliWgControl, WgControl};
