//! Add and delete peers on a parsed configuration.
//!
//! Mutations work on a copy and only replace the caller's model once the
//! result is known to be structurally sound, so a failed call never leaves
//! a half-edited model behind.

use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use crate::conf::{self, ConfigModel, PeerBlock, PEER_SECTION};
use crate::error::{KeeperError, Result};
use crate::identity::{self, HeaderLabel};
use crate::keys;

/// Lowest last octet handed out to clients; `.1` is the server by convention.
const FIRST_CLIENT_OCTET: u8 = 2;

/// Address pool derived from the interface `Address`.
///
/// Clients get `/32` host addresses that share the first three octets of the
/// server address. For prefixes of /24 or shorter the pool is `.2`–`.254`;
/// longer prefixes shrink it to the host range of that block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    server: Ipv4Addr,
    prefix_len: u8,
}

impl Subnet {
    /// Parse the first IPv4 entry of an `Address` value such as
    /// `10.8.0.1/24, fd00::1/64`. A missing prefix means /24.
    pub fn from_address(address: &str) -> Result<Self> {
        let entry = address
            .split(',')
            .map(str::trim)
            .find(|e| e.split('/').next().map_or(false, |ip| ip.parse::<Ipv4Addr>().is_ok()))
            .ok_or_else(|| KeeperError::InvalidInterface(format!("no IPv4 address in {:?}", address)))?;

        let (ip, prefix) = match entry.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (entry, None),
        };
        let server: Ipv4Addr = ip
            .parse()
            .map_err(|_| KeeperError::InvalidInterface(format!("bad address {:?}", entry)))?;
        let prefix_len = match prefix {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= 32)
                .ok_or_else(|| KeeperError::InvalidInterface(format!("bad prefix in {:?}", entry)))?,
            None => 24,
        };
        Ok(Self { server, prefix_len })
    }

    pub fn server(&self) -> Ipv4Addr {
        self.server
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn base(&self) -> [u8; 3] {
        let o = self.server.octets();
        [o[0], o[1], o[2]]
    }

    /// Last octets that may be assigned to clients.
    pub fn host_octets(&self) -> RangeInclusive<u8> {
        if self.prefix_len <= 24 {
            return FIRST_CLIENT_OCTET..=254;
        }
        if self.prefix_len > 30 {
            // no room for hosts besides the server
            return RangeInclusive::new(1, 0);
        }
        let network = self.network_octet();
        let broadcast = network | !self.last_octet_mask();
        network.saturating_add(1).max(FIRST_CLIENT_OCTET)..=broadcast - 1
    }

    /// Mask applied to the last octet; zero for prefixes of /24 or shorter.
    fn last_octet_mask(&self) -> u8 {
        if self.prefix_len <= 24 {
            return 0;
        }
        let host_bits = 32 - u32::from(self.prefix_len);
        (0xffu32 << host_bits) as u8
    }

    fn network_octet(&self) -> u8 {
        self.server.octets()[3] & self.last_octet_mask()
    }

    pub fn host(&self, octet: u8) -> Ipv4Addr {
        let [a, b, c] = self.base();
        Ipv4Addr::new(a, b, c, octet)
    }

    /// Last octet of `ip` if it shares the pool's first three octets.
    fn octet_of(&self, ip: Ipv4Addr) -> Option<u8> {
        let o = ip.octets();
        ([o[0], o[1], o[2]] == self.base()).then_some(o[3])
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.base();
        write!(
            f,
            "{}.{}.{}.{}/{}",
            a,
            b,
            c,
            self.network_octet(),
            self.prefix_len.max(24)
        )
    }
}

/// Host addresses (`/32` or bare) among `AllowedIPs` entries.
fn host_addresses(allowed_ips: &[String]) -> impl Iterator<Item = Ipv4Addr> + '_ {
    allowed_ips.iter().filter_map(|entry| {
        let (ip, prefix) = match entry.split_once('/') {
            Some((ip, prefix)) => (ip, prefix),
            None => (entry.as_str(), "32"),
        };
        if prefix.trim() != "32" {
            return None;
        }
        ip.trim().parse().ok()
    })
}

/// Lowest free client address in the pool. Addresses written in keyless
/// blocks count as taken.
pub fn allocate_address(model: &ConfigModel, subnet: &Subnet) -> Result<Ipv4Addr> {
    let mut used: Vec<u8> = model
        .peers
        .iter()
        .map(|p| p.allowed_ips.as_slice())
        .chain(model.inert.iter().map(|b| b.allowed_ips.as_slice()))
        .flat_map(host_addresses)
        .filter_map(|ip| subnet.octet_of(ip))
        .collect();
    if let Some(own) = subnet.octet_of(subnet.server()) {
        used.push(own);
    }

    subnet
        .host_octets()
        .find(|octet| !used.contains(octet))
        .map(|octet| subnet.host(octet))
        .ok_or_else(|| KeeperError::SubnetExhausted {
            subnet: subnet.to_string(),
        })
}

/// Request to add one client.
#[derive(Debug, Clone)]
pub struct NewPeer<'a> {
    /// Desired display name; unsupported characters are dropped.
    pub name: &'a str,
    pub public_key: &'a str,
    pub label: HeaderLabel,
}

/// Outcome of a successful add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddedPeer {
    pub name: String,
    pub address: Ipv4Addr,
    pub public_key: String,
    /// Prefix of the server subnet, used for the client's own `Address`.
    pub prefix_len: u8,
}

/// Append a peer for `request` to the model.
pub fn add_peer(model: &mut ConfigModel, request: NewPeer<'_>) -> Result<AddedPeer> {
    let name = identity::sanitize_name(request.name);
    if name.is_empty() {
        return Err(KeeperError::InvalidName(request.name.to_string()));
    }
    if model.peers.iter().any(|p| p.name == name) {
        return Err(KeeperError::DuplicateName(name));
    }

    let public_key = request.public_key.trim();
    if !keys::is_valid_key(public_key) {
        return Err(KeeperError::InvalidKey(format!("{:?}", request.public_key)));
    }
    if model.peers.iter().any(|p| p.public_key == public_key) {
        return Err(KeeperError::DuplicatePublicKey(public_key.to_string()));
    }

    let address = model
        .interface
        .address
        .as_deref()
        .ok_or_else(|| KeeperError::InvalidInterface("[Interface] has no Address".to_string()))?;
    let subnet = Subnet::from_address(address)?;
    let ip = allocate_address(model, &subnet)?;

    let block = PeerBlock::from_lines(
        vec![request.label.header_line(&name)],
        vec![
            PEER_SECTION.to_string(),
            format!("PublicKey = {}", public_key),
            format!("AllowedIPs = {}/32", ip),
            String::new(),
        ],
    )
    .ok_or_else(|| KeeperError::InvalidKey(public_key.to_string()))?;
    debug_assert_eq!(block.name, name);

    model.push_peer(block);
    info!("Added peer {} at {} ({} peers total)", name, ip, model.peers.len());

    Ok(AddedPeer {
        name,
        address: ip,
        public_key: public_key.to_string(),
        prefix_len: subnet.prefix_len().max(24),
    })
}

/// Index of the first peer `target` designates, in file order.
pub fn find_target(model: &ConfigModel, target: &str) -> Option<usize> {
    match identity::fallback_target(target) {
        Some(suffix) => model
            .peers
            .iter()
            .position(|p| p.fallback_suffix() == suffix),
        None => model
            .peers
            .iter()
            .position(|p| identity::names_peer(&p.comment_lines, target)),
    }
}

pub(crate) fn known_peers(model: &ConfigModel) -> Vec<String> {
    model
        .peers
        .iter()
        .enumerate()
        .map(|(i, p)| format!("Peer {}: {} (key suffix {})", i + 1, p.name, p.fallback_suffix()))
        .collect()
}

/// Remove the first peer matching `target` (a name or `Unknown-<suffix>`)
/// and return it. The model is untouched on error.
pub fn delete_peer(model: &mut ConfigModel, target: &str) -> Result<PeerBlock> {
    let wanted = identity::sanitize_name(target);
    if wanted.is_empty() {
        return Err(KeeperError::InvalidName(target.to_string()));
    }
    let index = find_target(model, &wanted).ok_or_else(|| KeeperError::NotFound {
        target: target.to_string(),
        known: known_peers(model),
    })?;

    let mut next = model.clone();
    let removed = next.remove_peer(index);
    validate(&next)?;

    *model = next;
    info!(
        "Deleted peer {} (key suffix {}), {} peers left",
        removed.name,
        removed.fallback_suffix(),
        model.peers.len()
    );
    Ok(removed)
}

/// Check that the text this model serializes to is still a usable
/// configuration: an interface with `PrivateKey` and `Address`, every peer
/// with `PublicKey` and `AllowedIPs`, and no block gained or lost. Keyless
/// blocks the model already carries are tolerated.
pub fn validate(model: &ConfigModel) -> Result<()> {
    let (reparsed, _) = conf::parse(&model.serialize());
    let mut problems = Vec::new();

    if !reparsed.interface.has_section_header() {
        problems.push("missing [Interface]".to_string());
    }
    if reparsed.interface.private_key.is_none() {
        problems.push("missing PrivateKey".to_string());
    }
    if reparsed.interface.address.is_none() {
        problems.push("missing Address".to_string());
    }
    for block in reparsed.inert.iter().skip(model.inert.len()) {
        problems.push(format!("peer at line {} missing PublicKey", block.line));
    }
    for (i, peer) in reparsed.peers.iter().enumerate() {
        if peer.allowed_ips.is_empty() {
            problems.push(format!("Peer {} missing AllowedIPs", i + 1));
        }
    }
    if reparsed.inert.len() < model.inert.len() {
        problems.push(format!(
            "{} keyless block(s) lost",
            model.inert.len() - reparsed.inert.len()
        ));
    }
    if reparsed.peers.len() != model.peers.len() {
        problems.push(format!(
            "peer count changed from {} to {}",
            model.peers.len(),
            reparsed.peers.len()
        ));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        debug!("Validation failed: {:?}", problems);
        Err(KeeperError::StructuralCorruption { problems })
    }
}

/// How many peers carry each public key.
pub fn key_counts(model: &ConfigModel) -> HashMap<&str, usize> {
    let mut counts = HashMap::new();
    for peer in &model.peers {
        *counts.entry(peer.public_key.as_str()).or_insert(0) += 1;
    }
    counts
}

/// How many peers resolve to each name.
pub fn name_counts(model: &ConfigModel) -> HashMap<&str, usize> {
    let mut counts = HashMap::new();
    for peer in &model.peers {
        *counts.entry(peer.name.as_str()).or_insert(0) += 1;
    }
    counts
}

/// Per-peer breakdown of what each name matcher sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInspection {
    pub index: usize,
    pub raw_block: String,
    pub matches: Vec<(String, String)>,
    pub resolved_name: String,
    pub public_key: String,
    pub public_key_suffix: String,
    pub allowed_ips: Vec<String>,
}

pub fn inspect(model: &ConfigModel) -> Vec<PeerInspection> {
    model
        .peers
        .iter()
        .enumerate()
        .map(|(i, peer)| PeerInspection {
            index: i + 1,
            raw_block: peer.raw_text().trim().to_string(),
            matches: identity::NAME_MATCHERS
                .iter()
                .filter_map(|(kind, matcher)| {
                    peer.comment_lines
                        .iter()
                        .find_map(|l| matcher(l))
                        .map(|name| (kind.to_string(), name.to_string()))
                })
                .collect(),
            resolved_name: peer.name.clone(),
            public_key: peer.public_key.clone(),
            public_key_suffix: peer.fallback_suffix(),
            allowed_ips: peer.allowed_ips.clone(),
        })
        .collect()
}
