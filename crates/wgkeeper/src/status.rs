//! Live connection status extracted from a `wg show <iface>` dump.
//!
//! The dump is consumed as text; nothing here runs `wg` itself.

use log::debug;
use serde::Serialize;
use std::collections::HashMap;

use crate::size::parse_size;

const PEER_MARKER: &str = "peer:";
const HANDSHAKE_FIELD: &str = "latest handshake:";
const TRANSFER_FIELD: &str = "transfer:";

/// Handshake value reported when a peer never completed one.
pub const NEVER: &str = "Never";
/// Transfer value reported when the dump has no counters for a peer.
pub const ZERO_TRANSFER: &str = "0 B";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Offline,
}

impl PeerStatus {
    /// A handshake within the last minutes means the tunnel is live. `wg`
    /// prints older handshakes in hours or days.
    pub fn from_handshake(value: &str) -> Self {
        if value.contains("second") || value.contains("minute") {
            PeerStatus::Online
        } else {
            PeerStatus::Offline
        }
    }
}

/// Ephemeral per-peer sample; recomputed on every read, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSample {
    pub last_handshake: String,
    pub status: PeerStatus,
    pub transfer_rx: String,
    pub transfer_tx: String,
}

impl Default for ConnectionSample {
    fn default() -> Self {
        Self {
            last_handshake: NEVER.to_string(),
            status: PeerStatus::Offline,
            transfer_rx: ZERO_TRANSFER.to_string(),
            transfer_tx: ZERO_TRANSFER.to_string(),
        }
    }
}

impl ConnectionSample {
    /// Received bytes as an integer; an undecodable magnitude counts as zero.
    pub fn rx_bytes(&self) -> u64 {
        decode_or_zero(&self.transfer_rx)
    }

    /// Sent bytes as an integer; an undecodable magnitude counts as zero.
    pub fn tx_bytes(&self) -> u64 {
        decode_or_zero(&self.transfer_tx)
    }

    fn apply_field(&mut self, line: &str) {
        if let Some(value) = line.strip_prefix(HANDSHAKE_FIELD) {
            let value = value.trim();
            self.status = PeerStatus::from_handshake(value);
            self.last_handshake = value.to_string();
        } else if let Some(value) = line.strip_prefix(TRANSFER_FIELD) {
            if let Some((rx, tx)) = split_transfer(value) {
                self.transfer_rx = rx;
                self.transfer_tx = tx;
            }
        }
    }
}

fn decode_or_zero(text: &str) -> u64 {
    parse_size(text).unwrap_or_else(|e| {
        debug!("Ignoring transfer value: {}", e);
        0
    })
}

/// `1.52 MiB received, 308.04 KiB sent` -> (`1.52 MiB`, `308.04 KiB`).
fn split_transfer(value: &str) -> Option<(String, String)> {
    let (rx, tx) = value.split_once("received,")?;
    let tx = tx.trim();
    let tx = tx.strip_suffix("sent").unwrap_or(tx);
    let (rx, tx) = (rx.trim(), tx.trim());
    if rx.is_empty() || tx.is_empty() {
        return None;
    }
    Some((rx.to_string(), tx.to_string()))
}

fn peer_marker(line: &str) -> Option<&str> {
    line.trim().strip_prefix(PEER_MARKER).map(str::trim)
}

/// Sample for a single peer. The block runs from the exact `peer: <key>`
/// line to the next `peer:` line or the end of the dump. A key missing from
/// the dump yields the default (offline, never, zero transfer) sample.
pub fn extract(dump: &str, public_key: &str) -> ConnectionSample {
    let mut sample = ConnectionSample::default();
    let mut inside = false;
    for line in dump.lines() {
        if let Some(key) = peer_marker(line) {
            if inside {
                break;
            }
            inside = key == public_key;
            continue;
        }
        if inside {
            sample.apply_field(line.trim());
        }
    }
    sample
}

/// Every peer block of a dump in one pass, keyed by public key.
///
/// Equivalent to calling [`extract`] once per key. If a key appears twice,
/// the first block wins.
pub fn parse_dump(dump: &str) -> HashMap<String, ConnectionSample> {
    let mut samples: HashMap<String, ConnectionSample> = HashMap::new();
    let mut current: Option<(String, ConnectionSample)> = None;

    for line in dump.lines() {
        if let Some(key) = peer_marker(line) {
            if let Some((key, sample)) = current.take() {
                samples.entry(key).or_insert(sample);
            }
            current = Some((key.to_string(), ConnectionSample::default()));
        } else if let Some((_, sample)) = current.as_mut() {
            sample.apply_field(line.trim());
        }
    }
    if let Some((key, sample)) = current {
        samples.entry(key).or_insert(sample);
    }

    debug!("Parsed live status for {} peers", samples.len());
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
    const BOB: &str = "TrMvSoP4jYQlY6RIzBgbssQqY3vxI2Pi+y71lOWWXX0=";
    const CAROL: &str = "gN65BkIKy1eCE9pP1wdc8ROUtkHLF2PfAqYdyYBz6EA=";

    fn dump() -> String {
        format!(
            "interface: wg0\n  \
             public key: HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=\n  \
             private key: (hidden)\n  \
             listening port: 51820\n\n\
             peer: {ALICE}\n  \
             endpoint: 203.0.113.7:51820\n  \
             allowed ips: 10.8.0.2/32\n  \
             latest handshake: 1 minute, 12 seconds ago\n  \
             transfer: 1.52 MiB received, 308.04 KiB sent\n\n\
             peer: {BOB}\n  \
             allowed ips: 10.8.0.3/32\n  \
             latest handshake: 3 hours, 2 minutes ago\n  \
             transfer: 12.40 GiB received, 1.01 GiB sent\n\n\
             peer: {CAROL}\n  \
             allowed ips: 10.8.0.4/32\n"
        )
    }

    #[test]
    fn test_extract_online_peer() {
        let sample = extract(&dump(), ALICE);
        assert_eq!(sample.status, PeerStatus::Online);
        assert_eq!(sample.last_handshake, "1 minute, 12 seconds ago");
        assert_eq!(sample.transfer_rx, "1.52 MiB");
        assert_eq!(sample.transfer_tx, "308.04 KiB");
        assert_eq!(sample.tx_bytes(), 315_433);
    }

    #[test]
    fn test_extract_stops_at_next_peer() {
        let sample = extract(&dump(), BOB);
        // "3 hours, 2 minutes ago" still contains "minute"
        assert_eq!(sample.status, PeerStatus::Online);
        assert_eq!(sample.transfer_rx, "12.40 GiB");

        let carol = extract(&dump(), CAROL);
        assert_eq!(carol, ConnectionSample::default());
    }

    #[test]
    fn test_handshake_classification() {
        assert_eq!(PeerStatus::from_handshake("42 seconds ago"), PeerStatus::Online);
        assert_eq!(PeerStatus::from_handshake("5 minutes ago"), PeerStatus::Online);
        assert_eq!(PeerStatus::from_handshake("2 days, 1 hour ago"), PeerStatus::Offline);
    }

    #[test]
    fn test_unknown_key_is_default_sample() {
        let sample = extract(&dump(), "missing");
        assert_eq!(sample.status, PeerStatus::Offline);
        assert_eq!(sample.last_handshake, NEVER);
        assert_eq!(sample.transfer_rx, ZERO_TRANSFER);
        assert_eq!(sample.rx_bytes(), 0);

        assert_eq!(extract("", ALICE), ConnectionSample::default());
    }

    #[test]
    fn test_parse_dump_agrees_with_extract() {
        let text = dump();
        let all = parse_dump(&text);
        assert_eq!(all.len(), 3);
        for key in [ALICE, BOB, CAROL] {
            assert_eq!(all[key], extract(&text, key));
        }
    }
}
