//! Cumulative per-client traffic that survives counter resets.
//!
//! `wg` counters start from zero whenever the interface is recreated. The
//! ledger remembers the last raw sample per client and, when a sample goes
//! backwards, banks the previous value before adding the new one. A reset
//! followed by more traffic than was banked within a single sampling gap is
//! indistinguishable from no reset; that delta is lost.

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Persisted counters for one client name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRecord {
    #[serde(default)]
    pub accumulated_rx: u64,
    #[serde(default)]
    pub accumulated_tx: u64,
    #[serde(default)]
    pub last_rx: u64,
    #[serde(default)]
    pub last_tx: u64,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

/// Totals reported for one observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficTotals {
    pub rx: u64,
    pub tx: u64,
}

/// Fold one counter sample into the banked amount.
fn absorb(accumulated: &mut u64, last: u64, now: u64) -> u64 {
    if now < last {
        *accumulated = accumulated.saturating_add(last);
    }
    accumulated.saturating_add(now)
}

impl TrafficRecord {
    /// Apply a raw sample and return the cumulative totals.
    pub fn observe(&mut self, rx_now: u64, tx_now: u64, now: DateTime<Utc>) -> TrafficTotals {
        let rx_reset = rx_now < self.last_rx;
        let tx_reset = tx_now < self.last_tx;
        let totals = TrafficTotals {
            rx: absorb(&mut self.accumulated_rx, self.last_rx, rx_now),
            tx: absorb(&mut self.accumulated_tx, self.last_tx, tx_now),
        };
        if rx_reset || tx_reset {
            info!(
                "Counter reset detected (rx {} -> {}, tx {} -> {})",
                self.last_rx, rx_now, self.last_tx, tx_now
            );
        }
        self.last_rx = rx_now;
        self.last_tx = tx_now;
        self.last_update = Some(now);
        totals
    }
}

/// All traffic records, keyed by resolved client name.
///
/// Loaded once per client-list read and saved once after every observation
/// of that read has been applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrafficLedger {
    records: BTreeMap<String, TrafficRecord>,
}

impl TrafficLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample for `name`, creating its record on first sight.
    pub fn observe(
        &mut self,
        name: &str,
        rx_now: u64,
        tx_now: u64,
        now: DateTime<Utc>,
    ) -> TrafficTotals {
        let record = self.records.entry(name.to_string()).or_default();
        let totals = record.observe(rx_now, tx_now, now);
        debug!("Traffic for {}: rx={} tx={}", name, totals.rx, totals.tx);
        totals
    }

    pub fn get(&self, name: &str) -> Option<&TrafficRecord> {
        self.records.get(name)
    }

    /// Drop the record of a deleted client.
    pub fn remove(&mut self, name: &str) -> Option<TrafficRecord> {
        let removed = self.records.remove(name);
        if removed.is_some() {
            info!("Removed traffic record for {}", name);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TrafficRecord)> {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_totals_survive_reset() {
        let mut ledger = TrafficLedger::new();
        let samples = [(100, 50), (300, 120), (50, 10), (80, 40)];
        let totals: Vec<_> = samples
            .iter()
            .enumerate()
            .map(|(i, (rx, tx))| ledger.observe("alice", *rx, *tx, at(i as i64)))
            .collect();

        assert_eq!(totals[0], TrafficTotals { rx: 100, tx: 50 });
        assert_eq!(totals[1], TrafficTotals { rx: 300, tx: 120 });
        // reset: 300/120 banked
        assert_eq!(totals[2], TrafficTotals { rx: 350, tx: 130 });
        assert_eq!(totals[3], TrafficTotals { rx: 380, tx: 160 });

        for pair in totals.windows(2) {
            assert!(pair[1].rx >= pair[0].rx);
            assert!(pair[1].tx >= pair[0].tx);
            assert!(pair[1].rx + pair[1].tx >= pair[0].rx + pair[0].tx);
        }

        let record = ledger.get("alice").unwrap();
        assert_eq!(record.accumulated_rx, 300);
        assert_eq!(record.last_rx, 80);
        assert_eq!(record.last_update, Some(at(3)));
    }

    #[test]
    fn test_repeated_resets() {
        let mut record = TrafficRecord::default();
        let mut previous = 0;
        for (i, rx) in [500u64, 20, 700, 5, 5, 900].iter().enumerate() {
            let total = record.observe(*rx, 0, at(i as i64)).rx;
            assert!(total >= previous, "total went from {} to {}", previous, total);
            previous = total;
        }
        // banked 500 + 700, then 900 live
        assert_eq!(previous, 2100);
    }

    #[test]
    fn test_independent_directions() {
        let mut record = TrafficRecord::default();
        record.observe(1000, 10, at(0));
        let totals = record.observe(2000, 5, at(1));
        assert_eq!(totals, TrafficTotals { rx: 2000, tx: 15 });
        assert_eq!(record.accumulated_rx, 0);
        assert_eq!(record.accumulated_tx, 10);
    }

    #[test]
    fn test_saturates_instead_of_overflowing() {
        let mut record = TrafficRecord {
            accumulated_rx: u64::MAX - 1,
            last_rx: 10,
            ..Default::default()
        };
        let totals = record.observe(1, 0, at(0));
        assert_eq!(totals.rx, u64::MAX);
    }

    #[test]
    fn test_remove_and_serde_shape() {
        let mut ledger = TrafficLedger::new();
        ledger.observe("alice", 1, 2, at(0));
        ledger.observe("bob", 3, 4, at(0));

        let json = serde_json::to_value(&ledger).unwrap();
        assert_eq!(json["bob"]["last_rx"], 3);
        assert_eq!(json["alice"]["accumulated_tx"], 0);

        assert!(ledger.remove("alice").is_some());
        assert!(ledger.remove("alice").is_none());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_loads_records_without_timestamp() {
        let ledger: TrafficLedger =
            serde_json::from_str(r#"{"carol": {"accumulated_rx": 7, "last_rx": 3}}"#).unwrap();
        let record = ledger.get("carol").unwrap();
        assert_eq!(record.accumulated_rx, 7);
        assert_eq!(record.last_update, None);
    }
}
