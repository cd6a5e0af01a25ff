//! Transfer-size codec.
//!
//! `wg show` reports transfer counters as human-readable magnitudes such as
//! `1.52 MiB`. Accounting needs integer bytes, display needs the text form.

use serde::Deserialize;

use crate::error::{KeeperError, Result};

/// Unit family used when formatting a byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitFamily {
    /// Powers of 1024 (`KiB`, `MiB`, ...), as printed by `wg`.
    #[default]
    Binary,
    /// Powers of 1000 (`KB`, `MB`, ...).
    Decimal,
}

const BINARY_UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
const DECIMAL_UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

impl UnitFamily {
    fn base(self) -> f64 {
        match self {
            UnitFamily::Binary => 1024.0,
            UnitFamily::Decimal => 1000.0,
        }
    }

    fn units(self) -> &'static [&'static str; 6] {
        match self {
            UnitFamily::Binary => &BINARY_UNITS,
            UnitFamily::Decimal => &DECIMAL_UNITS,
        }
    }
}

/// Multiplier for a unit suffix. Decimal suffixes are accepted in any case
/// (`kB`, `KB`); binary ones tolerate a lowercase `i` form (`kib`).
fn unit_multiplier(unit: &str) -> Option<f64> {
    if unit.is_empty() || unit == "B" || unit.eq_ignore_ascii_case("bytes") {
        return Some(1.0);
    }
    let lower = unit.to_ascii_lowercase();
    let (prefix, family) = if let Some(p) = lower.strip_suffix("ib") {
        (p, UnitFamily::Binary)
    } else if let Some(p) = lower.strip_suffix('b') {
        (p, UnitFamily::Decimal)
    } else {
        return None;
    };
    let exponent = match prefix {
        "k" => 1,
        "m" => 2,
        "g" => 3,
        "t" => 4,
        "p" => 5,
        _ => return None,
    };
    Some(family.base().powi(exponent))
}

/// Parse a magnitude such as `12.3 MiB`, `512 B` or `4.20 GB` into bytes.
///
/// A bare number is taken as bytes. Fractional results are rounded to the
/// nearest byte.
pub fn parse_size(text: &str) -> Result<u64> {
    let trimmed = text.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| KeeperError::InvalidSize(text.to_string()))?;
    let multiplier =
        unit_multiplier(unit.trim()).ok_or_else(|| KeeperError::InvalidSize(text.to_string()))?;

    let bytes = (value * multiplier).round();
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(KeeperError::InvalidSize(text.to_string()));
    }
    Ok(bytes as u64)
}

/// Format a byte count the way `wg` does: whole bytes below one unit step,
/// otherwise two decimals in the largest fitting unit.
pub fn format_size(bytes: u64, family: UnitFamily) -> String {
    let base = family.base();
    let units = family.units();
    if (bytes as f64) < base {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut idx = 0;
    while value >= base && idx < units.len() - 1 {
        value /= base;
        idx += 1;
    }
    format!("{:.2} {}", value, units[idx])
}
