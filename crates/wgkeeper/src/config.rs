use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::ClientProfile;
use crate::identity::HeaderLabel;
use crate::manager::ManagerOptions;
use crate::size::UnitFamily;

/// Top-level settings for wgkeeper.
#[derive(Debug, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub wireguard: WireguardSettings,
    #[serde(default)]
    pub traffic: TrafficSettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub timing: TimingSettings,
    #[serde(default)]
    pub daemon: DaemonSettings,
}

/// The interface being managed.
#[derive(Debug, Deserialize)]
pub struct WireguardSettings {
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Server configuration file, edited in place.
    #[serde(default = "default_config_path")]
    pub config_path: String,
    #[serde(default = "default_wg_bin")]
    pub wg_bin: String,
    #[serde(default = "default_wg_quick_bin")]
    pub wg_quick_bin: String,
}

impl Default for WireguardSettings {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            config_path: default_config_path(),
            wg_bin: default_wg_bin(),
            wg_quick_bin: default_wg_quick_bin(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TrafficSettings {
    #[serde(default = "default_store_path")]
    pub store_path: String,
    /// `binary` (KiB, MiB, like `wg`) or `decimal` (KB, MB)
    #[serde(default)]
    pub units: UnitFamily,
}

impl Default for TrafficSettings {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            units: UnitFamily::default(),
        }
    }
}

/// What goes into generated client profiles.
#[derive(Debug, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_dns")]
    pub dns: String,
    #[serde(default = "default_allowed_ips")]
    pub allowed_ips: String,
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive: u16,
    /// Public host or IP clients connect to. Omitted from profiles when unset.
    pub endpoint: Option<String>,
    /// Label of the `# <label>: <name>` header written above new peers.
    #[serde(default)]
    pub label: HeaderLabel,
    /// Directory holding each client's `<name>.conf`, kept until the
    /// client is deleted.
    #[serde(default = "default_profile_dir")]
    pub profile_dir: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            dns: default_dns(),
            allowed_ips: default_allowed_ips(),
            persistent_keepalive: default_keepalive(),
            endpoint: None,
            label: HeaderLabel::default(),
            profile_dir: default_profile_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimingSettings {
    /// Upper bound for each `wg`/`wg-quick` invocation.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl TimingSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_interface() -> String {
    "wg0".to_string()
}
fn default_config_path() -> String {
    "/etc/wireguard/wg0.conf".to_string()
}
fn default_wg_bin() -> String {
    "wg".to_string()
}
fn default_wg_quick_bin() -> String {
    "wg-quick".to_string()
}
fn default_store_path() -> String {
    "/var/lib/wgkeeper/traffic.json".to_string()
}
fn default_profile_dir() -> String {
    "/etc/wireguard/clients".to_string()
}
fn default_dns() -> String {
    "8.8.8.8, 1.1.1.1".to_string()
}
fn default_allowed_ips() -> String {
    "0.0.0.0/0, ::/0".to_string()
}
fn default_keepalive() -> u16 {
    25
}
fn default_command_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read settings file: {:?}", path.as_ref()))?;
        let settings: Settings =
            toml::from_str(&content).context("Failed to parse TOML settings")?;
        Ok(settings)
    }

    /// Load from default paths or return default settings.
    pub fn load_or_default() -> Self {
        let paths = [
            "/etc/wgkeeper/config.toml",
            "~/.wgkeeper/config.toml",
            "./wgkeeper.toml",
        ];

        for path in &paths {
            let expanded = expand(path);
            if expanded.exists() {
                match Self::load(&expanded) {
                    Ok(settings) => return settings,
                    Err(e) => log::warn!("Skipping {}: {:#}", expanded.display(), e),
                }
            }
        }

        Self::default()
    }

    pub fn config_path(&self) -> PathBuf {
        expand(&self.wireguard.config_path)
    }

    pub fn store_path(&self) -> PathBuf {
        expand(&self.traffic.store_path)
    }

    pub fn profile_dir(&self) -> PathBuf {
        expand(&self.client.profile_dir)
    }

    pub fn client_profile(&self) -> ClientProfile {
        ClientProfile {
            dns: self.client.dns.clone(),
            allowed_ips: self.client.allowed_ips.clone(),
            persistent_keepalive: self.client.persistent_keepalive,
            endpoint_host: self.client.endpoint.clone(),
        }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            interface: self.wireguard.interface.clone(),
            profile: self.client_profile(),
            label: self.client.label,
            units: self.traffic.units,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.wireguard.interface, "wg0");
        assert_eq!(settings.config_path(), PathBuf::from("/etc/wireguard/wg0.conf"));
        assert_eq!(settings.timing.command_timeout(), Duration::from_secs(10));
        assert_eq!(settings.client_profile(), ClientProfile::default());
        assert_eq!(settings.client.label, HeaderLabel::Chinese);
        assert_eq!(settings.profile_dir(), PathBuf::from("/etc/wireguard/clients"));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[wireguard]\ninterface = \"wg1\"\n\n[client]\nendpoint = \"vpn.example.com\"\nlabel = \"english\"\nprofile_dir = \"/srv/wg/clients\"\n\n[traffic]\nunits = \"decimal\""
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.wireguard.interface, "wg1");
        assert_eq!(settings.wireguard.config_path, "/etc/wireguard/wg0.conf");
        assert_eq!(settings.client.endpoint.as_deref(), Some("vpn.example.com"));
        assert_eq!(settings.client.persistent_keepalive, 25);
        assert_eq!(settings.profile_dir(), PathBuf::from("/srv/wg/clients"));

        let options = settings.manager_options();
        assert_eq!(options.interface, "wg1");
        assert_eq!(options.label, HeaderLabel::English);
        assert_eq!(options.units, UnitFamily::Decimal);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[wireguard\ninterface = ").unwrap();
        assert!(Settings::load(file.path()).is_err());
    }
}
