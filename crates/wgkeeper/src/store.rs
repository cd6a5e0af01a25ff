//! Persistence seams for the configuration text, the traffic ledger and
//! the saved client profiles.
//!
//! The manager only talks to these traits, so tests and embedders can swap
//! the files for memory.

use chrono::Local;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{KeeperError, Result};
use crate::identity;
use crate::traffic::TrafficLedger;

const BACKUP_STAMP: &str = "%Y%m%d_%H%M%S";

/// Mode for files holding private keys.
const SECRET_MODE: u32 = 0o600;

/// `<file>.tmp` next to `path`.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "wgkeeper".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg_attr(not(unix), allow(unused_variables))]
fn write_new(path: &Path, contents: &[u8], mode: Option<u32>) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if let Some(mode) = mode {
            options.mode(mode);
        }
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // umask may have narrowed the creation mode
        if let Some(mode) = mode {
            file.set_permissions(fs::Permissions::from_mode(mode))?;
        }
    }
    file.sync_all()
}

/// Write `contents` to a sibling temp file and rename it over `path`.
/// Readers see the old file or the new one, never a torn write.
fn replace_file(path: &Path, contents: &[u8], mode: Option<u32>) -> Result<()> {
    let temp = temp_path(path);
    let replaced = write_new(&temp, contents, mode).and_then(|()| fs::rename(&temp, path));
    if let Err(e) = replaced {
        if let Err(cleanup) = fs::remove_file(&temp) {
            debug!("Could not remove {}: {}", temp.display(), cleanup);
        }
        return Err(KeeperError::io(format!("replacing {}", path.display()), e));
    }
    Ok(())
}

#[cfg(unix)]
fn existing_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).ok().map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn existing_mode(_path: &Path) -> Option<u32> {
    None
}

/// Where the configuration text lives.
pub trait ConfigStore: Send + Sync {
    fn read(&self) -> Result<String>;

    fn write(&self, text: &str) -> Result<()>;

    /// Snapshot the current text and return a handle to the snapshot.
    fn backup(&self) -> Result<PathBuf>;

    /// Put a snapshot taken by [`ConfigStore::backup`] back in place.
    fn restore(&self, backup: &Path) -> Result<()>;
}

/// Where the traffic ledger lives. Read once and written once per batch.
pub trait TrafficStore: Send + Sync {
    fn load(&self) -> Result<TrafficLedger>;

    fn save(&self, ledger: &TrafficLedger) -> Result<()>;
}

/// Configuration file on disk, backed up next to itself.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<path>.backup.<stamp>`, then `.1`, `.2`, ... if that name is taken.
    fn backup_path(&self, stamp: &str) -> PathBuf {
        let base = format!("{}.backup.{}", self.path.display(), stamp);
        let mut candidate = PathBuf::from(&base);
        let mut n = 1;
        while candidate.exists() {
            candidate = PathBuf::from(format!("{}.{}", base, n));
            n += 1;
        }
        candidate
    }
}

impl ConfigStore for FileConfigStore {
    fn read(&self) -> Result<String> {
        fs::read_to_string(&self.path)
            .map_err(|e| KeeperError::io(format!("reading {}", self.path.display()), e))
    }

    /// Replaces the file atomically, keeping its permissions. A new file
    /// is created owner-only since it carries the server's private key.
    fn write(&self, text: &str) -> Result<()> {
        let mode = existing_mode(&self.path).unwrap_or(SECRET_MODE);
        replace_file(&self.path, text.as_bytes(), Some(mode))?;
        debug!("Wrote {} bytes to {}", text.len(), self.path.display());
        Ok(())
    }

    fn backup(&self) -> Result<PathBuf> {
        let stamp = Local::now().format(BACKUP_STAMP).to_string();
        let target = self.backup_path(&stamp);
        fs::copy(&self.path, &target)
            .map_err(|e| KeeperError::io(format!("backing up to {}", target.display()), e))?;
        info!("Backed up {} to {}", self.path.display(), target.display());
        Ok(target)
    }

    fn restore(&self, backup: &Path) -> Result<()> {
        fs::copy(backup, &self.path)
            .map_err(|e| KeeperError::io(format!("restoring {}", backup.display()), e))?;
        warn!("Restored {} from {}", self.path.display(), backup.display());
        Ok(())
    }
}

/// JSON ledger on disk, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonTrafficStore {
    path: PathBuf,
}

impl JsonTrafficStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TrafficStore for JsonTrafficStore {
    /// A missing file is an empty ledger. A file that exists but does not
    /// parse is an error; silently starting over would zero every total.
    fn load(&self) -> Result<TrafficLedger> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No traffic ledger at {}, starting empty", self.path.display());
                return Ok(TrafficLedger::new());
            }
            Err(e) => {
                return Err(KeeperError::io(format!("reading {}", self.path.display()), e))
            }
        };
        if text.trim().is_empty() {
            return Ok(TrafficLedger::new());
        }
        serde_json::from_str(&text).map_err(|source| KeeperError::CorruptStore {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, ledger: &TrafficLedger) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| KeeperError::io(format!("creating {}", parent.display()), e))?;
        }
        let body = serde_json::to_string_pretty(ledger).map_err(|source| {
            KeeperError::CorruptStore {
                path: self.path.clone(),
                source,
            }
        })?;

        replace_file(&self.path, body.as_bytes(), None)?;
        debug!("Saved {} traffic records", ledger.len());
        Ok(())
    }
}

/// Where each client's rendered profile is kept, keyed by client name.
///
/// The profile carries the client's private key, which exists nowhere else
/// once the add returns.
pub trait ProfileStore: Send + Sync {
    fn save(&self, name: &str, profile: &str) -> Result<()>;

    /// `None` when nothing was saved under `name`.
    fn load(&self, name: &str) -> Result<Option<String>>;

    /// Whether there was a profile to remove.
    fn remove(&self, name: &str) -> Result<bool>;
}

/// One owner-only `<name>.conf` per client in a directory.
#[derive(Debug, Clone)]
pub struct DirProfileStore {
    dir: PathBuf,
}

impl DirProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File for `name`, or `None` when the name could escape the directory.
    pub fn path_for(&self, name: &str) -> Option<PathBuf> {
        (!name.is_empty() && identity::sanitize_name(name) == name)
            .then(|| self.dir.join(format!("{}.conf", name)))
    }
}

impl ProfileStore for DirProfileStore {
    fn save(&self, name: &str, profile: &str) -> Result<()> {
        let path = self
            .path_for(name)
            .ok_or_else(|| KeeperError::InvalidName(name.to_string()))?;
        fs::create_dir_all(&self.dir)
            .map_err(|e| KeeperError::io(format!("creating {}", self.dir.display()), e))?;
        replace_file(&path, profile.as_bytes(), Some(SECRET_MODE))?;
        info!("Saved client profile {}", path.display());
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<String>> {
        let Some(path) = self.path_for(name) else {
            return Ok(None);
        };
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KeeperError::io(format!("reading {}", path.display()), e)),
        }
    }

    fn remove(&self, name: &str) -> Result<bool> {
        let Some(path) = self.path_for(name) else {
            return Ok(false);
        };
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed client profile {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(KeeperError::io(format!("removing {}", path.display()), e)),
        }
    }
}

/// In-memory configuration, with every backup kept in a list.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    text: Mutex<String>,
    backups: Mutex<Vec<String>>,
}

impl MemoryConfigStore {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Mutex::new(text.into()),
            backups: Mutex::new(Vec::new()),
        }
    }

    pub fn text(&self) -> String {
        self.text.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn backup_count(&self) -> usize {
        self.backups.lock().map(|b| b.len()).unwrap_or(0)
    }
}

fn poisoned() -> KeeperError {
    KeeperError::io(
        "memory store",
        std::io::Error::new(std::io::ErrorKind::Other, "lock poisoned"),
    )
}

impl ConfigStore for MemoryConfigStore {
    fn read(&self) -> Result<String> {
        self.text.lock().map(|t| t.clone()).map_err(|_| poisoned())
    }

    fn write(&self, text: &str) -> Result<()> {
        *self.text.lock().map_err(|_| poisoned())? = text.to_string();
        Ok(())
    }

    fn backup(&self) -> Result<PathBuf> {
        let current = self.read()?;
        let mut backups = self.backups.lock().map_err(|_| poisoned())?;
        backups.push(current);
        Ok(PathBuf::from(format!("memory.backup.{}", backups.len() - 1)))
    }

    fn restore(&self, backup: &Path) -> Result<()> {
        let index = backup
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse::<usize>().ok());
        let snapshot = index
            .and_then(|i| self.backups.lock().ok()?.get(i).cloned())
            .ok_or_else(|| {
                KeeperError::io(
                    format!("restoring {}", backup.display()),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no such backup"),
                )
            })?;
        self.write(&snapshot)
    }
}

/// In-memory ledger.
#[derive(Debug, Default)]
pub struct MemoryTrafficStore {
    ledger: Mutex<TrafficLedger>,
}

impl MemoryTrafficStore {
    pub fn new(ledger: TrafficLedger) -> Self {
        Self {
            ledger: Mutex::new(ledger),
        }
    }

    pub fn snapshot(&self) -> TrafficLedger {
        self.ledger.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl TrafficStore for MemoryTrafficStore {
    fn load(&self) -> Result<TrafficLedger> {
        self.ledger.lock().map(|l| l.clone()).map_err(|_| poisoned())
    }

    fn save(&self, ledger: &TrafficLedger) -> Result<()> {
        *self.ledger.lock().map_err(|_| poisoned())? = ledger.clone();
        Ok(())
    }
}

/// In-memory profiles.
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profiles: Mutex<HashMap<String, String>>,
}

impl MemoryProfileStore {
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .profiles
            .lock()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl ProfileStore for MemoryProfileStore {
    fn save(&self, name: &str, profile: &str) -> Result<()> {
        self.profiles
            .lock()
            .map_err(|_| poisoned())?
            .insert(name.to_string(), profile.to_string());
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<String>> {
        Ok(self.profiles.lock().map_err(|_| poisoned())?.get(name).cloned())
    }

    fn remove(&self, name: &str) -> Result<bool> {
        Ok(self
            .profiles
            .lock()
            .map_err(|_| poisoned())?
            .remove(name)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_backup_and_restore_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wg0.conf");
        fs::write(&path, "original").unwrap();
        let store = FileConfigStore::new(&path);

        let backup = store.backup().unwrap();
        let name = backup.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("wg0.conf.backup."), "{}", name);

        store.write("broken").unwrap();
        assert_eq!(store.read().unwrap(), "broken");
        store.restore(&backup).unwrap();
        assert_eq!(store.read().unwrap(), "original");
    }

    #[test]
    fn test_backups_in_same_second_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wg0.conf");
        fs::write(&path, "x").unwrap();
        let store = FileConfigStore::new(&path);

        let first = store.backup_path("20240101_000000");
        fs::write(&first, "a").unwrap();
        let second = store.backup_path("20240101_000000");
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with(".backup.20240101_000000.1"));
    }

    #[test]
    fn test_config_write_replaces_file_whole() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wg0.conf");
        fs::write(&path, "[Interface]\nAddress = 10.8.0.1/24\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();
        }
        let store = FileConfigStore::new(&path);

        store.write("[Interface]\nAddress = 10.9.0.1/24\n").unwrap();
        assert_eq!(store.read().unwrap(), "[Interface]\nAddress = 10.9.0.1/24\n");
        assert!(!temp_path(&path).exists());
        #[cfg(unix)]
        assert_eq!(existing_mode(&path), Some(0o640));

        // a failed replace leaves the old text and no temp file behind
        let blocked = FileConfigStore::new(dir.path().join("missing/wg0.conf"));
        assert!(matches!(blocked.write("x"), Err(KeeperError::Io { .. })));
        assert_eq!(store.read().unwrap(), "[Interface]\nAddress = 10.9.0.1/24\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_new_config_file_is_owner_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wg1.conf");
        FileConfigStore::new(&path).write("[Interface]\n").unwrap();
        assert_eq!(existing_mode(&path), Some(SECRET_MODE));
    }

    #[test]
    fn test_profile_dir_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = DirProfileStore::new(dir.path().join("clients"));
        assert_eq!(store.load("carol").unwrap(), None);

        store.save("carol", "[Interface]\nPrivateKey = c\n").unwrap();
        let path = store.path_for("carol").unwrap();
        assert!(path.ends_with("clients/carol.conf"));
        assert_eq!(store.load("carol").unwrap().as_deref(), Some("[Interface]\nPrivateKey = c\n"));
        #[cfg(unix)]
        assert_eq!(existing_mode(&path), Some(SECRET_MODE));

        assert!(store.remove("carol").unwrap());
        assert!(!path.exists());
        assert!(!store.remove("carol").unwrap());
    }

    #[test]
    fn test_profile_names_cannot_escape_dir() {
        let dir = TempDir::new().unwrap();
        let store = DirProfileStore::new(dir.path());
        assert!(store.path_for("../wg0").is_none());
        assert!(store.path_for("").is_none());
        assert!(matches!(
            store.save("../wg0", "x"),
            Err(KeeperError::InvalidName(_))
        ));
        assert_eq!(store.load("a/b").unwrap(), None);
        assert!(!store.remove("a/b").unwrap());
    }

    #[test]
    fn test_read_missing_config_is_io_error() {
        let dir = TempDir::new().unwrap();
        let store = FileConfigStore::new(dir.path().join("absent.conf"));
        assert!(matches!(store.read(), Err(KeeperError::Io { .. })));
    }

    #[test]
    fn test_traffic_round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let store = JsonTrafficStore::new(dir.path().join("state/traffic.json"));
        assert!(store.load().unwrap().is_empty());

        let mut ledger = TrafficLedger::new();
        ledger.observe("alice", 10, 20, Utc::now());
        store.save(&ledger).unwrap();

        assert_eq!(store.load().unwrap(), ledger);
        assert!(!temp_path(store.path()).exists());
    }

    #[test]
    fn test_corrupt_ledger_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("traffic.json");
        fs::write(&path, "{not json").unwrap();
        let store = JsonTrafficStore::new(&path);
        assert!(matches!(store.load(), Err(KeeperError::CorruptStore { .. })));
    }

    #[test]
    fn test_memory_store_restore() {
        let store = MemoryConfigStore::new("one");
        let backup = store.backup().unwrap();
        store.write("two").unwrap();
        store.restore(&backup).unwrap();
        assert_eq!(store.text(), "one");
        assert_eq!(store.backup_count(), 1);
        assert!(store.restore(Path::new("memory.backup.9")).is_err());
    }
}
