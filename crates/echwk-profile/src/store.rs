//! Profile persistence
//!
//! `config.json` layout:
//!
//! ```json
//! {
//!   "servers": [ { "id": "...", "name": "...", "server": "...", ... } ],
//!   "current_server_id": "..."
//! }
//! ```

use crate::profile::{ProfileError, ServerProfile};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// File name inside the config directory
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Directory name under the platform config dir
const APP_DIR_NAME: &str = "ECHWorkersClient";

/// Platform config directory
///
/// `%APPDATA%\ECHWorkersClient` on Windows,
/// `~/Library/Application Support/ECHWorkersClient` on macOS,
/// `~/.config/ECHWorkersClient` elsewhere.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// What the core needs from the config layer
pub trait ProfileStore: Send + Sync {
    /// The profile the operator currently has selected
    fn active_profile(&self) -> Option<ServerProfile>;

    /// Insert or update a profile (matched by id)
    fn save(&self, profile: &ServerProfile) -> Result<(), ProfileError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    servers: Vec<ServerProfile>,
    #[serde(default)]
    current_server_id: Option<String>,
}

impl ConfigFile {
    fn current(&self) -> Option<&ServerProfile> {
        self.current_server_id
            .as_ref()
            .and_then(|id| self.servers.iter().find(|s| &s.id == id))
            .or_else(|| self.servers.first())
    }
}

/// `config.json` backed store
pub struct JsonProfileStore {
    path: PathBuf,
    inner: Mutex<ConfigFile>,
}

impl JsonProfileStore {
    /// Open (or create) the store in `dir`
    ///
    /// An unreadable file is logged and replaced by a fresh config; an empty
    /// server list is seeded with [`ServerProfile::default_profile`].
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(CONFIG_FILE_NAME);

        let mut config = match Self::read(&path) {
            Ok(Some(config)) => config,
            Ok(None) => ConfigFile::default(),
            Err(e) => {
                warn!("Failed to load {}: {}", path.display(), e);
                ConfigFile::default()
            }
        };

        let store_needs_seed = config.servers.is_empty();
        if store_needs_seed {
            let profile = ServerProfile::default_profile();
            config.current_server_id = Some(profile.id.clone());
            config.servers.push(profile);
        }

        let store = Self {
            path,
            inner: Mutex::new(config),
        };

        if store_needs_seed {
            info!("Created default profile in {}", store.path.display());
            store.persist()?;
        }

        Ok(store)
    }

    /// Open the store in [`default_config_dir`]
    pub fn open_default() -> Result<Self, ProfileError> {
        Self::open(default_config_dir())
    }

    /// Path of `config.json`
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All saved profiles, in insertion order
    pub fn profiles(&self) -> Vec<ServerProfile> {
        self.lock().servers.clone()
    }

    pub fn find_by_name(&self, name: &str) -> Option<ServerProfile> {
        self.lock().servers.iter().find(|s| s.name == name).cloned()
    }

    /// Add a new profile and make it current
    pub fn add(&self, profile: ServerProfile) -> Result<(), ProfileError> {
        {
            let mut config = self.lock();
            if config.servers.iter().any(|s| s.name == profile.name) {
                return Err(ProfileError::DuplicateName(profile.name));
            }
            config.current_server_id = Some(profile.id.clone());
            config.servers.push(profile);
        }
        self.persist()
    }

    /// Remove a profile; the first remaining one becomes current if needed
    pub fn remove(&self, id: &str) -> Result<(), ProfileError> {
        {
            let mut config = self.lock();
            let before = config.servers.len();
            config.servers.retain(|s| s.id != id);
            if config.servers.len() == before {
                return Err(ProfileError::NotFound(id.to_string()));
            }
            if config.current_server_id.as_deref() == Some(id) {
                config.current_server_id = config.servers.first().map(|s| s.id.clone());
            }
        }
        self.persist()
    }

    /// Rename profile `id`; returns the old name
    ///
    /// The name is trimmed and must not be taken by another profile.
    pub fn rename(&self, id: &str, new_name: &str) -> Result<String, ProfileError> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(ProfileError::EmptyName);
        }

        let old_name = {
            let mut config = self.lock();
            if config.servers.iter().any(|s| s.name == new_name && s.id != id) {
                return Err(ProfileError::DuplicateName(new_name.to_string()));
            }
            let profile = config
                .servers
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| ProfileError::NotFound(id.to_string()))?;
            std::mem::replace(&mut profile.name, new_name.to_string())
        };
        self.persist()?;
        info!("Renamed profile {} -> {}", old_name, new_name);
        Ok(old_name)
    }

    /// Make `id` the current profile
    pub fn select(&self, id: &str) -> Result<(), ProfileError> {
        {
            let mut config = self.lock();
            if !config.servers.iter().any(|s| s.id == id) {
                return Err(ProfileError::NotFound(id.to_string()));
            }
            config.current_server_id = Some(id.to_string());
        }
        self.persist()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConfigFile> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(path: &Path) -> Result<Option<ConfigFile>, ProfileError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write to a temp file, then rename over `config.json`
    fn persist(&self) -> Result<(), ProfileError> {
        let data = serde_json::to_vec_pretty(&*self.lock())?;
        let temp_path = self.path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)?;
        debug!("Saved {} bytes to {}", data.len(), self.path.display());
        Ok(())
    }
}

impl ProfileStore for JsonProfileStore {
    fn active_profile(&self) -> Option<ServerProfile> {
        self.lock().current().cloned()
    }

    fn save(&self, profile: &ServerProfile) -> Result<(), ProfileError> {
        {
            let mut config = self.lock();
            match config.servers.iter_mut().find(|s| s.id == profile.id) {
                Some(existing) => *existing = profile.clone(),
                None => config.servers.push(profile.clone()),
            }
        }
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::RoutingMode;

    #[test]
    fn test_first_open_seeds_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProfileStore::open(dir.path()).unwrap();

        assert!(store.path().exists());
        let active = store.active_profile().unwrap();
        assert_eq!(active.name, "Default");
        assert_eq!(store.profiles().len(), 1);
    }

    #[test]
    fn test_save_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProfileStore::open(dir.path()).unwrap();

        let mut profile = store.active_profile().unwrap();
        profile.server = "worker.example.net:443".to_string();
        profile.routing_mode = RoutingMode::Global;
        store.save(&profile).unwrap();

        let reopened = JsonProfileStore::open(dir.path()).unwrap();
        let active = reopened.active_profile().unwrap();
        assert_eq!(active.server, "worker.example.net:443");
        assert_eq!(active.routing_mode, RoutingMode::Global);
        assert_eq!(reopened.profiles().len(), 1);
    }

    #[test]
    fn test_add_select_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProfileStore::open(dir.path()).unwrap();
        let default_id = store.active_profile().unwrap().id;

        let tokyo = ServerProfile::new("Tokyo", "tokyo.example.com:443", "127.0.0.1:30001");
        let tokyo_id = tokyo.id.clone();
        store.add(tokyo).unwrap();
        assert_eq!(store.active_profile().unwrap().id, tokyo_id);

        let dup = ServerProfile::new("Tokyo", "other:443", "127.0.0.1:30002");
        assert!(matches!(store.add(dup), Err(ProfileError::DuplicateName(_))));

        store.select(&default_id).unwrap();
        assert_eq!(store.active_profile().unwrap().id, default_id);

        store.remove(&default_id).unwrap();
        assert_eq!(store.active_profile().unwrap().id, tokyo_id);
        assert!(matches!(store.remove("missing"), Err(ProfileError::NotFound(_))));
        assert!(store.find_by_name("Tokyo").is_some());
    }

    #[test]
    fn test_rename() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProfileStore::open(dir.path()).unwrap();
        let default_id = store.active_profile().unwrap().id;
        store
            .add(ServerProfile::new("Tokyo", "tokyo.example.com:443", "127.0.0.1:30001"))
            .unwrap();

        assert!(matches!(
            store.rename(&default_id, "Tokyo"),
            Err(ProfileError::DuplicateName(name)) if name == "Tokyo"
        ));
        assert!(matches!(store.rename(&default_id, "  "), Err(ProfileError::EmptyName)));
        assert!(matches!(store.rename("missing", "Osaka"), Err(ProfileError::NotFound(_))));

        assert_eq!(store.rename(&default_id, "  Home ").unwrap(), "Default");
        // keeping its own name is not a clash
        assert_eq!(store.rename(&default_id, "Home").unwrap(), "Home");

        let reopened = JsonProfileStore::open(dir.path()).unwrap();
        assert!(reopened.find_by_name("Default").is_none());
        assert_eq!(reopened.find_by_name("Home").unwrap().id, default_id);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), "{ not json").unwrap();

        let store = JsonProfileStore::open(dir.path()).unwrap();
        assert_eq!(store.active_profile().unwrap().name, "Default");
    }
}
