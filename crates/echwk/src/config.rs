//! Control plane configuration.

use echwk_profile::default_config_dir;
use echwk_routing::{RepositoryConfig, CHINA_IP_LIST_URL};
use echwk_supervisor::{ExecutableLocator, EXECUTABLE_NAME};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// Holds `config.json` and the range cache
    pub config_dir: PathBuf,
    /// Range feed URL
    pub feed_url: String,
    /// Proxy binary name
    pub executable: String,
    /// Directories to search instead of the standard path
    pub executable_dirs: Option<Vec<PathBuf>>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            feed_url: CHINA_IP_LIST_URL.to_string(),
            executable: EXECUTABLE_NAME.to_string(),
            executable_dirs: None,
        }
    }
}

impl ControlPlaneConfig {
    pub fn repository(&self) -> RepositoryConfig {
        RepositoryConfig {
            feed_url: self.feed_url.clone(),
            ..RepositoryConfig::in_dir(&self.config_dir)
        }
    }

    pub fn locator(&self) -> ExecutableLocator {
        match &self.executable_dirs {
            Some(dirs) => ExecutableLocator::with_dirs(&self.executable, dirs.clone()),
            None => ExecutableLocator::new(&self.executable),
        }
    }
}
