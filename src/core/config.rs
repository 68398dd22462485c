use crate::errors::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub driver: DriverConfig,
    pub dom: DomConfig,
    pub session: SessionConfig,
    pub downloads: DownloadConfig,
    pub dialogs: DialogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub executable_path: PathBuf,
    pub port: u16,
    pub command_timeout_ms: u64,
    pub page_load_timeout_ms: u64,
    pub script_timeout_ms: u64,
    pub implicit_wait_ms: u64,
    pub startup_timeout_ms: u64,
    pub applescript_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomConfig {
    pub max_elements: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub navigation_ready_timeout_ms: u64,
    pub history_ready_timeout_ms: u64,
    pub ready_state_poll_ms: u64,
    pub navigation_download_wait_ms: u64,
    pub click_download_wait_ms: u64,
    pub os_tabs_cache_ms: u64,
    pub os_fallback_settle_ms: u64,
    pub storage_state: Option<PathBuf>,
    pub safari_profile: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub downloads_path: Option<PathBuf>,
    pub include_system_folders: bool,
    pub poll_interval_ms: u64,
    pub recent_downloads_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogConfig {
    pub auto_accept: bool,
    pub prompt_text: Option<String>,
    pub max_wait_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            executable_path: PathBuf::from("/usr/bin/safaridriver"),
            port: 4444,
            command_timeout_ms: 45_000,
            page_load_timeout_ms: 60_000,
            script_timeout_ms: 30_000,
            implicit_wait_ms: 0,
            startup_timeout_ms: 10_000,
            applescript_timeout_ms: 10_000,
        }
    }
}

impl Default for DomConfig {
    fn default() -> Self {
        Self { max_elements: 400 }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 2,
            retry_base_delay_ms: 150,
            navigation_ready_timeout_ms: 12_000,
            history_ready_timeout_ms: 8_000,
            ready_state_poll_ms: 100,
            navigation_download_wait_ms: 1_000,
            click_download_wait_ms: 1_200,
            os_tabs_cache_ms: 1_000,
            os_fallback_settle_ms: 200,
            storage_state: None,
            safari_profile: None,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            downloads_path: None,
            include_system_folders: true,
            poll_interval_ms: 200,
            recent_downloads_limit: 25,
        }
    }
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            auto_accept: true,
            prompt_text: None,
            max_wait_ms: 800,
            poll_interval_ms: 150,
        }
    }
}

impl Config {
    /// Loads a JSON config file; missing sections fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.driver.port == 0 {
            return Err(BridgeError::Configuration(
                "driver.port must be non-zero".to_string(),
            ));
        }
        if self.driver.command_timeout_ms == 0 {
            return Err(BridgeError::Configuration(
                "driver.command_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.download_poll_interval().is_zero() && self.downloads.include_system_folders {
            return Err(BridgeError::Configuration(
                "downloads.poll_interval_ms must be non-zero when polling system folders"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.driver.command_timeout_ms)
    }

    pub fn download_poll_interval(&self) -> Duration {
        Duration::from_millis(self.downloads.poll_interval_ms)
    }

    pub fn dialog_max_wait(&self) -> Duration {
        Duration::from_millis(self.dialogs.max_wait_ms)
    }

    pub fn dialog_poll_interval(&self) -> Duration {
        Duration::from_millis(self.dialogs.poll_interval_ms)
    }
}
