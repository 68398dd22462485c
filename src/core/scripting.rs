use crate::errors::Result;
use crate::types::OsTab;
use async_trait::async_trait;
use std::path::PathBuf;

/// OS-level scripting of the Safari application, independent of WebDriver.
#[async_trait]
pub trait OsScripting: Send + Sync {
    /// Tabs of the front window in display order
    async fn list_tabs(&self) -> Result<Vec<OsTab>>;

    /// Focus the tab at a 0-based position; `false` if it does not exist
    async fn switch_tab(&self, index: usize) -> Result<bool>;

    /// Close the tab at a 0-based position; `false` if it does not exist
    async fn close_tab(&self, index: usize) -> Result<bool>;

    async fn open_tab(&self, url: &str) -> Result<()>;

    async fn downloads_folder(&self) -> Result<Option<PathBuf>>;

    /// Most recently modified entries of the downloads folder, newest first
    async fn recent_downloads(&self, limit: usize) -> Result<Vec<PathBuf>>;

    async fn show_downloads_ui(&self) -> Result<()>;

    async fn execute_js(&self, script: &str) -> Result<String>;

    async fn open_profile_window(&self, profile: &str) -> Result<bool>;
}
