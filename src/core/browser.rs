use crate::errors::Result;
use crate::types::{BackendCapability, CookieRecord, NativeTab};
use crate::utils::keys::KeyChord;
use async_trait::async_trait;
use serde_json::Value;

/// Remote-control plane for one Safari instance.
///
/// Implementations serialize their own commands; callers may share one
/// instance behind an `Arc` without extra locking.
#[async_trait]
pub trait BrowserControl: Send + Sync {
    /// Establish the control channel
    async fn start(&self) -> Result<()>;

    /// Tear down the control channel
    async fn stop(&self) -> Result<()>;

    /// Kill lingering driver processes so a fresh pairing can succeed
    async fn reset(&self) -> Result<()>;

    /// Cheap liveness probe of the control channel
    async fn is_alive(&self) -> bool;

    fn capability(&self) -> BackendCapability;

    /// Execute a synchronous script body (`return ...;`) with `arguments`
    async fn execute_script(&self, script: &str, args: Vec<Value>) -> Result<Value>;

    /// Execute an asynchronous script body that reports through its last argument
    async fn execute_async_script(&self, script: &str, args: Vec<Value>) -> Result<Value>;

    async fn navigate(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    async fn title(&self) -> Result<String>;

    async fn back(&self) -> Result<()>;

    async fn forward(&self) -> Result<()>;

    async fn refresh(&self) -> Result<()>;

    async fn window_handles(&self) -> Result<Vec<String>>;

    async fn current_window_handle(&self) -> Result<String>;

    async fn switch_to_window(&self, handle: &str) -> Result<()>;

    /// Open a new tab, focus it, and optionally load a URL; returns its handle
    async fn new_tab(&self, url: Option<&str>) -> Result<String>;

    /// Close the tab at a position in the handle list
    async fn close_tab(&self, index: usize) -> Result<()>;

    /// Enumerate tabs with their title and URL, in handle order
    async fn list_tabs(&self) -> Result<Vec<NativeTab>>;

    /// PNG bytes of the current viewport
    async fn screenshot(&self) -> Result<Vec<u8>>;

    async fn cookies(&self) -> Result<Vec<CookieRecord>>;

    async fn add_cookie(&self, cookie: &CookieRecord) -> Result<()>;

    async fn delete_cookies(&self) -> Result<()>;

    /// Accept or dismiss a pending native dialog; `None` when none is open
    async fn handle_dialog(&self, accept: bool, prompt_text: Option<&str>)
        -> Result<Option<String>>;

    /// Press key chords against the focused element
    async fn send_keys(&self, chords: &[KeyChord]) -> Result<()>;

    /// Type literal text into the focused element
    async fn type_text(&self, text: &str) -> Result<()>;

    async fn upload_file(&self, css: Option<&str>, xpath: Option<&str>, path: &str)
        -> Result<()>;
}
