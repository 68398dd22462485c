//! Scripted stand-ins for the two control planes, used by the unit and
//! integration tests to drive a [`SafariSession`](crate::SafariSession)
//! without a real Safari.

use crate::core::{BrowserControl, Config, OsScripting};
use crate::dom::EXTRACTION_SCRIPT;
use crate::errors::{BridgeError, Result};
use crate::types::{BackendCapability, CookieRecord, NativeTab, OsTab};
use crate::utils::javascript::READY_STATE_SCRIPT;
use crate::utils::keys::KeyChord;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One element entry in the shape the extraction script reports.
pub fn element_json(index: u32, tag: &str, text: &str, rect: (f64, f64, f64, f64)) -> Value {
    let (x, y, width, height) = rect;
    json!({
        "index": index,
        "backend_node_id": index,
        "tag_name": tag,
        "text_content": text,
        "attributes": {},
        "bounding_rect": {"x": x, "y": y, "width": width, "height": height},
        "is_visible": true,
        "is_scrollable": false,
        "xpath": format!("/html/body/{tag}[{index}]"),
        "css_selector": format!("{tag}:nth-of-type({index})"),
        "stable_id": format!("sid-{tag}-{index}"),
    })
}

pub fn extraction_json(elements: Vec<Value>) -> Value {
    json!({
        "url": "https://example.com/",
        "title": "Example Domain",
        "viewport_width": 1280,
        "viewport_height": 720,
        "elements": elements,
    })
}

/// Defaults shrunk so waits and backoffs finish in a few milliseconds.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.session.retry_base_delay_ms = 1;
    config.session.ready_state_poll_ms = 1;
    config.session.navigation_ready_timeout_ms = 200;
    config.session.history_ready_timeout_ms = 200;
    config.session.navigation_download_wait_ms = 50;
    config.session.click_download_wait_ms = 50;
    config.session.os_fallback_settle_ms = 1;
    config.downloads.include_system_folders = false;
    config.downloads.poll_interval_ms = 10;
    config.dialogs.max_wait_ms = 20;
    config.dialogs.poll_interval_ms = 1;
    config
}

#[derive(Debug, Clone)]
struct MockTab {
    handle: String,
    url: String,
    title: String,
}

#[derive(Debug, Default)]
struct BrowserState {
    alive: bool,
    start_failure: Option<String>,
    resets: usize,
    replies: HashMap<String, VecDeque<std::result::Result<Value, String>>>,
    stale_replies: HashSet<String>,
    script_calls: HashMap<String, Vec<Vec<Value>>>,
    tabs: Vec<MockTab>,
    active: Option<String>,
    next_handle: usize,
    visited: Vec<String>,
    history: Vec<String>,
    new_tab_urls: Vec<Option<String>>,
    closed_tabs: Vec<usize>,
    screenshot: Vec<u8>,
    screenshot_calls: usize,
    cookies: Vec<CookieRecord>,
    dialogs: VecDeque<Option<String>>,
    dialog_polls: usize,
    sent_keys: Vec<Vec<KeyChord>>,
    typed: Vec<String>,
    uploads: Vec<String>,
    fail_url: bool,
    fail_title: bool,
    fail_list_tabs: bool,
    fail_screenshot: bool,
    fail_new_tab: bool,
    fail_switch_window: bool,
    fail_dialogs: bool,
}

/// In-memory [`BrowserControl`] with one open tab and per-script replies.
///
/// Replies queue per script; the last one keeps answering once the queue
/// drains, until a new reply replaces it. Scripts without a reply evaluate
/// to `null`.
pub struct MockBrowser {
    capability: BackendCapability,
    state: Mutex<BrowserState>,
}

impl Default for MockBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBrowser {
    pub fn new() -> Self {
        Self::with_capability(BackendCapability::FullProtocol)
    }

    pub fn with_capability(capability: BackendCapability) -> Self {
        let mut state = BrowserState {
            alive: true,
            tabs: vec![MockTab {
                handle: "mock-1".to_string(),
                url: "about:blank".to_string(),
                title: String::new(),
            }],
            active: Some("mock-1".to_string()),
            next_handle: 2,
            screenshot: vec![0x89, b'P', b'N', b'G'],
            ..Default::default()
        };
        for (script, reply) in [
            (EXTRACTION_SCRIPT, extraction_json(Vec::new())),
            (READY_STATE_SCRIPT, json!("complete")),
        ] {
            state.replies.insert(script.to_string(), VecDeque::from([Ok(reply)]));
            state.stale_replies.insert(script.to_string());
        }
        Self {
            capability,
            state: Mutex::new(state),
        }
    }

    /// Queues a reply. A default or already-answered sticky reply is
    /// replaced rather than answered first.
    pub fn reply(&self, script: &str, reply: std::result::Result<Value, String>) {
        let mut state = lock(&self.state);
        let stale = state.stale_replies.remove(script);
        let queue = state.replies.entry(script.to_string()).or_default();
        if stale {
            queue.clear();
        }
        queue.push_back(reply);
    }

    pub fn reply_async(&self, script: &str, reply: std::result::Result<Value, String>) {
        self.reply(script, reply);
    }

    pub fn script_args(&self, script: &str) -> Vec<Vec<Value>> {
        lock(&self.state)
            .script_calls
            .get(script)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_alive(&self, alive: bool) {
        lock(&self.state).alive = alive;
    }

    pub fn fail_next_start(&self, message: &str) {
        lock(&self.state).start_failure = Some(message.to_string());
    }

    pub fn reset_count(&self) -> usize {
        lock(&self.state).resets
    }

    /// Replaces the open tabs with `(handle, url, title)` triples; the first
    /// one becomes active.
    pub fn set_tabs(&self, tabs: Vec<(&str, &str, &str)>) {
        let mut state = lock(&self.state);
        state.tabs = tabs
            .into_iter()
            .map(|(handle, url, title)| MockTab {
                handle: handle.to_string(),
                url: url.to_string(),
                title: title.to_string(),
            })
            .collect();
        state.active = state.tabs.first().map(|tab| tab.handle.clone());
    }

    pub fn set_active_handle(&self, handle: &str) {
        lock(&self.state).active = Some(handle.to_string());
    }

    pub fn set_screenshot(&self, bytes: Vec<u8>) {
        lock(&self.state).screenshot = bytes;
    }

    pub fn add_stored_cookie(&self, cookie: CookieRecord) {
        lock(&self.state).cookies.push(cookie);
    }

    pub fn stored_cookies(&self) -> Vec<CookieRecord> {
        lock(&self.state).cookies.clone()
    }

    /// Dialog texts reported by successive polls; `None` is a quiet poll.
    pub fn queue_dialogs(&self, dialogs: Vec<Option<&str>>) {
        lock(&self.state).dialogs = dialogs
            .into_iter()
            .map(|dialog| dialog.map(str::to_string))
            .collect();
    }

    pub fn dialog_polls(&self) -> usize {
        lock(&self.state).dialog_polls
    }

    pub fn visited(&self) -> Vec<String> {
        lock(&self.state).visited.clone()
    }

    pub fn history(&self) -> Vec<String> {
        lock(&self.state).history.clone()
    }

    pub fn new_tab_urls(&self) -> Vec<Option<String>> {
        lock(&self.state).new_tab_urls.clone()
    }

    pub fn closed_tabs(&self) -> Vec<usize> {
        lock(&self.state).closed_tabs.clone()
    }

    pub fn screenshot_calls(&self) -> usize {
        lock(&self.state).screenshot_calls
    }

    pub fn sent_keys(&self) -> Vec<Vec<KeyChord>> {
        lock(&self.state).sent_keys.clone()
    }

    pub fn typed_text(&self) -> Vec<String> {
        lock(&self.state).typed.clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        lock(&self.state).uploads.clone()
    }

    pub fn fail_url(&self, fail: bool) {
        lock(&self.state).fail_url = fail;
    }

    pub fn fail_title(&self, fail: bool) {
        lock(&self.state).fail_title = fail;
    }

    pub fn fail_list_tabs(&self, fail: bool) {
        lock(&self.state).fail_list_tabs = fail;
    }

    pub fn fail_screenshot(&self, fail: bool) {
        lock(&self.state).fail_screenshot = fail;
    }

    pub fn fail_new_tab(&self, fail: bool) {
        lock(&self.state).fail_new_tab = fail;
    }

    pub fn fail_switch_window(&self, fail: bool) {
        lock(&self.state).fail_switch_window = fail;
    }

    pub fn fail_dialogs(&self, fail: bool) {
        lock(&self.state).fail_dialogs = fail;
    }

    fn answer(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        state
            .script_calls
            .entry(script.to_string())
            .or_default()
            .push(args);
        let reply = match state.replies.get_mut(script) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => {
                let last = queue.front().cloned();
                state.stale_replies.insert(script.to_string());
                last
            }
            None => None,
        };
        match reply {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(BridgeError::Evaluation(message)),
            None => Ok(Value::Null),
        }
    }

    fn active_tab_mut(state: &mut BrowserState) -> Option<&mut MockTab> {
        let active = state.active.clone()?;
        state.tabs.iter_mut().find(|tab| tab.handle == active)
    }
}

fn refused(what: &str) -> BridgeError {
    BridgeError::WebDriver(format!("{what} refused by mock"))
}

#[async_trait]
impl BrowserControl for MockBrowser {
    async fn start(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(message) = state.start_failure.take() {
            return Err(BridgeError::Startup(message));
        }
        state.alive = true;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        lock(&self.state).resets += 1;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        lock(&self.state).alive
    }

    fn capability(&self) -> BackendCapability {
        self.capability
    }

    async fn execute_script(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.answer(script, args)
    }

    async fn execute_async_script(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.answer(script, args)
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.visited.push(url.to_string());
        if let Some(tab) = Self::active_tab_mut(&mut state) {
            tab.url = url.to_string();
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        let mut state = lock(&self.state);
        if state.fail_url {
            return Err(refused("current_url"));
        }
        Ok(Self::active_tab_mut(&mut state)
            .map(|tab| tab.url.clone())
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn title(&self) -> Result<String> {
        let mut state = lock(&self.state);
        if state.fail_title {
            return Err(refused("title"));
        }
        Ok(Self::active_tab_mut(&mut state)
            .map(|tab| tab.title.clone())
            .unwrap_or_default())
    }

    async fn back(&self) -> Result<()> {
        lock(&self.state).history.push("back".to_string());
        Ok(())
    }

    async fn forward(&self) -> Result<()> {
        lock(&self.state).history.push("forward".to_string());
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        lock(&self.state).history.push("refresh".to_string());
        Ok(())
    }

    async fn window_handles(&self) -> Result<Vec<String>> {
        let state = lock(&self.state);
        if state.fail_list_tabs {
            return Err(refused("window_handles"));
        }
        Ok(state.tabs.iter().map(|tab| tab.handle.clone()).collect())
    }

    async fn current_window_handle(&self) -> Result<String> {
        Ok(lock(&self.state).active.clone().unwrap_or_default())
    }

    async fn switch_to_window(&self, handle: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_switch_window {
            return Err(refused("switch_to_window"));
        }
        if !state.tabs.iter().any(|tab| tab.handle == handle) {
            return Err(BridgeError::WebDriver(format!("no such window: {handle}")));
        }
        state.active = Some(handle.to_string());
        Ok(())
    }

    async fn new_tab(&self, url: Option<&str>) -> Result<String> {
        let mut state = lock(&self.state);
        state.new_tab_urls.push(url.map(str::to_string));
        if state.fail_new_tab {
            return Err(refused("new_tab"));
        }
        let handle = format!("mock-{}", state.next_handle);
        state.next_handle += 1;
        state.tabs.push(MockTab {
            handle: handle.clone(),
            url: url.unwrap_or("about:blank").to_string(),
            title: String::new(),
        });
        state.active = Some(handle.clone());
        Ok(handle)
    }

    async fn close_tab(&self, index: usize) -> Result<()> {
        let mut state = lock(&self.state);
        if index >= state.tabs.len() {
            return Err(BridgeError::TabNotFound(format!("index {index}")));
        }
        let closed = state.tabs.remove(index);
        state.closed_tabs.push(index);
        if state.active.as_deref() == Some(closed.handle.as_str()) {
            state.active = state.tabs.last().map(|tab| tab.handle.clone());
        }
        Ok(())
    }

    async fn list_tabs(&self) -> Result<Vec<NativeTab>> {
        let state = lock(&self.state);
        if state.fail_list_tabs {
            return Err(refused("list_tabs"));
        }
        Ok(state
            .tabs
            .iter()
            .enumerate()
            .map(|(index, tab)| NativeTab {
                index,
                handle: tab.handle.clone(),
                url: tab.url.clone(),
                title: tab.title.clone(),
            })
            .collect())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let mut state = lock(&self.state);
        state.screenshot_calls += 1;
        if state.fail_screenshot {
            return Err(refused("screenshot"));
        }
        Ok(state.screenshot.clone())
    }

    async fn cookies(&self) -> Result<Vec<CookieRecord>> {
        Ok(lock(&self.state).cookies.clone())
    }

    async fn add_cookie(&self, cookie: &CookieRecord) -> Result<()> {
        lock(&self.state).cookies.push(cookie.clone());
        Ok(())
    }

    async fn delete_cookies(&self) -> Result<()> {
        lock(&self.state).cookies.clear();
        Ok(())
    }

    async fn handle_dialog(&self, _accept: bool, _prompt_text: Option<&str>) -> Result<Option<String>> {
        let mut state = lock(&self.state);
        state.dialog_polls += 1;
        if state.fail_dialogs {
            return Err(refused("handle_dialog"));
        }
        Ok(state.dialogs.pop_front().flatten())
    }

    async fn send_keys(&self, chords: &[KeyChord]) -> Result<()> {
        lock(&self.state).sent_keys.push(chords.to_vec());
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        lock(&self.state).typed.push(text.to_string());
        Ok(())
    }

    async fn upload_file(&self, css: Option<&str>, xpath: Option<&str>, path: &str) -> Result<()> {
        let locator = css.or(xpath).unwrap_or_default();
        lock(&self.state).uploads.push(format!("{locator}={path}"));
        Ok(())
    }
}

#[derive(Debug)]
struct ScriptingState {
    tabs: Vec<OsTab>,
    fail_list_tabs: bool,
    switched: Vec<usize>,
    closed: Vec<usize>,
    opened: Vec<String>,
    downloads_folder: Option<PathBuf>,
    recent_downloads: Vec<PathBuf>,
    downloads_ui_shown: usize,
    profile_result: bool,
}

/// In-memory [`OsScripting`]: tab switches and closes always succeed and
/// are recorded by position.
pub struct MockScripting {
    state: Mutex<ScriptingState>,
}

impl Default for MockScripting {
    fn default() -> Self {
        Self::new()
    }
}

impl MockScripting {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptingState {
                tabs: Vec::new(),
                fail_list_tabs: false,
                switched: Vec::new(),
                closed: Vec::new(),
                opened: Vec::new(),
                downloads_folder: None,
                recent_downloads: Vec::new(),
                downloads_ui_shown: 0,
                profile_result: true,
            }),
        }
    }

    /// Front-window tabs as `(title, url)` pairs.
    pub fn set_tabs(&self, tabs: Vec<(&str, &str)>) {
        lock(&self.state).tabs = tabs
            .into_iter()
            .map(|(title, url)| OsTab {
                title: title.to_string(),
                url: url.to_string(),
            })
            .collect();
    }

    pub fn fail_list_tabs(&self, fail: bool) {
        lock(&self.state).fail_list_tabs = fail;
    }

    pub fn set_downloads_folder(&self, folder: Option<PathBuf>) {
        lock(&self.state).downloads_folder = folder;
    }

    pub fn set_recent_downloads(&self, paths: Vec<PathBuf>) {
        lock(&self.state).recent_downloads = paths;
    }

    pub fn set_profile_result(&self, activated: bool) {
        lock(&self.state).profile_result = activated;
    }

    pub fn switched(&self) -> Vec<usize> {
        lock(&self.state).switched.clone()
    }

    pub fn closed(&self) -> Vec<usize> {
        lock(&self.state).closed.clone()
    }

    pub fn opened_tabs(&self) -> Vec<String> {
        lock(&self.state).opened.clone()
    }

    pub fn downloads_ui_shown(&self) -> usize {
        lock(&self.state).downloads_ui_shown
    }
}

#[async_trait]
impl OsScripting for MockScripting {
    async fn list_tabs(&self) -> Result<Vec<OsTab>> {
        let state = lock(&self.state);
        if state.fail_list_tabs {
            return Err(BridgeError::AppleScript("Safari got an error".to_string()));
        }
        Ok(state.tabs.clone())
    }

    async fn switch_tab(&self, index: usize) -> Result<bool> {
        lock(&self.state).switched.push(index);
        Ok(true)
    }

    async fn close_tab(&self, index: usize) -> Result<bool> {
        lock(&self.state).closed.push(index);
        Ok(true)
    }

    async fn open_tab(&self, url: &str) -> Result<()> {
        lock(&self.state).opened.push(url.to_string());
        Ok(())
    }

    async fn downloads_folder(&self) -> Result<Option<PathBuf>> {
        Ok(lock(&self.state).downloads_folder.clone())
    }

    async fn recent_downloads(&self, limit: usize) -> Result<Vec<PathBuf>> {
        Ok(lock(&self.state)
            .recent_downloads
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn show_downloads_ui(&self) -> Result<()> {
        lock(&self.state).downloads_ui_shown += 1;
        Ok(())
    }

    async fn execute_js(&self, _script: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn open_profile_window(&self, _profile: &str) -> Result<bool> {
        Ok(lock(&self.state).profile_result)
    }
}
