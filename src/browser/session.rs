use crate::browser::dialogs::{DialogWatcher, DIALOG_CLOSED_MESSAGE};
use crate::browser::downloads::DownloadTracker;
use crate::browser::navigation::NavigationManager;
use crate::browser::state::{BrowserStateSummary, RecentEvents};
use crate::browser::tabs::TabRegistry;
use crate::core::{BrowserControl, Config, OsScripting};
use crate::dom::{html_to_text, DomExtractor, DomNode, DomSnapshot, ElementRef, ElementResolver};
use crate::errors::{BridgeError, Result};
use crate::events::{BrowserEvent, EventBus};
use crate::types::{BackendCapability, PageMetrics, TabRecord};
use crate::utils::javascript::RuntimeEvaluation;
use crate::utils::{with_retry, RetryPolicy, ScreenshotManager, ScriptGateway};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const RECENT_EVENT_CAPACITY: usize = 20;
const RECENT_EVENTS_SHOWN: usize = 10;
const CLOSED_POPUPS_SHOWN: usize = 10;
pub(crate) const FALLBACK_TARGET: &str = "safari-target";

/// How text and keystrokes reach the page, fixed when the session is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStrategy {
    /// Keystrokes, file inputs and dialogs through WebDriver.
    Native,
    /// Everything synthesised by injected script.
    Scripted,
}

impl From<BackendCapability> for InputStrategy {
    fn from(capability: BackendCapability) -> Self {
        match capability {
            BackendCapability::FullProtocol => InputStrategy::Native,
            BackendCapability::ScriptOnly => InputStrategy::Scripted,
        }
    }
}

/// One Safari browser driven on behalf of an agent.
///
/// Owns every piece of mutable browser state: tab identities, the element
/// reference table, the cached summary, download tracking. Handlers take
/// `&mut self`, so callers serialize them behind one async mutex.
pub struct SafariSession {
    id: String,
    pub(crate) config: Config,
    pub(crate) control: Arc<dyn BrowserControl>,
    pub(crate) os: Arc<dyn OsScripting>,
    pub(crate) input: InputStrategy,
    pub(crate) tabs: TabRegistry,
    pub(crate) resolver: ElementResolver,
    extractor: DomExtractor,
    pub(crate) downloads: DownloadTracker,
    dialogs: DialogWatcher,
    recent_events: RecentEvents,
    pub(crate) cached_summary: Option<BrowserStateSummary>,
    selector_map: BTreeMap<u32, DomNode>,
    closed_popup_messages: Vec<String>,
    pub(crate) bus: Option<EventBus>,
    started: bool,
}

impl SafariSession {
    pub fn new(config: Config, control: Arc<dyn BrowserControl>, os: Arc<dyn OsScripting>) -> Self {
        let input = InputStrategy::from(control.capability());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tabs: TabRegistry::new(
                Duration::from_millis(config.session.os_tabs_cache_ms),
                Duration::from_millis(config.session.os_fallback_settle_ms),
            ),
            resolver: ElementResolver::new(),
            extractor: DomExtractor::new(&config.dom),
            downloads: DownloadTracker::new(&config.downloads),
            dialogs: DialogWatcher::new(&config.dialogs),
            recent_events: RecentEvents::new(RECENT_EVENT_CAPACITY),
            cached_summary: None,
            selector_map: BTreeMap::new(),
            closed_popup_messages: Vec::new(),
            bus: None,
            started: false,
            config,
            control,
            os,
            input,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn input_strategy(&self) -> InputStrategy {
        self.input
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub async fn is_alive(&self) -> bool {
        self.control.is_alive().await
    }

    pub fn set_event_bus(&mut self, bus: EventBus) {
        self.bus = Some(bus);
    }

    pub fn focused_target(&self) -> Option<&str> {
        self.tabs.focused()
    }

    pub fn recent_events(&self) -> &RecentEvents {
        &self.recent_events
    }

    pub fn closed_popup_messages(&self) -> &[String] {
        &self.closed_popup_messages
    }

    pub fn cached_summary(&self) -> Option<&BrowserStateSummary> {
        self.cached_summary.as_ref()
    }

    pub fn tab_registry(&self) -> &TabRegistry {
        &self.tabs
    }

    pub fn element_resolver(&self) -> &ElementResolver {
        &self.resolver
    }

    pub(crate) fn ensure_started(&self) -> Result<()> {
        if self.started {
            Ok(())
        } else {
            Err(BridgeError::NotStarted)
        }
    }

    /// Policy used at the event-handler boundary.
    pub(crate) fn handler_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.session.retry_attempts,
            Duration::from_millis(self.config.session.retry_base_delay_ms),
            true,
        )
    }

    pub(crate) fn record_event(&mut self, label: impl Into<String>) {
        let label = label.into();
        debug!(session = %self.id, event = %label, "recent event");
        self.recent_events.push(label);
    }

    /// Drops every cache derived from the page after an action changed it.
    pub(crate) fn invalidate(&mut self) {
        self.cached_summary = None;
        self.selector_map.clear();
        self.resolver.clear();
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        info!(session = %self.id, "starting Safari session");

        if let Some(profile) = self.config.session.safari_profile.clone() {
            match self.os.open_profile_window(&profile).await {
                Ok(true) => info!(profile = %profile, "Safari profile window activated"),
                Ok(false) => {
                    warn!(profile = %profile, "Safari profile not found; using default context");
                    self.record_event(format!("profile:activation_failed:{profile}"));
                }
                Err(err) => {
                    warn!(profile = %profile, error = %err, "Safari profile activation failed");
                    self.record_event(format!("profile:activation_failed:{profile}"));
                }
            }
        }

        match self.start_control().await {
            Ok(()) => {}
            Err(err) if self.config.session.safari_profile.is_some() => {
                warn!(error = %err, "WebDriver startup after profile activation failed; retrying with default context");
                if let Err(stop_err) = self.control.stop().await {
                    debug!(error = %stop_err, "stopping half-open session failed");
                }
                self.start_control().await?;
            }
            Err(err) => return Err(err),
        }
        if !self.control.is_alive().await {
            if self.config.session.safari_profile.is_some() {
                warn!("WebDriver not alive after profile activation; retrying with default context");
                if let Err(err) = self.control.stop().await {
                    debug!(error = %err, "stopping half-open session failed");
                }
                self.start_control().await?;
            }
            if !self.control.is_alive().await {
                return Err(BridgeError::Startup(
                    "Safari WebDriver session is not alive after startup".to_string(),
                ));
            }
        }

        self.tabs
            .refresh(self.control.as_ref(), self.os.as_ref())
            .await?;
        self.downloads.discover_os_folder(self.os.as_ref()).await;
        self.downloads.take_baseline().await;

        if let Some(path) = self.config.session.storage_state.clone() {
            if path.exists() {
                self.load_storage_state(&path).await?;
            }
        }

        self.started = true;
        info!(session = %self.id, tabs = self.tabs.tabs().len(), "Safari session started");
        Ok(())
    }

    /// Starts the control channel, recovering once from a stale pairing.
    async fn start_control(&self) -> Result<()> {
        match self.control.start().await {
            Ok(()) => Ok(()),
            Err(err) if err.is_stale_pairing() => {
                warn!(error = %err, "stale safaridriver pairing detected; resetting");
                if let Err(reset_err) = self.control.reset().await {
                    debug!(error = %reset_err, "safaridriver reset failed");
                }
                self.control.start().await
            }
            Err(err) => Err(err),
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        if let Some(path) = self.config.session.storage_state.clone() {
            if let Err(err) = self.save_storage_state(&path).await {
                debug!(error = %err, "failed to save Safari storage state");
            }
        }
        let stopped = self.control.stop().await;
        self.started = false;
        self.invalidate();
        self.tabs.clear();
        self.downloads.reset();
        info!(session = %self.id, "Safari session stopped");
        stopped
    }

    // ------------------------------------------------------------------
    // shared building blocks
    // ------------------------------------------------------------------

    pub(crate) async fn refresh_tabs(&mut self) -> Result<Vec<TabRecord>> {
        self.tabs
            .refresh(self.control.as_ref(), self.os.as_ref())
            .await
    }

    /// Picks up completed downloads, announcing each one once.
    pub(crate) async fn refresh_downloads(
        &mut self,
        wait_for_new: bool,
        timeout: Duration,
    ) -> Vec<PathBuf> {
        let new_paths = self
            .downloads
            .refresh(self.os.as_ref(), wait_for_new, timeout)
            .await;

        for path in &new_paths {
            let Some(mut file) = self.downloads.record(path).await else {
                continue;
            };
            self.record_event(format!("download:{}", file.file_name));

            let control = Arc::clone(&self.control);
            file.url = with_retry(control.as_ref(), "download:get_url", RetryPolicy::quick(), || {
                control.current_url()
            })
            .await
            .unwrap_or_default();

            info!(path = %file.path.display(), size = file.size, "download completed");
            if let Some(bus) = &self.bus {
                bus.emit(BrowserEvent::FileDownloaded {
                    url: file.url,
                    path: file.path,
                    file_name: file.file_name,
                    size: file.size,
                    file_type: file.file_type,
                });
            }
        }
        new_paths
    }

    pub(crate) async fn dismiss_dialog(&mut self) -> bool {
        match self.dialogs.dismiss_if_present(self.control.as_ref()).await {
            Some(_) => {
                self.note_closed_dialog();
                true
            }
            None => false,
        }
    }

    pub(crate) async fn dismiss_dialogs_after_navigation(&mut self) -> bool {
        let report = self
            .dialogs
            .dismiss_after_navigation(self.control.as_ref())
            .await;
        for _ in &report.dialogs {
            self.note_closed_dialog();
        }
        report.handled_any()
    }

    fn note_closed_dialog(&mut self) {
        self.closed_popup_messages
            .push(DIALOG_CLOSED_MESSAGE.to_string());
        self.record_event("dialog:auto-accepted");
    }

    pub(crate) async fn wait_for_ready(&self, timeout: Duration) {
        let result = NavigationManager::wait_for_ready_state(
            self.control.as_ref(),
            timeout,
            Duration::from_millis(self.config.session.ready_state_poll_ms),
        )
        .await;
        if !result.success {
            debug!(state = %result.ready_state, attempts = result.attempts, "page not complete before deadline");
        }
    }

    /// Runs a fresh extraction pass and installs its reference table.
    pub(crate) async fn rebuild_dom(&mut self) -> Result<DomSnapshot> {
        let target_id = self
            .tabs
            .focused()
            .unwrap_or(FALLBACK_TARGET)
            .to_string();
        let pass = self
            .extractor
            .extract_pass(self.control.as_ref(), &target_id)
            .await?;
        self.resolver.replace_table(pass.refs);
        self.selector_map = pass.snapshot.selector_map.clone();
        Ok(pass.snapshot)
    }

    /// Maps a node handed out earlier onto the live page.
    pub async fn resolve_element_ref(&mut self, node: &DomNode) -> Result<ElementRef> {
        if let Some(hit) = self.resolver.resolve_direct(node) {
            return Ok(hit.element);
        }
        self.rebuild_dom().await?;
        let resolution = self.resolver.resolve_after_refresh(node)?;
        debug!(
            requested = node.backend_node_id,
            resolved = resolution.element.backend_node_id,
            strategy = ?resolution.strategy,
            "element re-resolved"
        );
        Ok(resolution.element)
    }

    // ------------------------------------------------------------------
    // state aggregation
    // ------------------------------------------------------------------

    /// Builds a fresh summary. Every source is tried independently; a failed
    /// source falls back to the previous summary and leaves a diagnostic.
    pub async fn collect_state(
        &mut self,
        include_dom: bool,
        include_screenshot: bool,
        include_recent_events: bool,
    ) -> BrowserStateSummary {
        let mut browser_errors: Vec<String> = Vec::new();
        let previous = self.cached_summary.clone();
        let control = Arc::clone(&self.control);

        self.refresh_downloads(false, Duration::ZERO).await;

        let mut url = previous.as_ref().map(|s| s.url.clone()).unwrap_or_default();
        let mut title = previous.as_ref().map(|s| s.title.clone()).unwrap_or_default();
        let mut tabs = previous.as_ref().map(|s| s.tabs.clone()).unwrap_or_default();

        match with_retry(control.as_ref(), "BrowserStateRequestEvent:get_url", RetryPolicy::quick(), || {
            control.current_url()
        })
        .await
        {
            Ok(value) => url = value,
            Err(err) => degrade(&mut browser_errors, "Safari URL read failed", &err),
        }

        match with_retry(control.as_ref(), "BrowserStateRequestEvent:get_title", RetryPolicy::quick(), || {
            control.title()
        })
        .await
        {
            Ok(value) => title = value,
            Err(err) => degrade(&mut browser_errors, "Safari title read failed", &err),
        }

        match self.refresh_tabs().await {
            Ok(records) => tabs = records,
            Err(err) => {
                degrade(&mut browser_errors, "Safari tab refresh failed", &err);
                if tabs.is_empty() {
                    tabs.push(TabRecord {
                        target_id: self.tabs.focused().unwrap_or(FALLBACK_TARGET).to_string(),
                        handle: None,
                        url: if url.is_empty() { "about:blank".to_string() } else { url.clone() },
                        title: if title.is_empty() { "Untitled".to_string() } else { title.clone() },
                        index: 0,
                    });
                }
            }
        }

        let mut dom = Arc::new(DomSnapshot::empty());
        if include_dom {
            match self.rebuild_dom().await {
                Ok(snapshot) => dom = Arc::new(snapshot),
                Err(err) => {
                    degrade(&mut browser_errors, "Safari DOM extraction failed", &err);
                    self.record_event("dom_fallback:cached_or_empty");
                    if let Some(previous) = &previous {
                        dom = Arc::clone(&previous.dom);
                    }
                }
            }
        }

        let mut screenshot = None;
        if include_screenshot {
            match with_retry(
                control.as_ref(),
                "BrowserStateRequestEvent:screenshot",
                RetryPolicy::quick(),
                || ScreenshotManager::take_base64(control.as_ref()),
            )
            .await
            {
                Ok(encoded) => screenshot = Some(encoded),
                Err(err) => {
                    degrade(&mut browser_errors, "Safari screenshot failed", &err);
                    if let Some(cached) = previous.as_ref().and_then(|s| s.screenshot.clone()) {
                        screenshot = Some(cached);
                        self.record_event("screenshot_fallback:cached");
                    }
                }
            }
        }

        let page_info = match ScriptGateway::page_metrics(control.as_ref()).await {
            Ok(metrics) => metrics,
            Err(err) => {
                degrade(&mut browser_errors, "Safari page metrics failed", &err);
                previous
                    .as_ref()
                    .map(|s| s.page_info)
                    .unwrap_or_else(PageMetrics::default)
            }
        };

        let recent_events = if include_recent_events && !self.recent_events.is_empty() {
            Some(self.recent_events.tail(RECENT_EVENTS_SHOWN))
        } else {
            None
        };
        let skip = self
            .closed_popup_messages
            .len()
            .saturating_sub(CLOSED_POPUPS_SHOWN);

        let summary = BrowserStateSummary {
            url,
            title,
            tabs,
            dom,
            screenshot,
            page_info,
            browser_errors,
            recent_events,
            closed_popup_messages: self.closed_popup_messages[skip..].to_vec(),
            captured_at: chrono::Utc::now(),
        };
        self.cached_summary = Some(summary.clone());
        summary
    }

    // ------------------------------------------------------------------
    // accessors
    // ------------------------------------------------------------------

    pub async fn current_url(&self) -> Result<String> {
        self.ensure_started()?;
        let control = self.control.as_ref();
        with_retry(control, "get_current_page_url", RetryPolicy::quick_checked(), || {
            control.current_url()
        })
        .await
    }

    pub async fn current_title(&self) -> Result<String> {
        self.ensure_started()?;
        let control = self.control.as_ref();
        with_retry(control, "get_current_page_title", RetryPolicy::quick_checked(), || {
            control.title()
        })
        .await
    }

    pub async fn tab_list(&mut self) -> Result<Vec<TabRecord>> {
        self.ensure_started()?;
        self.refresh_tabs().await
    }

    /// Index → element map of the current page, extracting it when needed.
    pub async fn selector_map(&mut self) -> Result<BTreeMap<u32, DomNode>> {
        self.ensure_started()?;
        if !self.selector_map.is_empty() {
            return Ok(self.selector_map.clone());
        }
        let summary = self.collect_state(true, false, true).await;
        Ok(summary.dom.selector_map.clone())
    }

    pub async fn element_by_index(&mut self, index: u32) -> Result<Option<DomNode>> {
        Ok(self.selector_map().await?.remove(&index))
    }

    pub async fn index_by_id(&mut self, element_id: &str) -> Result<Option<u32>> {
        let map = self.selector_map().await?;
        Ok(DomSnapshot::new(None, map).index_by_id(element_id))
    }

    pub async fn index_by_class(&mut self, class_name: &str) -> Result<Option<u32>> {
        let map = self.selector_map().await?;
        Ok(DomSnapshot::new(None, map).index_by_class(class_name))
    }

    pub async fn most_recently_opened_target(&mut self) -> Result<String> {
        let tabs = self.tab_list().await?;
        tabs.last()
            .map(|tab| tab.target_id.clone())
            .ok_or_else(|| BridgeError::TabNotFound("No tabs available".to_string()))
    }

    /// Full target id for the short suffix shown to agents.
    pub async fn target_id_from_tab_id(&mut self, tab_id: &str) -> Result<String> {
        self.tab_list().await?;
        self.tabs
            .target_by_suffix(tab_id)
            .map(str::to_string)
            .ok_or_else(|| {
                BridgeError::InvalidArgument(format!("No tab found with tab_id suffix: {tab_id}"))
            })
    }

    pub fn is_file_input(&self, node: &DomNode) -> bool {
        node.node_name.eq_ignore_ascii_case("input")
            && node
                .attributes
                .get("type")
                .map(|t| t.eq_ignore_ascii_case("file"))
                .unwrap_or(false)
    }

    pub fn downloaded_files(&self) -> Vec<PathBuf> {
        self.downloads.downloaded_files().to_vec()
    }

    pub async fn take_screenshot(&self, path: Option<&Path>) -> Result<Vec<u8>> {
        self.ensure_started()?;
        let control = self.control.as_ref();
        with_retry(control, "screenshot", self.handler_policy(), || {
            ScreenshotManager::capture(control, path)
        })
        .await
    }

    /// Visible text of the page, rendered from its markup.
    pub async fn page_text(&self) -> Result<String> {
        self.ensure_started()?;
        let html = ScriptGateway::outer_html(self.control.as_ref()).await?;
        Ok(html_to_text(&html))
    }

    /// Selector map in the compact listing shown to language models.
    pub async fn state_as_text(&mut self) -> Result<String> {
        let map = self.selector_map().await?;
        Ok(DomSnapshot::new(None, map).llm_representation())
    }

    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.ensure_started()?;
        ScriptGateway::evaluate(self.control.as_ref(), expression).await
    }

    pub async fn evaluate_async(&self, expression: &str) -> Result<Value> {
        self.ensure_started()?;
        ScriptGateway::evaluate_async(self.control.as_ref(), expression).await
    }

    pub async fn evaluate_runtime(&self, expression: &str, await_promise: bool) -> Result<RuntimeEvaluation> {
        self.ensure_started()?;
        Ok(ScriptGateway::evaluate_runtime(self.control.as_ref(), expression, await_promise).await)
    }

    pub async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<bool> {
        self.ensure_started()?;
        Ok(NavigationManager::wait_for_selector(
            self.control.as_ref(),
            selector,
            timeout,
            Duration::from_millis(self.config.session.ready_state_poll_ms),
        )
        .await)
    }

    pub async fn wait_for_ready_state(&self, timeout: Duration) -> Result<bool> {
        self.ensure_started()?;
        Ok(NavigationManager::wait_for_ready_state(
            self.control.as_ref(),
            timeout,
            Duration::from_millis(self.config.session.ready_state_poll_ms),
        )
        .await
        .success)
    }
}

fn degrade(errors: &mut Vec<String>, what: &str, err: &BridgeError) {
    let text = format!("{what}: {}: {err}", err.kind());
    warn!("{text}");
    errors.push(text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::EXTRACTION_SCRIPT;
    use crate::testing::{element_json, extraction_json, test_config, MockBrowser, MockScripting};
    use serde_json::json;

    fn session(browser: &Arc<MockBrowser>, os: &Arc<MockScripting>) -> SafariSession {
        SafariSession::new(test_config(), browser.clone(), os.clone())
    }

    #[tokio::test]
    async fn handlers_require_a_started_session() {
        let browser = Arc::new(MockBrowser::new());
        let os = Arc::new(MockScripting::new());
        let session = session(&browser, &os);
        assert!(matches!(session.current_url().await, Err(BridgeError::NotStarted)));
    }

    #[test]
    fn file_inputs_are_recognized_by_tag_and_type() {
        let browser = Arc::new(MockBrowser::new());
        let os = Arc::new(MockScripting::new());
        let session = session(&browser, &os);

        let mut node = DomNode::document("tab-1");
        node.node_name = "INPUT".to_string();
        node.attributes.insert("type".to_string(), "File".to_string());
        assert!(session.is_file_input(&node));

        node.attributes.insert("type".to_string(), "text".to_string());
        assert!(!session.is_file_input(&node));
        node.attributes.clear();
        assert!(!session.is_file_input(&node));
    }

    #[tokio::test]
    async fn state_collection_picks_up_new_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let mut config = test_config();
        config.downloads.downloads_path = Some(root.clone());
        let browser = Arc::new(MockBrowser::new());
        let os = Arc::new(MockScripting::new());
        let mut session = SafariSession::new(config, browser.clone(), os.clone());
        session.start().await.unwrap();

        std::fs::write(root.join("notes.txt"), b"hello").unwrap();
        let summary = session.collect_state(false, false, false).await;
        assert_eq!(session.downloaded_files(), vec![root.join("notes.txt")]);
        assert!(!summary.browser_errors.iter().any(|e| e.contains("download")));
    }

    #[tokio::test]
    async fn stale_pairing_is_recovered_once() {
        let browser = Arc::new(MockBrowser::new());
        browser.fail_next_start("Session is already paired with another WebDriver session");
        let os = Arc::new(MockScripting::new());
        let mut session = session(&browser, &os);

        session.start().await.unwrap();
        assert!(session.is_started());
        assert_eq!(browser.reset_count(), 1);
        assert!(session.focused_target().is_some());
    }

    #[tokio::test]
    async fn profile_startup_failure_falls_back_to_default_context() {
        let browser = Arc::new(MockBrowser::new());
        browser.fail_next_start("Allow Remote Automation is disabled");
        let os = Arc::new(MockScripting::new());
        let mut config = test_config();
        config.session.safari_profile = Some("Work".to_string());
        let mut session = SafariSession::new(config, browser.clone(), os.clone());

        session.start().await.unwrap();
        assert!(session.is_started());
        assert_eq!(browser.reset_count(), 0);
    }

    #[tokio::test]
    async fn other_startup_failures_leave_session_unstarted() {
        let browser = Arc::new(MockBrowser::new());
        browser.fail_next_start("Allow Remote Automation is disabled");
        let os = Arc::new(MockScripting::new());
        let mut session = session(&browser, &os);

        assert!(session.start().await.is_err());
        assert!(!session.is_started());
        assert_eq!(browser.reset_count(), 0);
    }

    #[tokio::test]
    async fn failed_profile_activation_is_recorded() {
        let browser = Arc::new(MockBrowser::new());
        let os = Arc::new(MockScripting::new());
        os.set_profile_result(false);
        let mut config = test_config();
        config.session.safari_profile = Some("Work".into());
        let mut session = SafariSession::new(config, browser.clone(), os.clone());

        session.start().await.unwrap();
        assert!(session.recent_events().contains("profile:activation_failed:Work"));
    }

    #[tokio::test]
    async fn failed_extraction_reuses_the_previous_snapshot() {
        let browser = Arc::new(MockBrowser::new());
        browser.reply(
            EXTRACTION_SCRIPT,
            Ok(extraction_json(vec![element_json(1, "a", "Home", (0.0, 0.0, 40.0, 20.0))])),
        );
        let os = Arc::new(MockScripting::new());
        let mut session = session(&browser, &os);
        session.start().await.unwrap();

        let first = session.collect_state(true, false, true).await;
        assert!(first.browser_errors.is_empty());
        assert_eq!(first.dom.element_count(), 1);

        browser.reply(EXTRACTION_SCRIPT, Err("page crashed".into()));
        let second = session.collect_state(true, false, true).await;
        assert!(Arc::ptr_eq(&first.dom, &second.dom));
        assert!(second
            .browser_errors
            .iter()
            .any(|e| e.starts_with("Safari DOM extraction failed: EvaluationError")));
        assert!(session.recent_events().contains("dom_fallback:cached_or_empty"));
    }

    #[tokio::test]
    async fn every_source_failing_still_yields_a_summary() {
        let browser = Arc::new(MockBrowser::new());
        let os = Arc::new(MockScripting::new());
        let mut session = session(&browser, &os);
        session.start().await.unwrap();

        browser.fail_url(true);
        browser.fail_title(true);
        browser.fail_list_tabs(true);
        browser.fail_screenshot(true);
        browser.reply(EXTRACTION_SCRIPT, Err("boom".into()));
        browser.reply(crate::utils::javascript::PAGE_METRICS_SCRIPT, Err("boom".into()));

        let summary = session.collect_state(true, true, true).await;
        assert_eq!(summary.tabs.len(), 1);
        assert_eq!(summary.tabs[0].url, "about:blank");
        assert_eq!(summary.tabs[0].title, "Untitled");
        assert!(summary.dom.is_empty());
        assert!(summary.screenshot.is_none());
        assert_eq!(summary.page_info, PageMetrics::default());
        assert_eq!(summary.browser_errors.len(), 6);
        assert!(session.cached_summary().is_some());
    }

    #[tokio::test]
    async fn screenshot_failure_falls_back_to_cached_image() {
        let browser = Arc::new(MockBrowser::new());
        browser.set_screenshot(b"png".to_vec());
        let os = Arc::new(MockScripting::new());
        let mut session = session(&browser, &os);
        session.start().await.unwrap();

        let first = session.collect_state(false, true, false).await;
        assert!(first.screenshot.is_some());
        assert!(first.recent_events.is_none());

        browser.fail_screenshot(true);
        let second = session.collect_state(false, true, false).await;
        assert_eq!(second.screenshot, first.screenshot);
        assert!(session.recent_events().contains("screenshot_fallback:cached"));
    }

    #[tokio::test]
    async fn resolution_refreshes_then_matches_by_stable_id() {
        let browser = Arc::new(MockBrowser::new());
        let mut buy = element_json(2, "button", "Buy", (0.0, 300.0, 40.0, 20.0));
        buy["stable_id"] = json!("fp-buy");
        browser.reply(
            EXTRACTION_SCRIPT,
            Ok(extraction_json(vec![
                element_json(1, "a", "Promo", (0.0, 0.0, 40.0, 20.0)),
                buy,
            ])),
        );
        let os = Arc::new(MockScripting::new());
        let mut session = session(&browser, &os);
        session.start().await.unwrap();

        let summary = session.collect_state(true, false, false).await;
        let node = summary.dom.selector_map.get(&2).cloned().unwrap();
        session.invalidate();

        let mut moved = element_json(1, "button", "Buy", (0.0, 0.0, 40.0, 20.0));
        moved["stable_id"] = json!("fp-buy");
        browser.reply(EXTRACTION_SCRIPT, Ok(extraction_json(vec![moved])));

        let resolved = session.resolve_element_ref(&node).await.unwrap();
        assert_eq!(resolved.backend_node_id, 1);
        assert_eq!(resolved.stable_id, "fp-buy");
    }

    #[tokio::test]
    async fn vanished_element_reports_index() {
        let browser = Arc::new(MockBrowser::new());
        browser.reply(
            EXTRACTION_SCRIPT,
            Ok(extraction_json(vec![
                element_json(1, "a", "Promo", (0.0, 0.0, 40.0, 20.0)),
                element_json(2, "button", "Buy", (0.0, 30.0, 40.0, 20.0)),
            ])),
        );
        let os = Arc::new(MockScripting::new());
        let mut session = session(&browser, &os);
        session.start().await.unwrap();
        let summary = session.collect_state(true, false, false).await;
        let node = summary.dom.selector_map.get(&2).cloned().unwrap();
        session.invalidate();

        browser.reply(EXTRACTION_SCRIPT, Ok(extraction_json(vec![])));
        let err = session.resolve_element_ref(&node).await.unwrap_err();
        assert_eq!(err.to_string(), "Element index 2 no longer exists");
    }

    #[tokio::test]
    async fn accessors_read_from_the_selector_map() {
        let browser = Arc::new(MockBrowser::new());
        let mut link = element_json(1, "a", "Docs", (0.0, 0.0, 40.0, 20.0));
        link["attributes"] = json!({"id": "docs-link", "class": "nav primary"});
        browser.reply(EXTRACTION_SCRIPT, Ok(extraction_json(vec![link])));
        let os = Arc::new(MockScripting::new());
        let mut session = session(&browser, &os);
        session.start().await.unwrap();

        assert_eq!(session.index_by_id("docs-link").await.unwrap(), Some(1));
        assert_eq!(session.index_by_class("primary").await.unwrap(), Some(1));
        assert!(session.element_by_index(7).await.unwrap().is_none());
        assert!(session.state_as_text().await.unwrap().starts_with("[1]<a "));
    }

    #[tokio::test]
    async fn tab_suffix_lookup() {
        let browser = Arc::new(MockBrowser::new());
        let os = Arc::new(MockScripting::new());
        let mut session = session(&browser, &os);
        session.start().await.unwrap();

        let target = session.most_recently_opened_target().await.unwrap();
        let suffix = &target[target.len() - 4..];
        assert_eq!(session.target_id_from_tab_id(suffix).await.unwrap(), target);
        assert!(session.target_id_from_tab_id("zzzzzzzz").await.is_err());
    }

    #[tokio::test]
    async fn stop_clears_state() {
        let browser = Arc::new(MockBrowser::new());
        let os = Arc::new(MockScripting::new());
        let mut session = session(&browser, &os);
        session.start().await.unwrap();
        session.collect_state(false, false, false).await;

        session.stop().await.unwrap();
        assert!(!session.is_started());
        assert!(session.cached_summary().is_none());
        assert!(session.tab_registry().tabs().is_empty());
    }
}
