use crate::core::{BrowserControl, OsScripting};
use crate::errors::{BridgeError, Result};
use crate::types::{OsTab, TabRecord};
use crate::utils::{with_retry, RetryPolicy};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

const MISSING_VALUE: &str = "missing value";

/// Framework-facing tab identities over Safari's recyclable window handles.
///
/// Target ids are minted the first time a handle is seen and dropped as soon
/// as a refresh no longer reports the handle. Both maps are rebuilt together
/// on every refresh, so they stay exact inverses.
#[derive(Debug)]
pub struct TabRegistry {
    handle_to_target: HashMap<String, String>,
    target_to_handle: HashMap<String, String>,
    tabs: Vec<TabRecord>,
    focused: Option<String>,
    os_cache: Vec<OsTab>,
    os_cached_at: Option<Instant>,
    os_cache_ttl: Duration,
    settle: Duration,
}

impl TabRegistry {
    pub fn new(os_cache_ttl: Duration, settle: Duration) -> Self {
        Self {
            handle_to_target: HashMap::new(),
            target_to_handle: HashMap::new(),
            tabs: Vec::new(),
            focused: None,
            os_cache: Vec::new(),
            os_cached_at: None,
            os_cache_ttl,
            settle,
        }
    }

    pub fn tabs(&self) -> &[TabRecord] {
        &self.tabs
    }

    pub fn focused(&self) -> Option<&str> {
        self.focused.as_deref()
    }

    pub fn handle_for(&self, target_id: &str) -> Option<&str> {
        self.target_to_handle.get(target_id).map(String::as_str)
    }

    pub fn target_for(&self, handle: &str) -> Option<&str> {
        self.handle_to_target.get(handle).map(String::as_str)
    }

    pub fn position_of(&self, target_id: &str) -> Option<usize> {
        self.tabs.iter().position(|tab| tab.target_id == target_id)
    }

    pub fn last_target(&self) -> Option<&str> {
        self.tabs.last().map(|tab| tab.target_id.as_str())
    }

    /// Target whose id ends with `suffix`, the short form shown to agents.
    pub fn target_by_suffix(&self, suffix: &str) -> Option<&str> {
        let mut targets: Vec<&String> = self.target_to_handle.keys().collect();
        targets.sort();
        targets
            .into_iter()
            .find(|target| target.ends_with(suffix))
            .map(String::as_str)
    }

    pub fn is_bijective(&self) -> bool {
        self.handle_to_target.len() == self.target_to_handle.len()
            && self.handle_to_target.iter().all(|(handle, target)| {
                self.target_to_handle.get(target).map(String::as_str) == Some(handle.as_str())
            })
    }

    pub fn clear(&mut self) {
        self.handle_to_target.clear();
        self.target_to_handle.clear();
        self.tabs.clear();
        self.focused = None;
        self.os_cache.clear();
        self.os_cached_at = None;
    }

    /// OS-level tab scrape, reused for a short while to avoid repeated
    /// `osascript` round trips. A failed scrape counts as an empty list.
    async fn os_tabs(&mut self, os: &dyn OsScripting) -> Vec<OsTab> {
        let now = Instant::now();
        if let Some(cached_at) = self.os_cached_at {
            if !self.os_cache.is_empty() && now.duration_since(cached_at) <= self.os_cache_ttl {
                return self.os_cache.clone();
            }
        }
        match os.list_tabs().await {
            Ok(tabs) => self.os_cache = tabs,
            Err(err) => {
                debug!(error = %err, "AppleScript tab sync unavailable");
                self.os_cache.clear();
            }
        }
        self.os_cached_at = Some(now);
        self.os_cache.clone()
    }

    /// Rebuilds the tab list from the control plane, overlaying the OS
    /// scrape position by position.
    pub async fn refresh(
        &mut self,
        control: &dyn BrowserControl,
        os: &dyn OsScripting,
    ) -> Result<Vec<TabRecord>> {
        let native = with_retry(control, "tabs:list_tabs", RetryPolicy::quick(), || {
            control.list_tabs()
        })
        .await?;
        let active = with_retry(
            control,
            "tabs:get_window_handle",
            RetryPolicy::quick(),
            || control.current_window_handle(),
        )
        .await?;
        let os_tabs = self.os_tabs(os).await;

        let mut handle_to_target = HashMap::with_capacity(native.len());
        let mut target_to_handle = HashMap::with_capacity(native.len());
        let mut records = Vec::with_capacity(native.len());

        for (position, tab) in native.into_iter().enumerate() {
            let target_id = self
                .handle_to_target
                .get(&tab.handle)
                .cloned()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let mut title = tab.title;
            let mut url = tab.url;
            if let Some(os_tab) = os_tabs.get(tab.index) {
                if let Some(value) = usable(&os_tab.title) {
                    title = value;
                }
                if let Some(value) = usable(&os_tab.url) {
                    url = value;
                }
            }

            handle_to_target.insert(tab.handle.clone(), target_id.clone());
            target_to_handle.insert(target_id.clone(), tab.handle.clone());
            records.push(TabRecord {
                target_id,
                handle: Some(tab.handle),
                url,
                title,
                index: position,
            });
        }

        self.handle_to_target = handle_to_target;
        self.target_to_handle = target_to_handle;
        self.tabs = records;

        self.focused = match self.handle_to_target.get(&active) {
            Some(target) => Some(target.clone()),
            None => self.last_target().map(str::to_string),
        };
        debug!(tabs = self.tabs.len(), focused = ?self.focused, "tabs refreshed");
        Ok(self.tabs.clone())
    }

    /// Switches through the OS layer by tab position. Returns `false` when
    /// the target is unknown or the OS layer could not switch.
    pub async fn switch_via_os(
        &mut self,
        control: &dyn BrowserControl,
        os: &dyn OsScripting,
        target_id: &str,
    ) -> Result<bool> {
        let Some(index) = self.position_of(target_id) else {
            return Ok(false);
        };
        match os.switch_tab(index).await {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(err) => {
                debug!(error = %err, "AppleScript switch-tab fallback failed");
                return Ok(false);
            }
        }
        tokio::time::sleep(self.settle).await;
        self.refresh(control, os).await?;
        self.focused = Some(target_id.to_string());
        Ok(true)
    }

    pub async fn close_via_os(
        &mut self,
        control: &dyn BrowserControl,
        os: &dyn OsScripting,
        target_id: &str,
    ) -> Result<bool> {
        let Some(index) = self.position_of(target_id) else {
            return Ok(false);
        };
        match os.close_tab(index).await {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(err) => {
                debug!(error = %err, "AppleScript close-tab fallback failed");
                return Ok(false);
            }
        }
        tokio::time::sleep(self.settle).await;
        self.refresh(control, os).await?;
        Ok(true)
    }

    /// Primary switch by handle, with one OS-level retry when the handle is
    /// unknown or the control plane refuses the switch.
    pub async fn switch_to(
        &mut self,
        control: &dyn BrowserControl,
        os: &dyn OsScripting,
        target_id: &str,
    ) -> Result<SwitchPath> {
        let Some(handle) = self.handle_for(target_id).map(str::to_string) else {
            if self.switch_via_os(control, os, target_id).await? {
                return Ok(SwitchPath::OsFallback);
            }
            return Err(BridgeError::TabNotFound(short_id(target_id).to_string()));
        };

        if let Err(err) = control.switch_to_window(&handle).await {
            debug!(error = %err, target = short_id(target_id), "window switch failed");
            if self.switch_via_os(control, os, target_id).await? {
                return Ok(SwitchPath::OsFallback);
            }
            return Err(err);
        }
        self.focused = Some(target_id.to_string());
        self.refresh(control, os).await?;
        Ok(SwitchPath::Native)
    }

    /// Primary close by handle position, with the same OS-level retry.
    pub async fn close(
        &mut self,
        control: &dyn BrowserControl,
        os: &dyn OsScripting,
        target_id: &str,
    ) -> Result<SwitchPath> {
        let Some(handle) = self.handle_for(target_id).map(str::to_string) else {
            if self.close_via_os(control, os, target_id).await? {
                return Ok(SwitchPath::OsFallback);
            }
            return Err(BridgeError::TabNotFound(short_id(target_id).to_string()));
        };

        let primary = async {
            let tabs = control.list_tabs().await?;
            let index = tabs
                .iter()
                .find(|tab| tab.handle == handle)
                .map(|tab| tab.index)
                .ok_or_else(|| BridgeError::TabNotFound(short_id(target_id).to_string()))?;
            control.close_tab(index).await
        };

        if let Err(err) = primary.await {
            debug!(error = %err, target = short_id(target_id), "tab close failed");
            if self.close_via_os(control, os, target_id).await? {
                return Ok(SwitchPath::OsFallback);
            }
            return Err(err);
        }
        self.refresh(control, os).await?;
        Ok(SwitchPath::Native)
    }

    #[cfg(test)]
    pub(crate) fn seed(&mut self, tabs: Vec<TabRecord>) {
        self.tabs = tabs;
    }
}

/// Which path a tab operation took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchPath {
    Native,
    OsFallback,
}

/// Last four characters of a target id.
pub fn short_id(target_id: &str) -> &str {
    let start = target_id
        .char_indices()
        .rev()
        .nth(3)
        .map(|(index, _)| index)
        .unwrap_or(0);
    &target_id[start..]
}

fn usable(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(MISSING_VALUE) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBrowser, MockScripting};

    fn registry() -> TabRegistry {
        TabRegistry::new(Duration::from_millis(1000), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn os_scrape_overrides_title_and_url_by_position() {
        let browser = MockBrowser::new();
        browser.set_tabs(vec![("h1", "about:blank", "")]);
        let os = MockScripting::new();
        os.set_tabs(vec![("Example Domain", "https://example.com")]);

        let mut tabs = registry();
        let records = tabs.refresh(&browser, &os).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Example Domain");
        assert_eq!(records[0].url, "https://example.com");
        assert_eq!(tabs.focused(), Some(records[0].target_id.as_str()));
    }

    #[tokio::test]
    async fn missing_value_markers_are_ignored() {
        let browser = MockBrowser::new();
        browser.set_tabs(vec![("h1", "https://a.test/", "A")]);
        let os = MockScripting::new();
        os.set_tabs(vec![("missing value", "  ")]);

        let mut tabs = registry();
        let records = tabs.refresh(&browser, &os).await.unwrap();
        assert_eq!(records[0].title, "A");
        assert_eq!(records[0].url, "https://a.test/");
    }

    #[tokio::test]
    async fn target_ids_survive_refresh_and_retire_with_their_handle() {
        let browser = MockBrowser::new();
        browser.set_tabs(vec![("h1", "about:blank", ""), ("h2", "about:blank", "")]);
        let os = MockScripting::new();
        os.fail_list_tabs(true);

        let mut tabs = registry();
        let first = tabs.refresh(&browser, &os).await.unwrap();
        let second = tabs.refresh(&browser, &os).await.unwrap();
        assert_eq!(first[0].target_id, second[0].target_id);
        assert!(tabs.is_bijective());

        browser.set_tabs(vec![("h2", "about:blank", ""), ("h3", "about:blank", "")]);
        let third = tabs.refresh(&browser, &os).await.unwrap();
        assert_eq!(third[0].target_id, first[1].target_id);
        assert!(tabs.handle_for(&first[0].target_id).is_none());
        assert!(tabs.is_bijective());
    }

    #[tokio::test]
    async fn focus_falls_back_to_last_tab() {
        let browser = MockBrowser::new();
        browser.set_tabs(vec![("h1", "about:blank", ""), ("h2", "about:blank", "")]);
        browser.set_active_handle("gone");
        let os = MockScripting::new();

        let mut tabs = registry();
        let records = tabs.refresh(&browser, &os).await.unwrap();
        assert_eq!(tabs.focused(), Some(records[1].target_id.as_str()));
    }

    #[tokio::test]
    async fn control_plane_failure_is_surfaced() {
        let browser = MockBrowser::new();
        browser.fail_list_tabs(true);
        let os = MockScripting::new();
        assert!(registry().refresh(&browser, &os).await.is_err());
    }

    #[tokio::test]
    async fn unmapped_target_switches_through_os_fallback() {
        let browser = MockBrowser::new();
        browser.set_tabs(vec![("h1", "https://example.com", "Example")]);
        let os = MockScripting::new();

        let mut tabs = registry();
        tabs.seed(vec![TabRecord {
            target_id: "target-0001".into(),
            handle: None,
            url: "https://example.com".into(),
            title: "Example".into(),
            index: 0,
        }]);

        let path = tabs.switch_to(&browser, &os, "target-0001").await.unwrap();
        assert_eq!(path, SwitchPath::OsFallback);
        assert_eq!(os.switched(), vec![0]);
        assert_eq!(tabs.focused(), Some("target-0001"));
        assert!(tabs.is_bijective());
    }

    #[tokio::test]
    async fn unknown_target_without_fallback_is_not_found() {
        let browser = MockBrowser::new();
        let os = MockScripting::new();
        let err = registry().switch_to(&browser, &os, "abcdef").await.unwrap_err();
        assert_eq!(err.to_string(), "Tab not found: cdef");
        assert!(os.switched().is_empty());
    }

    #[tokio::test]
    async fn close_removes_the_mapping() {
        let browser = MockBrowser::new();
        browser.set_tabs(vec![("h1", "about:blank", ""), ("h2", "about:blank", "")]);
        let os = MockScripting::new();

        let mut tabs = registry();
        let records = tabs.refresh(&browser, &os).await.unwrap();
        let path = tabs.close(&browser, &os, &records[1].target_id).await.unwrap();
        assert_eq!(path, SwitchPath::Native);
        assert_eq!(browser.closed_tabs(), vec![1]);
        assert_eq!(tabs.tabs().len(), 1);
        assert!(tabs.handle_for(&records[1].target_id).is_none());
        assert!(tabs.is_bijective());
    }

    #[test]
    fn short_ids() {
        assert_eq!(short_id("0f3a-77c1"), "77c1");
        assert_eq!(short_id("ab"), "ab");
    }
}
