//! Event handlers of a [`SafariSession`].
//!
//! Each handler runs its browser work through the session retry policy,
//! then drops every page-derived cache and appends a short annotation to
//! the recent-event log.

use crate::browser::navigation::normalize_url;
use crate::browser::session::{InputStrategy, SafariSession};
use crate::browser::tabs::{short_id, SwitchPath};
use crate::dom::{DomNode, ElementRef};
use crate::errors::{BridgeError, Result};
use crate::events::{BrowserEvent, EventBus, EventHandler, EventKind, EventOutcome, ScrollDirection};
use crate::utils::keys::parse_key_sequence;
use crate::utils::{with_retry, with_retry_mut, RetryPolicy, ScreenshotManager, ScriptGateway};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SCREENSHOT_MEMORY: &str =
    "Screenshot capture failed in Safari. Continue without image or retry the action.";

/// Why an element center is being located; picks the failure wording.
#[derive(Debug, Clone, Copy)]
enum Approach {
    Click,
    Type,
}

impl Approach {
    fn failure(&self, backend_id: u32) -> BridgeError {
        match self {
            Approach::Click => BridgeError::Operation {
                message: format!("Element {backend_id} could not be located in DOM"),
                memory: "Element changed before click; refresh state and retry.".to_string(),
            },
            Approach::Type => BridgeError::Operation {
                message: format!("Element {backend_id} could not be focused for typing"),
                memory: "Element changed before typing; refresh state and retry.".to_string(),
            },
        }
    }

    fn fallback_event(&self, backend_id: u32) -> String {
        match self {
            Approach::Click => format!("fallback:cached-rect-click:{backend_id}"),
            Approach::Type => format!("fallback:cached-rect-type:{backend_id}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum History {
    Back,
    Forward,
    Reload,
}

impl History {
    fn name(&self) -> &'static str {
        match self {
            History::Back => "GoBackEvent",
            History::Forward => "GoForwardEvent",
            History::Reload => "RefreshEvent",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            History::Back => "go_back",
            History::Forward => "go_forward",
            History::Reload => "refresh",
        }
    }
}

fn record(pairs: &[(&str, String)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn truncated(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn rounded(value: f64) -> i64 {
    value.round() as i64
}

impl SafariSession {
    /// Entry point for every inbound event.
    pub async fn handle_event(&mut self, event: BrowserEvent) -> Result<EventOutcome> {
        self.ensure_started()?;
        match event {
            BrowserEvent::Navigate { url, new_tab } => {
                self.navigate(&url, new_tab).await.map(|_| EventOutcome::Done)
            }
            BrowserEvent::ClickElement { node } => self
                .click_element(&node)
                .await
                .map(|(x, y)| EventOutcome::Click { x, y }),
            BrowserEvent::ClickCoordinate { x, y } => self
                .click_coordinate(x, y)
                .await
                .map(|(x, y)| EventOutcome::Click { x, y }),
            BrowserEvent::TypeText { node, text, clear } => self.type_text(&node, &text, clear).await,
            BrowserEvent::Scroll {
                direction,
                amount,
                node,
            } => self
                .scroll(direction, amount, node.as_ref())
                .await
                .map(|_| EventOutcome::Done),
            BrowserEvent::ScrollToText { text } => {
                self.scroll_to_text(&text).await.map(|_| EventOutcome::Done)
            }
            BrowserEvent::Screenshot => self.screenshot().await.map(EventOutcome::Screenshot),
            BrowserEvent::BrowserStateRequest {
                include_dom,
                include_screenshot,
                include_recent_events,
            } => {
                let summary = self
                    .collect_state(include_dom, include_screenshot, include_recent_events)
                    .await;
                Ok(EventOutcome::State(Box::new(summary)))
            }
            BrowserEvent::SwitchTab { target_id } => {
                self.switch_tab(target_id).await.map(EventOutcome::Target)
            }
            BrowserEvent::CloseTab { target_id } => {
                self.close_tab(&target_id).await.map(|_| EventOutcome::Done)
            }
            BrowserEvent::GoBack => self.go_back().await.map(|_| EventOutcome::Done),
            BrowserEvent::GoForward => self.go_forward().await.map(|_| EventOutcome::Done),
            BrowserEvent::Refresh => self.reload().await.map(|_| EventOutcome::Done),
            BrowserEvent::Wait {
                seconds,
                max_seconds,
            } => {
                self.wait(seconds, max_seconds).await;
                Ok(EventOutcome::Done)
            }
            BrowserEvent::SendKeys { keys } => self.send_keys(&keys).await.map(|_| EventOutcome::Done),
            BrowserEvent::UploadFile { node, file_path } => self
                .upload_file(&node, &file_path)
                .await
                .map(|_| EventOutcome::Done),
            BrowserEvent::GetDropdownOptions { node } => self
                .dropdown_options(&node)
                .await
                .map(EventOutcome::Record),
            BrowserEvent::SelectDropdownOption { node, text } => self
                .select_dropdown_option(&node, &text)
                .await
                .map(EventOutcome::Record),
            BrowserEvent::FileDownloaded { path, .. } => {
                self.file_downloaded(&path).await;
                Ok(EventOutcome::Done)
            }
        }
    }

    fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.config.session.os_fallback_settle_ms)
    }

    /// Post-action tab sync. The action already happened, so a failure here
    /// is logged rather than retried.
    async fn sync_tabs_after_action(&mut self) {
        if let Err(err) = self.refresh_tabs().await {
            warn!(error = %err, "tab refresh after action failed");
        }
    }

    /// Scrolls the element into view and returns its viewport center, or
    /// falls back to the rect cached at extraction time.
    async fn element_center(&mut self, element: &ElementRef, approach: Approach) -> Result<(f64, f64)> {
        let control = Arc::clone(&self.control);
        let ctl = control.as_ref();
        let css = element.css_selector.as_deref();
        let xpath = element.xpath.as_deref();
        let live = with_retry(ctl, "scroll_into_view", RetryPolicy::quick(), || {
            ScriptGateway::scroll_into_view(ctl, css, xpath)
        })
        .await;

        match live {
            Ok(Some(rect)) => return Ok(rect.center()),
            Ok(None) => debug!(element = element.backend_node_id, "element not found for scroll"),
            Err(err) => debug!(element = element.backend_node_id, error = %err, "scroll into view failed"),
        }

        let cached = element
            .absolute_position
            .filter(|rect| rect.has_area())
            .ok_or_else(|| approach.failure(element.backend_node_id))?;
        self.record_event(approach.fallback_event(element.backend_node_id));
        Ok(cached.center())
    }

    // ------------------------------------------------------------------
    // navigation
    // ------------------------------------------------------------------

    pub async fn navigate(&mut self, url: &str, new_tab: bool) -> Result<()> {
        let url = normalize_url(url)?;
        let control = Arc::clone(&self.control);
        let policy = self.handler_policy();
        with_retry_mut(control.as_ref(), self, "NavigateToUrlEvent", policy, move |session| {
            let url = url.clone();
            Box::pin(async move { session.navigate_once(&url, new_tab).await })
        })
        .await
    }

    async fn navigate_once(&mut self, url: &str, new_tab: bool) -> Result<()> {
        self.refresh_downloads(false, Duration::ZERO).await;
        if new_tab {
            if let Err(err) = self.control.new_tab(Some(url)).await {
                debug!(error = %err, "WebDriver new tab failed; opening through AppleScript");
                self.os.open_tab(url).await?;
                tokio::time::sleep(self.settle_delay()).await;
            }
        } else {
            self.control.navigate(url).await?;
        }

        self.wait_for_ready(Duration::from_millis(
            self.config.session.navigation_ready_timeout_ms,
        ))
        .await;
        self.dismiss_dialogs_after_navigation().await;
        self.sync_tabs_after_action().await;
        self.refresh_downloads(
            true,
            Duration::from_millis(self.config.session.navigation_download_wait_ms),
        )
        .await;
        self.invalidate();
        info!(url = %url, new_tab, "navigated");
        self.record_event(format!("navigate:{url}"));
        Ok(())
    }

    pub async fn go_back(&mut self) -> Result<()> {
        self.history(History::Back).await
    }

    pub async fn go_forward(&mut self) -> Result<()> {
        self.history(History::Forward).await
    }

    pub async fn reload(&mut self) -> Result<()> {
        self.history(History::Reload).await
    }

    async fn history(&mut self, step: History) -> Result<()> {
        let control = Arc::clone(&self.control);
        let policy = self.handler_policy();
        with_retry_mut(control.as_ref(), self, step.name(), policy, move |session| {
            Box::pin(async move { session.history_once(step).await })
        })
        .await
    }

    async fn history_once(&mut self, step: History) -> Result<()> {
        match step {
            History::Back => self.control.back().await?,
            History::Forward => self.control.forward().await?,
            History::Reload => self.control.refresh().await?,
        }
        self.wait_for_ready(Duration::from_millis(
            self.config.session.history_ready_timeout_ms,
        ))
        .await;
        self.dismiss_dialogs_after_navigation().await;
        self.sync_tabs_after_action().await;
        self.invalidate();
        self.record_event(step.label());
        Ok(())
    }

    // ------------------------------------------------------------------
    // pointer and keyboard
    // ------------------------------------------------------------------

    pub async fn click_element(&mut self, node: &DomNode) -> Result<(i64, i64)> {
        let control = Arc::clone(&self.control);
        let policy = self.handler_policy();
        let node = node.clone();
        with_retry_mut(control.as_ref(), self, "ClickElementEvent", policy, move |session| {
            let node = node.clone();
            Box::pin(async move { session.click_element_once(&node).await })
        })
        .await
    }

    async fn click_element_once(&mut self, node: &DomNode) -> Result<(i64, i64)> {
        self.refresh_downloads(false, Duration::ZERO).await;
        let element = self.resolve_element_ref(node).await?;
        let (x, y) = self.element_center(&element, Approach::Click).await?;
        self.click_and_settle(x, y).await?;
        self.record_event(format!("click:{}", node.backend_node_id));
        Ok((rounded(x), rounded(y)))
    }

    pub async fn click_coordinate(&mut self, x: f64, y: f64) -> Result<(i64, i64)> {
        let control = Arc::clone(&self.control);
        let policy = self.handler_policy();
        with_retry_mut(control.as_ref(), self, "ClickCoordinateEvent", policy, move |session| {
            Box::pin(async move {
                session.refresh_downloads(false, Duration::ZERO).await;
                session.click_and_settle(x, y).await?;
                session.record_event(format!("click@{x},{y}"));
                Ok((rounded(x), rounded(y)))
            })
        })
        .await
    }

    async fn click_and_settle(&mut self, x: f64, y: f64) -> Result<()> {
        let hit = ScriptGateway::click_at(self.control.as_ref(), x, y).await?;
        if !hit {
            debug!(x, y, "no element under click point");
        }
        self.dismiss_dialog().await;
        self.sync_tabs_after_action().await;
        self.refresh_downloads(
            true,
            Duration::from_millis(self.config.session.click_download_wait_ms),
        )
        .await;
        self.invalidate();
        Ok(())
    }

    pub async fn type_text(&mut self, node: &DomNode, text: &str, clear: bool) -> Result<EventOutcome> {
        let control = Arc::clone(&self.control);
        let policy = self.handler_policy();
        let node = node.clone();
        let text = text.to_string();
        with_retry_mut(control.as_ref(), self, "TypeTextEvent", policy, move |session| {
            let node = node.clone();
            let text = text.clone();
            Box::pin(async move { session.type_text_once(&node, &text, clear).await })
        })
        .await
    }

    async fn type_text_once(&mut self, node: &DomNode, text: &str, clear: bool) -> Result<EventOutcome> {
        let element = self.resolve_element_ref(node).await?;
        let (x, y) = self.element_center(&element, Approach::Type).await?;
        let control = Arc::clone(&self.control);
        let ctl = control.as_ref();
        let css = element.css_selector.as_deref();
        let xpath = element.xpath.as_deref();

        ScriptGateway::click_at(ctl, x, y).await?;
        if clear {
            ScriptGateway::clear_element(ctl, css, xpath).await?;
        }
        match self.input {
            InputStrategy::Native => ctl.type_text(text).await?,
            InputStrategy::Scripted => {
                ScriptGateway::type_into_focused(ctl, text).await?;
            }
        }
        let actual_value = match ScriptGateway::read_value(ctl, css, xpath).await {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "could not read back typed value");
                None
            }
        };

        self.dismiss_dialog().await;
        self.sync_tabs_after_action().await;
        self.invalidate();
        self.record_event(format!("type:{}", node.backend_node_id));
        Ok(EventOutcome::Typed {
            x: rounded(x),
            y: rounded(y),
            actual_value,
        })
    }

    pub async fn send_keys(&mut self, keys: &str) -> Result<()> {
        let chords = parse_key_sequence(keys);
        if chords.is_empty() {
            return Err(BridgeError::InvalidArgument("no keys to send".to_string()));
        }
        let control = Arc::clone(&self.control);
        let policy = self.handler_policy();
        let keys = keys.to_string();
        with_retry_mut(control.as_ref(), self, "SendKeysEvent", policy, move |session| {
            let chords = chords.clone();
            let keys = keys.clone();
            Box::pin(async move {
                match session.input {
                    InputStrategy::Native => session.control.send_keys(&chords).await?,
                    InputStrategy::Scripted => {
                        ScriptGateway::dispatch_keys(session.control.as_ref(), &chords).await?
                    }
                }
                session.dismiss_dialog().await;
                session.invalidate();
                session.record_event(format!("send_keys:{keys}"));
                Ok(())
            })
        })
        .await
    }

    // ------------------------------------------------------------------
    // scrolling
    // ------------------------------------------------------------------

    pub async fn scroll(
        &mut self,
        direction: ScrollDirection,
        amount: i64,
        node: Option<&DomNode>,
    ) -> Result<()> {
        let control = Arc::clone(&self.control);
        let policy = self.handler_policy();
        let node = node.cloned();
        with_retry_mut(control.as_ref(), self, "ScrollEvent", policy, move |session| {
            let node = node.clone();
            Box::pin(async move { session.scroll_once(direction, amount, node.as_ref()).await })
        })
        .await
    }

    async fn scroll_once(
        &mut self,
        direction: ScrollDirection,
        amount: i64,
        node: Option<&DomNode>,
    ) -> Result<()> {
        let (dx, dy) = direction.delta(amount);
        let mut scrolled_element = false;
        if let Some(node) = node {
            let element = self.resolve_element_ref(node).await?;
            scrolled_element = ScriptGateway::scroll_element_by(
                self.control.as_ref(),
                element.css_selector.as_deref(),
                element.xpath.as_deref(),
                dx,
                dy,
            )
            .await?;
            if !scrolled_element {
                debug!(element = node.backend_node_id, "element missing; scrolling the window");
            }
        }
        if !scrolled_element {
            ScriptGateway::scroll_by(self.control.as_ref(), dx, dy).await?;
        }
        self.dismiss_dialog().await;
        self.invalidate();
        self.record_event(format!("scroll:{}:{amount}", direction.as_str()));
        Ok(())
    }

    pub async fn scroll_to_text(&mut self, text: &str) -> Result<()> {
        let control = Arc::clone(&self.control);
        let policy = self.handler_policy();
        let text = text.to_string();
        with_retry_mut(control.as_ref(), self, "ScrollToTextEvent", policy, move |session| {
            let text = text.clone();
            Box::pin(async move {
                let found = ScriptGateway::scroll_to_text(session.control.as_ref(), &text).await?;
                if !found {
                    return Err(BridgeError::Operation {
                        message: format!("Text '{text}' not found on page"),
                        memory: format!("Text '{text}' was not found while scrolling."),
                    });
                }
                session.invalidate();
                session.record_event(format!("scroll_to_text:{}", truncated(&text, 50)));
                Ok(())
            })
        })
        .await
    }

    // ------------------------------------------------------------------
    // screenshots
    // ------------------------------------------------------------------

    /// Base64 PNG of the viewport. Not retried; a failed capture reuses the
    /// image of the cached summary when there is one.
    pub async fn screenshot(&mut self) -> Result<String> {
        match ScreenshotManager::take_base64(self.control.as_ref()).await {
            Ok(encoded) => Ok(encoded),
            Err(err) => {
                let cached = self
                    .cached_summary
                    .as_ref()
                    .and_then(|summary| summary.screenshot.clone());
                match cached {
                    Some(encoded) => {
                        warn!(error = %err, "screenshot failed; using cached image");
                        self.record_event("screenshot_event_fallback:cached");
                        Ok(encoded)
                    }
                    None => Err(BridgeError::Operation {
                        message: format!("Safari screenshot failed: {}: {err}", err.kind()),
                        memory: SCREENSHOT_MEMORY.to_string(),
                    }),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // tabs
    // ------------------------------------------------------------------

    /// Focuses `target_id`, or the most recent tab when none is given.
    /// Opens a blank tab when the window has none. Returns the focused target.
    pub async fn switch_tab(&mut self, target_id: Option<String>) -> Result<String> {
        let control = Arc::clone(&self.control);
        let policy = self.handler_policy();
        with_retry_mut(control.as_ref(), self, "SwitchTabEvent", policy, move |session| {
            let target_id = target_id.clone();
            Box::pin(async move { session.switch_tab_once(target_id).await })
        })
        .await
    }

    async fn switch_tab_once(&mut self, target_id: Option<String>) -> Result<String> {
        self.refresh_tabs().await?;
        let target = match target_id {
            Some(target) => target,
            None => match self.tabs.last_target() {
                Some(last) => last.to_string(),
                None => return self.open_blank_tab().await,
            },
        };
        let short = short_id(&target).to_string();

        let control = Arc::clone(&self.control);
        let os = Arc::clone(&self.os);
        match self.tabs.switch_to(control.as_ref(), os.as_ref(), &target).await {
            Ok(SwitchPath::Native) => self.record_event(format!("switch_tab:{short}")),
            Ok(SwitchPath::OsFallback) => {
                self.record_event(format!("switch_tab_fallback:{short}"))
            }
            Err(BridgeError::TabNotFound(_)) => {
                return Err(BridgeError::Operation {
                    message: format!("Tab {short} not found"),
                    memory: format!("Tab {short} does not exist. Re-read tabs and retry."),
                })
            }
            Err(err) => {
                warn!(target = %short, error = %err, "tab switch failed");
                return Err(BridgeError::Operation {
                    message: format!("Tab {short} switch failed"),
                    memory: format!("Could not switch to tab {short}. Re-read tabs and retry."),
                });
            }
        }
        self.invalidate();
        Ok(target)
    }

    async fn open_blank_tab(&mut self) -> Result<String> {
        let control = Arc::clone(&self.control);
        let ctl = control.as_ref();
        let opened = with_retry(ctl, "switch_tab:new_tab", RetryPolicy::quick(), || {
            ctl.new_tab(Some("about:blank"))
        })
        .await;
        if let Err(err) = opened {
            debug!(error = %err, "WebDriver new tab failed; opening through AppleScript");
            self.os.open_tab("about:blank").await?;
            tokio::time::sleep(self.settle_delay()).await;
        }
        self.refresh_tabs().await?;
        self.invalidate();

        let target = self
            .tabs
            .focused()
            .or_else(|| self.tabs.last_target())
            .map(str::to_string)
            .ok_or_else(|| BridgeError::TabNotFound("No tabs available".to_string()))?;
        self.record_event(format!("switch_tab:{}", short_id(&target)));
        Ok(target)
    }

    pub async fn close_tab(&mut self, target_id: &str) -> Result<()> {
        let control = Arc::clone(&self.control);
        let policy = self.handler_policy();
        let target_id = target_id.to_string();
        with_retry_mut(control.as_ref(), self, "CloseTabEvent", policy, move |session| {
            let target_id = target_id.clone();
            Box::pin(async move { session.close_tab_once(&target_id).await })
        })
        .await
    }

    async fn close_tab_once(&mut self, target_id: &str) -> Result<()> {
        self.refresh_tabs().await?;
        let short = short_id(target_id).to_string();
        let control = Arc::clone(&self.control);
        let os = Arc::clone(&self.os);
        match self.tabs.close(control.as_ref(), os.as_ref(), target_id).await {
            Ok(SwitchPath::Native) => self.record_event(format!("close_tab:{short}")),
            Ok(SwitchPath::OsFallback) => self.record_event(format!("close_tab_fallback:{short}")),
            Err(BridgeError::TabNotFound(_)) => {
                return Err(BridgeError::Operation {
                    message: format!("Tab {short} not found"),
                    memory: format!("Tab {short} does not exist. Re-read tabs and retry."),
                })
            }
            Err(err) => {
                warn!(target = %short, error = %err, "tab close failed");
                return Err(BridgeError::Operation {
                    message: format!("Tab {short} close failed"),
                    memory: format!("Could not close tab {short}. Re-read tabs and retry."),
                });
            }
        }
        self.invalidate();
        Ok(())
    }

    // ------------------------------------------------------------------
    // waiting, uploads, dropdowns, downloads
    // ------------------------------------------------------------------

    /// Sleeps for `seconds`, clamped to `[0, max_seconds]`.
    pub async fn wait(&mut self, seconds: f64, max_seconds: f64) {
        let pause = wait_duration(seconds, max_seconds);
        tokio::time::sleep(pause).await;
        let seconds = pause.as_secs_f64();
        self.refresh_downloads(false, Duration::ZERO).await;
        self.record_event(format!("wait:{seconds:.2}s"));
    }

    pub async fn upload_file(&mut self, node: &DomNode, file_path: &Path) -> Result<()> {
        if self.input == InputStrategy::Scripted {
            return Err(BridgeError::Unsupported(
                "file upload needs the WebDriver backend".to_string(),
            ));
        }
        let control = Arc::clone(&self.control);
        let policy = self.handler_policy();
        let node = node.clone();
        let file_path = file_path.to_path_buf();
        with_retry_mut(control.as_ref(), self, "UploadFileEvent", policy, move |session| {
            let node = node.clone();
            let file_path = file_path.clone();
            Box::pin(async move { session.upload_file_once(&node, &file_path).await })
        })
        .await
    }

    async fn upload_file_once(&mut self, node: &DomNode, file_path: &Path) -> Result<()> {
        let element = self.resolve_element_ref(node).await?;
        if element.css_selector.is_none() && element.xpath.is_none() {
            return Err(BridgeError::Operation {
                message: format!("Element {} has no selector for upload", node.backend_node_id),
                memory: "Could not locate file input element for upload.".to_string(),
            });
        }
        let path = file_path.to_string_lossy();
        self.control
            .upload_file(
                element.css_selector.as_deref(),
                element.xpath.as_deref(),
                &path,
            )
            .await?;
        self.invalidate();
        let file_name = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        self.record_event(format!("upload:{file_name}"));
        Ok(())
    }

    /// Options of a `<select>`, as an agent-readable record.
    pub async fn dropdown_options(&mut self, node: &DomNode) -> Result<BTreeMap<String, String>> {
        let control = Arc::clone(&self.control);
        let policy = self.handler_policy();
        let node = node.clone();
        with_retry_mut(control.as_ref(), self, "GetDropdownOptionsEvent", policy, move |session| {
            let node = node.clone();
            Box::pin(async move { session.dropdown_options_once(&node).await })
        })
        .await
    }

    async fn dropdown_options_once(&mut self, node: &DomNode) -> Result<BTreeMap<String, String>> {
        let index = node.backend_node_id;
        let element = self.resolve_element_ref(node).await?;
        let probe = ScriptGateway::dropdown_options(
            self.control.as_ref(),
            element.css_selector.as_deref(),
            element.xpath.as_deref(),
        )
        .await?;

        let outcome = if !probe.found {
            let memory = format!("Dropdown element at index {index} was not found on the page.");
            record(&[
                ("error", "Dropdown element not found".to_string()),
                ("short_term_memory", memory.clone()),
                ("long_term_memory", memory),
            ])
        } else if !probe.is_select {
            let tag = probe.tag.unwrap_or_else(|| element.tag_name.clone());
            let memory = format!("Element {index} is a <{tag}>, not a dropdown.");
            record(&[
                ("error", format!("Element {index} is not a select element")),
                ("short_term_memory", memory.clone()),
                ("long_term_memory", memory),
            ])
        } else if probe.options.is_empty() {
            let memory = format!("No dropdown options found for index {index}.");
            record(&[
                ("type", "select".to_string()),
                ("options", "[]".to_string()),
                ("short_term_memory", memory.clone()),
                ("long_term_memory", memory),
            ])
        } else {
            let formatted = probe
                .options
                .iter()
                .map(|option| {
                    format!(
                        "{}: text={}, value={}",
                        option.index,
                        serde_json::Value::String(option.text.clone()),
                        serde_json::Value::String(option.value.clone())
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            let message = format!(
                "Found {} dropdown options for index {index}:\n{formatted}\n\nUse select_dropdown(index={index}, text=...) with exact text/value.",
                probe.options.len()
            );
            record(&[
                ("type", "select".to_string()),
                ("options", serde_json::to_string(&probe.options)?),
                ("formatted_options", formatted),
                ("message", message.clone()),
                ("short_term_memory", message),
                ("long_term_memory", format!("Read dropdown options for index {index}.")),
            ])
        };

        self.invalidate();
        self.record_event(format!("dropdown_options:{index}"));
        Ok(outcome)
    }

    /// Selects the option whose text or value matches `text`, ignoring case.
    pub async fn select_dropdown_option(
        &mut self,
        node: &DomNode,
        text: &str,
    ) -> Result<BTreeMap<String, String>> {
        let control = Arc::clone(&self.control);
        let policy = self.handler_policy();
        let node = node.clone();
        let text = text.to_string();
        with_retry_mut(control.as_ref(), self, "SelectDropdownOptionEvent", policy, move |session| {
            let node = node.clone();
            let text = text.clone();
            Box::pin(async move { session.select_dropdown_option_once(&node, &text).await })
        })
        .await
    }

    async fn select_dropdown_option_once(
        &mut self,
        node: &DomNode,
        text: &str,
    ) -> Result<BTreeMap<String, String>> {
        let index = node.backend_node_id;
        let element = self.resolve_element_ref(node).await?;
        let probe = ScriptGateway::select_option(
            self.control.as_ref(),
            element.css_selector.as_deref(),
            element.xpath.as_deref(),
            text,
        )
        .await?;

        let failure = |error: String, memory: String| {
            record(&[
                ("success", "false".to_string()),
                ("error", error),
                ("short_term_memory", memory.clone()),
                ("long_term_memory", memory),
            ])
        };
        let outcome = if !probe.found {
            failure(
                "Dropdown element not found".to_string(),
                format!("Dropdown element at index {index} was not found on the page."),
            )
        } else if !probe.is_select {
            failure(
                format!("Element {index} is not a select element"),
                format!("Element {index} is not a dropdown; click it instead."),
            )
        } else if !probe.matched {
            failure(
                format!(
                    "Option '{text}' not found. Available options: {}",
                    probe.options.join(", ")
                ),
                format!("Option '{text}' does not exist in dropdown {index}. Read the options and retry."),
            )
        } else {
            record(&[
                ("success", "true".to_string()),
                ("message", format!("Selected option: {text}")),
                ("value", probe.value.unwrap_or_default()),
            ])
        };

        self.invalidate();
        self.record_event(format!("dropdown_select:{index}:{}", truncated(text, 40)));
        Ok(outcome)
    }

    /// Remembers a download announced from outside the session.
    pub async fn file_downloaded(&mut self, path: &Path) {
        if self.downloads.remember(path).await {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            self.record_event(format!("download:{name}"));
        }
    }
}

/// Bus adapter that serializes events into one shared session.
pub struct SessionHandler {
    session: Arc<Mutex<SafariSession>>,
}

impl SessionHandler {
    pub fn new(session: Arc<Mutex<SafariSession>>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl EventHandler for SessionHandler {
    async fn handle(&self, event: BrowserEvent) -> Result<EventOutcome> {
        self.session.lock().await.handle_event(event).await
    }
}

/// Subscribes the session to every event kind and lets it emit download
/// notifications on the same bus. Calling it again replaces the handlers.
pub async fn register_handlers(session: &Arc<Mutex<SafariSession>>, bus: &EventBus) {
    let handler: Arc<dyn EventHandler> = Arc::new(SessionHandler::new(Arc::clone(session)));
    for kind in EventKind::ALL {
        bus.subscribe(kind, Arc::clone(&handler)).await;
    }
    session.lock().await.set_event_bus(bus.clone());
}

/// Longest pause a single wait event may request.
const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

fn wait_duration(seconds: f64, max_seconds: f64) -> Duration {
    let ceiling = if max_seconds.is_finite() { max_seconds.max(0.0) } else { 0.0 };
    let seconds = if seconds.is_finite() { seconds.clamp(0.0, ceiling) } else { 0.0 };
    Duration::try_from_secs_f64(seconds)
        .unwrap_or(MAX_WAIT)
        .min(MAX_WAIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::EXTRACTION_SCRIPT;
    use crate::testing::{element_json, extraction_json, test_config, MockBrowser, MockScripting};
    use crate::types::BackendCapability;
    use crate::utils::javascript::{
        CLICK_AT_SCRIPT, DROPDOWN_OPTIONS_SCRIPT, READ_VALUE_SCRIPT, SCROLL_INTO_VIEW_SCRIPT,
        SCROLL_TO_TEXT_SCRIPT, SELECT_OPTION_SCRIPT, TYPE_INTO_FOCUSED_SCRIPT,
    };
    use serde_json::json;
    use std::path::PathBuf;

    async fn started(browser: &Arc<MockBrowser>, os: &Arc<MockScripting>) -> SafariSession {
        let mut session = SafariSession::new(test_config(), browser.clone(), os.clone());
        session.start().await.unwrap();
        session
    }

    async fn node_at(session: &mut SafariSession, index: u32) -> DomNode {
        let summary = session.collect_state(true, false, false).await;
        summary.dom.selector_map.get(&index).cloned().unwrap()
    }

    #[tokio::test]
    async fn stale_rect_click_uses_cached_center() {
        let browser = Arc::new(MockBrowser::new());
        let mut button = element_json(1, "button", "Go", (10.0, 20.0, 100.0, 40.0));
        button["css_selector"] = json!("#go");
        browser.reply(EXTRACTION_SCRIPT, Ok(extraction_json(vec![button])));
        browser.reply(SCROLL_INTO_VIEW_SCRIPT, Ok(json!(null)));
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;
        let node = node_at(&mut session, 1).await;

        let outcome = session
            .handle_event(BrowserEvent::ClickElement { node })
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Click { x: 60, y: 40 });
        assert_eq!(browser.script_args(CLICK_AT_SCRIPT), vec![vec![json!(60.0), json!(40.0)]]);
        assert!(session.recent_events().contains("fallback:cached-rect-click:1"));
        assert!(session.recent_events().contains("click:1"));
        assert!(session.cached_summary().is_none());
    }

    #[tokio::test]
    async fn click_without_any_geometry_fails_with_hint() {
        let browser = Arc::new(MockBrowser::new());
        browser.reply(
            EXTRACTION_SCRIPT,
            Ok(extraction_json(vec![element_json(1, "button", "Go", (0.0, 0.0, 0.0, 0.0))])),
        );
        browser.reply(SCROLL_INTO_VIEW_SCRIPT, Ok(json!(null)));
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;
        let node = node_at(&mut session, 1).await;

        let err = session.click_element(&node).await.unwrap_err();
        assert_eq!(err.to_string(), "Element 1 could not be located in DOM");
        assert_eq!(
            err.memory(),
            Some("Element changed before click; refresh state and retry.")
        );
        assert!(browser.script_args(CLICK_AT_SCRIPT).is_empty());
    }

    #[tokio::test]
    async fn live_rect_wins_over_cached_one() {
        let browser = Arc::new(MockBrowser::new());
        browser.reply(
            EXTRACTION_SCRIPT,
            Ok(extraction_json(vec![element_json(1, "a", "Docs", (0.0, 900.0, 20.0, 10.0))])),
        );
        browser.reply(
            SCROLL_INTO_VIEW_SCRIPT,
            Ok(json!({"x": 100.0, "y": 200.0, "width": 20.0, "height": 10.0})),
        );
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;
        let node = node_at(&mut session, 1).await;

        assert_eq!(session.click_element(&node).await.unwrap(), (110, 205));
        assert!(!session.recent_events().contains("fallback:cached-rect-click:1"));
    }

    #[tokio::test]
    async fn typing_through_scripted_input_reads_value_back() {
        let browser = Arc::new(MockBrowser::with_capability(BackendCapability::ScriptOnly));
        browser.reply(
            EXTRACTION_SCRIPT,
            Ok(extraction_json(vec![element_json(1, "input", "", (0.0, 0.0, 200.0, 30.0))])),
        );
        browser.reply(
            SCROLL_INTO_VIEW_SCRIPT,
            Ok(json!({"x": 0.0, "y": 0.0, "width": 200.0, "height": 30.0})),
        );
        browser.reply(READ_VALUE_SCRIPT, Ok(json!("hello")));
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;
        let node = node_at(&mut session, 1).await;

        let outcome = session.type_text(&node, "hello", true).await.unwrap();
        assert_eq!(
            outcome,
            EventOutcome::Typed {
                x: 100,
                y: 15,
                actual_value: Some("hello".into())
            }
        );
        assert_eq!(browser.script_args(TYPE_INTO_FOCUSED_SCRIPT), vec![vec![json!("hello")]]);
        assert!(browser.typed_text().is_empty());
    }

    #[tokio::test]
    async fn native_typing_goes_through_the_driver() {
        let browser = Arc::new(MockBrowser::new());
        browser.reply(
            EXTRACTION_SCRIPT,
            Ok(extraction_json(vec![element_json(1, "input", "", (0.0, 0.0, 200.0, 30.0))])),
        );
        browser.reply(
            SCROLL_INTO_VIEW_SCRIPT,
            Ok(json!({"x": 0.0, "y": 0.0, "width": 200.0, "height": 30.0})),
        );
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;
        let node = node_at(&mut session, 1).await;

        session.type_text(&node, "abc", false).await.unwrap();
        assert_eq!(browser.typed_text(), vec!["abc".to_string()]);
        assert!(session.recent_events().contains("type:1"));
    }

    #[tokio::test]
    async fn scroll_to_missing_text_keeps_its_message() {
        let browser = Arc::new(MockBrowser::new());
        browser.reply(SCROLL_TO_TEXT_SCRIPT, Ok(json!(false)));
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;

        let err = session.scroll_to_text("Pricing").await.unwrap_err();
        assert_eq!(err.to_string(), "Text 'Pricing' not found on page");
        assert_eq!(err.memory(), Some("Text 'Pricing' was not found while scrolling."));
        assert_eq!(browser.script_args(SCROLL_TO_TEXT_SCRIPT).len(), 1);
    }

    #[tokio::test]
    async fn window_scroll_records_direction() {
        let browser = Arc::new(MockBrowser::new());
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;

        session
            .handle_event(BrowserEvent::Scroll {
                direction: ScrollDirection::Up,
                amount: 250,
                node: None,
            })
            .await
            .unwrap();
        assert!(session.recent_events().contains("scroll:up:250"));
    }

    #[tokio::test]
    async fn screenshot_failure_without_cache_is_reported() {
        let browser = Arc::new(MockBrowser::new());
        browser.fail_screenshot(true);
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;

        let err = session.screenshot().await.unwrap_err();
        assert!(err.to_string().starts_with("Safari screenshot failed: WebDriverError"));
        assert_eq!(err.memory(), Some(SCREENSHOT_MEMORY));
        assert_eq!(browser.screenshot_calls(), 1);
    }

    #[tokio::test]
    async fn navigate_records_event_and_new_tab_falls_back_to_applescript() {
        let browser = Arc::new(MockBrowser::new());
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;

        session.navigate("example.com", false).await.unwrap();
        assert_eq!(browser.visited(), vec!["https://example.com/".to_string()]);
        assert!(session.recent_events().contains("navigate:https://example.com/"));

        browser.fail_new_tab(true);
        session.navigate("https://docs.test/", true).await.unwrap();
        assert_eq!(os.opened_tabs(), vec!["https://docs.test/".to_string()]);
    }

    #[tokio::test]
    async fn switch_to_unknown_tab_is_an_agent_error() {
        let browser = Arc::new(MockBrowser::new());
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;

        let err = session
            .switch_tab(Some("00000000-dead-beef".into()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Tab beef not found");
        assert_eq!(err.memory(), Some("Tab beef does not exist. Re-read tabs and retry."));
    }

    #[tokio::test]
    async fn switch_falls_back_to_os_when_driver_refuses() {
        let browser = Arc::new(MockBrowser::new());
        browser.set_tabs(vec![("h1", "https://a.test/", "A"), ("h2", "https://b.test/", "B")]);
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;
        let tabs = session.tab_list().await.unwrap();
        browser.fail_switch_window(true);

        let target = session.switch_tab(Some(tabs[0].target_id.clone())).await.unwrap();
        assert_eq!(target, tabs[0].target_id);
        assert_eq!(os.switched(), vec![0]);
        let short = short_id(&target).to_string();
        assert!(session.recent_events().contains(&format!("switch_tab_fallback:{short}")));
        assert_eq!(session.focused_target(), Some(target.as_str()));
    }

    #[tokio::test]
    async fn switch_without_tabs_opens_blank_one() {
        let browser = Arc::new(MockBrowser::new());
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;
        browser.set_tabs(vec![]);

        let target = session.switch_tab(None).await.unwrap();
        assert_eq!(browser.new_tab_urls(), vec![Some("about:blank".to_string())]);
        assert_eq!(session.focused_target(), Some(target.as_str()));
    }

    #[tokio::test]
    async fn wait_is_clamped() {
        let browser = Arc::new(MockBrowser::new());
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;

        session
            .handle_event(BrowserEvent::Wait {
                seconds: 5.0,
                max_seconds: 0.01,
            })
            .await
            .unwrap();
        session.wait(-3.0, 10.0).await;
        assert!(session.recent_events().contains("wait:0.01s"));
        assert!(session.recent_events().contains("wait:0.00s"));
    }

    #[tokio::test]
    async fn enormous_wait_is_capped() {
        assert_eq!(wait_duration(1e20, 1e20), MAX_WAIT);
        assert_eq!(wait_duration(f64::MAX, f64::INFINITY), Duration::ZERO);
        assert_eq!(wait_duration(2.5, 1e20), Duration::from_millis(2500));

        let browser = Arc::new(MockBrowser::new());
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;
        session
            .handle_event(BrowserEvent::Wait {
                seconds: 0.0,
                max_seconds: 1e20,
            })
            .await
            .unwrap();
        assert!(session.recent_events().contains("wait:0.00s"));
    }

    #[tokio::test]
    async fn send_keys_uses_chords() {
        let browser = Arc::new(MockBrowser::new());
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;

        session.send_keys("cmd+a Enter").await.unwrap();
        let sent = browser.sent_keys();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 2);
        assert!(session.recent_events().contains("send_keys:cmd+a Enter"));
    }

    #[tokio::test]
    async fn upload_is_unsupported_on_script_only_backend() {
        let browser = Arc::new(MockBrowser::with_capability(BackendCapability::ScriptOnly));
        browser.reply(
            EXTRACTION_SCRIPT,
            Ok(extraction_json(vec![element_json(1, "input", "", (0.0, 0.0, 10.0, 10.0))])),
        );
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;
        let node = node_at(&mut session, 1).await;

        let err = session
            .upload_file(&node, Path::new("/tmp/a.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Unsupported(_)));
    }

    #[tokio::test]
    async fn upload_requires_a_selector() {
        let browser = Arc::new(MockBrowser::new());
        let mut input = element_json(1, "input", "", (0.0, 0.0, 10.0, 10.0));
        input["css_selector"] = json!(null);
        input["xpath"] = json!(null);
        browser.reply(EXTRACTION_SCRIPT, Ok(extraction_json(vec![input])));
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;
        let node = node_at(&mut session, 1).await;

        let err = session
            .upload_file(&node, Path::new("/tmp/a.txt"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Element 1 has no selector for upload");
    }

    #[tokio::test]
    async fn dropdown_options_are_formatted_for_the_agent() {
        let browser = Arc::new(MockBrowser::new());
        browser.reply(
            EXTRACTION_SCRIPT,
            Ok(extraction_json(vec![element_json(1, "select", "", (0.0, 0.0, 80.0, 20.0))])),
        );
        browser.reply(
            DROPDOWN_OPTIONS_SCRIPT,
            Ok(json!({
                "found": true,
                "is_select": true,
                "options": [
                    {"index": 0, "text": "Red", "value": "r"},
                    {"index": 1, "text": "Blue", "value": "b"}
                ]
            })),
        );
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;
        let node = node_at(&mut session, 1).await;

        let outcome = session
            .handle_event(BrowserEvent::GetDropdownOptions { node })
            .await
            .unwrap();
        let record = outcome.record().unwrap();
        assert_eq!(record["type"], "select");
        assert_eq!(
            record["formatted_options"],
            "0: text=\"Red\", value=\"r\"\n1: text=\"Blue\", value=\"b\""
        );
        assert!(record["message"].starts_with("Found 2 dropdown options for index 1:"));
        assert_eq!(record["long_term_memory"], "Read dropdown options for index 1.");
        assert!(session.recent_events().contains("dropdown_options:1"));
    }

    #[tokio::test]
    async fn dropdown_on_non_select_is_a_record_not_an_error() {
        let browser = Arc::new(MockBrowser::new());
        browser.reply(
            EXTRACTION_SCRIPT,
            Ok(extraction_json(vec![element_json(1, "div", "Pick", (0.0, 0.0, 80.0, 20.0))])),
        );
        browser.reply(
            DROPDOWN_OPTIONS_SCRIPT,
            Ok(json!({"found": true, "is_select": false, "tag": "div"})),
        );
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;
        let node = node_at(&mut session, 1).await;

        let record = session.dropdown_options(&node).await.unwrap();
        assert_eq!(record["error"], "Element 1 is not a select element");
        assert!(record.contains_key("short_term_memory"));
    }

    #[tokio::test]
    async fn select_option_reports_success_and_misses() {
        let browser = Arc::new(MockBrowser::new());
        browser.reply(
            EXTRACTION_SCRIPT,
            Ok(extraction_json(vec![element_json(1, "select", "", (0.0, 0.0, 80.0, 20.0))])),
        );
        browser.reply(
            SELECT_OPTION_SCRIPT,
            Ok(json!({"found": true, "is_select": true, "matched": true, "value": "b", "text": "Blue"})),
        );
        let os = Arc::new(MockScripting::new());
        let mut session = started(&browser, &os).await;
        let node = node_at(&mut session, 1).await;

        let record = session.select_dropdown_option(&node, "blue").await.unwrap();
        assert_eq!(record["success"], "true");
        assert_eq!(record["message"], "Selected option: blue");
        assert_eq!(record["value"], "b");

        browser.reply(
            SELECT_OPTION_SCRIPT,
            Ok(json!({"found": true, "is_select": true, "matched": false, "options": ["Red", "Blue"]})),
        );
        let node = node_at(&mut session, 1).await;
        let record = session.select_dropdown_option(&node, "green").await.unwrap();
        assert_eq!(record["success"], "false");
        assert_eq!(record["error"], "Option 'green' not found. Available options: Red, Blue");
    }

    #[tokio::test]
    async fn handlers_dispatch_through_the_bus() {
        let browser = Arc::new(MockBrowser::new());
        let os = Arc::new(MockScripting::new());
        let session = Arc::new(Mutex::new(started(&browser, &os).await));
        let bus = EventBus::new();
        register_handlers(&session, &bus).await;
        register_handlers(&session, &bus).await;

        assert_eq!(bus.subscribed_kinds().await.len(), EventKind::ALL.len());
        bus.dispatch(BrowserEvent::GoBack).await.unwrap();
        bus.dispatch(BrowserEvent::FileDownloaded {
            url: "https://a.test/f.pdf".into(),
            path: PathBuf::from("/tmp/f.pdf"),
            file_name: "f.pdf".into(),
            size: 1,
            file_type: Some("pdf".into()),
        })
        .await
        .unwrap();

        let guard = session.lock().await;
        assert!(guard.recent_events().contains("go_back"));
        assert!(guard.recent_events().contains("download:f.pdf"));
        assert_eq!(browser.history(), vec!["back".to_string()]);
    }

    #[tokio::test]
    async fn unstarted_session_rejects_events() {
        let browser = Arc::new(MockBrowser::new());
        let os = Arc::new(MockScripting::new());
        let mut session = SafariSession::new(test_config(), browser, os);
        let err = session.handle_event(BrowserEvent::Refresh).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotStarted));
    }
}
