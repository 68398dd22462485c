use crate::core::BrowserControl;
use crate::errors::{BridgeError, Result};
use crate::utils::javascript::{READY_STATE_SCRIPT, SELECTOR_PRESENT_SCRIPT};
use crate::utils::Poller;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub struct NavigationManager;

impl NavigationManager {
    /// Polls `document.readyState` until it reads `complete` or the deadline
    /// passes. Timing out is not an error; the last observed state is returned.
    pub async fn wait_for_ready_state(
        control: &dyn BrowserControl,
        timeout: Duration,
        poll_interval: Duration,
    ) -> NavigationResult {
        let mut poller = Poller::new(timeout, poll_interval);
        let mut ready_state = String::new();

        loop {
            poller.record_attempt();
            match control.execute_script(READY_STATE_SCRIPT, Vec::new()).await {
                Ok(value) => {
                    ready_state = value.as_str().unwrap_or_default().to_string();
                    if ready_state == "complete" {
                        break;
                    }
                }
                Err(err) => {
                    // pages mid-navigation reject scripts; keep polling
                    debug!(error = %err, "readyState probe failed");
                }
            }
            if !poller.tick().await {
                break;
            }
        }

        NavigationResult {
            success: ready_state == "complete",
            ready_state,
            attempts: poller.attempts(),
            duration_ms: poller.elapsed().as_millis() as u64,
        }
    }

    pub async fn wait_for_selector(
        control: &dyn BrowserControl,
        selector: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool {
        let mut poller = Poller::new(timeout, poll_interval);
        loop {
            poller.record_attempt();
            let present = control
                .execute_script(SELECTOR_PRESENT_SCRIPT, vec![json!(selector)])
                .await
                .ok()
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if present {
                return true;
            }
            if !poller.tick().await {
                return false;
            }
        }
    }
}

/// Parses a navigation target. Bare hosts such as `example.com/path` get
/// an `https://` scheme.
pub fn normalize_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(BridgeError::InvalidArgument("URL must not be empty".to_string()));
    }
    match url::Url::parse(trimmed) {
        Ok(parsed) => Ok(parsed.to_string()),
        Err(url::ParseError::RelativeUrlWithoutBase) => url::Url::parse(&format!("https://{trimmed}"))
            .map(|parsed| parsed.to_string())
            .map_err(|err| BridgeError::InvalidArgument(format!("invalid URL '{trimmed}': {err}"))),
        Err(err) => Err(BridgeError::InvalidArgument(format!(
            "invalid URL '{trimmed}': {err}"
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct NavigationResult {
    pub success: bool,
    pub ready_state: String,
    pub attempts: u32,
    pub duration_ms: u64,
}
