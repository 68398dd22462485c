use crate::core::{BrowserControl, DialogConfig};
use crate::utils::{with_retry, Poller, RetryPolicy};
use std::time::Duration;
use tracing::{debug, info};

/// Note recorded for every dialog closed on the agent's behalf.
pub const DIALOG_CLOSED_MESSAGE: &str = "Closed JavaScript dialog automatically.";

/// Native dialogs closed during one watch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DialogReport {
    /// Text of each dialog that was closed, in order.
    pub dialogs: Vec<String>,
    pub polls: u32,
}

impl DialogReport {
    pub fn handled_any(&self) -> bool {
        !self.dialogs.is_empty()
    }
}

/// Closes `alert`/`confirm`/`prompt` dialogs that would otherwise block the
/// control channel.
#[derive(Debug, Clone)]
pub struct DialogWatcher {
    accept: bool,
    prompt_text: Option<String>,
    max_wait: Duration,
    poll_interval: Duration,
}

impl DialogWatcher {
    pub fn new(config: &DialogConfig) -> Self {
        Self {
            accept: config.auto_accept,
            prompt_text: config.prompt_text.clone(),
            max_wait: Duration::from_millis(config.max_wait_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// One check. Control errors count as "no dialog".
    pub async fn dismiss_if_present(&self, control: &dyn BrowserControl) -> Option<String> {
        let outcome = with_retry(
            control,
            "dismiss_dialog:handle_dialog",
            RetryPolicy::quick(),
            || control.handle_dialog(self.accept, self.prompt_text.as_deref()),
        )
        .await;
        match outcome {
            Ok(Some(text)) => {
                info!(accepted = self.accept, "closed JavaScript dialog");
                Some(text)
            }
            Ok(None) => None,
            Err(err) => {
                debug!(error = %err, "dialog check failed");
                None
            }
        }
    }

    /// Polls for dialogs that show up late, such as `onbeforeunload`.
    ///
    /// Stops after the first quiet poll that follows a dialog, after two
    /// quiet polls when none was seen, or at the deadline.
    pub async fn dismiss_after_navigation(&self, control: &dyn BrowserControl) -> DialogReport {
        let mut report = DialogReport::default();
        let mut poller = Poller::new(self.max_wait, self.poll_interval);
        let mut saw_dialog = false;

        loop {
            let handled = self.dismiss_if_present(control).await;
            poller.record_attempt();
            report.polls = poller.attempts();

            match handled {
                Some(text) => {
                    saw_dialog = true;
                    report.dialogs.push(text);
                }
                None if saw_dialog || poller.attempts() >= 2 => return report,
                None => {}
            }

            if poller.expired() {
                return report;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
