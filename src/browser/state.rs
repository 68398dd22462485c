use crate::dom::DomSnapshot;
use crate::types::{PageMetrics, TabRecord};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Composite view of the browser handed to the agent on every state request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserStateSummary {
    pub url: String,
    pub title: String,
    pub tabs: Vec<TabRecord>,
    /// Shared with the cached summary so a failed extraction can reuse it.
    pub dom: Arc<DomSnapshot>,
    /// Base64 PNG of the viewport.
    pub screenshot: Option<String>,
    pub page_info: PageMetrics,
    pub browser_errors: Vec<String>,
    pub recent_events: Option<String>,
    pub closed_popup_messages: Vec<String>,
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

impl BrowserStateSummary {
    pub fn is_degraded(&self) -> bool {
        !self.browser_errors.is_empty()
    }
}

/// Bounded log of short event annotations, oldest dropped first.
#[derive(Debug, Clone)]
pub struct RecentEvents {
    entries: VecDeque<String>,
    capacity: usize,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, event: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(event.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.entries.iter().any(|entry| entry == event)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// The newest `count` entries, oldest first, one per line.
    pub fn tail(&self, count: usize) -> String {
        let skip = self.entries.len().saturating_sub(count);
        self.entries
            .iter()
            .skip(skip)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_events_fall_off() {
        let mut events = RecentEvents::new(3);
        for name in ["a", "b", "c", "d"] {
            events.push(name);
        }
        assert_eq!(events.len(), 3);
        assert!(!events.contains("a"));
        assert_eq!(events.tail(2), "c\nd");
        assert_eq!(events.tail(10), "b\nc\nd");
    }
}
