use crate::browser::state::BrowserStateSummary;
use crate::dom::DomNode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
            ScrollDirection::Left => "left",
            ScrollDirection::Right => "right",
        }
    }

    /// (dx, dy) for a scroll of `amount` pixels.
    pub fn delta(&self, amount: i64) -> (i64, i64) {
        match self {
            ScrollDirection::Up => (0, -amount),
            ScrollDirection::Down => (0, amount),
            ScrollDirection::Left => (-amount, 0),
            ScrollDirection::Right => (amount, 0),
        }
    }
}

/// Inbound automation events, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserEvent {
    Navigate {
        url: String,
        #[serde(default)]
        new_tab: bool,
    },
    ClickElement {
        node: DomNode,
    },
    ClickCoordinate {
        x: f64,
        y: f64,
    },
    TypeText {
        node: DomNode,
        text: String,
        #[serde(default = "default_true")]
        clear: bool,
    },
    Scroll {
        direction: ScrollDirection,
        amount: i64,
        #[serde(default)]
        node: Option<DomNode>,
    },
    ScrollToText {
        text: String,
    },
    Screenshot,
    BrowserStateRequest {
        #[serde(default = "default_true")]
        include_dom: bool,
        #[serde(default = "default_true")]
        include_screenshot: bool,
        #[serde(default = "default_true")]
        include_recent_events: bool,
    },
    SwitchTab {
        #[serde(default)]
        target_id: Option<String>,
    },
    CloseTab {
        target_id: String,
    },
    GoBack,
    GoForward,
    Refresh,
    Wait {
        seconds: f64,
        #[serde(default = "default_max_wait")]
        max_seconds: f64,
    },
    SendKeys {
        keys: String,
    },
    UploadFile {
        node: DomNode,
        file_path: PathBuf,
    },
    GetDropdownOptions {
        node: DomNode,
    },
    SelectDropdownOption {
        node: DomNode,
        text: String,
    },
    FileDownloaded {
        url: String,
        path: PathBuf,
        file_name: String,
        size: u64,
        #[serde(default)]
        file_type: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

fn default_max_wait() -> f64 {
    10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    Navigate,
    ClickElement,
    ClickCoordinate,
    TypeText,
    Scroll,
    ScrollToText,
    Screenshot,
    BrowserStateRequest,
    SwitchTab,
    CloseTab,
    GoBack,
    GoForward,
    Refresh,
    Wait,
    SendKeys,
    UploadFile,
    GetDropdownOptions,
    SelectDropdownOption,
    FileDownloaded,
}

impl EventKind {
    pub const ALL: [EventKind; 19] = [
        EventKind::Navigate,
        EventKind::ClickElement,
        EventKind::ClickCoordinate,
        EventKind::TypeText,
        EventKind::Scroll,
        EventKind::ScrollToText,
        EventKind::Screenshot,
        EventKind::BrowserStateRequest,
        EventKind::SwitchTab,
        EventKind::CloseTab,
        EventKind::GoBack,
        EventKind::GoForward,
        EventKind::Refresh,
        EventKind::Wait,
        EventKind::SendKeys,
        EventKind::UploadFile,
        EventKind::GetDropdownOptions,
        EventKind::SelectDropdownOption,
        EventKind::FileDownloaded,
    ];
}

impl BrowserEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BrowserEvent::Navigate { .. } => EventKind::Navigate,
            BrowserEvent::ClickElement { .. } => EventKind::ClickElement,
            BrowserEvent::ClickCoordinate { .. } => EventKind::ClickCoordinate,
            BrowserEvent::TypeText { .. } => EventKind::TypeText,
            BrowserEvent::Scroll { .. } => EventKind::Scroll,
            BrowserEvent::ScrollToText { .. } => EventKind::ScrollToText,
            BrowserEvent::Screenshot => EventKind::Screenshot,
            BrowserEvent::BrowserStateRequest { .. } => EventKind::BrowserStateRequest,
            BrowserEvent::SwitchTab { .. } => EventKind::SwitchTab,
            BrowserEvent::CloseTab { .. } => EventKind::CloseTab,
            BrowserEvent::GoBack => EventKind::GoBack,
            BrowserEvent::GoForward => EventKind::GoForward,
            BrowserEvent::Refresh => EventKind::Refresh,
            BrowserEvent::Wait { .. } => EventKind::Wait,
            BrowserEvent::SendKeys { .. } => EventKind::SendKeys,
            BrowserEvent::UploadFile { .. } => EventKind::UploadFile,
            BrowserEvent::GetDropdownOptions { .. } => EventKind::GetDropdownOptions,
            BrowserEvent::SelectDropdownOption { .. } => EventKind::SelectDropdownOption,
            BrowserEvent::FileDownloaded { .. } => EventKind::FileDownloaded,
        }
    }
}

/// What a handler hands back to the framework.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Done,
    Click {
        x: i64,
        y: i64,
    },
    Typed {
        x: i64,
        y: i64,
        actual_value: Option<String>,
    },
    Screenshot(String),
    State(Box<BrowserStateSummary>),
    Target(String),
    Record(BTreeMap<String, String>),
}

impl EventOutcome {
    pub fn record(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            EventOutcome::Record(record) => Some(record),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_deserialize_from_tagged_json() {
        let event: BrowserEvent =
            serde_json::from_value(json!({"type": "navigate", "url": "https://example.com"}))
                .unwrap();
        assert_eq!(
            event,
            BrowserEvent::Navigate {
                url: "https://example.com".into(),
                new_tab: false
            }
        );

        let state: BrowserEvent =
            serde_json::from_value(json!({"type": "browser_state_request", "include_screenshot": false}))
                .unwrap();
        assert_eq!(state.kind(), EventKind::BrowserStateRequest);
        assert!(matches!(
            state,
            BrowserEvent::BrowserStateRequest { include_dom: true, include_screenshot: false, .. }
        ));
    }

    #[test]
    fn scroll_deltas() {
        assert_eq!(ScrollDirection::Up.delta(300), (0, -300));
        assert_eq!(ScrollDirection::Right.delta(50), (50, 0));
    }
}
