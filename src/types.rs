use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Geometry of an element, either viewport-relative (extraction time) or
/// absolute (as cached in the element-reference table).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DomRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl DomRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn has_area(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

/// What the control backend can do, decided once when a session is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendCapability {
    /// Native WebDriver commands: keystrokes, file inputs, dialogs, cookies.
    FullProtocol,
    /// Only script evaluation is reliable; input is synthesised in the page.
    ScriptOnly,
}

/// A tab as reported by the WebDriver control layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeTab {
    pub index: usize,
    pub handle: String,
    pub url: String,
    pub title: String,
}

/// A tab as scraped from Safari's front window through AppleScript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsTab {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabRecord {
    pub target_id: String,
    pub handle: Option<String>,
    pub url: String,
    pub title: String,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PageMetrics {
    pub viewport_width: i64,
    pub viewport_height: i64,
    pub page_width: i64,
    pub page_height: i64,
    pub scroll_x: i64,
    pub scroll_y: i64,
    pub pixels_above: i64,
    pub pixels_below: i64,
    pub pixels_left: i64,
    pub pixels_right: i64,
}

impl PageMetrics {
    pub fn from_raw(
        viewport: (i64, i64),
        page: (i64, i64),
        scroll: (i64, i64),
    ) -> Self {
        let (viewport_width, viewport_height) = viewport;
        let (page_width, page_height) = page;
        let (scroll_x, scroll_y) = scroll;
        Self {
            viewport_width,
            viewport_height,
            page_width,
            page_height,
            scroll_x,
            scroll_y,
            pixels_above: scroll_y.max(0),
            pixels_below: (page_height - (scroll_y + viewport_height)).max(0),
            pixels_left: scroll_x.max(0),
            pixels_right: (page_width - (scroll_x + viewport_width)).max(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

/// On-disk layout of a saved browser storage state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    #[serde(default)]
    pub cookies: Vec<CookieRecord>,
    #[serde(default)]
    pub origins: Vec<serde_json::Value>,
    #[serde(default, rename = "localStorage")]
    pub local_storage: BTreeMap<String, String>,
    #[serde(default, rename = "sessionStorage")]
    pub session_storage: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedFile {
    pub url: String,
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub file_type: Option<String>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_clamp_scroll_remainders() {
        let metrics = PageMetrics::from_raw((800, 600), (1000, 2000), (0, 1500));
        assert_eq!(metrics.pixels_above, 1500);
        assert_eq!(metrics.pixels_below, 0);
        assert_eq!(metrics.pixels_right, 200);
    }

    #[test]
    fn storage_state_uses_camel_case_layout() {
        let state = StorageState {
            cookies: vec![CookieRecord {
                name: "sid".into(),
                value: "1".into(),
                domain: ".example.com".into(),
                path: "/".into(),
                secure: true,
                http_only: true,
                same_site: None,
                expires: None,
            }],
            ..Default::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("localStorage").is_some());
        assert!(json.get("sessionStorage").is_some());
        assert_eq!(json["origins"], serde_json::json!([]));
        assert_eq!(json["cookies"][0]["httpOnly"], serde_json::json!(true));
    }
}
