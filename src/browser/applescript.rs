use crate::core::OsScripting;
use crate::errors::{BridgeError, Result};
use crate::types::OsTab;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const MAX_RECENT_DOWNLOADS: usize = 200;

const LIST_TABS_SCRIPT: &str = r#"
tell application "Safari"
    set output to ""
    if (count windows) is 0 then return output
    repeat with t in tabs of window 1
        set output to output & (name of t) & "|" & (URL of t) & linefeed
    end repeat
    return output
end tell
"#;

const DOWNLOADS_FOLDER_SCRIPT: &str = "return POSIX path of (path to downloads folder)";

const SHOW_DOWNLOADS_SCRIPT: &str = r#"
tell application "Safari" to activate
tell application "System Events"
    tell process "Safari"
        keystroke "l" using {command down, option down}
    end tell
end tell
return "ok"
"#;

const FILE_MENU_ITEMS_SCRIPT: &str = r#"
tell application "Safari" to activate
delay 0.1
tell application "System Events"
    tell process "Safari"
        set output to ""
        repeat with itemRef in menu items of menu "File" of menu bar 1
            set itemName to name of itemRef as text
            if itemName is not missing value then
                set output to output & itemName & linefeed
            end if
        end repeat
        return output
    end tell
end tell
"#;

/// Output of one `osascript` run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Drives Safari through `osascript -e`, one process per call.
#[derive(Debug, Clone)]
pub struct AppleScriptRunner {
    timeout: Duration,
}

impl AppleScriptRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn run(&self, script: &str) -> Result<ScriptOutput> {
        let child = Command::new("osascript")
            .arg("-e")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                BridgeError::Timeout(format!(
                    "AppleScript timed out after {:.1}s",
                    self.timeout.as_secs_f64()
                ))
            })??;

        Ok(ScriptOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            success: output.status.success(),
        })
    }

    /// Like [`run`](Self::run), but a non-zero exit is an error.
    async fn run_checked(&self, script: &str) -> Result<String> {
        let output = self.run(script).await?;
        if !output.success {
            let detail = if output.stderr.is_empty() {
                output.stdout
            } else {
                output.stderr
            };
            return Err(BridgeError::AppleScript(detail));
        }
        Ok(output.stdout)
    }

    async fn file_menu_items(&self) -> Result<Vec<String>> {
        let raw = self.run_checked(FILE_MENU_ITEMS_SCRIPT).await?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn click_file_menu_item(&self, item: &str) -> Result<bool> {
        let script = format!(
            r#"
set targetItem to "{}"
tell application "Safari" to activate
delay 0.1
tell application "System Events"
    tell process "Safari"
        if exists menu item targetItem of menu "File" of menu bar 1 then
            click menu item targetItem of menu "File" of menu bar 1
            return "ok"
        end if
    end tell
end tell
return "missing"
"#,
            escape(item)
        );
        Ok(self.run_checked(&script).await?.eq_ignore_ascii_case("ok"))
    }
}

#[async_trait]
impl OsScripting for AppleScriptRunner {
    async fn list_tabs(&self) -> Result<Vec<OsTab>> {
        let raw = self.run_checked(LIST_TABS_SCRIPT).await?;
        Ok(parse_tab_lines(&raw))
    }

    async fn switch_tab(&self, index: usize) -> Result<bool> {
        let script = format!(
            r#"
set targetIndex to {}
tell application "Safari"
    if (count windows) is 0 then return "no-window"
    tell window 1
        if targetIndex > (count tabs) then return "missing"
        set current tab to tab targetIndex
        return "ok"
    end tell
end tell
"#,
            index + 1
        );
        Ok(self.run_checked(&script).await?.eq_ignore_ascii_case("ok"))
    }

    async fn close_tab(&self, index: usize) -> Result<bool> {
        let script = format!(
            r#"
set targetIndex to {}
tell application "Safari"
    if (count windows) is 0 then return "no-window"
    tell window 1
        if targetIndex > (count tabs) then return "missing"
        set tabCountBefore to (count tabs)
        close tab targetIndex
        if (count tabs) < tabCountBefore then return "ok"
        return "unknown"
    end tell
end tell
"#,
            index + 1
        );
        Ok(self.run_checked(&script).await?.eq_ignore_ascii_case("ok"))
    }

    async fn open_tab(&self, url: &str) -> Result<()> {
        let script = format!(
            r#"
tell application "Safari"
    tell window 1
        set current tab to (make new tab with properties {{URL:"{}"}})
    end tell
end tell
"#,
            escape(url)
        );
        self.run_checked(&script).await.map(|_| ())
    }

    async fn downloads_folder(&self) -> Result<Option<PathBuf>> {
        let raw = self.run_checked(DOWNLOADS_FOLDER_SCRIPT).await?;
        Ok(Some(raw).filter(|p| !p.is_empty()).map(PathBuf::from))
    }

    async fn recent_downloads(&self, limit: usize) -> Result<Vec<PathBuf>> {
        let limit = limit.clamp(1, MAX_RECENT_DOWNLOADS);
        let script = format!(
            r#"
set downloadsPath to POSIX path of (path to downloads folder)
set shellCmd to "ls -1tp " & quoted form of downloadsPath & " | grep -v '/$' | head -n {limit}"
set rawOutput to ""
try
    set rawOutput to do shell script shellCmd
on error
    set rawOutput to ""
end try
if rawOutput is "" then return ""
set output to ""
repeat with itemName in paragraphs of rawOutput
    set currentName to (itemName as text)
    if currentName is not "" then
        set output to output & downloadsPath & currentName & linefeed
    end if
end repeat
return output
"#
        );
        let raw = self.run_checked(&script).await?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .filter(|path| path.file_name().is_some())
            .collect())
    }

    async fn show_downloads_ui(&self) -> Result<()> {
        self.run_checked(SHOW_DOWNLOADS_SCRIPT).await.map(|_| ())
    }

    async fn execute_js(&self, script: &str) -> Result<String> {
        let wrapped = format!(
            r#"
tell application "Safari"
    return do JavaScript "{}" in document 1
end tell
"#,
            escape(script)
        );
        self.run_checked(&wrapped).await
    }

    async fn open_profile_window(&self, profile: &str) -> Result<bool> {
        let items = self.file_menu_items().await?;
        let Some(item) = pick_profile_item(profile, &items) else {
            debug!(profile, available = ?items, "no Safari profile menu item matched");
            return Ok(false);
        };
        self.click_file_menu_item(&item).await
    }
}

/// Escapes a value for a double-quoted AppleScript string literal.
pub fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// `title|url` per line; lines without a separator are skipped.
pub fn parse_tab_lines(raw: &str) -> Vec<OsTab> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let (title, url) = line.split_once('|')?;
            Some(OsTab {
                title: title.trim().to_string(),
                url: url.trim().to_string(),
            })
        })
        .collect()
}

/// Finds the File-menu item that opens a window for `profile`. Accepts
/// both `Work` and `New Work Window`; falls back to a single fuzzy match.
pub fn pick_profile_item(profile: &str, items: &[String]) -> Option<String> {
    let normalized = profile.trim();
    if normalized.is_empty() {
        return None;
    }
    let lower = normalized.to_lowercase();
    let wanted = if lower.starts_with("new ") && lower.ends_with(" window") {
        lower.clone()
    } else {
        format!("new {lower} window")
    };

    if let Some(exact) = items.iter().find(|item| item.to_lowercase() == wanted) {
        return Some(exact.clone());
    }

    let fuzzy: Vec<&String> = items
        .iter()
        .filter(|item| {
            let item = item.to_lowercase();
            item.starts_with("new ")
                && item.ends_with(" window")
                && item != "new private window"
                && item.contains(&lower)
        })
        .collect();
    match fuzzy.as_slice() {
        [only] => Some((*only).clone()),
        _ => None,
    }
}
