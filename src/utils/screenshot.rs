use crate::core::BrowserControl;
use crate::errors::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::Path;

pub struct ScreenshotManager;

impl ScreenshotManager {
    pub fn encode(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    pub fn decode(encoded: &str) -> Option<Vec<u8>> {
        STANDARD.decode(encoded).ok()
    }

    pub async fn take_base64(control: &dyn BrowserControl) -> Result<String> {
        let bytes = control.screenshot().await?;
        Ok(Self::encode(&bytes))
    }

    /// Captures the viewport and, when a path is given, writes the PNG there too.
    pub async fn capture(control: &dyn BrowserControl, path: Option<&Path>) -> Result<Vec<u8>> {
        let bytes = control.screenshot().await?;
        if let Some(path) = path {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, &bytes).await?;
        }
        Ok(bytes)
    }
}
