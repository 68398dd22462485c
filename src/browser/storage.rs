use crate::browser::session::SafariSession;
use crate::errors::{BridgeError, Result};
use crate::types::{CookieRecord, StorageState};
use crate::utils::javascript::{StorageSnapshot, READ_STORAGE_SCRIPT, WRITE_STORAGE_SCRIPT};
use crate::utils::{with_retry, RetryPolicy, ScriptGateway};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

impl SafariSession {
    pub async fn cookies(&self) -> Result<Vec<CookieRecord>> {
        self.ensure_started()?;
        let control = self.control.as_ref();
        with_retry(control, "get_cookies", RetryPolicy::quick_checked(), || {
            control.cookies()
        })
        .await
    }

    /// Adds cookies for the current page's domain.
    pub async fn set_cookies(&self, cookies: &[CookieRecord]) -> Result<()> {
        self.ensure_started()?;
        for cookie in cookies {
            self.control.add_cookie(cookie).await?;
        }
        Ok(())
    }

    pub async fn clear_cookies(&self) -> Result<()> {
        self.ensure_started()?;
        self.control.delete_cookies().await
    }

    /// Cookies plus the current origin's local and session storage,
    /// optionally written to `path` as JSON.
    pub async fn export_storage_state(&self, path: Option<&Path>) -> Result<StorageState> {
        self.ensure_started()?;
        let cookies = self.cookies().await?;
        let storage = match ScriptGateway::run(self.control.as_ref(), READ_STORAGE_SCRIPT, Vec::new()).await {
            Ok(value) => serde_json::from_value::<StorageSnapshot>(value).unwrap_or_default(),
            Err(err) => {
                debug!(error = %err, "web storage not readable on this page");
                StorageSnapshot::default()
            }
        };
        let state = StorageState {
            cookies,
            origins: Vec::new(),
            local_storage: storage.local,
            session_storage: storage.session,
        };

        if let Some(path) = path {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, serde_json::to_vec_pretty(&state)?).await?;
            info!(path = %path.display(), cookies = state.cookies.len(), "storage state saved");
        }
        Ok(state)
    }

    pub async fn save_storage_state(&self, path: &Path) -> Result<()> {
        self.export_storage_state(Some(path)).await.map(|_| ())
    }

    pub async fn load_storage_state(&mut self, path: &Path) -> Result<()> {
        let raw = tokio::fs::read(path).await?;
        let state: StorageState = serde_json::from_slice(&raw)?;
        self.apply_storage_state(&state).await?;
        info!(path = %path.display(), cookies = state.cookies.len(), "storage state loaded");
        Ok(())
    }

    /// WebDriver only accepts cookies for the loaded domain, so each domain
    /// group is visited before its cookies are added.
    pub async fn apply_storage_state(&mut self, state: &StorageState) -> Result<()> {
        for (domain, cookies) in cookies_by_domain(&state.cookies) {
            let origin = url::Url::parse(&format!("https://{domain}"))
                .map_err(|err| BridgeError::InvalidArgument(format!("cookie domain '{domain}': {err}")))?;
            if let Err(err) = self.control.navigate(origin.as_str()).await {
                warn!(domain = %domain, error = %err, "could not open cookie domain");
                continue;
            }
            for cookie in cookies {
                if let Err(err) = self.control.add_cookie(cookie).await {
                    debug!(name = %cookie.name, domain = %domain, error = %err, "cookie rejected");
                }
            }
        }

        if !state.local_storage.is_empty() || !state.session_storage.is_empty() {
            ScriptGateway::run(
                self.control.as_ref(),
                WRITE_STORAGE_SCRIPT,
                vec![json!(state.local_storage), json!(state.session_storage)],
            )
            .await?;
        }
        self.invalidate();
        Ok(())
    }
}

/// Groups cookies under their domain without the leading dot. Cookies with
/// no domain are skipped.
pub fn cookies_by_domain(cookies: &[CookieRecord]) -> BTreeMap<String, Vec<&CookieRecord>> {
    let mut groups: BTreeMap<String, Vec<&CookieRecord>> = BTreeMap::new();
    for cookie in cookies {
        let domain = cookie.domain.trim().trim_start_matches('.');
        if domain.is_empty() {
            continue;
        }
        groups.entry(domain.to_string()).or_default().push(cookie);
    }
    groups
}
