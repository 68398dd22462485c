use crate::core::{BrowserControl, DriverConfig};
use crate::errors::{BridgeError, Result};
use crate::types::{BackendCapability, CookieRecord, NativeTab};
use crate::utils::keys::{KeyChord, KeyToken, NamedKey};
use async_trait::async_trait;
use fantoccini::actions::{InputSource, KeyAction, KeyActions};
use fantoccini::cookies::Cookie;
use fantoccini::error::CmdError;
use fantoccini::key::Key;
use fantoccini::wd::WindowHandle;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const PORT_POLL: Duration = Duration::from_millis(100);
const RESET_SETTLE: Duration = Duration::from_millis(400);
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(3);

/// `safaridriver` process plus the fantoccini client attached to it.
///
/// Commands are serialized through one mutex and each runs under the
/// configured command timeout.
pub struct SafariDriver {
    config: DriverConfig,
    client: Mutex<Option<Client>>,
    process: Mutex<Option<Child>>,
    commands: Mutex<()>,
}

impl SafariDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
            process: Mutex::new(None),
            commands: Mutex::new(()),
        }
    }

    fn endpoint(&self) -> String {
        format!("http://localhost:{}", self.config.port)
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.config.command_timeout_ms)
    }

    fn capabilities(&self) -> Map<String, Value> {
        let mut caps = Map::new();
        caps.insert("browserName".to_string(), json!("safari"));
        caps.insert(
            "timeouts".to_string(),
            json!({
                "pageLoad": self.config.page_load_timeout_ms,
                "script": self.config.script_timeout_ms,
                "implicit": self.config.implicit_wait_ms,
            }),
        );
        caps
    }

    async fn spawn_driver(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        if let Some(child) = process.as_mut() {
            if child.try_wait()?.is_none() {
                return Ok(());
            }
        }
        info!(
            executable = %self.config.executable_path.display(),
            port = self.config.port,
            "launching safaridriver"
        );
        let mut child = Command::new(&self.config.executable_path)
            .arg("--port")
            .arg(self.config.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                BridgeError::Startup(format!(
                    "could not launch {}: {err}",
                    self.config.executable_path.display()
                ))
            })?;
        forward_stderr(&mut child);
        *process = Some(child);
        Ok(())
    }

    async fn wait_for_port(&self) -> Result<()> {
        let deadline = Duration::from_millis(self.config.startup_timeout_ms);
        let address = ("127.0.0.1", self.config.port);
        let probe = async {
            loop {
                if tokio::net::TcpStream::connect(address).await.is_ok() {
                    return;
                }
                tokio::time::sleep(PORT_POLL).await;
            }
        };
        tokio::time::timeout(deadline, probe).await.map_err(|_| {
            BridgeError::Startup(format!(
                "safaridriver did not open port {} within {}ms",
                self.config.port, self.config.startup_timeout_ms
            ))
        })
    }

    async fn client(&self) -> Result<Client> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or(BridgeError::NotStarted)
    }

    /// Runs one command against the client, serialized and time-boxed.
    async fn run<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = std::result::Result<T, CmdError>>,
    {
        let client = self.client().await?;
        let _guard = self.commands.lock().await;
        match tokio::time::timeout(self.command_timeout(), op(client)).await {
            Ok(result) => result.map_err(BridgeError::from),
            Err(_) => Err(BridgeError::Timeout(format!(
                "{name} exceeded {}ms",
                self.config.command_timeout_ms
            ))),
        }
    }
}

fn window_handle(handle: &str) -> Result<WindowHandle> {
    WindowHandle::try_from(handle.to_string())
        .map_err(|err| BridgeError::InvalidArgument(format!("window handle '{handle}': {err}")))
}

fn named_key(key: NamedKey) -> char {
    let key = match key {
        NamedKey::Enter => Key::Enter,
        NamedKey::Escape => Key::Escape,
        NamedKey::Tab => Key::Tab,
        NamedKey::Space => Key::Space,
        NamedKey::Backspace => Key::Backspace,
        NamedKey::Delete => Key::Delete,
        NamedKey::ArrowUp => Key::Up,
        NamedKey::ArrowDown => Key::Down,
        NamedKey::ArrowLeft => Key::Left,
        NamedKey::ArrowRight => Key::Right,
        NamedKey::Home => Key::Home,
        NamedKey::End => Key::End,
        NamedKey::PageUp => Key::PageUp,
        NamedKey::PageDown => Key::PageDown,
        NamedKey::Meta => Key::Meta,
        NamedKey::Control => Key::Control,
        NamedKey::Alt => Key::Alt,
        NamedKey::Shift => Key::Shift,
        NamedKey::F(1) => Key::F1,
        NamedKey::F(2) => Key::F2,
        NamedKey::F(3) => Key::F3,
        NamedKey::F(4) => Key::F4,
        NamedKey::F(5) => Key::F5,
        NamedKey::F(6) => Key::F6,
        NamedKey::F(7) => Key::F7,
        NamedKey::F(8) => Key::F8,
        NamedKey::F(9) => Key::F9,
        NamedKey::F(10) => Key::F10,
        NamedKey::F(11) => Key::F11,
        NamedKey::F(_) => Key::F12,
    };
    key.into()
}

/// Key-down/key-up sequence for one chord: modifiers pressed in order,
/// the key (or every character of a text run), modifiers released in reverse.
fn chord_actions(chord: &KeyChord) -> KeyActions {
    let mut actions = KeyActions::new("keyboard".to_string());
    for modifier in &chord.modifiers {
        actions = actions.then(KeyAction::Down {
            value: named_key(*modifier),
        });
    }
    let keys: Vec<char> = match &chord.key {
        KeyToken::Named(key) => vec![named_key(*key)],
        KeyToken::Text(text) => text.chars().collect(),
    };
    for key in keys {
        actions = actions
            .then(KeyAction::Down { value: key })
            .then(KeyAction::Up { value: key });
    }
    for modifier in chord.modifiers.iter().rev() {
        actions = actions.then(KeyAction::Up {
            value: named_key(*modifier),
        });
    }
    actions
}

fn to_record(cookie: &Cookie<'_>) -> CookieRecord {
    CookieRecord {
        name: cookie.name().to_string(),
        value: cookie.value().to_string(),
        domain: cookie.domain().unwrap_or_default().to_string(),
        path: cookie.path().unwrap_or("/").to_string(),
        secure: cookie.secure().unwrap_or(false),
        http_only: cookie.http_only().unwrap_or(false),
        same_site: cookie.same_site().map(|same_site| same_site.to_string()),
        expires: cookie.expires_datetime().map(|at| at.unix_timestamp()),
    }
}

fn from_record(record: &CookieRecord) -> Cookie<'static> {
    let mut cookie = Cookie::new(record.name.clone(), record.value.clone());
    if !record.domain.is_empty() {
        cookie.set_domain(record.domain.clone());
    }
    cookie.set_path(record.path.clone());
    cookie.set_secure(Some(record.secure));
    cookie.set_http_only(Some(record.http_only));
    cookie
}

fn is_no_alert(err: &CmdError) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("no such alert") || text.contains("no alert")
}

#[async_trait]
impl BrowserControl for SafariDriver {
    async fn start(&self) -> Result<()> {
        if self.client.lock().await.is_some() {
            return Ok(());
        }
        self.spawn_driver().await?;
        self.wait_for_port().await?;

        let mut builder = ClientBuilder::rustls()
            .map_err(|err| BridgeError::Startup(format!("TLS connector: {err}")))?;
        builder.capabilities(self.capabilities());
        let client = builder.connect(&self.endpoint()).await?;
        *self.client.lock().await = Some(client);
        info!(endpoint = %self.endpoint(), "Safari WebDriver session established");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            if let Err(err) = client.close().await {
                debug!(error = %err, "closing WebDriver session failed");
            }
        }
        if let Some(mut child) = self.process.lock().await.take() {
            if let Err(err) = child.kill().await {
                debug!(error = %err, "safaridriver already exited");
            }
        }
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.stop().await?;
        let status = Command::new("pkill")
            .args(["-f", "safaridriver"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(err) = status {
            warn!(error = %err, "pkill safaridriver failed");
        }
        tokio::time::sleep(RESET_SETTLE).await;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        let Ok(client) = self.client().await else {
            return false;
        };
        matches!(
            tokio::time::timeout(LIVENESS_TIMEOUT, client.window()).await,
            Ok(Ok(_))
        )
    }

    fn capability(&self) -> BackendCapability {
        BackendCapability::FullProtocol
    }

    async fn execute_script(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.run("execute_script", |client| async move {
            client.execute(script, args).await
        })
        .await
    }

    async fn execute_async_script(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.run("execute_async_script", |client| async move {
            client.execute_async(script, args).await
        })
        .await
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.run("navigate", |client| async move { client.goto(url).await })
            .await
    }

    async fn current_url(&self) -> Result<String> {
        self.run("current_url", |client| async move {
            client.current_url().await.map(|url| url.to_string())
        })
        .await
    }

    async fn title(&self) -> Result<String> {
        self.run("title", |client| async move { client.title().await })
            .await
    }

    async fn back(&self) -> Result<()> {
        self.run("back", |client| async move { client.back().await })
            .await
    }

    async fn forward(&self) -> Result<()> {
        self.run("forward", |client| async move { client.forward().await })
            .await
    }

    async fn refresh(&self) -> Result<()> {
        self.run("refresh", |client| async move { client.refresh().await })
            .await
    }

    async fn window_handles(&self) -> Result<Vec<String>> {
        self.run("window_handles", |client| async move {
            client
                .windows()
                .await
                .map(|handles| handles.into_iter().map(String::from).collect())
        })
        .await
    }

    async fn current_window_handle(&self) -> Result<String> {
        self.run("current_window_handle", |client| async move {
            client.window().await.map(String::from)
        })
        .await
    }

    async fn switch_to_window(&self, handle: &str) -> Result<()> {
        let handle = window_handle(handle)?;
        self.run("switch_to_window", |client| async move {
            client.switch_to_window(handle).await
        })
        .await
    }

    async fn new_tab(&self, url: Option<&str>) -> Result<String> {
        self.run("new_tab", |client| async move {
            let created = client.new_window(true).await?;
            client.switch_to_window(created.handle.clone()).await?;
            if let Some(url) = url {
                client.goto(url).await?;
            }
            Ok(String::from(created.handle))
        })
        .await
    }

    async fn close_tab(&self, index: usize) -> Result<()> {
        let handles = self.run("close_tab:windows", |client| async move { client.windows().await }).await?;
        let target = handles
            .get(index)
            .cloned()
            .ok_or_else(|| BridgeError::TabNotFound(format!("index {index}")))?;
        self.run("close_tab", |client| async move {
            let original = client.window().await.ok();
            client.switch_to_window(target.clone()).await?;
            client.close_window().await?;
            let remaining = client.windows().await?;
            let next = original
                .filter(|handle| *handle != target && remaining.contains(handle))
                .or_else(|| remaining.last().cloned());
            if let Some(next) = next {
                client.switch_to_window(next).await?;
            }
            Ok(())
        })
        .await
    }

    async fn list_tabs(&self) -> Result<Vec<NativeTab>> {
        self.run("list_tabs", |client| async move {
            let original = client.window().await.ok();
            let handles = client.windows().await?;
            let mut tabs = Vec::with_capacity(handles.len());
            for (index, handle) in handles.into_iter().enumerate() {
                client.switch_to_window(handle.clone()).await?;
                let title = client.title().await.unwrap_or_default();
                let url = client
                    .current_url()
                    .await
                    .map(|url| url.to_string())
                    .unwrap_or_else(|_| "about:blank".to_string());
                tabs.push(NativeTab {
                    index,
                    handle: String::from(handle),
                    url,
                    title,
                });
            }
            if let Some(original) = original {
                client.switch_to_window(original).await?;
            }
            Ok(tabs)
        })
        .await
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.run("screenshot", |client| async move { client.screenshot().await })
            .await
    }

    async fn cookies(&self) -> Result<Vec<CookieRecord>> {
        self.run("cookies", |client| async move {
            client
                .get_all_cookies()
                .await
                .map(|cookies| cookies.iter().map(to_record).collect())
        })
        .await
    }

    async fn add_cookie(&self, cookie: &CookieRecord) -> Result<()> {
        let cookie = from_record(cookie);
        self.run("add_cookie", |client| async move { client.add_cookie(cookie).await })
            .await
    }

    async fn delete_cookies(&self) -> Result<()> {
        self.run("delete_cookies", |client| async move {
            client.delete_all_cookies().await
        })
        .await
    }

    async fn handle_dialog(&self, accept: bool, prompt_text: Option<&str>) -> Result<Option<String>> {
        self.run("handle_dialog", |client| async move {
            let text = match client.get_alert_text().await {
                Ok(text) => text,
                Err(err) if is_no_alert(&err) => return Ok(None),
                Err(err) => return Err(err),
            };
            if let Some(prompt_text) = prompt_text {
                if let Err(err) = client.send_alert_text(prompt_text).await {
                    debug!(error = %err, "dialog does not take text");
                }
            }
            if accept {
                client.accept_alert().await?;
            } else {
                client.dismiss_alert().await?;
            }
            Ok(Some(text))
        })
        .await
    }

    async fn send_keys(&self, chords: &[KeyChord]) -> Result<()> {
        for chord in chords {
            let actions = chord_actions(chord);
            self.run("send_keys", |client| async move {
                client.perform_actions(actions).await?;
                client.release_actions().await
            })
            .await?;
        }
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        self.run("type_text", |client| async move {
            client.active_element().await?.send_keys(text).await
        })
        .await
    }

    async fn upload_file(&self, css: Option<&str>, xpath: Option<&str>, path: &str) -> Result<()> {
        self.run("upload_file", |client| async move {
            let element = match (css, xpath) {
                (Some(css), _) => match client.find(Locator::Css(css)).await {
                    Ok(element) => element,
                    Err(err) => match xpath {
                        Some(xpath) => client.find(Locator::XPath(xpath)).await?,
                        None => return Err(err),
                    },
                },
                (None, Some(xpath)) => client.find(Locator::XPath(xpath)).await?,
                (None, None) => client.find(Locator::Css("input[type=file]")).await?,
            };
            element.send_keys(path).await
        })
        .await
    }
}

/// Relays the driver's stderr into the log so the pipe never fills up.
fn forward_stderr(child: &mut Child) {
    let Some(stderr) = child.stderr.take() else {
        return;
    };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(target: "safaridriver", "{line}"),
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "safaridriver stderr closed");
                    break;
                }
            }
        }
    });
}
