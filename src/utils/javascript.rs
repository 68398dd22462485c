use crate::core::BrowserControl;
use crate::errors::{BridgeError, Result};
use crate::types::{DomRect, PageMetrics};
use crate::utils::keys::KeyChord;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

macro_rules! locate_js {
    () => {
        r#"
        const locate = (css, xpath) => {
            if (css) {
                try {
                    const found = document.querySelector(css);
                    if (found) return found;
                } catch (e) {}
            }
            if (xpath) {
                try {
                    return document.evaluate(xpath, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue;
                } catch (e) {}
            }
            return null;
        };
        "#
    };
}

pub const EVALUATE_SCRIPT: &str = "return (0, eval)(arguments[0]);";

pub const EVALUATE_ASYNC_SCRIPT: &str = r#"
    const done = arguments[arguments.length - 1];
    try {
        Promise.resolve((0, eval)(arguments[0])).then(
            (value) => done({ ok: true, value: value === undefined ? null : value }),
            (error) => done({ ok: false, error: String((error && error.message) || error) })
        );
    } catch (error) {
        done({ ok: false, error: String((error && error.message) || error) });
    }
"#;

pub const READY_STATE_SCRIPT: &str = "return document.readyState;";

pub const OUTER_HTML_SCRIPT: &str = "return document.documentElement.outerHTML;";

pub const SELECTOR_PRESENT_SCRIPT: &str = "return !!document.querySelector(arguments[0]);";

pub const PAGE_METRICS_SCRIPT: &str = r#"
    const doc = document.documentElement;
    const body = document.body || doc;
    return {
        viewport_width: Math.round(window.innerWidth || doc.clientWidth || 0),
        viewport_height: Math.round(window.innerHeight || doc.clientHeight || 0),
        page_width: Math.round(Math.max(doc.scrollWidth, body.scrollWidth || 0)),
        page_height: Math.round(Math.max(doc.scrollHeight, body.scrollHeight || 0)),
        scroll_x: Math.round(window.scrollX || window.pageXOffset || 0),
        scroll_y: Math.round(window.scrollY || window.pageYOffset || 0)
    };
"#;

pub const CLICK_AT_SCRIPT: &str = r#"
    const x = arguments[0];
    const y = arguments[1];
    const target = document.elementFromPoint(x, y);
    if (!target) return false;
    const init = { bubbles: true, cancelable: true, view: window, clientX: x, clientY: y };
    target.dispatchEvent(new MouseEvent('mousedown', init));
    target.dispatchEvent(new MouseEvent('mouseup', init));
    if (typeof target.focus === 'function') target.focus();
    target.click();
    return true;
"#;

pub const TYPE_INTO_FOCUSED_SCRIPT: &str = r#"
    const text = arguments[0];
    const el = document.activeElement;
    if (!el || el === document.body) return null;
    if (el.isContentEditable) {
        document.execCommand('insertText', false, text);
        return el.textContent;
    }
    const proto = el instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
    const setter = Object.getOwnPropertyDescriptor(proto, 'value');
    const next = (el.value || '') + text;
    if (setter && setter.set) { setter.set.call(el, next); } else { el.value = next; }
    el.dispatchEvent(new Event('input', { bubbles: true }));
    el.dispatchEvent(new Event('change', { bubbles: true }));
    return el.value;
"#;

pub const DISPATCH_KEYS_SCRIPT: &str = r#"
    const chords = arguments[0];
    const target = document.activeElement || document.body;
    for (const chord of chords) {
        const init = {
            key: chord.key,
            bubbles: true,
            cancelable: true,
            metaKey: chord.modifiers.includes('Meta'),
            ctrlKey: chord.modifiers.includes('Control'),
            altKey: chord.modifiers.includes('Alt'),
            shiftKey: chord.modifiers.includes('Shift')
        };
        target.dispatchEvent(new KeyboardEvent('keydown', init));
        if (chord.key.length === 1 && !init.metaKey && !init.ctrlKey && 'value' in target) {
            target.value = (target.value || '') + chord.key;
            target.dispatchEvent(new Event('input', { bubbles: true }));
        }
        target.dispatchEvent(new KeyboardEvent('keyup', init));
    }
    return chords.length;
"#;

pub const SCROLL_BY_SCRIPT: &str =
    "window.scrollBy(arguments[0], arguments[1]); return [window.scrollX, window.scrollY];";

pub const SCROLL_ELEMENT_SCRIPT: &str = concat!(
    locate_js!(),
    r#"
    const el = locate(arguments[0], arguments[1]);
    if (!el) return false;
    el.scrollBy(arguments[2], arguments[3]);
    return true;
    "#
);

pub const SCROLL_INTO_VIEW_SCRIPT: &str = concat!(
    locate_js!(),
    r#"
    const el = locate(arguments[0], arguments[1]);
    if (!el) return null;
    el.scrollIntoView({ block: 'center', inline: 'center' });
    const rect = el.getBoundingClientRect();
    return { x: rect.x, y: rect.y, width: rect.width, height: rect.height };
    "#
);

pub const CLEAR_ELEMENT_SCRIPT: &str = concat!(
    locate_js!(),
    r#"
    const el = locate(arguments[0], arguments[1]);
    if (!el) return false;
    if (el.isContentEditable) {
        el.textContent = '';
    } else {
        el.value = '';
    }
    el.dispatchEvent(new Event('input', { bubbles: true }));
    return true;
    "#
);

pub const READ_VALUE_SCRIPT: &str = concat!(
    locate_js!(),
    r#"
    const el = locate(arguments[0], arguments[1]);
    if (!el) return null;
    if ('value' in el && el.value !== undefined) return String(el.value);
    return el.textContent;
    "#
);

pub const SCROLL_TO_TEXT_SCRIPT: &str = r#"
    const needle = String(arguments[0]).toLowerCase();
    const walker = document.createTreeWalker(document.body || document.documentElement, NodeFilter.SHOW_TEXT);
    while (walker.nextNode()) {
        const node = walker.currentNode;
        if ((node.textContent || '').toLowerCase().includes(needle) && node.parentElement) {
            node.parentElement.scrollIntoView({ block: 'center' });
            return true;
        }
    }
    return false;
"#;

pub const DROPDOWN_OPTIONS_SCRIPT: &str = concat!(
    locate_js!(),
    r#"
    const el = locate(arguments[0], arguments[1]);
    if (!el) return { found: false };
    if (el.tagName.toLowerCase() !== 'select') return { found: true, is_select: false, tag: el.tagName.toLowerCase() };
    return {
        found: true,
        is_select: true,
        options: Array.from(el.options).map((opt, idx) => ({ index: idx, text: (opt.text || '').trim(), value: opt.value }))
    };
    "#
);

pub const SELECT_OPTION_SCRIPT: &str = concat!(
    locate_js!(),
    r#"
    const el = locate(arguments[0], arguments[1]);
    if (!el) return { found: false };
    if (el.tagName.toLowerCase() !== 'select') return { found: true, is_select: false };
    const wanted = String(arguments[2]).trim().toLowerCase();
    for (const opt of Array.from(el.options)) {
        if ((opt.text || '').trim().toLowerCase() === wanted || String(opt.value).toLowerCase() === wanted) {
            el.value = opt.value;
            el.dispatchEvent(new Event('input', { bubbles: true }));
            el.dispatchEvent(new Event('change', { bubbles: true }));
            return { found: true, is_select: true, matched: true, value: opt.value, text: (opt.text || '').trim() };
        }
    }
    return {
        found: true,
        is_select: true,
        matched: false,
        options: Array.from(el.options).map((opt) => (opt.text || '').trim())
    };
    "#
);

pub const READ_STORAGE_SCRIPT: &str = r#"
    const dump = (store) => {
        const out = {};
        try {
            for (let i = 0; i < store.length; i++) {
                const key = store.key(i);
                out[key] = store.getItem(key);
            }
        } catch (e) {}
        return out;
    };
    return { local: dump(window.localStorage), session: dump(window.sessionStorage) };
"#;

pub const WRITE_STORAGE_SCRIPT: &str = r#"
    const local = arguments[0] || {};
    const session = arguments[1] || {};
    let written = 0;
    for (const [key, value] of Object.entries(local)) { window.localStorage.setItem(key, value); written++; }
    for (const [key, value] of Object.entries(session)) { window.sessionStorage.setItem(key, value); written++; }
    return written;
"#;

/// Outcome of a runtime-style evaluation: a value or the page's exception text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvaluation {
    pub value: Option<Value>,
    pub exception: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropdownOption {
    pub index: usize,
    pub text: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DropdownProbe {
    #[serde(default)]
    pub found: bool,
    #[serde(default)]
    pub is_select: bool,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub options: Vec<DropdownOption>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectionProbe {
    #[serde(default)]
    pub found: bool,
    #[serde(default)]
    pub is_select: bool,
    #[serde(default)]
    pub matched: bool,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageSnapshot {
    #[serde(default)]
    pub local: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub session: std::collections::BTreeMap<String, String>,
}

/// Uniform script path into the active tab. Interaction primitives are
/// generated scripts so they work on every backend tier.
pub struct ScriptGateway;

impl ScriptGateway {
    pub async fn run(control: &dyn BrowserControl, script: &str, args: Vec<Value>) -> Result<Value> {
        control
            .execute_script(script, args)
            .await
            .map_err(into_evaluation_error)
    }

    pub async fn evaluate(control: &dyn BrowserControl, expression: &str) -> Result<Value> {
        Self::run(control, EVALUATE_SCRIPT, vec![json!(expression)]).await
    }

    pub async fn evaluate_async(control: &dyn BrowserControl, expression: &str) -> Result<Value> {
        let reply = control
            .execute_async_script(EVALUATE_ASYNC_SCRIPT, vec![json!(expression)])
            .await
            .map_err(into_evaluation_error)?;
        if reply.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(reply.get("value").cloned().unwrap_or(Value::Null))
        } else {
            let message = reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("promise rejected")
                .to_string();
            Err(BridgeError::Evaluation(message))
        }
    }

    /// Never raises for page exceptions; reports them in the result instead.
    pub async fn evaluate_runtime(
        control: &dyn BrowserControl,
        expression: &str,
        await_promise: bool,
    ) -> RuntimeEvaluation {
        let outcome = if await_promise {
            Self::evaluate_async(control, expression).await
        } else {
            Self::evaluate(control, expression).await
        };
        match outcome {
            Ok(value) => RuntimeEvaluation {
                value: Some(value),
                exception: None,
            },
            Err(err) => RuntimeEvaluation {
                value: None,
                exception: Some(err.to_string()),
            },
        }
    }

    pub async fn click_at(control: &dyn BrowserControl, x: f64, y: f64) -> Result<bool> {
        let value = Self::run(control, CLICK_AT_SCRIPT, vec![json!(x), json!(y)]).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    pub async fn type_into_focused(control: &dyn BrowserControl, text: &str) -> Result<Option<String>> {
        let value = Self::run(control, TYPE_INTO_FOCUSED_SCRIPT, vec![json!(text)]).await?;
        Ok(value.as_str().map(str::to_string))
    }

    pub async fn dispatch_keys(control: &dyn BrowserControl, chords: &[KeyChord]) -> Result<()> {
        let payload: Vec<Value> = chords
            .iter()
            .map(|chord| {
                json!({
                    "key": chord.key.dom_key(),
                    "modifiers": chord.modifiers.iter().map(|m| m.dom_key()).collect::<Vec<_>>(),
                })
            })
            .collect();
        Self::run(control, DISPATCH_KEYS_SCRIPT, vec![Value::Array(payload)]).await?;
        Ok(())
    }

    pub async fn scroll_by(control: &dyn BrowserControl, dx: i64, dy: i64) -> Result<()> {
        Self::run(control, SCROLL_BY_SCRIPT, vec![json!(dx), json!(dy)]).await?;
        Ok(())
    }

    pub async fn scroll_element_by(
        control: &dyn BrowserControl,
        css: Option<&str>,
        xpath: Option<&str>,
        dx: i64,
        dy: i64,
    ) -> Result<bool> {
        let value = Self::run(
            control,
            SCROLL_ELEMENT_SCRIPT,
            vec![json!(css), json!(xpath), json!(dx), json!(dy)],
        )
        .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Viewport rect of the element after scrolling it to the center.
    pub async fn scroll_into_view(
        control: &dyn BrowserControl,
        css: Option<&str>,
        xpath: Option<&str>,
    ) -> Result<Option<DomRect>> {
        let value = Self::run(control, SCROLL_INTO_VIEW_SCRIPT, vec![json!(css), json!(xpath)]).await?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    pub async fn scroll_to_text(control: &dyn BrowserControl, text: &str) -> Result<bool> {
        let value = Self::run(control, SCROLL_TO_TEXT_SCRIPT, vec![json!(text)]).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    pub async fn clear_element(
        control: &dyn BrowserControl,
        css: Option<&str>,
        xpath: Option<&str>,
    ) -> Result<bool> {
        let value = Self::run(control, CLEAR_ELEMENT_SCRIPT, vec![json!(css), json!(xpath)]).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    pub async fn read_value(
        control: &dyn BrowserControl,
        css: Option<&str>,
        xpath: Option<&str>,
    ) -> Result<Option<String>> {
        let value = Self::run(control, READ_VALUE_SCRIPT, vec![json!(css), json!(xpath)]).await?;
        Ok(value.as_str().map(str::to_string))
    }

    pub async fn dropdown_options(
        control: &dyn BrowserControl,
        css: Option<&str>,
        xpath: Option<&str>,
    ) -> Result<DropdownProbe> {
        let value = Self::run(control, DROPDOWN_OPTIONS_SCRIPT, vec![json!(css), json!(xpath)]).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    pub async fn select_option(
        control: &dyn BrowserControl,
        css: Option<&str>,
        xpath: Option<&str>,
        text: &str,
    ) -> Result<SelectionProbe> {
        let value = Self::run(
            control,
            SELECT_OPTION_SCRIPT,
            vec![json!(css), json!(xpath), json!(text)],
        )
        .await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    pub async fn page_metrics(control: &dyn BrowserControl) -> Result<PageMetrics> {
        let value = Self::run(control, PAGE_METRICS_SCRIPT, Vec::new()).await?;
        let field = |name: &str| value.get(name).and_then(Value::as_f64).unwrap_or(0.0) as i64;
        Ok(PageMetrics::from_raw(
            (field("viewport_width"), field("viewport_height")),
            (field("page_width"), field("page_height")),
            (field("scroll_x"), field("scroll_y")),
        ))
    }

    pub async fn outer_html(control: &dyn BrowserControl) -> Result<String> {
        let value = Self::run(control, OUTER_HTML_SCRIPT, Vec::new()).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    pub async fn read_storage(control: &dyn BrowserControl) -> Result<StorageSnapshot> {
        let value = Self::run(control, READ_STORAGE_SCRIPT, Vec::new()).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    pub async fn write_storage(
        control: &dyn BrowserControl,
        local: &std::collections::BTreeMap<String, String>,
        session: &std::collections::BTreeMap<String, String>,
    ) -> Result<u64> {
        let value = Self::run(
            control,
            WRITE_STORAGE_SCRIPT,
            vec![json!(local), json!(session)],
        )
        .await?;
        Ok(value.as_u64().unwrap_or(0))
    }
}

fn into_evaluation_error(err: BridgeError) -> BridgeError {
    match err {
        BridgeError::Evaluation(_) => err,
        other => BridgeError::Evaluation(other.to_string()),
    }
}
