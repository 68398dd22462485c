use crate::core::config::DomConfig;
use crate::core::BrowserControl;
use crate::dom::element::{DomNode, ElementRef, ExtractionResult};
use crate::dom::state::DomSnapshot;
use crate::errors::{BridgeError, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

pub const MIN_ELEMENTS: usize = 1;
pub const MAX_ELEMENTS: usize = 2000;

/// Injected extraction procedure. Selection runs in document order and stops
/// at the cap, so nothing past it is ever measured.
pub const EXTRACTION_SCRIPT: &str = r#"
return (() => {
    const limit = Math.max(1, Math.min(Number(arguments[0] ?? 400), 2000));
    const patterns = [
        'a[href]', 'button', 'input', 'select', 'textarea',
        '[role="button"]', '[role="link"]', '[role="checkbox"]', '[role="menuitem"]', '[role="tab"]',
        '[contenteditable=""]', '[contenteditable="true"]',
        '[tabindex]:not([tabindex="-1"])'
    ];
    const keptAttributes = ['id', 'class', 'aria-label', 'href', 'type', 'placeholder', 'name', 'value', 'role', 'title'];

    const xpathOf = (el) => {
        if (el.id) return `//*[@id="${el.id}"]`;
        const steps = [];
        for (let node = el; node && node.nodeType === Node.ELEMENT_NODE && node !== document.body; node = node.parentElement) {
            let position = 1;
            for (let sib = node.previousElementSibling; sib; sib = sib.previousElementSibling) {
                if (sib.tagName === node.tagName) position += 1;
            }
            steps.unshift(`${node.tagName.toLowerCase()}[${position}]`);
        }
        return '/' + steps.join('/');
    };

    const cssOf = (el) => {
        if (el.id) return `#${CSS.escape(el.id)}`;
        const tag = el.tagName.toLowerCase();
        if (typeof el.className !== 'string' || !el.className.trim()) return tag;
        const classes = el.className.trim().split(/\s+/).slice(0, 2).map((c) => CSS.escape(c));
        return `${tag}.${classes.join('.')}`;
    };

    const visible = (el, rect) => {
        if (rect.width <= 0 || rect.height <= 0) return false;
        if (rect.bottom < 0 || rect.right < 0) return false;
        if (rect.top > window.innerHeight || rect.left > window.innerWidth) return false;
        const style = window.getComputedStyle(el);
        if (style && (style.display === 'none' || style.visibility === 'hidden' || style.opacity === '0')) return false;
        if (el.hasAttribute('hidden') || el.getAttribute('aria-hidden') === 'true') return false;
        return true;
    };

    const picked = [];
    const seen = new Set();
    for (const el of document.querySelectorAll(patterns.join(','))) {
        if (seen.has(el)) continue;
        seen.add(el);
        picked.push(el);
        if (picked.length >= limit) break;
    }

    const elements = picked.map((el, i) => {
        const rect = el.getBoundingClientRect();
        const attributes = {};
        for (const name of keptAttributes) {
            const value = el.getAttribute(name);
            if (value !== null && value !== '') attributes[name] = String(value);
        }
        const text = (el.innerText || el.textContent || '').trim().replace(/\s+/g, ' ').slice(0, 300);
        const fingerprint = [
            el.tagName.toLowerCase(),
            attributes.id || '', attributes.name || '', attributes.role || '', attributes.href || '',
            text.slice(0, 80),
            Math.round(rect.x), Math.round(rect.y), Math.round(rect.width), Math.round(rect.height)
        ].join('|');
        return {
            index: i + 1,
            backend_node_id: i + 1,
            tag_name: el.tagName.toLowerCase(),
            text_content: text,
            attributes,
            bounding_rect: { x: rect.x, y: rect.y, width: rect.width, height: rect.height },
            is_visible: visible(el, rect),
            is_scrollable: el.scrollHeight > el.clientHeight || el.scrollWidth > el.clientWidth,
            xpath: xpathOf(el),
            css_selector: cssOf(el),
            stable_id: fingerprint
        };
    });

    return {
        url: window.location.href,
        title: document.title || '',
        viewport_width: window.innerWidth,
        viewport_height: window.innerHeight,
        elements
    };
})();
"#;

pub struct DomExtractor {
    max_elements: usize,
}

/// One extraction pass turned into the framework snapshot and the matching
/// element-reference table.
#[derive(Debug, Clone)]
pub struct ExtractionPass {
    pub snapshot: DomSnapshot,
    pub refs: BTreeMap<u32, ElementRef>,
    pub url: String,
    pub title: String,
}

impl DomExtractor {
    pub fn new(config: &DomConfig) -> Self {
        Self {
            max_elements: clamp_max_elements(config.max_elements),
        }
    }

    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    pub async fn extract(&self, control: &dyn BrowserControl) -> Result<ExtractionResult> {
        let payload = control
            .execute_script(EXTRACTION_SCRIPT, vec![json!(self.max_elements)])
            .await
            .map_err(|err| match err {
                BridgeError::Evaluation(_) => err,
                other => BridgeError::Evaluation(other.to_string()),
            })?;
        let result = parse_payload(payload)?;
        debug!(elements = result.elements.len(), url = %result.url, "extraction pass");
        Ok(result)
    }

    /// Runs a pass and assembles the document tree and the resolver table.
    pub async fn extract_pass(
        &self,
        control: &dyn BrowserControl,
        target_id: &str,
    ) -> Result<ExtractionPass> {
        let result = self.extract(control).await?;
        Ok(build_pass(result, target_id))
    }
}

pub fn clamp_max_elements(requested: usize) -> usize {
    requested.clamp(MIN_ELEMENTS, MAX_ELEMENTS)
}

/// Strict validation: any missing or extra field rejects the whole payload.
pub fn parse_payload(payload: Value) -> Result<ExtractionResult> {
    if payload.is_null() {
        return Err(BridgeError::ExtractionPayload(
            "page returned no extraction payload".to_string(),
        ));
    }
    let result: ExtractionResult = serde_json::from_value(payload)
        .map_err(|err| BridgeError::ExtractionPayload(err.to_string()))?;
    for (position, element) in result.elements.iter().enumerate() {
        if element.backend_node_id != element.index || element.index as usize != position + 1 {
            return Err(BridgeError::ExtractionPayload(format!(
                "element {} is out of order (backend id {})",
                element.index, element.backend_node_id
            )));
        }
    }
    Ok(result)
}

pub fn build_pass(result: ExtractionResult, target_id: &str) -> ExtractionPass {
    let mut root = DomNode::document(target_id);
    let mut selector_map = BTreeMap::new();
    let mut refs = BTreeMap::new();

    for element in &result.elements {
        let node = DomNode::interactive(element, target_id);
        selector_map.insert(element.backend_node_id, node.clone());
        refs.insert(element.backend_node_id, ElementRef::from(element));
        root.children.push(node);
    }

    ExtractionPass {
        snapshot: DomSnapshot::new(Some(root), selector_map),
        refs,
        url: result.url,
        title: result.title,
    }
}
