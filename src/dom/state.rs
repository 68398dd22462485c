use crate::dom::element::{DomNode, STABLE_ID_ATTR};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serialized page model: the document root plus index → element lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomSnapshot {
    pub root: Option<DomNode>,
    pub selector_map: BTreeMap<u32, DomNode>,
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl DomSnapshot {
    pub fn new(root: Option<DomNode>, selector_map: BTreeMap<u32, DomNode>) -> Self {
        Self {
            root,
            selector_map,
            timestamp: Some(chrono::Utc::now()),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.selector_map.is_empty()
    }

    pub fn element_count(&self) -> usize {
        self.selector_map.len()
    }

    pub fn index_by_id(&self, element_id: &str) -> Option<u32> {
        self.selector_map
            .iter()
            .find(|(_, node)| node.attributes.get("id").map(String::as_str) == Some(element_id))
            .map(|(index, _)| *index)
    }

    pub fn index_by_class(&self, class_name: &str) -> Option<u32> {
        self.selector_map
            .iter()
            .find(|(_, node)| {
                node.attributes
                    .get("class")
                    .map(|classes| classes.split_whitespace().any(|c| c == class_name))
                    .unwrap_or(false)
            })
            .map(|(index, _)| *index)
    }

    /// Compact listing for a language model: `[index]<tag attrs>text</tag>`.
    pub fn llm_representation(&self) -> String {
        let mut lines = Vec::with_capacity(self.selector_map.len());
        for (index, node) in &self.selector_map {
            let tag = node.tag_name();
            let attrs: Vec<String> = node
                .attributes
                .iter()
                .filter(|(key, _)| key.as_str() != STABLE_ID_ATTR && key.as_str() != "class")
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            let text = node.matching_text();
            if attrs.is_empty() {
                lines.push(format!("[{index}]<{tag}>{text}</{tag}>"));
            } else {
                lines.push(format!("[{index}]<{tag} {}>{text}</{tag}>", attrs.join(" ")));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::element::ExtractedElement;
    use crate::types::DomRect;

    fn snapshot() -> DomSnapshot {
        let mut map = BTreeMap::new();
        for (index, (tag, id, class)) in [("a", "home", "nav link"), ("button", "buy", "cta")]
            .into_iter()
            .enumerate()
        {
            let index = index as u32 + 1;
            let mut attributes = BTreeMap::new();
            attributes.insert("id".to_string(), id.to_string());
            attributes.insert("class".to_string(), class.to_string());
            let element = ExtractedElement {
                index,
                backend_node_id: index,
                tag_name: tag.to_string(),
                text_content: id.to_uppercase(),
                attributes,
                bounding_rect: DomRect::new(0.0, 0.0, 1.0, 1.0),
                is_visible: true,
                is_scrollable: false,
                xpath: None,
                css_selector: None,
                stable_id: format!("{tag}|{id}"),
            };
            map.insert(index, DomNode::interactive(&element, "t"));
        }
        DomSnapshot::new(None, map)
    }

    #[test]
    fn lookup_by_id_and_class() {
        let snap = snapshot();
        assert_eq!(snap.index_by_id("buy"), Some(2));
        assert_eq!(snap.index_by_class("link"), Some(1));
        assert_eq!(snap.index_by_class("missing"), None);
    }

    #[test]
    fn llm_listing_hides_fingerprints() {
        let text = snapshot().llm_representation();
        assert!(text.starts_with("[1]<a aria-label=HOME id=home>HOME</a>"));
        assert!(!text.contains(STABLE_ID_ATTR));
    }
}
