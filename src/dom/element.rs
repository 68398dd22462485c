use crate::types::DomRect;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attribute carrying an element's extraction fingerprint on the nodes we
/// hand back to the framework, so a later resolve can match on it.
pub const STABLE_ID_ATTR: &str = "data-browser-use-stable-id";

const SIGNATURE_TEXT_LEN: usize = 80;
const ARIA_LABEL_LEN: usize = 120;

/// One interactive candidate from an extraction pass, as the page reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractedElement {
    pub index: u32,
    pub backend_node_id: u32,
    pub tag_name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub text_content: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub bounding_rect: DomRect,
    pub is_visible: bool,
    pub is_scrollable: bool,
    #[serde(default)]
    pub xpath: Option<String>,
    #[serde(default)]
    pub css_selector: Option<String>,
    pub stable_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractionResult {
    pub url: String,
    pub title: String,
    pub viewport_width: i64,
    pub viewport_height: i64,
    pub elements: Vec<ExtractedElement>,
}

/// The resolver's working record for one element of the current pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementRef {
    pub backend_node_id: u32,
    pub stable_id: String,
    pub tag_name: String,
    pub text_content: String,
    pub attributes: BTreeMap<String, String>,
    pub css_selector: Option<String>,
    pub xpath: Option<String>,
    pub absolute_position: Option<DomRect>,
}

impl From<&ExtractedElement> for ElementRef {
    fn from(element: &ExtractedElement) -> Self {
        Self {
            backend_node_id: element.backend_node_id,
            stable_id: element.stable_id.clone(),
            tag_name: element.tag_name.clone(),
            text_content: element.text_content.clone(),
            attributes: element.attributes.clone(),
            css_selector: element.css_selector.clone(),
            xpath: element.xpath.clone(),
            absolute_position: Some(element.bounding_rect),
        }
    }
}

/// Coarse identity used when the fingerprint no longer matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub tag: String,
    pub id: String,
    pub name: String,
    pub href: String,
    pub text: String,
}

impl ElementRef {
    pub fn signature(&self) -> Signature {
        Signature::build(&self.tag_name, &self.attributes, &self.text_content)
    }
}

impl Signature {
    fn build(tag: &str, attributes: &BTreeMap<String, String>, text: &str) -> Self {
        let attr = |name: &str| attributes.get(name).cloned().unwrap_or_default();
        Self {
            tag: tag.to_lowercase(),
            id: attr("id"),
            name: attr("name"),
            href: attr("href"),
            text: truncate_chars(text, SIGNATURE_TEXT_LEN),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Document,
    Element,
    Text,
}

/// Element model handed to the agent framework, in its tree vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomNode {
    pub node_id: u32,
    pub backend_node_id: u32,
    pub node_type: NodeType,
    pub node_name: String,
    pub node_value: String,
    pub attributes: BTreeMap<String, String>,
    pub is_visible: bool,
    pub is_scrollable: bool,
    pub absolute_position: Option<DomRect>,
    pub target_id: String,
    pub children: Vec<DomNode>,
}

impl DomNode {
    pub fn document(target_id: &str) -> Self {
        Self {
            node_id: 0,
            backend_node_id: 0,
            node_type: NodeType::Document,
            node_name: "#document".to_string(),
            node_value: String::new(),
            attributes: BTreeMap::new(),
            is_visible: true,
            is_scrollable: false,
            absolute_position: None,
            target_id: target_id.to_string(),
            children: Vec::new(),
        }
    }

    /// Builds the framework node for an extracted element, embedding the
    /// fingerprint and, for non-inputs, an aria-label from the visible text.
    pub fn interactive(element: &ExtractedElement, target_id: &str) -> Self {
        let mut attributes = element.attributes.clone();
        attributes
            .entry(STABLE_ID_ATTR.to_string())
            .or_insert_with(|| element.stable_id.clone());
        let text = element.text_content.trim();
        if !text.is_empty()
            && !attributes.contains_key("aria-label")
            && !matches!(element.tag_name.as_str(), "input" | "textarea")
        {
            attributes.insert("aria-label".to_string(), truncate_chars(text, ARIA_LABEL_LEN));
        }

        let rect = element.bounding_rect;
        let mut node = Self {
            node_id: element.backend_node_id,
            backend_node_id: element.backend_node_id,
            node_type: NodeType::Element,
            node_name: element.tag_name.to_uppercase(),
            node_value: String::new(),
            attributes,
            is_visible: element.is_visible,
            is_scrollable: element.is_scrollable,
            absolute_position: Some(rect),
            target_id: target_id.to_string(),
            children: Vec::new(),
        };

        if !text.is_empty() {
            let text_id = element.backend_node_id * 1000 + 1;
            node.children.push(Self {
                node_id: text_id,
                backend_node_id: text_id,
                node_type: NodeType::Text,
                node_name: "#text".to_string(),
                node_value: text.to_string(),
                attributes: BTreeMap::new(),
                is_visible: element.is_visible,
                is_scrollable: false,
                absolute_position: Some(rect),
                target_id: target_id.to_string(),
                children: Vec::new(),
            });
        }
        node
    }

    pub fn tag_name(&self) -> String {
        self.node_name.to_lowercase()
    }

    pub fn stable_id(&self) -> Option<&str> {
        self.attributes
            .get(STABLE_ID_ATTR)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    /// aria-label, else value, else the first non-empty text child.
    pub fn matching_text(&self) -> String {
        for key in ["aria-label", "value"] {
            if let Some(value) = self.attributes.get(key).map(|v| v.trim()) {
                if !value.is_empty() {
                    return value.to_string();
                }
            }
        }
        self.children
            .iter()
            .filter(|child| child.node_type == NodeType::Text)
            .map(|child| child.node_value.trim())
            .find(|text| !text.is_empty())
            .unwrap_or_default()
            .to_string()
    }

    pub fn signature(&self) -> Signature {
        Signature::build(&self.tag_name(), &self.attributes, &self.matching_text())
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(tag: &str, text: &str) -> ExtractedElement {
        ExtractedElement {
            index: 1,
            backend_node_id: 1,
            tag_name: tag.to_string(),
            text_content: text.to_string(),
            attributes: BTreeMap::new(),
            bounding_rect: DomRect::new(0.0, 0.0, 10.0, 10.0),
            is_visible: true,
            is_scrollable: false,
            xpath: None,
            css_selector: None,
            stable_id: format!("{tag}|||||{text}|0|0|10|10"),
        }
    }

    #[test]
    fn interactive_node_embeds_stable_id_and_label() {
        let node = DomNode::interactive(&element("button", "Submit order"), "t1");
        assert_eq!(node.node_name, "BUTTON");
        assert_eq!(node.stable_id(), Some("button|||||Submit order|0|0|10|10"));
        assert_eq!(node.attributes.get("aria-label").unwrap(), "Submit order");
        assert_eq!(node.children[0].backend_node_id, 1001);
    }

    #[test]
    fn inputs_do_not_get_synthetic_labels() {
        let node = DomNode::interactive(&element("input", "typed"), "t1");
        assert!(!node.attributes.contains_key("aria-label"));
        assert_eq!(node.matching_text(), "typed");
    }

    #[test]
    fn signature_text_is_capped_at_80_chars() {
        let long = "x".repeat(200);
        let node = DomNode::interactive(&element("a", &long), "t1");
        let reference = ElementRef::from(&element("a", &long));
        assert_eq!(node.signature().text.chars().count(), 80);
        assert_eq!(node.signature(), reference.signature());
    }
}
