//! Re-location of previously handed-out element references.
//!
//! The table is replaced wholesale after every extraction pass. Lookups try,
//! in order: the backend id, the embedded stable id, then the coarse
//! signature with the nearest last-known center as tie-break. The forced
//! re-extraction between the first and second attempt is driven by the
//! session, which owns the control channel.

use crate::dom::element::{DomNode, ElementRef};
use crate::errors::{BridgeError, Result};
use crate::types::DomRect;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    Direct,
    RefreshedDirect,
    StableId,
    Signature,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub element: ElementRef,
    pub strategy: ResolutionStrategy,
}

#[derive(Debug, Default)]
pub struct ElementResolver {
    table: BTreeMap<u32, ElementRef>,
    generation: u64,
}

impl ElementResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the table of a new extraction pass, dropping the old one.
    pub fn replace_table(&mut self, refs: BTreeMap<u32, ElementRef>) {
        self.table = refs;
        self.generation += 1;
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Increments with every installed pass.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, backend_id: u32) -> Option<&ElementRef> {
        self.table.get(&backend_id)
    }

    /// First step: the reference is still valid in the current table.
    pub fn resolve_direct(&self, node: &DomNode) -> Option<Resolution> {
        self.table.get(&node.backend_node_id).map(|element| Resolution {
            element: element.clone(),
            strategy: ResolutionStrategy::Direct,
        })
    }

    /// Remaining steps against a freshly rebuilt table.
    pub fn resolve_after_refresh(&self, node: &DomNode) -> Result<Resolution> {
        if let Some(element) = self.table.get(&node.backend_node_id) {
            return Ok(Resolution {
                element: element.clone(),
                strategy: ResolutionStrategy::RefreshedDirect,
            });
        }

        // Fingerprints can collide on uniform grids; the first entry in
        // document order wins.
        if let Some(stable_id) = node.stable_id() {
            if let Some(element) = self.table.values().find(|r| r.stable_id == stable_id) {
                return Ok(Resolution {
                    element: element.clone(),
                    strategy: ResolutionStrategy::StableId,
                });
            }
        }

        let signature = node.signature();
        self.table
            .values()
            .filter(|r| r.signature() == signature)
            .min_by(|a, b| {
                let da = distance(node.absolute_position, a.absolute_position);
                let db = distance(node.absolute_position, b.absolute_position);
                da.total_cmp(&db)
            })
            .map(|element| Resolution {
                element: element.clone(),
                strategy: ResolutionStrategy::Signature,
            })
            .ok_or_else(|| BridgeError::element_gone(node.backend_node_id))
    }
}

/// Center-to-center distance; unknown geometry sorts last.
pub fn distance(a: Option<DomRect>, b: Option<DomRect>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => {
            let (ax, ay) = a.center();
            let (bx, by) = b.center();
            ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
        }
        _ => f64::INFINITY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::element::{ExtractedElement, STABLE_ID_ATTR};

    fn extracted(index: u32, tag: &str, text: &str, rect: (f64, f64), stable: &str) -> ExtractedElement {
        ExtractedElement {
            index,
            backend_node_id: index,
            tag_name: tag.to_string(),
            text_content: text.to_string(),
            attributes: BTreeMap::new(),
            bounding_rect: DomRect::new(rect.0, rect.1, 20.0, 10.0),
            is_visible: true,
            is_scrollable: false,
            xpath: None,
            css_selector: Some(format!("{tag}:nth-of-type({index})")),
            stable_id: stable.to_string(),
        }
    }

    fn table(elements: &[ExtractedElement]) -> BTreeMap<u32, ElementRef> {
        elements
            .iter()
            .map(|e| (e.backend_node_id, ElementRef::from(e)))
            .collect()
    }

    #[test]
    fn direct_hit_returns_entry_unchanged() {
        let first = extracted(1, "button", "Buy", (0.0, 0.0), "s-buy");
        let mut resolver = ElementResolver::new();
        resolver.replace_table(table(&[first.clone()]));

        let node = DomNode::interactive(&first, "t");
        let hit = resolver.resolve_direct(&node).unwrap();
        assert_eq!(hit.strategy, ResolutionStrategy::Direct);
        assert_eq!(hit.element, ElementRef::from(&first));
    }

    #[test]
    fn stable_id_wins_over_geometry() {
        let old = extracted(3, "button", "Buy", (0.0, 300.0), "s-buy");
        let mut resolver = ElementResolver::new();
        resolver.replace_table(table(&[
            extracted(1, "button", "Buy", (0.0, 300.0), "s-other"),
            extracted(2, "button", "Buy", (0.0, 900.0), "s-buy"),
        ]));

        let mut node = DomNode::interactive(&old, "t");
        node.backend_node_id = 17;
        let hit = resolver.resolve_after_refresh(&node).unwrap();
        assert_eq!(hit.strategy, ResolutionStrategy::StableId);
        assert_eq!(hit.element.backend_node_id, 2);
    }

    #[test]
    fn stable_id_collision_takes_first_in_document_order() {
        let tile = extracted(9, "a", "Product", (0.0, 0.0), "a||||/p|Product|0|0|20|10");
        let mut resolver = ElementResolver::new();
        resolver.replace_table(table(&[
            extracted(4, "a", "Product", (500.0, 0.0), "a||||/p|Product|0|0|20|10"),
            extracted(5, "a", "Product", (0.0, 0.0), "a||||/p|Product|0|0|20|10"),
        ]));

        let node = DomNode::interactive(&tile, "t");
        let hit = resolver.resolve_after_refresh(&node).unwrap();
        assert_eq!(hit.element.backend_node_id, 4);
    }

    #[test]
    fn signature_match_picks_nearest_center() {
        let old = extracted(8, "button", "Add to cart", (100.0, 400.0), "gone");
        let mut resolver = ElementResolver::new();
        resolver.replace_table(table(&[
            extracted(1, "button", "Add to cart", (100.0, 100.0), "x1"),
            extracted(2, "button", "Add to cart", (110.0, 390.0), "x2"),
            extracted(3, "button", "Remove", (100.0, 400.0), "x3"),
        ]));

        let mut node = DomNode::interactive(&old, "t");
        node.attributes.remove(STABLE_ID_ATTR);
        let hit = resolver.resolve_after_refresh(&node).unwrap();
        assert_eq!(hit.strategy, ResolutionStrategy::Signature);
        assert_eq!(hit.element.backend_node_id, 2);
    }

    #[test]
    fn no_match_is_element_gone() {
        let old = extracted(8, "button", "Checkout", (0.0, 0.0), "gone");
        let mut resolver = ElementResolver::new();
        resolver.replace_table(table(&[extracted(1, "a", "Home", (0.0, 0.0), "home")]));

        let node = DomNode::interactive(&old, "t");
        let err = resolver.resolve_after_refresh(&node).unwrap_err();
        assert!(err.is_element_gone());
        assert_eq!(err.to_string(), "Element index 8 no longer exists");
    }

    #[test]
    fn replacing_the_table_drops_old_entries() {
        let mut resolver = ElementResolver::new();
        resolver.replace_table(table(&[extracted(1, "a", "Old", (0.0, 0.0), "old")]));
        resolver.replace_table(table(&[extracted(2, "a", "New", (0.0, 0.0), "new")]));
        assert!(resolver.get(1).is_none());
        assert!(resolver.get(2).is_some());
        assert_eq!(resolver.generation(), 2);
    }
}
