pub mod element;
pub mod extractor;
pub mod resolver;
pub mod state;
pub mod text;

pub use element::{DomNode, ElementRef, ExtractedElement, ExtractionResult, NodeType, STABLE_ID_ATTR};
pub use extractor::{DomExtractor, ExtractionPass, EXTRACTION_SCRIPT};
pub use resolver::{ElementResolver, Resolution, ResolutionStrategy};
pub use state::DomSnapshot;
pub use text::html_to_text;
