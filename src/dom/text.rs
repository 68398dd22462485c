use regex::Regex;
use scraper::{ElementRef, Html, Node};
use std::sync::LazyLock;

const SKIPPED_TAGS: [&str; 5] = ["script", "style", "noscript", "template", "svg"];
const BLOCK_TAGS: [&str; 14] = [
    "p", "div", "section", "article", "header", "footer", "li", "tr", "h1", "h2", "h3", "h4", "br",
    "main",
];

static SPACES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\u{a0}]+").expect("valid whitespace regex"));

fn collapse_spaces(line: &str) -> String {
    SPACES.replace_all(line, " ").into_owned()
}

/// Renders a page's outer HTML as readable plain text, one block per line.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut raw = String::new();
    collect(document.root_element(), &mut raw);

    raw.lines()
        .map(|line| collapse_spaces(line.trim()))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect(element: ElementRef<'_>, out: &mut String) {
    let tag = element.value().name();
    if SKIPPED_TAGS.contains(&tag) {
        return;
    }
    let block = BLOCK_TAGS.contains(&tag);
    if block {
        out.push('\n');
    }
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(_) => {
                if let Some(child_element) = ElementRef::wrap(child) {
                    collect(child_element, out);
                }
            }
            _ => {}
        }
    }
    if block {
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scripts_and_splits_blocks() {
        let html = r#"<html><head><style>p{}</style></head><body>
            <h1>Title</h1><p>First   para</p><script>var x = 1;</script>
            <div>Second <b>bold</b></div></body></html>"#;
        assert_eq!(html_to_text(html), "Title\nFirst para\nSecond bold");
    }

    #[test]
    fn tabs_and_non_breaking_spaces_collapse() {
        assert_eq!(collapse_spaces("a \t\u{a0} b\tc"), "a b c");
    }
}
