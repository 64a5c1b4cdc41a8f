//! Structural paths: a selector-like address for an element that both sides
//! of a mirror can compute and resolve against their own copy of the tree.
//!
//! A path is a list of segments joined by `" > "`, from the outermost
//! ancestor down to the element. Walking upward stops at the first element
//! with a unique, selector-safe `id`, which becomes a `#id` anchor. Other
//! segments are `tag` plus `.class` suffixes; `:nth-of-type(k)` is appended
//! only when another sibling matches the same segment.

use crate::dom::{Document, NodeId};

const SEPARATOR: &str = " > ";

/// Compute the path of an element. Returns `None` for text nodes, the
/// document root and detached nodes.
pub fn compute_path(doc: &Document, node: NodeId) -> Option<String> {
    doc.tag(node)?;
    if !doc.is_connected(node) {
        return None;
    }

    let mut segments = Vec::new();
    let mut current = node;
    loop {
        if let Some(id) = doc.attr(current, "id").filter(|id| is_anchor_id(doc, current, id)) {
            segments.push(format!("#{id}"));
            break;
        }

        let tag = doc.tag(current)?;
        let mut segment = tag.to_string();
        for class in doc.classes(current).into_iter().filter(|c| is_plain_ident(c)) {
            segment.push('.');
            segment.push_str(class);
        }

        let parent = doc.parent(current)?;
        let selector = Selector::parse(&segment)?;
        let matching = doc
            .element_children(parent)
            .filter(|&c| selector.matches(doc, c))
            .count();
        if matching > 1 {
            let position = doc
                .element_children(parent)
                .filter(|&c| doc.tag(c) == Some(tag))
                .position(|c| c == current)?;
            segment.push_str(&format!(":nth-of-type({})", position + 1));
        }
        segments.push(segment);

        if parent == doc.root() {
            break;
        }
        current = parent;
    }

    segments.reverse();
    Some(segments.join(SEPARATOR))
}

/// Find the element a path addresses. Unknown or malformed paths resolve to
/// `None`; when several siblings match a segment the first one wins.
pub fn resolve(doc: &Document, path: &str) -> Option<NodeId> {
    let mut segments = path.split(SEPARATOR).map(str::trim);
    let first = segments.next().filter(|s| !s.is_empty())?;

    let mut current = match first.strip_prefix('#') {
        Some(id) => doc.element_by_id(id)?,
        None => Selector::parse(first)?.find_child(doc, doc.root())?,
    };
    for segment in segments {
        current = Selector::parse(segment)?.find_child(doc, current)?;
    }
    Some(current)
}

fn is_plain_ident(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with(|c: char| c.is_ascii_digit())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// An id is usable as an anchor when it is selector-safe and the first
/// element in the document carrying it is this one.
fn is_anchor_id(doc: &Document, node: NodeId, id: &str) -> bool {
    is_plain_ident(id) && doc.element_by_id(id) == Some(node)
}

struct Selector<'a> {
    tag: &'a str,
    classes: Vec<&'a str>,
    nth_of_type: Option<usize>,
}

impl<'a> Selector<'a> {
    fn parse(segment: &'a str) -> Option<Self> {
        let (head, nth_of_type) = match segment.split_once(":nth-of-type(") {
            Some((head, rest)) => {
                let n = rest.strip_suffix(')')?.parse::<usize>().ok()?;
                (head, Some(n))
            }
            None => (segment, None),
        };
        let mut parts = head.split('.');
        let tag = parts.next().filter(|t| !t.is_empty())?;
        Some(Self {
            tag,
            classes: parts.filter(|c| !c.is_empty()).collect(),
            nth_of_type,
        })
    }

    fn matches(&self, doc: &Document, node: NodeId) -> bool {
        if doc.tag(node) != Some(self.tag) {
            return false;
        }
        let classes = doc.classes(node);
        self.classes.iter().all(|c| classes.contains(c))
    }

    fn find_child(&self, doc: &Document, parent: NodeId) -> Option<NodeId> {
        match self.nth_of_type {
            Some(n) => doc
                .element_children(parent)
                .filter(|&c| doc.tag(c) == Some(self.tag))
                .nth(n.checked_sub(1)?)
                .filter(|&c| self.matches(doc, c)),
            None => doc
                .element_children(parent)
                .find(|&c| self.matches(doc, c)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head></head><body><main class="shop"><section class="row"><button class="btn primary">A</button><button class="btn">B</button></section><section class="row"><p>x</p></section><div id="cart"><span>1</span></div><form><input name="q"></form></main></body></html>"#;

    fn doc() -> Document {
        Document::parse(PAGE)
    }

    fn by_text(doc: &Document, tag: &str, text: &str) -> NodeId {
        doc.descendants(doc.root())
            .into_iter()
            .find(|&n| doc.tag(n) == Some(tag) && doc.text_content(n) == text)
            .unwrap()
    }

    #[test]
    fn id_anchor_stops_the_walk() {
        let doc = doc();
        let span = by_text(&doc, "span", "1");
        assert_eq!(compute_path(&doc, span).unwrap(), "#cart > span");
        let cart = doc.element_by_id("cart").unwrap();
        assert_eq!(compute_path(&doc, cart).unwrap(), "#cart");
    }

    #[test]
    fn tag_and_class_segments_without_ids() {
        let doc = doc();
        let body = doc
            .element_children(doc.document_element().unwrap())
            .nth(1)
            .unwrap();
        assert_eq!(compute_path(&doc, body).unwrap(), "html > body");
        let input = doc
            .descendants(doc.root())
            .into_iter()
            .find(|&n| doc.tag(n) == Some("input"))
            .unwrap();
        assert_eq!(
            compute_path(&doc, input).unwrap(),
            "html > body > main.shop > form > input"
        );
    }

    #[test]
    fn nth_of_type_only_for_ambiguous_siblings() {
        let doc = doc();
        let b = by_text(&doc, "button", "B");
        let path = compute_path(&doc, b).unwrap();
        // Both buttons match "button.btn", so the position is needed.
        assert_eq!(
            path,
            "html > body > main.shop > section.row:nth-of-type(1) > button.btn:nth-of-type(2)"
        );
        let a = by_text(&doc, "button", "A");
        let path_a = compute_path(&doc, a).unwrap();
        assert!(path_a.ends_with("button.btn.primary"), "{path_a}");
    }

    #[test]
    fn resolve_inverts_compute_for_every_element() {
        let doc = doc();
        for node in doc.descendants(doc.root()) {
            if doc.tag(node).is_none() {
                continue;
            }
            let path = compute_path(&doc, node).unwrap();
            assert_eq!(resolve(&doc, &path), Some(node), "path {path}");
        }
    }

    #[test]
    fn paths_are_stable_across_reparse() {
        let live = doc();
        let copy = Document::parse(&live.outer_html(live.root()));
        let b = by_text(&live, "button", "B");
        let path = compute_path(&live, b).unwrap();
        let resolved = resolve(&copy, &path).unwrap();
        assert_eq!(copy.text_content(resolved), "B");
    }

    #[test]
    fn unresolvable_paths() {
        let doc = doc();
        assert_eq!(resolve(&doc, "#missing"), None);
        assert_eq!(resolve(&doc, "html > body > aside"), None);
        assert_eq!(resolve(&doc, ""), None);
        assert_eq!(resolve(&doc, "html > body:nth-of-type(x)"), None);
        assert_eq!(resolve(&doc, "html > body > main.shop > section:nth-of-type(0)"), None);
    }

    #[test]
    fn duplicate_ids_fall_back_to_structure() {
        let doc = Document::parse(r#"<div id="dup"></div><div id="dup"><b></b></div>"#);
        let second = doc.element_children(doc.root()).nth(1).unwrap();
        let path = compute_path(&doc, second).unwrap();
        assert_eq!(path, "div:nth-of-type(2)");
        assert_eq!(resolve(&doc, &path), Some(second));
    }

    #[test]
    fn text_nodes_have_no_path() {
        let doc = Document::parse("<p>hi</p>");
        let p = doc.document_element().unwrap();
        let text = doc.children(p)[0];
        assert_eq!(compute_path(&doc, text), None);
        assert_eq!(compute_path(&doc, doc.root()), None);
    }
}
