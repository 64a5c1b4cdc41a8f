//! Arena-backed document tree shared by the capture and render sides.
//!
//! The capture side reads the host's live tree through this model; the
//! renderer parses transmitted markup back into it. The markup dialect is the
//! one [`write_markup`] produces, plus enough leniency (comments, doctype,
//! unclosed tags, stray end tags) to accept ordinary hand-written HTML.

use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Document,
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// Elements whose content is not markup.
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea", "title"];

pub fn is_void(tag: &str) -> bool {
    VOID_ELEMENTS.contains(&tag)
}

#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Option<Node>>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(Node {
                data: NodeData::Document,
                parent: None,
                children: Vec::new(),
            })],
        }
    }

    /// Parse a full document. Top-level nodes become children of the root.
    pub fn parse(markup: &str) -> Self {
        let mut doc = Self::new();
        let root = doc.root();
        for node in doc.parse_fragment(markup) {
            doc.append_child(root, node);
        }
        doc
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// The first element child of the root (`<html>` for a full page).
    pub fn document_element(&self) -> Option<NodeId> {
        self.element_children(self.root()).next()
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(|n| n.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0).and_then(|n| n.as_mut())
    }

    fn alloc(&mut self, data: NodeData) -> NodeId {
        self.nodes.push(Some(Node {
            data,
            parent: None,
            children: Vec::new(),
        }));
        NodeId(self.nodes.len() - 1)
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.alloc(NodeData::Element {
            tag: tag.to_ascii_lowercase(),
            attrs: Vec::new(),
        })
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.alloc(NodeData::Text(text.to_string()))
    }

    /// True while the node has not been removed.
    pub fn exists(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// True if the node is reachable from the root.
    pub fn is_connected(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node_id) = current {
            if node_id == self.root() {
                return true;
            }
            current = self.node(node_id).and_then(|n| n.parent);
        }
        false
    }

    pub fn data(&self, id: NodeId) -> Option<&NodeData> {
        self.node(id).map(|n| &n.data)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn element_children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children(id)
            .iter()
            .copied()
            .filter(|&c| self.tag(c).is_some())
    }

    pub fn tag(&self, id: NodeId) -> Option<&str> {
        match self.data(id)? {
            NodeData::Element { tag, .. } => Some(tag),
            _ => None,
        }
    }

    pub fn text(&self, id: NodeId) -> Option<&str> {
        match self.data(id)? {
            NodeData::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn attrs(&self, id: NodeId) -> &[(String, String)] {
        match self.data(id) {
            Some(NodeData::Element { attrs, .. }) => attrs,
            _ => &[],
        }
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.attrs(id)
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        if let Some(Node {
            data: NodeData::Element { attrs, .. },
            ..
        }) = self.node_mut(id)
        {
            let name = name.to_ascii_lowercase();
            match attrs.iter_mut().find(|(k, _)| *k == name) {
                Some(slot) => slot.1 = value.to_string(),
                None => attrs.push((name, value.to_string())),
            }
        }
    }

    pub fn remove_attr(&mut self, id: NodeId, name: &str) -> Option<String> {
        if let Some(Node {
            data: NodeData::Element { attrs, .. },
            ..
        }) = self.node_mut(id)
        {
            let pos = attrs.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))?;
            return Some(attrs.remove(pos).1);
        }
        None
    }

    pub fn set_text(&mut self, id: NodeId, value: &str) {
        if let Some(Node {
            data: NodeData::Text(text),
            ..
        }) = self.node_mut(id)
        {
            *text = value.to_string();
        }
    }

    pub fn classes(&self, id: NodeId) -> Vec<&str> {
        self.attr(id, "class")
            .map(|c| c.split_ascii_whitespace().collect())
            .unwrap_or_default()
    }

    /// Append `child` as the last child of `parent`, detaching it first.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        if !self.exists(parent) || !self.exists(child) || parent == child {
            return;
        }
        self.detach(child);
        if let Some(node) = self.node_mut(child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.node_mut(parent) {
            node.children.push(child);
        }
    }

    /// Unlink a node from its parent, keeping the subtree alive.
    pub fn detach(&mut self, id: NodeId) {
        let Some(parent) = self.parent(id) else {
            return;
        };
        if let Some(node) = self.node_mut(parent) {
            node.children.retain(|&c| c != id);
        }
        if let Some(node) = self.node_mut(id) {
            node.parent = None;
        }
    }

    /// Detach a node and free its whole subtree.
    pub fn remove(&mut self, id: NodeId) {
        if id == self.root() {
            return;
        }
        self.detach(id);
        for node in self.descendants(id) {
            if let Some(slot) = self.nodes.get_mut(node.0) {
                *slot = None;
            }
        }
    }

    /// Pre-order traversal including `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if !self.exists(next) {
                continue;
            }
            out.push(next);
            stack.extend(self.children(next).iter().rev().copied());
        }
        out
    }

    /// First connected element whose `id` attribute equals `id`.
    pub fn element_by_id(&self, id: &str) -> Option<NodeId> {
        self.descendants(self.root())
            .into_iter()
            .find(|&n| self.tag(n).is_some() && self.attr(n, "id") == Some(id))
    }

    pub fn text_content(&self, id: NodeId) -> String {
        self.descendants(id)
            .into_iter()
            .filter_map(|n| self.text(n))
            .collect()
    }

    /// Serialize a node and its subtree without any filtering.
    pub fn outer_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        write_markup(self, id, &PlainMarkup, &mut out);
        out
    }

    /// Parse markup into detached nodes owned by this document.
    pub fn parse_fragment(&mut self, markup: &str) -> Vec<NodeId> {
        let mut parser = Parser {
            src: markup,
            pos: 0,
        };
        let mut top = Vec::new();
        let mut stack: Vec<NodeId> = Vec::new();

        while parser.pos < markup.len() {
            let rest = parser.rest();
            if rest.starts_with("<!--") {
                parser.skip_past("-->");
            } else if rest.starts_with("<!") || rest.starts_with("<?") {
                parser.skip_past(">");
            } else if rest.starts_with("</") {
                let name = parser.end_tag();
                if let Some(depth) = stack
                    .iter()
                    .rposition(|&open| self.tag(open) == Some(name.as_str()))
                {
                    stack.truncate(depth);
                }
            } else if rest.starts_with('<')
                && rest[1..].starts_with(|c: char| c.is_ascii_alphabetic())
            {
                let (tag, attrs, self_closing) = parser.start_tag();
                let element = self.alloc(NodeData::Element {
                    tag: tag.clone(),
                    attrs,
                });
                self.attach_parsed(element, &stack, &mut top);

                if self_closing || is_void(&tag) {
                    continue;
                }
                if RAW_TEXT_ELEMENTS.contains(&tag.as_str()) {
                    let raw = parser.raw_text_until_end(&tag);
                    if !raw.is_empty() {
                        let content = if tag == "script" || tag == "style" {
                            raw.to_string()
                        } else {
                            decode_entities(raw)
                        };
                        let text = self.alloc(NodeData::Text(content));
                        self.append_child(element, text);
                    }
                    continue;
                }
                stack.push(element);
            } else {
                let raw = parser.text();
                if !raw.is_empty() {
                    let text = self.alloc(NodeData::Text(decode_entities(raw)));
                    self.attach_parsed(text, &stack, &mut top);
                }
            }
        }
        top
    }

    fn attach_parsed(&mut self, node: NodeId, stack: &[NodeId], top: &mut Vec<NodeId>) {
        match stack.last() {
            Some(&parent) => self.append_child(parent, node),
            None => top.push(node),
        }
    }
}

/// Hooks applied while serializing, used to produce sanitized copies.
pub trait MarkupFilter {
    /// Leave the node (and its subtree) out of the output.
    fn skip(&self, _doc: &Document, _node: NodeId) -> bool {
        false
    }

    /// Attributes to emit for an element.
    fn attributes<'a>(&self, doc: &'a Document, node: NodeId) -> Vec<(Cow<'a, str>, Cow<'a, str>)> {
        doc.attrs(node)
            .iter()
            .map(|(k, v)| (Cow::Borrowed(k.as_str()), Cow::Borrowed(v.as_str())))
            .collect()
    }

    /// Replace an element's children with this text.
    fn replace_content(&self, _doc: &Document, _node: NodeId) -> Option<String> {
        None
    }
}

struct PlainMarkup;

impl MarkupFilter for PlainMarkup {}

/// Serialize `node` into `out` through `filter`.
pub fn write_markup(doc: &Document, node: NodeId, filter: &dyn MarkupFilter, out: &mut String) {
    if filter.skip(doc, node) {
        return;
    }
    match doc.data(node) {
        None => {}
        Some(NodeData::Document) => {
            for &child in doc.children(node) {
                write_markup(doc, child, filter, out);
            }
        }
        Some(NodeData::Text(text)) => {
            let raw_parent = doc
                .parent(node)
                .and_then(|p| doc.tag(p))
                .is_some_and(|t| t == "script" || t == "style");
            if raw_parent {
                out.push_str(text);
            } else {
                escape_into(text, false, out);
            }
        }
        Some(NodeData::Element { tag, .. }) => {
            out.push('<');
            out.push_str(tag);
            for (name, value) in filter.attributes(doc, node) {
                out.push(' ');
                out.push_str(&name);
                out.push_str("=\"");
                escape_into(&value, true, out);
                out.push('"');
            }
            out.push('>');
            if is_void(tag) {
                return;
            }
            match filter.replace_content(doc, node) {
                Some(content) => escape_into(&content, false, out),
                None => {
                    for &child in doc.children(node) {
                        write_markup(doc, child, filter, out);
                    }
                }
            }
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
    }
}

fn escape_into(text: &str, attribute: bool, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest.find(';').filter(|&end| end <= 10).and_then(|end| {
            let entity = &rest[1..end];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" | "#39" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ if entity.starts_with("#x") || entity.starts_with("#X") => {
                    u32::from_str_radix(&entity[2..], 16).ok().and_then(char::from_u32)
                }
                _ if entity.starts_with('#') => {
                    entity[1..].parse::<u32>().ok().and_then(char::from_u32)
                }
                _ => None,
            };
            c.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_past(&mut self, marker: &str) {
        match self.rest().find(marker) {
            Some(i) => self.pos += i + marker.len(),
            None => self.pos = self.src.len(),
        }
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn take_while(&mut self, keep: impl Fn(char) -> bool) -> &'a str {
        let rest = self.rest();
        let end = rest.find(|c: char| !keep(c)).unwrap_or(rest.len());
        self.pos += end;
        &rest[..end]
    }

    fn text(&mut self) -> &'a str {
        let rest = self.rest();
        // A '<' that does not open a tag is ordinary text.
        let mut end = 0;
        while let Some(i) = rest[end..].find('<') {
            let candidate = &rest[end + i..];
            if candidate.starts_with("</")
                || candidate.starts_with("<!")
                || candidate.starts_with("<?")
                || candidate[1..].starts_with(|c: char| c.is_ascii_alphabetic())
            {
                end += i;
                self.pos += end;
                return &rest[..end];
            }
            end += i + 1;
        }
        self.pos = self.src.len();
        rest
    }

    fn end_tag(&mut self) -> String {
        self.pos += 2;
        let name = self
            .take_while(|c| !c.is_whitespace() && c != '>')
            .to_ascii_lowercase();
        self.skip_past(">");
        name
    }

    fn start_tag(&mut self) -> (String, Vec<(String, String)>, bool) {
        self.pos += 1;
        let tag = self
            .take_while(|c| !c.is_whitespace() && c != '>' && c != '/')
            .to_ascii_lowercase();
        let mut attrs: Vec<(String, String)> = Vec::new();
        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.is_empty() {
                return (tag, attrs, false);
            }
            if rest.starts_with("/>") {
                self.pos += 2;
                return (tag, attrs, true);
            }
            if rest.starts_with('>') {
                self.pos += 1;
                return (tag, attrs, false);
            }
            if rest.starts_with('/') {
                self.pos += 1;
                continue;
            }
            let name = self
                .take_while(|c| !c.is_whitespace() && c != '=' && c != '>' && c != '/')
                .to_ascii_lowercase();
            if name.is_empty() {
                // Unparseable byte; skip it rather than loop forever.
                let skip = self.rest().chars().next().map_or(1, char::len_utf8);
                self.pos += skip;
                continue;
            }
            self.skip_whitespace();
            let mut value = String::new();
            if self.rest().starts_with('=') {
                self.pos += 1;
                self.skip_whitespace();
                let rest = self.rest();
                if let Some(quote) = rest.chars().next().filter(|&c| c == '"' || c == '\'') {
                    let body = &rest[1..];
                    let end = body.find(quote).unwrap_or(body.len());
                    value = decode_entities(&body[..end]);
                    self.pos += 1 + end + usize::from(end < body.len());
                } else {
                    let raw = self.take_while(|c| !c.is_whitespace() && c != '>');
                    value = decode_entities(raw);
                }
            }
            if !attrs.iter().any(|(k, _)| *k == name) {
                attrs.push((name, value));
            }
        }
    }

    /// Content of a raw text element up to its end tag, consuming the end tag.
    fn raw_text_until_end(&mut self, tag: &str) -> &'a str {
        let rest = self.rest();
        let closing = format!("</{tag}");
        let lower = rest.to_ascii_lowercase();
        match lower.find(&closing) {
            Some(end) => {
                self.pos += end;
                self.skip_past(">");
                &rest[..end]
            }
            None => {
                self.pos = self.src.len();
                rest
            }
        }
    }
}
