//! Sanitized serialization of the visitor's document.
//!
//! Sensitive form fields are masked in the transmitted copy only; the live
//! tree is never modified.

use std::borrow::Cow;

use tandem_protocol::MirrorConfig;

use crate::dom::{self, Document, MarkupFilter, NodeId};

/// Attribute marking a field whose value was replaced.
pub const MASKED_MARKER: &str = "data-tandem-masked";

const CARD_AUTOCOMPLETE: &[&str] = &["cc-number", "cc-csc"];

#[derive(Debug, Clone)]
pub struct MaskRules {
    placeholder: String,
    patterns: Vec<String>,
    flag_attribute: String,
    strip_scripts: bool,
}

impl MaskRules {
    pub fn new(config: &MirrorConfig) -> Self {
        Self {
            placeholder: config.mask_placeholder.clone(),
            patterns: config
                .sensitive_patterns
                .iter()
                .map(|p| p.trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            flag_attribute: config.mask_attribute.to_ascii_lowercase(),
            strip_scripts: config.strip_scripts,
        }
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Whether the element is a form field whose value must not leave the page.
    pub fn is_sensitive(&self, doc: &Document, node: NodeId) -> bool {
        if !matches!(doc.tag(node), Some("input" | "textarea")) {
            return false;
        }
        if doc.attr(node, &self.flag_attribute).is_some() {
            return true;
        }
        if doc
            .attr(node, "type")
            .is_some_and(|t| t.eq_ignore_ascii_case("password"))
        {
            return true;
        }
        if let Some(autocomplete) = doc.attr(node, "autocomplete") {
            let card = autocomplete.split_ascii_whitespace().any(|token| {
                let token = token.to_ascii_lowercase();
                CARD_AUTOCOMPLETE.contains(&token.as_str()) || token.starts_with("cc-exp")
            });
            if card {
                return true;
            }
        }
        ["name", "id"].iter().any(|attr| {
            doc.attr(node, attr).is_some_and(|value| {
                let value = value.to_ascii_lowercase();
                self.patterns.iter().any(|p| value.contains(p.as_str()))
            })
        })
    }

    /// Whether an attribute may appear in the transmitted copy at all.
    pub fn allows_attribute(&self, name: &str) -> bool {
        !(self.strip_scripts && is_event_handler(name))
    }

    /// Whether an element is dropped from the transmitted copy, along with
    /// its subtree.
    pub fn drops_element(&self, doc: &Document, node: NodeId) -> bool {
        doc.tag(node).is_some_and(|tag| self.drops_tag(tag))
    }

    pub fn drops_tag(&self, tag: &str) -> bool {
        self.strip_scripts && matches!(tag, "script" | "noscript")
    }

    /// True if the node or one of its ancestors is dropped.
    pub fn is_hidden(&self, doc: &Document, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if self.drops_element(doc, id) {
                return true;
            }
            current = doc.parent(id);
        }
        false
    }

    /// True if the node is a sensitive field or lies inside one. Content
    /// under a masked field only ever travels as the placeholder.
    pub fn is_within_sensitive(&self, doc: &Document, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if self.is_sensitive(doc, id) {
                return true;
            }
            current = doc.parent(id);
        }
        false
    }

    /// Value to transmit for an attribute change on `node`.
    pub fn attribute_value(
        &self,
        doc: &Document,
        node: NodeId,
        name: &str,
        value: Option<&str>,
    ) -> Option<String> {
        let value = value?;
        if name.eq_ignore_ascii_case("value") && self.is_sensitive(doc, node) {
            return Some(self.placeholder.clone());
        }
        Some(value.to_string())
    }

    /// Serialize a node and its subtree with masking applied.
    pub fn serialize(&self, doc: &Document, node: NodeId) -> String {
        let mut out = String::new();
        dom::write_markup(doc, node, self, &mut out);
        out
    }
}

impl MarkupFilter for MaskRules {
    fn skip(&self, doc: &Document, node: NodeId) -> bool {
        self.drops_element(doc, node)
    }

    fn attributes<'a>(&self, doc: &'a Document, node: NodeId) -> Vec<(Cow<'a, str>, Cow<'a, str>)> {
        let sensitive = self.is_sensitive(doc, node);
        let mut attrs: Vec<(Cow<'a, str>, Cow<'a, str>)> = doc
            .attrs(node)
            .iter()
            .filter(|(name, _)| self.allows_attribute(name) && name != MASKED_MARKER)
            .map(|(name, value)| {
                let value = if sensitive && name == "value" {
                    Cow::Owned(self.placeholder.clone())
                } else {
                    Cow::Borrowed(value.as_str())
                };
                (Cow::Borrowed(name.as_str()), value)
            })
            .collect();
        if sensitive {
            if doc.tag(node) == Some("input") && doc.attr(node, "value").is_none() {
                attrs.push((Cow::Borrowed("value"), Cow::Owned(self.placeholder.clone())));
            }
            attrs.push((Cow::Borrowed(MASKED_MARKER), Cow::Borrowed("true")));
        }
        attrs
    }

    fn replace_content(&self, doc: &Document, node: NodeId) -> Option<String> {
        (doc.tag(node) == Some("textarea") && self.is_sensitive(doc, node))
            .then(|| self.placeholder.clone())
    }
}

pub(crate) fn is_event_handler(name: &str) -> bool {
    name.len() > 2 && name.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("on"))
}
