//! Host page interface for Mirror Capture, plus an in-memory page used by
//! embedders without a real browser document and by tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tandem_protocol::Viewport;
use tokio::sync::mpsc;

use crate::dom::{Document, NodeId};

/// A style sheet the host could not read (cross-origin, blocked, ...).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("style sheet {href} is not readable: {reason}")]
pub struct StyleSheetError {
    pub href: String,
    pub reason: String,
}

/// One observed document change.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationRecord {
    /// Children of `target` were added and/or removed.
    ChildList {
        target: NodeId,
        added: Vec<NodeId>,
        removed_tags: Vec<String>,
    },
    /// Attribute `name` of `target` changed; read the new value from the tree.
    Attribute { target: NodeId, name: String },
}

/// Activity reported by the host page while it is observed.
#[derive(Debug, Clone, PartialEq)]
pub enum PageActivity {
    Mutations(Vec<MutationRecord>),
    Scroll { x: f64, y: f64 },
    PointerMove { x: f64, y: f64 },
    Click { x: f64, y: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OverlayId(pub u64);

/// Live document access granted by the page hosting the capture side.
pub trait DocumentObserver: Send + Sync {
    /// Run `f` against the current document.
    fn read(&self, f: &mut dyn FnMut(&Document));

    /// Rules of every style sheet, in document order.
    fn style_sheets(&self) -> Vec<Result<Vec<String>, StyleSheetError>>;

    fn viewport(&self) -> Viewport;

    fn url(&self) -> String;

    /// Start reporting changes, scrolling and pointer activity. A second call
    /// replaces the previous stream.
    fn observe(&self) -> mpsc::UnboundedReceiver<PageActivity>;

    /// Stop reporting activity. Idempotent.
    fn disconnect(&self);

    /// Draw a temporary outline over `node`. `None` if the node is gone.
    fn show_outline(&self, node: NodeId, color: &str) -> Option<OverlayId>;

    fn remove_outline(&self, overlay: OverlayId);
}

/// Read a value out of the observer's document.
pub fn inspect<T>(page: &dyn DocumentObserver, f: impl FnOnce(&Document) -> T) -> Option<T> {
    let mut f = Some(f);
    let mut out = None;
    page.read(&mut |doc| {
        if let Some(f) = f.take() {
            out = Some(f(doc));
        }
    });
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outline {
    pub node: NodeId,
    pub color: String,
}

struct PageState {
    doc: Document,
    sheets: Vec<Result<Vec<String>, StyleSheetError>>,
    viewport: Viewport,
    url: String,
    observer: Option<mpsc::UnboundedSender<PageActivity>>,
    outlines: HashMap<u64, Outline>,
    next_overlay: u64,
}

impl PageState {
    fn emit(&self, activity: PageActivity) {
        if let Some(tx) = &self.observer {
            let _ = tx.send(activity);
        }
    }
}

/// In-memory page. Every mutation helper updates the tree and, while
/// observed, reports the change the way a browser mutation observer would.
pub struct MemoryPage {
    state: Mutex<PageState>,
}

impl MemoryPage {
    pub fn new(markup: &str, url: &str, viewport: Viewport) -> Self {
        Self {
            state: Mutex::new(PageState {
                doc: Document::parse(markup),
                sheets: Vec::new(),
                viewport,
                url: url.to_string(),
                observer: None,
                outlines: HashMap::new(),
                next_overlay: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PageState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_style_sheet(&self, rules: &[&str]) {
        self.lock()
            .sheets
            .push(Ok(rules.iter().map(|r| r.to_string()).collect()));
    }

    /// Add a sheet whose rules cannot be read, like a cross-origin sheet.
    pub fn add_unreadable_style_sheet(&self, href: &str) {
        self.lock().sheets.push(Err(StyleSheetError {
            href: href.to_string(),
            reason: "cross-origin".to_string(),
        }));
    }

    pub fn element_by_id(&self, id: &str) -> Option<NodeId> {
        self.lock().doc.element_by_id(id)
    }

    pub fn with_document<T>(&self, f: impl FnOnce(&Document) -> T) -> T {
        f(&self.lock().doc)
    }

    /// Apply several changes that are reported as one batch.
    pub fn batch<T>(&self, f: impl FnOnce(&mut MutationBatch<'_>) -> T) -> T {
        let mut state = self.lock();
        let mut batch = MutationBatch {
            doc: &mut state.doc,
            records: Vec::new(),
        };
        let out = f(&mut batch);
        let records = batch.records;
        if !records.is_empty() {
            state.emit(PageActivity::Mutations(records));
        }
        out
    }

    pub fn append_html(&self, parent: NodeId, markup: &str) -> Vec<NodeId> {
        self.batch(|b| b.append_html(parent, markup))
    }

    pub fn remove_node(&self, node: NodeId) {
        self.batch(|b| b.remove_node(node))
    }

    pub fn set_attribute(&self, node: NodeId, name: &str, value: &str) {
        self.batch(|b| b.set_attribute(node, name, value))
    }

    pub fn remove_attribute(&self, node: NodeId, name: &str) {
        self.batch(|b| b.remove_attribute(node, name))
    }

    pub fn scroll_to(&self, x: f64, y: f64) {
        self.lock().emit(PageActivity::Scroll { x, y });
    }

    pub fn pointer_move(&self, x: f64, y: f64) {
        self.lock().emit(PageActivity::PointerMove { x, y });
    }

    pub fn click(&self, x: f64, y: f64) {
        self.lock().emit(PageActivity::Click { x, y });
    }

    pub fn is_observed(&self) -> bool {
        self.lock().observer.is_some()
    }

    /// Outlines currently drawn.
    pub fn outlines(&self) -> Vec<Outline> {
        let state = self.lock();
        let mut ids: Vec<_> = state.outlines.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| state.outlines.get(&id).cloned())
            .collect()
    }
}

impl DocumentObserver for MemoryPage {
    fn read(&self, f: &mut dyn FnMut(&Document)) {
        f(&self.lock().doc)
    }

    fn style_sheets(&self) -> Vec<Result<Vec<String>, StyleSheetError>> {
        self.lock().sheets.clone()
    }

    fn viewport(&self) -> Viewport {
        self.lock().viewport
    }

    fn url(&self) -> String {
        self.lock().url.clone()
    }

    fn observe(&self) -> mpsc::UnboundedReceiver<PageActivity> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().observer = Some(tx);
        rx
    }

    fn disconnect(&self) {
        self.lock().observer = None;
    }

    fn show_outline(&self, node: NodeId, color: &str) -> Option<OverlayId> {
        let mut state = self.lock();
        if !state.doc.is_connected(node) {
            return None;
        }
        let id = state.next_overlay;
        state.next_overlay += 1;
        state.outlines.insert(
            id,
            Outline {
                node,
                color: color.to_string(),
            },
        );
        Some(OverlayId(id))
    }

    fn remove_outline(&self, overlay: OverlayId) {
        self.lock().outlines.remove(&overlay.0);
    }
}

/// Mutations applied under one lock and reported together.
pub struct MutationBatch<'a> {
    doc: &'a mut Document,
    records: Vec<MutationRecord>,
}

impl MutationBatch<'_> {
    pub fn document(&self) -> &Document {
        &*self.doc
    }

    pub fn append_html(&mut self, parent: NodeId, markup: &str) -> Vec<NodeId> {
        let added = self.doc.parse_fragment(markup);
        for &node in &added {
            self.doc.append_child(parent, node);
        }
        if !added.is_empty() {
            self.records.push(MutationRecord::ChildList {
                target: parent,
                added: added.clone(),
                removed_tags: Vec::new(),
            });
        }
        added
    }

    pub fn remove_node(&mut self, node: NodeId) {
        let Some(parent) = self.doc.parent(node) else {
            return;
        };
        let removed_tags = self
            .doc
            .tag(node)
            .map(|t| vec![t.to_string()])
            .unwrap_or_default();
        self.doc.remove(node);
        self.records.push(MutationRecord::ChildList {
            target: parent,
            added: Vec::new(),
            removed_tags,
        });
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) {
        self.doc.set_attr(node, name, value);
        self.records.push(MutationRecord::Attribute {
            target: node,
            name: name.to_ascii_lowercase(),
        });
    }

    pub fn remove_attribute(&mut self, node: NodeId, name: &str) {
        if self.doc.remove_attr(node, name).is_some() {
            self.records.push(MutationRecord::Attribute {
                target: node,
                name: name.to_ascii_lowercase(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> MemoryPage {
        MemoryPage::new(
            r#"<html><body><ul id="list"><li>a</li></ul></body></html>"#,
            "https://shop.example/cart",
            Viewport {
                width: 1280,
                height: 720,
            },
        )
    }

    #[test]
    fn unobserved_changes_are_not_reported() {
        let page = page();
        let list = page.element_by_id("list").unwrap();
        page.append_html(list, "<li>b</li>");
        let mut rx = page.observe();
        assert!(rx.try_recv().is_err());
        page.with_document(|doc| assert_eq!(doc.text_content(list), "ab"));
    }

    #[test]
    fn batch_reports_one_activity() {
        let page = page();
        let mut rx = page.observe();
        let list = page.element_by_id("list").unwrap();
        page.batch(|b| {
            b.append_html(list, "<li>b</li><li>c</li>");
            b.set_attribute(list, "class", "open");
        });
        match rx.try_recv().unwrap() {
            PageActivity::Mutations(records) => {
                assert_eq!(records.len(), 2);
                match &records[0] {
                    MutationRecord::ChildList { target, added, .. } => {
                        assert_eq!(*target, list);
                        assert_eq!(added.len(), 2);
                    }
                    other => panic!("Expected ChildList, got {other:?}"),
                }
            }
            other => panic!("Expected Mutations, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn remove_reports_tag_and_disconnect_stops_stream() {
        let page = page();
        let mut rx = page.observe();
        let list = page.element_by_id("list").unwrap();
        let li = page.with_document(|doc| doc.element_children(list).next().unwrap());
        page.remove_node(li);
        assert_eq!(
            rx.try_recv().unwrap(),
            PageActivity::Mutations(vec![MutationRecord::ChildList {
                target: list,
                added: vec![],
                removed_tags: vec!["li".to_string()],
            }])
        );
        page.disconnect();
        assert!(!page.is_observed());
        page.scroll_to(0.0, 10.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn outlines_only_for_connected_nodes() {
        let page = page();
        let list = page.element_by_id("list").unwrap();
        let overlay = page.show_outline(list, "#ff6a00").unwrap();
        assert_eq!(page.outlines().len(), 1);
        page.remove_outline(overlay);
        assert!(page.outlines().is_empty());

        page.remove_node(list);
        assert!(page.show_outline(list, "#ff6a00").is_none());
    }

    #[test]
    fn inspect_reads_through_trait_object() {
        let page = page();
        let observer: &dyn DocumentObserver = &page;
        let count = inspect(observer, |doc| doc.descendants(doc.root()).len());
        assert_eq!(count, Some(6));
    }
}
