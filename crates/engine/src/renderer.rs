//! Mirror Renderer: rebuilds the visitor's document on the agent side and
//! authors highlight commands.

use std::sync::Arc;
use std::time::Duration;

use tandem_protocol::{
    HighlightPayload, MirrorBody, MirrorConfig, MirrorEvent, MirrorKind, MutationKind,
    MutationPayload, PointerAction, SnapshotPayload, Viewport, now_millis,
};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{EventChannel, Subscription};
use crate::dom::{Document, NodeId};
use crate::error::{MirrorError, SessionError};
use crate::lifecycle::SessionLifecycle;
use crate::mask::is_event_handler;
use crate::path::{compute_path, resolve};

const CLICK_SCALE: f64 = 0.8;
const CLICK_RESTORE: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, PartialEq)]
pub struct CursorOverlay {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
    pub visible: bool,
}

/// The isolated, non-interactive view of the visitor's document.
#[derive(Debug, Clone)]
pub struct RenderSurface {
    pub document: Document,
    pub style_rules: Vec<String>,
    pub viewport: Viewport,
    pub url: String,
    pub scroll_x: f64,
    pub scroll_y: f64,
    pub cursor: CursorOverlay,
}

impl RenderSurface {
    fn from_snapshot(snapshot: SnapshotPayload) -> Self {
        let mut document = Document::parse(&snapshot.markup);
        let root = document.root();
        neutralize(&mut document, root);
        Self {
            document,
            style_rules: snapshot.style_rules,
            viewport: snapshot.viewport,
            url: snapshot.url,
            scroll_x: 0.0,
            scroll_y: 0.0,
            cursor: CursorOverlay {
                x: 0.0,
                y: 0.0,
                scale: 1.0,
                visible: false,
            },
        }
    }

    pub fn markup(&self) -> String {
        self.document.outer_html(self.document.root())
    }

    fn apply_mutation(&mut self, mutation: &MutationPayload) -> bool {
        let doc = &mut self.document;
        let Some(target) = resolve(doc, &mutation.target_path) else {
            debug!(target_path = %mutation.target_path, "Mutation target not found, dropped");
            return false;
        };
        match mutation.mutation_kind {
            MutationKind::NodeListChange => {
                for fragment in mutation.added_fragments.iter().flatten() {
                    for node in doc.parse_fragment(fragment) {
                        doc.append_child(target, node);
                        neutralize(doc, node);
                    }
                }
                for tag in mutation.removed_tags.iter().flatten() {
                    let child = doc
                        .element_children(target)
                        .find(|&c| doc.tag(c) == Some(tag.as_str()));
                    match child {
                        Some(child) => doc.remove(child),
                        None => debug!(%tag, "Removed tag not present, skipped"),
                    }
                }
                true
            }
            MutationKind::AttributeChange => {
                let Some(name) = mutation.attribute_name.as_deref() else {
                    return false;
                };
                if is_event_handler(name) {
                    return false;
                }
                match mutation.attribute_value.as_deref() {
                    Some(value) => doc.set_attr(target, name, value),
                    None => {
                        doc.remove_attr(target, name);
                    }
                }
                true
            }
        }
    }
}

/// Strip anything that could run or react inside the mirrored copy.
fn neutralize(doc: &mut Document, node: NodeId) {
    for id in doc.descendants(node) {
        if !doc.exists(id) {
            continue;
        }
        if matches!(doc.tag(id), Some("script" | "noscript")) {
            doc.remove(id);
            continue;
        }
        let handlers: Vec<String> = doc
            .attrs(id)
            .iter()
            .filter(|(name, _)| is_event_handler(name))
            .map(|(name, _)| name.clone())
            .collect();
        for name in handlers {
            doc.remove_attr(id, &name);
        }
    }
}

pub struct MirrorRenderer {
    channel: Arc<dyn EventChannel>,
    sessions: Arc<dyn SessionLifecycle>,
    config: MirrorConfig,
    session_id: Option<Uuid>,
    subscription: Option<Subscription<MirrorEvent>>,
    surface: Option<RenderSurface>,
    cursor_restore_at: Option<Instant>,
}

impl MirrorRenderer {
    pub fn new(
        channel: Arc<dyn EventChannel>,
        sessions: Arc<dyn SessionLifecycle>,
        config: MirrorConfig,
    ) -> Self {
        Self {
            channel,
            sessions,
            config,
            session_id: None,
            subscription: None,
            surface: None,
            cursor_restore_at: None,
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    /// `None` until the first snapshot has been applied.
    pub fn surface(&self) -> Option<&RenderSurface> {
        self.surface.as_ref()
    }

    /// Subscribe to a mirror session, releasing any previous subscription
    /// first.
    pub async fn attach(&mut self, session_id: Uuid) -> Result<(), MirrorError> {
        self.detach();
        let session = self.sessions.mirror_session(session_id).await?;
        if !session.is_active() {
            return Err(SessionError::Ended(session_id).into());
        }
        let subscription = self.channel.subscribe_mirror(session_id).await?;
        self.session_id = Some(session_id);
        self.subscription = Some(subscription);
        info!(%session_id, "Mirror renderer attached");
        Ok(())
    }

    /// Release the subscription and drop the surface without ending the
    /// session.
    pub fn detach(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            debug!(%session_id, "Mirror renderer detached");
        }
        self.subscription = None;
        self.surface = None;
        self.cursor_restore_at = None;
    }

    /// Wait for the next event, apply it and return it. `None` when not
    /// attached or the session's stream has ended.
    pub async fn next_event(&mut self) -> Option<MirrorEvent> {
        loop {
            let restore_at = self.cursor_restore_at;
            let subscription = self.subscription.as_mut()?;
            tokio::select! {
                event = subscription.recv() => {
                    let event = event?;
                    self.apply(&event);
                    return Some(event);
                }
                _ = sleep_until(restore_at.unwrap_or_else(Instant::now)), if restore_at.is_some() => {
                    self.restore_cursor();
                }
            }
        }
    }

    /// Apply one event to the surface. Returns false if it was dropped.
    pub fn apply(&mut self, event: &MirrorEvent) -> bool {
        if let Some(at) = self.cursor_restore_at
            && at <= Instant::now()
        {
            self.restore_cursor();
        }
        if self.session_id.is_some_and(|id| id != event.session_id) {
            debug!(session_id = %event.session_id, "Event for another session, dropped");
            return false;
        }
        if event.kind == MirrorKind::Highlight {
            return false;
        }
        let body = match event.body() {
            Ok(body) => body,
            Err(e) => {
                warn!(session_id = %event.session_id, "Dropping undecodable mirror event: {e}");
                return false;
            }
        };

        if let MirrorBody::Snapshot(snapshot) = body {
            self.surface = Some(RenderSurface::from_snapshot(snapshot));
            self.cursor_restore_at = None;
            debug!(session_id = %event.session_id, "Surface rebuilt from snapshot");
            return true;
        }
        let Some(surface) = self.surface.as_mut() else {
            debug!(kind = event.kind.as_str(), "Event before first snapshot, dropped");
            return false;
        };
        match body {
            MirrorBody::Mutation(mutation) => surface.apply_mutation(&mutation),
            MirrorBody::Scroll(scroll) => {
                surface.scroll_x = scroll.x;
                surface.scroll_y = scroll.y;
                true
            }
            MirrorBody::Pointer(pointer) => {
                surface.cursor.x = pointer.x;
                surface.cursor.y = pointer.y;
                surface.cursor.visible = true;
                if pointer.action == PointerAction::Click {
                    surface.cursor.scale = CLICK_SCALE;
                    self.cursor_restore_at = Some(Instant::now() + CLICK_RESTORE);
                }
                true
            }
            MirrorBody::Snapshot(_) | MirrorBody::Highlight(_) => false,
        }
    }

    fn restore_cursor(&mut self) {
        self.cursor_restore_at = None;
        if let Some(surface) = self.surface.as_mut() {
            surface.cursor.scale = 1.0;
        }
    }

    /// Publish a highlight for an element of the reconstructed surface.
    pub async fn highlight(&self, node: NodeId) -> Result<HighlightPayload, MirrorError> {
        let surface = self.surface.as_ref().ok_or(MirrorError::NotAttached)?;
        let path = compute_path(&surface.document, node).ok_or(MirrorError::NoPath)?;
        self.highlight_path(&path).await
    }

    /// Publish a highlight for a structural path.
    pub async fn highlight_path(&self, target_path: &str) -> Result<HighlightPayload, MirrorError> {
        let session_id = self.session_id.ok_or(MirrorError::NotAttached)?;
        let highlight = HighlightPayload {
            target_path: target_path.to_string(),
            color: self.config.highlight_color.clone(),
            duration_ms: self.config.highlight_duration_ms,
            timestamp: now_millis(),
        };
        let payload = MirrorBody::Highlight(highlight.clone())
            .to_payload()
            .map_err(crate::error::ChannelError::from)?;
        self.channel
            .append_mirror(session_id, MirrorKind::Highlight, payload)
            .await?;
        debug!(%session_id, target_path, "Highlight published");
        Ok(highlight)
    }

    /// End the mirror session and release the subscription.
    pub async fn close(&mut self) -> Result<(), MirrorError> {
        let Some(session_id) = self.session_id else {
            return Ok(());
        };
        self.detach();
        self.sessions.end_mirror(session_id).await?;
        info!(%session_id, "Mirror session closed by renderer");
        Ok(())
    }
}
