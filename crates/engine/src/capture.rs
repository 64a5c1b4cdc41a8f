//! Mirror Capture: runs inside the visitor's page and publishes a masked
//! copy of the document, its changes, scrolling and pointer activity.

use std::sync::Arc;
use std::time::Duration;

use tandem_protocol::{
    HighlightPayload, MirrorBody, MirrorConfig, MirrorEvent, MirrorKind, MutationKind,
    MutationPayload, PointerAction, PointerPayload, ScrollPayload, SnapshotPayload, now_millis,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{EventChannel, Subscription};
use crate::dom::Document;
use crate::error::{MirrorError, SessionError};
use crate::lifecycle::SessionLifecycle;
use crate::mask::{MASKED_MARKER, MaskRules};
use crate::page::{DocumentObserver, MutationRecord, OverlayId, PageActivity, inspect};
use crate::path::{compute_path, resolve};
use crate::throttle::PointerThrottle;

struct Running {
    session_id: Uuid,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct MirrorCapture {
    page: Arc<dyn DocumentObserver>,
    channel: Arc<dyn EventChannel>,
    sessions: Arc<dyn SessionLifecycle>,
    config: MirrorConfig,
    running: Option<Running>,
}

impl MirrorCapture {
    pub fn new(
        page: Arc<dyn DocumentObserver>,
        channel: Arc<dyn EventChannel>,
        sessions: Arc<dyn SessionLifecycle>,
        config: MirrorConfig,
    ) -> Self {
        Self {
            page,
            channel,
            sessions,
            config,
            running: None,
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.running.as_ref().map(|r| r.session_id)
    }

    pub fn is_capturing(&self) -> bool {
        self.running.is_some()
    }

    /// Publish a snapshot and start streaming changes for `session_id`.
    /// Starting again for the same session is a no-op.
    pub async fn start(&mut self, session_id: Uuid) -> Result<(), MirrorError> {
        match &self.running {
            Some(running) if running.session_id == session_id => {
                debug!(%session_id, "Mirror capture already running");
                return Ok(());
            }
            Some(running) => return Err(MirrorError::AlreadyAttached(running.session_id)),
            None => {}
        }

        let session = self.sessions.mirror_session(session_id).await?;
        if !session.is_active() {
            return Err(SessionError::Ended(session_id).into());
        }
        let highlights = self.channel.subscribe_mirror(session_id).await?;

        let worker = CaptureWorker {
            session_id,
            page: Arc::clone(&self.page),
            channel: Arc::clone(&self.channel),
            rules: MaskRules::new(&self.config),
            throttle: PointerThrottle::new(Duration::from_millis(self.config.pointer_throttle_ms)),
            config: self.config.clone(),
            outlines: Vec::new(),
        };

        // Serialize before observing so the snapshot and the first mutation
        // describe consecutive states.
        let snapshot = worker.snapshot();
        let activity = self.page.observe();
        match snapshot {
            Some(snapshot) => worker.publish(MirrorBody::Snapshot(snapshot)).await,
            None => warn!(%session_id, "Document unavailable, no snapshot published"),
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(worker.run(activity, highlights, shutdown_rx));
        self.running = Some(Running {
            session_id,
            shutdown: shutdown_tx,
            task,
        });
        info!(%session_id, "Mirror capture started");
        Ok(())
    }

    /// Stop observing and release the subscription. The session stays active
    /// so a reloaded page can start again. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(());
        if let Err(e) = running.task.await {
            warn!(session_id = %running.session_id, "Capture task ended abnormally: {e}");
        }
        self.page.disconnect();
        info!(session_id = %running.session_id, "Mirror capture stopped");
    }

    /// Stop and end the mirror session (the visitor navigated away).
    pub async fn finish(&mut self) -> Result<(), MirrorError> {
        let session_id = self.session_id();
        self.stop().await;
        if let Some(id) = session_id {
            self.sessions.end_mirror(id).await?;
        }
        Ok(())
    }
}

impl Drop for MirrorCapture {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(());
            self.page.disconnect();
        }
    }
}

struct ActiveOutline {
    overlay: OverlayId,
    expires_at: Instant,
}

struct CaptureWorker {
    session_id: Uuid,
    page: Arc<dyn DocumentObserver>,
    channel: Arc<dyn EventChannel>,
    rules: MaskRules,
    throttle: PointerThrottle,
    config: MirrorConfig,
    outlines: Vec<ActiveOutline>,
}

impl CaptureWorker {
    async fn run(
        mut self,
        mut activity: mpsc::UnboundedReceiver<PageActivity>,
        mut highlights: Subscription<MirrorEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut highlights_open = true;
        loop {
            let next_expiry = self.outlines.iter().map(|o| o.expires_at).min();
            tokio::select! {
                _ = &mut shutdown => break,
                next = activity.recv() => match next {
                    Some(activity) => self.handle_activity(activity).await,
                    None => {
                        debug!(session_id = %self.session_id, "Page stopped reporting activity");
                        break;
                    }
                },
                event = highlights.recv(), if highlights_open => match event {
                    Some(event) => self.handle_event(&event),
                    None => {
                        warn!(session_id = %self.session_id, "Highlight stream closed");
                        highlights_open = false;
                    }
                },
                _ = sleep_until(next_expiry.unwrap_or_else(Instant::now)), if next_expiry.is_some() => {
                    self.expire_outlines(Instant::now());
                }
            }
        }

        for outline in self.outlines.drain(..) {
            self.page.remove_outline(outline.overlay);
        }
    }

    fn snapshot(&self) -> Option<SnapshotPayload> {
        let markup = inspect(&*self.page, |doc| self.rules.serialize(doc, doc.root()))?;
        let mut style_rules = Vec::new();
        for sheet in self.page.style_sheets() {
            match sheet {
                Ok(rules) => style_rules.extend(rules),
                Err(e) => debug!(session_id = %self.session_id, "Skipping style sheet: {e}"),
            }
        }
        Some(SnapshotPayload {
            markup,
            style_rules,
            viewport: self.page.viewport(),
            url: self.page.url(),
            timestamp: now_millis(),
        })
    }

    async fn handle_activity(&mut self, activity: PageActivity) {
        match activity {
            PageActivity::Mutations(records) => {
                let payloads = inspect(&*self.page, |doc| {
                    records
                        .iter()
                        .filter_map(|record| self.describe(doc, record))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
                for payload in payloads {
                    self.publish(MirrorBody::Mutation(payload)).await;
                }
            }
            PageActivity::Scroll { x, y } => {
                self.publish(MirrorBody::Scroll(ScrollPayload {
                    x,
                    y,
                    timestamp: now_millis(),
                }))
                .await;
            }
            PageActivity::PointerMove { x, y } => {
                if self.throttle.admit(Instant::now()) {
                    self.publish_pointer(x, y, PointerAction::Move).await;
                }
            }
            PageActivity::Click { x, y } => {
                self.publish_pointer(x, y, PointerAction::Click).await;
            }
        }
    }

    /// Describe one change as a mutation payload, or `None` if it has no
    /// visible effect on the transmitted copy.
    fn describe(&self, doc: &Document, record: &MutationRecord) -> Option<MutationPayload> {
        match record {
            MutationRecord::ChildList {
                target,
                added,
                removed_tags,
            } => {
                // A masked field's content is already the placeholder on the
                // other side and never changes there.
                if self.rules.is_hidden(doc, *target)
                    || self.rules.is_within_sensitive(doc, *target)
                {
                    return None;
                }
                let target_path = compute_path(doc, *target)?;
                // Nodes moved elsewhere or removed since the record was taken
                // are reported by their own records.
                let fragments: Vec<String> = added
                    .iter()
                    .filter(|&&node| doc.parent(node) == Some(*target))
                    .map(|&node| self.rules.serialize(doc, node))
                    .filter(|markup| !markup.is_empty())
                    .collect();
                let removed: Vec<String> = removed_tags
                    .iter()
                    .filter(|tag| !self.rules.drops_tag(tag))
                    .cloned()
                    .collect();
                if fragments.is_empty() && removed.is_empty() {
                    return None;
                }
                Some(MutationPayload {
                    mutation_kind: MutationKind::NodeListChange,
                    target_path,
                    added_fragments: (!fragments.is_empty()).then_some(fragments),
                    removed_tags: (!removed.is_empty()).then_some(removed),
                    attribute_name: None,
                    attribute_value: None,
                    timestamp: now_millis(),
                })
            }
            MutationRecord::Attribute { target, name } => {
                if !self.rules.allows_attribute(name)
                    || name == MASKED_MARKER
                    || self.rules.is_hidden(doc, *target)
                {
                    return None;
                }
                let target_path = compute_path(doc, *target)?;
                let attribute_value =
                    self.rules
                        .attribute_value(doc, *target, name, doc.attr(*target, name));
                Some(MutationPayload {
                    mutation_kind: MutationKind::AttributeChange,
                    target_path,
                    added_fragments: None,
                    removed_tags: None,
                    attribute_name: Some(name.clone()),
                    attribute_value,
                    timestamp: now_millis(),
                })
            }
        }
    }

    fn handle_event(&mut self, event: &MirrorEvent) {
        if event.kind != MirrorKind::Highlight {
            return;
        }
        let highlight = match event.body() {
            Ok(MirrorBody::Highlight(highlight)) => highlight,
            Ok(_) => return,
            Err(e) => {
                warn!(session_id = %self.session_id, "Dropping undecodable highlight: {e}");
                return;
            }
        };
        self.show_highlight(&highlight);
    }

    fn show_highlight(&mut self, highlight: &HighlightPayload) {
        let target = inspect(&*self.page, |doc| resolve(doc, &highlight.target_path)).flatten();
        let Some(node) = target else {
            debug!(target_path = %highlight.target_path, "Highlight target not found");
            return;
        };
        let color = if highlight.color.is_empty() {
            self.config.highlight_color.as_str()
        } else {
            highlight.color.as_str()
        };
        let duration_ms = match highlight.duration_ms {
            0 => self.config.highlight_duration_ms,
            ms => ms,
        };
        match self.page.show_outline(node, color) {
            Some(overlay) => {
                debug!(target_path = %highlight.target_path, duration_ms, "Highlight shown");
                self.outlines.push(ActiveOutline {
                    overlay,
                    expires_at: Instant::now() + Duration::from_millis(duration_ms),
                });
            }
            None => debug!(target_path = %highlight.target_path, "Highlight target detached"),
        }
    }

    fn expire_outlines(&mut self, now: Instant) {
        let page = &self.page;
        self.outlines.retain(|outline| {
            if outline.expires_at <= now {
                page.remove_outline(outline.overlay);
                false
            } else {
                true
            }
        });
    }

    async fn publish_pointer(&self, x: f64, y: f64, action: PointerAction) {
        self.publish(MirrorBody::Pointer(PointerPayload {
            x,
            y,
            action,
            timestamp: now_millis(),
        }))
        .await;
    }

    /// Publish failures are logged and dropped; capture never retries.
    async fn publish(&self, body: MirrorBody) {
        let kind = body.kind();
        let payload = match body.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!(session_id = %self.session_id, "Failed to encode mirror event: {e}");
                return;
            }
        };
        if let Err(e) = self
            .channel
            .append_mirror(self.session_id, kind, payload)
            .await
        {
            warn!(
                session_id = %self.session_id,
                kind = kind.as_str(),
                "Failed to publish mirror event: {e}"
            );
        }
    }
}
