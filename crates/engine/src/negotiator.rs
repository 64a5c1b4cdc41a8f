//! Call Negotiator: drives one participant's side of a call from local media
//! through offer/answer and candidate exchange to a connected transport.

use std::sync::Arc;
use std::time::Duration;

use tandem_protocol::{CallSession, CallType, IceCandidate, Role, Signal, SignalMessage};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{EventChannel, Subscription};
use crate::error::{CallError, ChannelError, MediaError};
use crate::lifecycle::SessionLifecycle;
use crate::media::{MediaDeviceSource, MediaKind, MediaStream, MediaTrack, TrackKind, acquire};
use crate::peer::{
    ConnectionQuality, PeerConnector, PeerEvent, PeerTransport, SdpType, TransportState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    LocalMediaReady,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Connected,
    Ended,
}

impl CallState {
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Ended, _) => false,
            (_, Ended) => true,
            (Idle, LocalMediaReady | OfferSent | OfferReceived) => true,
            (LocalMediaReady, OfferSent | OfferReceived) => true,
            (OfferSent | OfferReceived, AnswerExchanged) => true,
            (AnswerExchanged, Connected) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub quality: ConnectionQuality,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
            screen_sharing: false,
            quality: ConnectionQuality::Unknown,
        }
    }
}

/// Which call this negotiator drives and from which side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    pub call_id: Uuid,
    pub role: Role,
    pub call_type: CallType,
}

impl CallContext {
    pub fn new(call_id: Uuid, role: Role, call_type: CallType) -> Self {
        Self {
            call_id,
            role,
            call_type,
        }
    }

    /// Context for `participant_id`, or `None` if they are not part of the call.
    pub fn for_participant(session: &CallSession, participant_id: &str) -> Option<Self> {
        let role = if session.initiator_id == participant_id {
            Role::Initiator
        } else if session.responder_id == participant_id {
            Role::Responder
        } else {
            return None;
        };
        Some(Self::new(session.id, role, session.call_type))
    }
}

/// Something the negotiator has to react to.
#[derive(Debug)]
pub enum CallInput {
    Signal(SignalMessage),
    Peer(PeerEvent),
    ScreenShareEnded,
    SignalsClosed,
}

/// External collaborators of a negotiator.
#[derive(Clone)]
pub struct CallDeps {
    pub channel: Arc<dyn EventChannel>,
    pub sessions: Arc<dyn SessionLifecycle>,
    pub devices: Arc<dyn MediaDeviceSource>,
    pub connector: Arc<dyn PeerConnector>,
}

pub struct Negotiator {
    ctx: CallContext,
    deps: CallDeps,
    state: CallState,
    media: MediaState,
    peer: Option<Arc<dyn PeerTransport>>,
    peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    signals: Option<Subscription<SignalMessage>>,
    local_stream: MediaStream,
    screen_track: Option<MediaTrack>,
    remote_tracks: Vec<MediaTrack>,
    pending_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    transport_connected: bool,
    last_offer_ufrag: Option<String>,
    connected_at: Option<Instant>,
    cleaned_up: bool,
}

impl Negotiator {
    pub fn new(ctx: CallContext, deps: CallDeps) -> Self {
        Self {
            ctx,
            deps,
            state: CallState::Idle,
            media: MediaState::default(),
            peer: None,
            peer_events: None,
            signals: None,
            local_stream: MediaStream::default(),
            screen_track: None,
            remote_tracks: Vec::new(),
            pending_candidates: Vec::new(),
            remote_description_set: false,
            transport_connected: false,
            last_offer_ufrag: None,
            connected_at: None,
            cleaned_up: false,
        }
    }

    pub fn context(&self) -> CallContext {
        self.ctx
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn media(&self) -> &MediaState {
        &self.media
    }

    pub fn local_stream(&self) -> &MediaStream {
        &self.local_stream
    }

    pub fn remote_tracks(&self) -> &[MediaTrack] {
        &self.remote_tracks
    }

    /// Candidates received before the remote description was applied.
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            state: self.state,
            media: self.media.clone(),
            remote_tracks: self.remote_tracks.clone(),
        }
    }

    /// Create the peer connection and subscribe to the call's signal stream.
    pub async fn initialize(&mut self) -> Result<(), CallError> {
        self.ensure_live("initialize")?;
        if self.peer.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = self.deps.connector.connect(tx).await?;
        let signals = match self.deps.channel.subscribe_signals(self.ctx.call_id).await {
            Ok(signals) => signals,
            Err(e) => {
                if let Err(close_err) = peer.close().await {
                    warn!("Failed to close peer after subscribe error: {close_err}");
                }
                return Err(e.into());
            }
        };
        self.peer = Some(peer);
        self.peer_events = Some(rx);
        self.signals = Some(signals);
        info!(call_id = %self.ctx.call_id, role = ?self.ctx.role, "Call negotiator initialized");
        Ok(())
    }

    /// Acquire local tracks and attach them to the peer connection. The
    /// returned stream is for local preview.
    pub async fn acquire_local_media(&mut self, kind: MediaKind) -> Result<MediaStream, CallError> {
        self.ensure_live("acquire_local_media")?;
        let peer = self.peer()?;
        if self.state != CallState::Idle || !self.local_stream.is_empty() {
            return Err(CallError::InvalidState {
                op: "acquire_local_media",
                state: self.state,
            });
        }
        let stream = acquire(self.deps.devices.as_ref(), kind).await?;
        for track in stream.tracks() {
            if let Err(e) = peer.add_track(track).await {
                stream.stop_all();
                return Err(e.into());
            }
        }
        if kind == MediaKind::Screen {
            self.screen_track = stream.video_track().cloned();
            self.media.screen_sharing = self.screen_track.is_some();
        }
        self.local_stream = stream.clone();
        self.transition(CallState::LocalMediaReady);
        info!(call_id = %self.ctx.call_id, ?kind, tracks = stream.tracks().len(), "Local media ready");
        Ok(stream)
    }

    /// Generate, apply and publish an offer. Initiator only.
    pub async fn create_offer(&mut self) -> Result<(), CallError> {
        if self.ctx.role != Role::Initiator {
            return Err(CallError::NotInitiator("create_offer"));
        }
        self.ensure_live("create_offer")?;
        let peer = self.peer()?;
        if !matches!(self.state, CallState::Idle | CallState::LocalMediaReady) {
            return Err(CallError::InvalidState {
                op: "create_offer",
                state: self.state,
            });
        }
        let sdp = peer.create_offer().await?;
        peer.set_local_description(SdpType::Offer, &sdp).await?;
        self.publish(Signal::Offer { sdp }).await?;
        self.transition(CallState::OfferSent);
        Ok(())
    }

    /// Generate, apply and publish the answer to a received offer.
    pub async fn create_answer(&mut self) -> Result<(), CallError> {
        self.ensure_live("create_answer")?;
        let peer = self.peer()?;
        if self.state != CallState::OfferReceived {
            return Err(CallError::InvalidState {
                op: "create_answer",
                state: self.state,
            });
        }
        let sdp = peer.create_answer().await?;
        peer.set_local_description(SdpType::Answer, &sdp).await?;
        self.publish(Signal::Answer { sdp }).await?;
        self.transition(CallState::AnswerExchanged);
        self.maybe_connected().await;
        Ok(())
    }

    /// Wait for the next signal, transport callback or screen-share end.
    /// Cancel-safe; pends forever once there is nothing left to wait on.
    pub async fn next_input(&mut self) -> CallInput {
        loop {
            let screen = self.screen_track.clone();
            tokio::select! {
                signal = recv_signal(&mut self.signals) => {
                    return match signal {
                        Some(message) => CallInput::Signal(message),
                        None => {
                            self.signals = None;
                            CallInput::SignalsClosed
                        }
                    };
                }
                event = recv_peer(&mut self.peer_events) => {
                    match event {
                        Some(event) => return CallInput::Peer(event),
                        None => self.peer_events = None,
                    }
                }
                _ = screen_ended(screen) => return CallInput::ScreenShareEnded,
            }
        }
    }

    pub async fn process(&mut self, input: CallInput) {
        match input {
            CallInput::Signal(message) => {
                // Failures are logged and end the call inside handle_signal
                let _ = self.handle_signal(message).await;
            }
            CallInput::Peer(event) => self.handle_peer_event(event).await,
            CallInput::ScreenShareEnded => {
                if self.media.screen_sharing && self.state != CallState::Ended {
                    info!(call_id = %self.ctx.call_id, "Screen share ended by host, reverting to camera");
                    if let Err(e) = self.stop_screen_share().await {
                        warn!(call_id = %self.ctx.call_id, "Failed to revert to camera: {e}");
                        self.screen_track = None;
                        self.media.screen_sharing = false;
                    }
                }
            }
            CallInput::SignalsClosed => {
                if self.state != CallState::Ended {
                    info!(call_id = %self.ctx.call_id, "Signal stream closed, ending call");
                    if let Err(e) = self.end_call().await {
                        warn!(call_id = %self.ctx.call_id, "Failed to end call: {e}");
                    }
                }
            }
        }
    }

    /// Wait for one input and process it.
    pub async fn pump(&mut self) {
        let input = self.next_input().await;
        self.process(input).await;
    }

    /// Apply a message from the call's signal stream. A negotiation failure
    /// ends the call.
    pub async fn handle_signal(&mut self, message: SignalMessage) -> Result<(), CallError> {
        if message.sender_role == self.ctx.role || message.call_session_id != self.ctx.call_id {
            return Ok(());
        }
        if self.state == CallState::Ended {
            debug!(kind = message.signal_kind.as_str(), "Signal after call ended, ignored");
            return Ok(());
        }
        let signal = match message.signal() {
            Ok(signal) => signal,
            Err(e) => {
                warn!(call_id = %self.ctx.call_id, "Dropping undecodable signal: {e}");
                return Ok(());
            }
        };
        let result = match signal {
            Signal::Offer { sdp } => self.on_offer(sdp).await,
            Signal::Answer { sdp } => self.on_answer(sdp).await,
            Signal::IceCandidate(candidate) => {
                self.on_remote_candidate(candidate).await;
                Ok(())
            }
        };
        if let Err(e) = &result {
            warn!(call_id = %self.ctx.call_id, "Negotiation failed, ending call: {e}");
            if let Err(end_err) = self.end_call().await {
                warn!(call_id = %self.ctx.call_id, "Failed to end call: {end_err}");
            }
        }
        result
    }

    async fn on_offer(&mut self, sdp: String) -> Result<(), CallError> {
        if self.ctx.role == Role::Initiator {
            warn!(call_id = %self.ctx.call_id, "Initiator received an offer, ignored");
            return Ok(());
        }
        let ufrag = ice_ufrag(&sdp).map(str::to_string);
        if ufrag.is_some() && ufrag == self.last_offer_ufrag {
            debug!(call_id = %self.ctx.call_id, "Duplicate offer ignored");
            return Ok(());
        }
        if !matches!(self.state, CallState::Idle | CallState::LocalMediaReady) {
            debug!(call_id = %self.ctx.call_id, state = ?self.state, "Late offer ignored");
            return Ok(());
        }
        let peer = self.peer()?;
        peer.set_remote_description(SdpType::Offer, &sdp).await?;
        self.remote_description_set = true;
        self.last_offer_ufrag = ufrag;
        self.transition(CallState::OfferReceived);
        self.flush_candidates(&peer).await;
        self.create_answer().await
    }

    async fn on_answer(&mut self, sdp: String) -> Result<(), CallError> {
        if self.ctx.role != Role::Initiator || self.state != CallState::OfferSent {
            debug!(call_id = %self.ctx.call_id, state = ?self.state, "Unexpected answer ignored");
            return Ok(());
        }
        let peer = self.peer()?;
        peer.set_remote_description(SdpType::Answer, &sdp).await?;
        self.remote_description_set = true;
        self.flush_candidates(&peer).await;
        self.transition(CallState::AnswerExchanged);
        self.maybe_connected().await;
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.remote_description_set {
            debug!(queued = self.pending_candidates.len() + 1, "Remote candidate buffered");
            self.pending_candidates.push(candidate);
            return;
        }
        let Some(peer) = self.peer.clone() else {
            return;
        };
        if let Err(e) = peer.add_ice_candidate(&candidate).await {
            warn!(call_id = %self.ctx.call_id, "Failed to apply remote candidate: {e}");
        }
    }

    async fn flush_candidates(&mut self, peer: &Arc<dyn PeerTransport>) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "Flushing buffered candidates");
        for candidate in pending {
            if let Err(e) = peer.add_ice_candidate(&candidate).await {
                warn!(call_id = %self.ctx.call_id, "Failed to apply buffered candidate: {e}");
            }
        }
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        if self.state == CallState::Ended {
            if let PeerEvent::RemoteTrack(track) = event {
                track.stop();
            }
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.publish(Signal::IceCandidate(candidate)).await {
                    warn!(call_id = %self.ctx.call_id, "Failed to publish local candidate: {e}");
                }
            }
            PeerEvent::StateChanged(TransportState::Connected) => {
                self.transport_connected = true;
                self.maybe_connected().await;
            }
            PeerEvent::StateChanged(state @ (TransportState::Failed | TransportState::Disconnected)) => {
                info!(call_id = %self.ctx.call_id, ?state, "Transport lost, ending call");
                if let Err(e) = self.end_call().await {
                    warn!(call_id = %self.ctx.call_id, "Failed to end call: {e}");
                }
            }
            PeerEvent::StateChanged(state) => {
                debug!(call_id = %self.ctx.call_id, ?state, "Transport state");
            }
            PeerEvent::RemoteTrack(track) => {
                debug!(track_id = %track.id(), kind = ?track.kind(), "Remote track added");
                self.remote_tracks.push(track);
            }
            PeerEvent::Quality(quality) => self.media.quality = quality,
        }
    }

    async fn maybe_connected(&mut self) {
        if self.state != CallState::AnswerExchanged || !self.transport_connected {
            return;
        }
        self.transition(CallState::Connected);
        self.connected_at = Some(Instant::now());
        if let Err(e) = self.deps.sessions.activate_call(self.ctx.call_id).await {
            warn!(call_id = %self.ctx.call_id, "Failed to mark call active: {e}");
        }
    }

    /// Send the display instead of the camera on the existing video sender.
    pub async fn switch_to_screen_share(&mut self) -> Result<MediaTrack, CallError> {
        self.ensure_live("switch_to_screen_share")?;
        if let Some(screen) = &self.screen_track {
            return Ok(screen.clone());
        }
        let peer = self.peer()?;
        let Some(current) = self.local_stream.video_track().cloned() else {
            return Err(CallError::NoVideoSender);
        };
        let display = self.deps.devices.display_media().await?;
        let Some(screen) = display.video_track().cloned() else {
            display.stop_all();
            return Err(MediaError::NotFound("display video".into()).into());
        };
        // Only the video replaces the camera; tab or system audio is not sent
        for track in display.tracks().iter().filter(|t| t.id() != screen.id()) {
            track.stop();
        }
        self.swap_video(&peer, &current, &screen).await?;
        self.screen_track = Some(screen.clone());
        self.media.screen_sharing = true;
        info!(call_id = %self.ctx.call_id, "Screen share started");
        Ok(screen)
    }

    /// Return to the camera on the existing video sender.
    pub async fn stop_screen_share(&mut self) -> Result<Option<MediaTrack>, CallError> {
        self.ensure_live("stop_screen_share")?;
        let Some(screen) = self.screen_track.clone() else {
            return Ok(None);
        };
        let peer = self.peer()?;
        let user = self.deps.devices.user_media(true, false).await?;
        let Some(camera) = user.video_track().cloned() else {
            user.stop_all();
            return Err(MediaError::NotFound("camera".into()).into());
        };
        self.swap_video(&peer, &screen, &camera).await?;
        self.screen_track = None;
        self.media.screen_sharing = false;
        info!(call_id = %self.ctx.call_id, "Screen share stopped");
        Ok(Some(camera))
    }

    async fn swap_video(
        &mut self,
        peer: &Arc<dyn PeerTransport>,
        old: &MediaTrack,
        new: &MediaTrack,
    ) -> Result<(), CallError> {
        new.set_enabled(self.media.video_enabled);
        if let Err(e) = peer.replace_video_track(new).await {
            new.stop();
            return Err(e.into());
        }
        old.stop();
        self.local_stream.remove_track(old.id());
        self.local_stream.add_track(new.clone());
        Ok(())
    }

    pub fn toggle_audio(&mut self, enabled: bool) {
        self.media.audio_enabled = enabled;
        for track in self.local_tracks(TrackKind::Audio) {
            track.set_enabled(enabled);
        }
    }

    pub fn toggle_video(&mut self, enabled: bool) {
        self.media.video_enabled = enabled;
        for track in self.local_tracks(TrackKind::Video) {
            track.set_enabled(enabled);
        }
    }

    fn local_tracks(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.local_stream
            .tracks()
            .iter()
            .filter(move |t| t.kind() == kind)
    }

    /// Persist the end of the call, then release everything. Idempotent.
    pub async fn end_call(&mut self) -> Result<(), CallError> {
        if self.state == CallState::Ended {
            self.cleanup().await;
            return Ok(());
        }
        let duration = self.connected_at.map(|at| at.elapsed().as_secs());
        self.transition(CallState::Ended);
        let persisted = self.deps.sessions.end_call(self.ctx.call_id, duration).await;
        self.cleanup().await;
        info!(call_id = %self.ctx.call_id, duration_seconds = duration.unwrap_or(0), "Call ended");
        persisted.map(|_| ()).map_err(CallError::from)
    }

    /// Stop every track, close the transport and release the signal
    /// subscription. Returns false if cleanup already ran.
    pub async fn cleanup(&mut self) -> bool {
        if self.cleaned_up {
            return false;
        }
        self.cleaned_up = true;
        self.transition(CallState::Ended);

        self.local_stream.stop_all();
        if let Some(screen) = self.screen_track.take() {
            screen.stop();
        }
        for track in &self.remote_tracks {
            track.stop();
        }
        self.pending_candidates.clear();
        self.signals = None;
        self.peer_events = None;
        if let Some(peer) = self.peer.take()
            && let Err(e) = peer.close().await
        {
            warn!(call_id = %self.ctx.call_id, "Failed to close peer connection: {e}");
        }
        debug!(call_id = %self.ctx.call_id, "Call resources released");
        true
    }

    fn transition(&mut self, next: CallState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            debug!(from = ?self.state, to = ?next, "Ignoring invalid call state transition");
            return false;
        }
        info!(call_id = %self.ctx.call_id, from = ?self.state, to = ?next, "Call state changed");
        self.state = next;
        true
    }

    fn ensure_live(&self, op: &'static str) -> Result<(), CallError> {
        if self.state == CallState::Ended {
            return Err(CallError::InvalidState {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    fn peer(&self) -> Result<Arc<dyn PeerTransport>, CallError> {
        self.peer.clone().ok_or(CallError::NotInitialized)
    }

    async fn publish(&self, signal: Signal) -> Result<(), CallError> {
        let payload = signal.to_payload().map_err(ChannelError::from)?;
        self.deps
            .channel
            .append_signal(self.ctx.call_id, self.ctx.role, signal.kind(), payload)
            .await?;
        debug!(call_id = %self.ctx.call_id, kind = signal.kind().as_str(), "Signal published");
        Ok(())
    }
}

async fn recv_signal(signals: &mut Option<Subscription<SignalMessage>>) -> Option<SignalMessage> {
    match signals {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_peer(events: &mut Option<mpsc::UnboundedReceiver<PeerEvent>>) -> Option<PeerEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn screen_ended(track: Option<MediaTrack>) {
    match track {
        Some(track) => track.ended().await,
        None => std::future::pending().await,
    }
}

/// The `a=ice-ufrag:` value of an SDP blob.
pub fn ice_ufrag(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix("a=ice-ufrag:"))
        .map(str::trim)
}

/// Observable state of a running call.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub state: CallState,
    pub media: MediaState,
    pub remote_tracks: Vec<MediaTrack>,
}

enum CallCommand {
    AcquireLocalMedia(MediaKind, oneshot::Sender<Result<MediaStream, CallError>>),
    CreateOffer(oneshot::Sender<Result<(), CallError>>),
    SwitchToScreenShare(oneshot::Sender<Result<MediaTrack, CallError>>),
    StopScreenShare(oneshot::Sender<Result<Option<MediaTrack>, CallError>>),
    ToggleAudio(bool),
    ToggleVideo(bool),
    End(oneshot::Sender<Result<(), CallError>>),
}

/// Controls a negotiator running on its own task.
pub struct CallHandle {
    ctx: CallContext,
    commands: mpsc::Sender<CallCommand>,
    snapshot: watch::Receiver<CallSnapshot>,
    task: JoinHandle<()>,
}

/// Initialize the negotiator and run it on its own task. UI commands and
/// transport callbacks are serialized through that task.
pub async fn spawn_call(mut negotiator: Negotiator) -> Result<CallHandle, CallError> {
    negotiator.initialize().await?;
    let ctx = negotiator.context();
    let (commands, rx) = mpsc::channel(32);
    let (snapshot_tx, snapshot) = watch::channel(negotiator.snapshot());
    let task = tokio::spawn(run_call(negotiator, rx, snapshot_tx));
    Ok(CallHandle {
        ctx,
        commands,
        snapshot,
        task,
    })
}

async fn run_call(
    mut negotiator: Negotiator,
    mut commands: mpsc::Receiver<CallCommand>,
    snapshot: watch::Sender<CallSnapshot>,
) {
    let call_id = negotiator.context().call_id;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => execute(&mut negotiator, command).await,
                None => {
                    debug!(%call_id, "Call handle dropped, ending call");
                    if let Err(e) = negotiator.end_call().await {
                        warn!(%call_id, "Failed to end call: {e}");
                    }
                }
            },
            input = negotiator.next_input() => negotiator.process(input).await,
        }
        snapshot.send_replace(negotiator.snapshot());
        if negotiator.state() == CallState::Ended {
            break;
        }
    }
    negotiator.cleanup().await;
    debug!(%call_id, "Call task finished");
}

async fn execute(negotiator: &mut Negotiator, command: CallCommand) {
    // A dropped reply receiver only means the caller stopped waiting
    match command {
        CallCommand::AcquireLocalMedia(kind, reply) => {
            let _ = reply.send(negotiator.acquire_local_media(kind).await);
        }
        CallCommand::CreateOffer(reply) => {
            let _ = reply.send(negotiator.create_offer().await);
        }
        CallCommand::SwitchToScreenShare(reply) => {
            let _ = reply.send(negotiator.switch_to_screen_share().await);
        }
        CallCommand::StopScreenShare(reply) => {
            let _ = reply.send(negotiator.stop_screen_share().await);
        }
        CallCommand::ToggleAudio(enabled) => negotiator.toggle_audio(enabled),
        CallCommand::ToggleVideo(enabled) => negotiator.toggle_video(enabled),
        CallCommand::End(reply) => {
            let _ = reply.send(negotiator.end_call().await);
        }
    }
}

impl CallHandle {
    pub fn context(&self) -> CallContext {
        self.ctx
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> CallState {
        self.snapshot.borrow().state
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the call reaches `state` (or ends). Returns the snapshot
    /// that satisfied the wait.
    pub async fn wait_for_state(&self, state: CallState) -> CallSnapshot {
        let mut rx = self.snapshot.clone();
        let result = rx
            .wait_for(|s| s.state == state || s.state == CallState::Ended)
            .await
            .map(|s| (*s).clone());
        match result {
            Ok(snapshot) => snapshot,
            // The task has exited; its last published snapshot is final
            Err(_) => rx.borrow().clone(),
        }
    }

    pub async fn wait_until(&self, timeout: Duration, state: CallState) -> Option<CallSnapshot> {
        tokio::time::timeout(timeout, self.wait_for_state(state))
            .await
            .ok()
            .filter(|s| s.state == state)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, CallError>>) -> CallCommand,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| CallError::Ended)?;
        rx.await.map_err(|_| CallError::Ended)?
    }

    pub async fn acquire_local_media(&self, kind: MediaKind) -> Result<MediaStream, CallError> {
        self.request(|tx| CallCommand::AcquireLocalMedia(kind, tx)).await
    }

    pub async fn create_offer(&self) -> Result<(), CallError> {
        self.request(CallCommand::CreateOffer).await
    }

    pub async fn switch_to_screen_share(&self) -> Result<MediaTrack, CallError> {
        self.request(CallCommand::SwitchToScreenShare).await
    }

    pub async fn stop_screen_share(&self) -> Result<Option<MediaTrack>, CallError> {
        self.request(CallCommand::StopScreenShare).await
    }

    pub async fn toggle_audio(&self, enabled: bool) -> Result<(), CallError> {
        self.commands
            .send(CallCommand::ToggleAudio(enabled))
            .await
            .map_err(|_| CallError::Ended)
    }

    pub async fn toggle_video(&self, enabled: bool) -> Result<(), CallError> {
        self.commands
            .send(CallCommand::ToggleVideo(enabled))
            .await
            .map_err(|_| CallError::Ended)
    }

    /// End the call. Ending an already finished call succeeds.
    pub async fn end_call(&self) -> Result<(), CallError> {
        match self.request(CallCommand::End).await {
            Err(CallError::Ended) => Ok(()),
            other => other,
        }
    }

    /// Wait for the call task to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(call_id = %self.ctx.call_id, "Call task failed: {e}");
        }
    }
}
