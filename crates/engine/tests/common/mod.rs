#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tandem_engine::page::MemoryPage;
use tandem_engine::peer::{PeerConnector, PeerEvent, PeerTransport, SdpType, TransportState};
use tandem_engine::{
    CallContext, CallDeps, MediaTrack, MemoryChannel, MemoryDevices, MirrorCapture,
    MirrorRenderer, Negotiator, PeerError, SessionLifecycle, SessionManager, TrackKind,
};
use tandem_protocol::{
    CallSession, CallType, IceCandidate, MirrorConfig, MirrorSession, NewCall, Role,
    SessionConfig, Viewport,
};
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tandem_engine=debug")
        .with_test_writer()
        .try_init();
}

// --- Mirror ---

pub struct MirrorWorld {
    pub page: Arc<MemoryPage>,
    pub channel: Arc<MemoryChannel>,
    pub sessions: Arc<SessionManager>,
    pub session: MirrorSession,
    pub config: MirrorConfig,
}

impl MirrorWorld {
    pub async fn new(markup: &str) -> Self {
        init_tracing();
        let page = Arc::new(MemoryPage::new(
            markup,
            "https://shop.example/checkout",
            Viewport {
                width: 1280,
                height: 720,
            },
        ));
        let channel = Arc::new(MemoryChannel::default());
        let sessions = Arc::new(SessionManager::in_memory(SessionConfig::default()));
        let session = sessions.open_mirror("agent-7").await.unwrap();
        Self {
            page,
            channel,
            sessions,
            session,
            config: MirrorConfig::default(),
        }
    }

    pub fn capture(&self) -> MirrorCapture {
        MirrorCapture::new(
            self.page.clone(),
            self.channel.clone(),
            self.sessions.clone(),
            self.config.clone(),
        )
    }

    pub fn renderer(&self) -> MirrorRenderer {
        MirrorRenderer::new(
            self.channel.clone(),
            self.sessions.clone(),
            self.config.clone(),
        )
    }

    /// The masked serialization of the live page, which a converged
    /// renderer reproduces.
    pub fn expected_markup(&self) -> String {
        let rules = tandem_engine::mask::MaskRules::new(&self.config);
        self.page.with_document(|doc| rules.serialize(doc, doc.root()))
    }
}

/// Apply events until the stream has been quiet for a moment.
pub async fn settle(renderer: &mut MirrorRenderer) -> usize {
    let mut applied = 0;
    while let Ok(Some(_)) =
        tokio::time::timeout(Duration::from_millis(100), renderer.next_event()).await
    {
        applied += 1;
    }
    applied
}

// --- Calls ---

#[derive(Default)]
pub struct FakeState {
    pub local: Option<(SdpType, String)>,
    pub remote: Option<(SdpType, String)>,
    pub tracks: Vec<MediaTrack>,
    pub video_source: Option<MediaTrack>,
    pub candidates: Vec<IceCandidate>,
    pub offers: usize,
    pub answers: usize,
    pub replacements: usize,
    connected: bool,
}

/// Scripted transport: reports a local candidate once its local description
/// is set, and connects as soon as both descriptions are in place.
pub struct FakePeer {
    pub index: usize,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<FakeState>,
    pub closes: AtomicUsize,
    pub fail_remote_description: AtomicBool,
    auto_connect: bool,
}

impl FakePeer {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn sdp(&self, kind: &str, tracks: &[MediaTrack]) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\na=ice-ufrag:{kind}{}\r\n",
            self.index, self.index
        );
        for track in tracks {
            let media = match track.kind() {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            sdp.push_str(&format!("m={media} 9 UDP/TLS/RTP/SAVPF 96\r\n"));
        }
        sdp
    }

    fn maybe_connect(&self) {
        let remote_sdp = {
            let mut state = self.state();
            if state.connected || !self.auto_connect || state.local.is_none() {
                return;
            }
            let Some((_, sdp)) = state.remote.clone() else {
                return;
            };
            state.connected = true;
            sdp
        };
        self.emit(PeerEvent::StateChanged(TransportState::Connecting));
        self.emit(PeerEvent::StateChanged(TransportState::Connected));
        for line in remote_sdp.lines() {
            let kind = if line.starts_with("m=audio") {
                TrackKind::Audio
            } else if line.starts_with("m=video") {
                TrackKind::Video
            } else {
                continue;
            };
            self.emit(PeerEvent::RemoteTrack(MediaTrack::new(kind, "remote")));
        }
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let mut state = self.state();
        if track.kind() == TrackKind::Video {
            state.video_source = Some(track.clone());
        }
        state.tracks.push(track.clone());
        Ok(())
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let mut state = self.state();
        if state.video_source.is_none() {
            return Err(PeerError("no video sender".into()));
        }
        state.video_source = Some(track.clone());
        state.replacements += 1;
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        let mut state = self.state();
        state.offers += 1;
        Ok(self.sdp("offer", &state.tracks))
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let mut state = self.state();
        if state.remote.is_none() {
            return Err(PeerError("answer without remote offer".into()));
        }
        state.answers += 1;
        Ok(self.sdp("answer", &state.tracks))
    }

    async fn set_local_description(&self, kind: SdpType, sdp: &str) -> Result<(), PeerError> {
        self.state().local = Some((kind, sdp.to_string()));
        self.emit(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:1 1 UDP 2122260223 10.0.0.{} 5000 typ host", self.index),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpType, sdp: &str) -> Result<(), PeerError> {
        if self.fail_remote_description.load(Ordering::Relaxed) {
            return Err(PeerError("malformed remote description".into()));
        }
        self.state().remote = Some((kind, sdp.to_string()));
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        let mut state = self.state();
        if state.remote.is_none() {
            return Err(PeerError("candidate before remote description".into()));
        }
        state.candidates.push(candidate.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    manual_connect: AtomicBool,
}

impl FakeConnector {
    pub fn manual() -> Self {
        let connector = Self::default();
        connector.manual_connect.store(true, Ordering::Relaxed);
        connector
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn peer(&self, index: usize) -> Arc<FakePeer> {
        self.peers()[index].clone()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let mut peers = self.peers.lock().unwrap();
        let peer = Arc::new(FakePeer {
            index: peers.len(),
            events,
            state: Mutex::new(FakeState::default()),
            closes: AtomicUsize::new(0),
            fail_remote_description: AtomicBool::new(false),
            auto_connect: !self.manual_connect.load(Ordering::Relaxed),
        });
        peers.push(peer.clone());
        Ok(peer)
    }
}

pub struct CallWorld {
    pub channel: Arc<MemoryChannel>,
    pub sessions: Arc<SessionManager>,
    pub initiator_devices: Arc<MemoryDevices>,
    pub responder_devices: Arc<MemoryDevices>,
    pub connector: Arc<FakeConnector>,
    pub call: CallSession,
}

impl CallWorld {
    pub async fn new(call_type: CallType) -> Self {
        Self::with_connector(call_type, FakeConnector::default()).await
    }

    pub async fn with_connector(call_type: CallType, connector: FakeConnector) -> Self {
        init_tracing();
        let sessions = Arc::new(SessionManager::in_memory(SessionConfig::default()));
        let call = sessions
            .create_call(NewCall {
                id: None,
                conversation_id: "conv-42".into(),
                initiator_id: "agent-7".into(),
                responder_id: "visitor-3".into(),
                call_type,
            })
            .await
            .unwrap();
        Self {
            channel: Arc::new(MemoryChannel::default()),
            sessions,
            initiator_devices: Arc::new(MemoryDevices::new()),
            responder_devices: Arc::new(MemoryDevices::new()),
            connector: Arc::new(connector),
            call,
        }
    }

    pub fn devices(&self, role: Role) -> Arc<MemoryDevices> {
        match role {
            Role::Initiator => self.initiator_devices.clone(),
            Role::Responder => self.responder_devices.clone(),
        }
    }

    pub fn negotiator(&self, role: Role) -> Negotiator {
        let deps = CallDeps {
            channel: self.channel.clone(),
            sessions: self.sessions.clone(),
            devices: self.devices(role),
            connector: self.connector.clone(),
        };
        Negotiator::new(
            CallContext::new(self.call.id, role, self.call.call_type),
            deps,
        )
    }
}
