//! Peer transport seam and its WebRTC implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tandem_protocol::{CallConfig, IceCandidate, IceServerInfo};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::PeerError;
use crate::media::{MediaTrack, SampleSink, TrackKind};

/// Transport-level connection state as reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
            _ => TransportState::New,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionQuality {
    #[default]
    Unknown,
    Good,
    Fair,
    Poor,
}

/// Callbacks from the transport, delivered as messages to the owning task.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteTrack(MediaTrack),
    Quality(ConnectionQuality),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Start sending a local track; its samples are routed to the transport.
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError>;
    /// Swap the source of the outgoing video sender without renegotiating.
    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), PeerError>;
    async fn create_offer(&self) -> Result<String, PeerError>;
    async fn create_answer(&self) -> Result<String, PeerError>;
    async fn set_local_description(&self, kind: SdpType, sdp: &str) -> Result<(), PeerError>;
    async fn set_remote_description(&self, kind: SdpType, sdp: &str) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}

/// Builds a transport whose callbacks are delivered on `events`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError>;
}

/// Loss/RTT tracker that turns cumulative RTP counters into a quality grade.
#[derive(Debug, Default)]
pub struct QualityMonitor {
    loss_ema: f64,
    prev_packets_sent: u64,
    prev_packets_lost: i64,
}

impl QualityMonitor {
    pub fn update(
        &mut self,
        packets_sent: u64,
        packets_lost: i64,
        rtt_secs: f64,
    ) -> ConnectionQuality {
        let interval_sent = packets_sent.saturating_sub(self.prev_packets_sent);
        let interval_lost = packets_lost.saturating_sub(self.prev_packets_lost);
        self.prev_packets_sent = packets_sent;
        self.prev_packets_lost = packets_lost;

        let loss_rate = if interval_sent > 0 {
            interval_lost.max(0) as f64 / interval_sent as f64
        } else {
            0.0
        };
        self.loss_ema = self.loss_ema * 0.7 + loss_rate * 0.3;

        if self.loss_ema > 0.05 {
            ConnectionQuality::Poor
        } else if self.loss_ema > 0.01 || rtt_secs > 0.3 {
            ConnectionQuality::Fair
        } else {
            ConnectionQuality::Good
        }
    }

    pub fn loss_ema(&self) -> f64 {
        self.loss_ema
    }
}

/// Creates WebRTC peer connections with VP8/Opus and the configured ICE servers.
#[derive(Debug, Clone)]
pub struct RtcConnector {
    ice_servers: Vec<IceServerInfo>,
    stats_interval: Duration,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<IceServerInfo>, stats_interval: Duration) -> Self {
        Self {
            ice_servers,
            stats_interval,
        }
    }

    pub fn from_config(config: &CallConfig) -> Self {
        Self::new(
            config.ice.servers(),
            Duration::from_millis(config.stats_interval_ms.max(100)),
        )
    }

    /// Use servers handed out by the relay, e.g. from `/api/ice-config`.
    pub fn with_ice_servers(mut self, servers: Vec<IceServerInfo>) -> Self {
        self.ice_servers = servers;
        self
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let peer = RtcPeer::new(&self.ice_servers, events, self.stats_interval).await?;
        Ok(Arc::new(peer))
    }
}

fn media_engine() -> Result<MediaEngine, PeerError> {
    let mut media_engine = MediaEngine::default();
    let feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".into(),
            parameter: "".into(),
        },
        RTCPFeedback {
            typ: "ccm".into(),
            parameter: "fir".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "pli".into(),
        },
    ];
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: vp8_capability(feedback),
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                ..opus_capability()
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;
    Ok(media_engine)
}

fn vp8_capability(rtcp_feedback: Vec<RTCPFeedback>) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback,
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_string(),
        clock_rate: 48000,
        channels: 2,
        ..Default::default()
    }
}

struct RtcSink(Arc<TrackLocalStaticSample>);

#[async_trait]
impl SampleSink for RtcSink {
    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), PeerError> {
        self.0
            .write_sample(&webrtc::media::Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

struct VideoSender {
    local: Arc<TrackLocalStaticSample>,
    source: MediaTrack,
}

pub struct RtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    video: Mutex<Option<VideoSender>>,
    audio: Mutex<Option<MediaTrack>>,
}

impl RtcPeer {
    pub async fn new(
        ice_servers: &[IceServerInfo],
        events: mpsc::UnboundedSender<PeerEvent>,
        stats_interval: Duration,
    ) -> Result<Self, PeerError> {
        let mut media_engine = media_engine()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                })
                .collect(),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        let candidate_tx = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(json) => {
                        let _ = candidate_tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));

        let state_tx = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed => warn!("Peer connection failed"),
                RTCPeerConnectionState::Disconnected => warn!("Peer connection disconnected"),
                _ => info!(?state, "Peer connection state changed"),
            }
            let _ = state_tx.send(PeerEvent::StateChanged(state.into()));
            Box::pin(async {})
        }));

        let track_tx = events.clone();
        peer_connection.on_track(Box::new(move |remote, _receiver, _transceiver| {
            let kind = if remote.kind() == RTPCodecType::Video {
                TrackKind::Video
            } else {
                TrackKind::Audio
            };
            let track = MediaTrack::with_id(remote.id(), kind, "remote");
            info!(track_id = %track.id(), ?kind, "Remote track received");
            let _ = track_tx.send(PeerEvent::RemoteTrack(track.clone()));
            tokio::spawn(async move {
                // Drain RTP until the transport drops the track
                while remote.read_rtp().await.is_ok() {
                    if track.is_ended() {
                        break;
                    }
                }
                track.stop();
            });
            Box::pin(async {})
        }));

        spawn_stats_loop(Arc::clone(&peer_connection), events, stats_interval);
        info!("WebRTC peer connection created");

        Ok(Self {
            peer_connection,
            video: Mutex::new(None),
            audio: Mutex::new(None),
        })
    }

    async fn add_local(
        &self,
        capability: RTCRtpCodecCapability,
        track: &MediaTrack,
    ) -> Result<Arc<TrackLocalStaticSample>, PeerError> {
        let local = Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id().to_string(),
            "tandem".to_string(),
        ));
        self.peer_connection
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        track.attach_sink(Arc::new(RtcSink(Arc::clone(&local))));
        Ok(local)
    }
}

#[async_trait]
impl PeerTransport for RtcPeer {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        match track.kind() {
            TrackKind::Video => {
                let mut video = self.video.lock().await;
                if video.is_some() {
                    return Err(PeerError("a video track is already being sent".into()));
                }
                let local = self.add_local(vp8_capability(Vec::new()), track).await?;
                *video = Some(VideoSender {
                    local,
                    source: track.clone(),
                });
            }
            TrackKind::Audio => {
                let mut audio = self.audio.lock().await;
                if audio.is_some() {
                    return Err(PeerError("an audio track is already being sent".into()));
                }
                self.add_local(opus_capability(), track).await?;
                *audio = Some(track.clone());
            }
        }
        debug!(track_id = %track.id(), kind = ?track.kind(), "Local track added");
        Ok(())
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let mut video = self.video.lock().await;
        let sender = video
            .as_mut()
            .ok_or_else(|| PeerError("no video sender".into()))?;
        sender.source.detach_sink();
        track.attach_sink(Arc::new(RtcSink(Arc::clone(&sender.local))));
        sender.source = track.clone();
        info!(track_id = %track.id(), label = track.label(), "Outgoing video source replaced");
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        Ok(self.peer_connection.create_offer(None).await?.sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        Ok(self.peer_connection.create_answer(None).await?.sdp)
    }

    async fn set_local_description(&self, kind: SdpType, sdp: &str) -> Result<(), PeerError> {
        self.peer_connection
            .set_local_description(description(kind, sdp)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpType, sdp: &str) -> Result<(), PeerError> {
        self.peer_connection
            .set_remote_description(description(kind, sdp)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.peer_connection.add_ice_candidate(init).await?;
        debug!(candidate = %candidate.candidate, "ICE candidate added");
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        if let Some(video) = self.video.lock().await.take() {
            video.source.detach_sink();
        }
        if let Some(audio) = self.audio.lock().await.take() {
            audio.detach_sink();
        }
        self.peer_connection.close().await?;
        info!("Peer connection closed");
        Ok(())
    }
}

fn description(kind: SdpType, sdp: &str) -> Result<RTCSessionDescription, PeerError> {
    let desc = match kind {
        SdpType::Offer => RTCSessionDescription::offer(sdp.to_string())?,
        SdpType::Answer => RTCSessionDescription::answer(sdp.to_string())?,
    };
    Ok(desc)
}

fn spawn_stats_loop(
    peer_connection: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut monitor = QualityMonitor::default();
        let mut last = ConnectionQuality::Unknown;
        loop {
            tokio::time::sleep(interval).await;
            match peer_connection.connection_state() {
                RTCPeerConnectionState::Closed => break,
                RTCPeerConnectionState::Connected => {}
                _ => continue,
            }
            if events.is_closed() {
                break;
            }

            let stats = peer_connection.get_stats().await;
            let mut packets_sent: u64 = 0;
            let mut packets_lost: i64 = 0;
            let mut rtt_sum: f64 = 0.0;
            let mut rtt_count: u32 = 0;
            for (_key, stat) in stats.reports.iter() {
                use webrtc::stats::StatsReportType;
                if let StatsReportType::OutboundRTP(rtp) = stat {
                    packets_sent += rtp.packets_sent;
                }
                if let StatsReportType::RemoteInboundRTP(remote) = stat {
                    packets_lost += remote.packets_lost;
                    if let Some(rtt) = remote.round_trip_time {
                        rtt_sum += rtt;
                        rtt_count += 1;
                    }
                }
            }
            let avg_rtt = if rtt_count > 0 {
                rtt_sum / rtt_count as f64
            } else {
                0.0
            };

            let quality = monitor.update(packets_sent, packets_lost, avg_rtt);
            debug!(
                packets_sent,
                packets_lost,
                rtt_ms = format!("{:.0}", avg_rtt * 1000.0),
                loss_pct = format!("{:.1}", monitor.loss_ema() * 100.0),
                "WebRTC stats"
            );
            if quality != last {
                info!(?quality, "Connection quality changed");
                last = quality;
                if events.send(PeerEvent::Quality(quality)).is_err() {
                    break;
                }
            }
        }
        debug!("Stats loop stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_link_is_good() {
        let mut monitor = QualityMonitor::default();
        assert_eq!(monitor.update(100, 0, 0.05), ConnectionQuality::Good);
        assert_eq!(monitor.update(200, 0, 0.05), ConnectionQuality::Good);
    }

    #[test]
    fn high_rtt_is_fair() {
        let mut monitor = QualityMonitor::default();
        assert_eq!(monitor.update(100, 0, 0.45), ConnectionQuality::Fair);
    }

    #[test]
    fn sustained_loss_degrades_then_recovers() {
        let mut monitor = QualityMonitor::default();
        // 20% loss in one interval: ema = 0.06
        assert_eq!(monitor.update(100, 20, 0.0), ConnectionQuality::Poor);
        // Clean intervals decay the average: 0.042, 0.0294, ...
        assert_eq!(monitor.update(200, 20, 0.0), ConnectionQuality::Fair);
        let mut quality = ConnectionQuality::Unknown;
        for i in 3..12 {
            quality = monitor.update(i * 100, 20, 0.0);
        }
        assert_eq!(quality, ConnectionQuality::Good);
    }

    #[test]
    fn counter_resets_do_not_underflow() {
        let mut monitor = QualityMonitor::default();
        monitor.update(500, 10, 0.0);
        assert_eq!(monitor.update(0, 0, 0.0), ConnectionQuality::Good);
        assert!(monitor.loss_ema() < 0.01);
    }

    #[test]
    fn transport_state_mapping() {
        assert_eq!(
            TransportState::from(RTCPeerConnectionState::Connected),
            TransportState::Connected
        );
        assert_eq!(
            TransportState::from(RTCPeerConnectionState::Unspecified),
            TransportState::New
        );
    }

    #[tokio::test]
    async fn rtc_peer_generates_offer_with_local_tracks() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = RtcPeer::new(&[], tx, Duration::from_secs(1)).await.unwrap();
        let camera = MediaTrack::new(TrackKind::Video, "camera");
        let mic = MediaTrack::new(TrackKind::Audio, "mic");
        peer.add_track(&camera).await.unwrap();
        peer.add_track(&mic).await.unwrap();
        assert!(camera.has_sink() && mic.has_sink());

        let offer = peer.create_offer().await.unwrap();
        assert!(offer.contains("m=video"));
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("VP8"));

        let screen = MediaTrack::new(TrackKind::Video, "screen");
        peer.replace_video_track(&screen).await.unwrap();
        assert!(screen.has_sink());
        assert!(!camera.has_sink());

        peer.close().await.unwrap();
        assert!(!screen.has_sink());
    }
}
