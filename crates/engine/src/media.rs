//! Local and remote media tracks, and the host's media devices.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{MediaError, PeerError};

/// What the caller asks the host for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Camera and microphone
    Video,
    /// Microphone only
    Audio,
    /// Display capture plus microphone
    Screen,
}

impl From<tandem_protocol::CallType> for MediaKind {
    fn from(call_type: tandem_protocol::CallType) -> Self {
        match call_type {
            tandem_protocol::CallType::Video => MediaKind::Video,
            tandem_protocol::CallType::Audio => MediaKind::Audio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Destination for encoded samples, typically an outgoing peer track.
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), PeerError>;
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    sink: Mutex<Option<Arc<dyn SampleSink>>>,
}

/// A single audio or video track. Clones share state.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind, label)
    }

    pub fn with_id(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended,
                sink: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    /// Disabled tracks stay negotiated but send nothing.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// End the track. Returns false if it had already ended.
    pub fn stop(&self) -> bool {
        let stopped = self.inner.ended.send_if_modified(|ended| {
            if *ended {
                false
            } else {
                *ended = true;
                true
            }
        });
        if stopped {
            self.detach_sink();
            debug!(track_id = %self.inner.id, label = %self.inner.label, "Track stopped");
        }
        stopped
    }

    /// Resolves once the track has ended, from any cause.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        // The sender lives in `inner`, so the channel cannot close under us
        let _ = rx.wait_for(|ended| *ended).await;
    }

    pub fn attach_sink(&self, sink: Arc<dyn SampleSink>) {
        *self.sink_slot() = Some(sink);
    }

    pub fn detach_sink(&self) {
        *self.sink_slot() = None;
    }

    pub fn has_sink(&self) -> bool {
        self.sink_slot().is_some()
    }

    /// Forward a sample to the attached sink. Returns whether it was sent;
    /// disabled or ended tracks and unattached tracks drop samples.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool, PeerError> {
        if !self.is_enabled() || self.is_ended() {
            return Ok(false);
        }
        let Some(sink) = self.sink_slot().clone() else {
            return Ok(false);
        };
        sink.write_sample(data, duration).await?;
        Ok(true)
    }

    fn sink_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn SampleSink>>> {
        self.inner
            .sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An ordered set of tracks handed back to the caller for preview.
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub fn add_track(&mut self, track: MediaTrack) {
        if !self.tracks.contains(&track) {
            self.tracks.push(track);
        }
    }

    pub fn remove_track(&mut self, id: &str) -> Option<MediaTrack> {
        let pos = self.tracks.iter().position(|t| t.id() == id)?;
        Some(self.tracks.remove(pos))
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Camera, microphone and display capture provided by the host.
#[async_trait]
pub trait MediaDeviceSource: Send + Sync {
    async fn user_media(&self, video: bool, audio: bool) -> Result<MediaStream, MediaError>;
    async fn display_media(&self) -> Result<MediaStream, MediaError>;
}

/// Acquire the tracks for a call of the given kind.
pub async fn acquire(
    devices: &dyn MediaDeviceSource,
    kind: MediaKind,
) -> Result<MediaStream, MediaError> {
    match kind {
        MediaKind::Video => devices.user_media(true, true).await,
        MediaKind::Audio => devices.user_media(false, true).await,
        MediaKind::Screen => {
            let mut stream = devices.display_media().await?;
            match devices.user_media(false, true).await {
                Ok(mic) => {
                    for track in mic.tracks() {
                        stream.add_track(track.clone());
                    }
                }
                Err(e) => {
                    stream.stop_all();
                    return Err(e);
                }
            }
            Ok(stream)
        }
    }
}

/// In-process devices that hand out synthetic tracks.
#[derive(Default)]
pub struct MemoryDevices {
    deny_user_media: AtomicBool,
    deny_display: AtomicBool,
    display_audio: AtomicBool,
    issued: Mutex<Vec<MediaTrack>>,
}

impl MemoryDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_user_media(&self, deny: bool) {
        self.deny_user_media.store(deny, Ordering::Relaxed);
    }

    pub fn deny_display(&self, deny: bool) {
        self.deny_display.store(deny, Ordering::Relaxed);
    }

    /// Include a tab/system audio track with display captures.
    pub fn share_display_audio(&self, share: bool) {
        self.display_audio.store(share, Ordering::Relaxed);
    }

    /// Every track handed out so far.
    pub fn issued(&self) -> Vec<MediaTrack> {
        self.issued_slot().clone()
    }

    /// Issued tracks that have not ended.
    pub fn live_tracks(&self) -> Vec<MediaTrack> {
        self.issued_slot()
            .iter()
            .filter(|t| !t.is_ended())
            .cloned()
            .collect()
    }

    fn issue(&self, kind: TrackKind, label: &str) -> MediaTrack {
        let track = MediaTrack::new(kind, label);
        self.issued_slot().push(track.clone());
        track
    }

    fn issued_slot(&self) -> std::sync::MutexGuard<'_, Vec<MediaTrack>> {
        self.issued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MediaDeviceSource for MemoryDevices {
    async fn user_media(&self, video: bool, audio: bool) -> Result<MediaStream, MediaError> {
        if self.deny_user_media.load(Ordering::Relaxed) {
            return Err(MediaError::PermissionDenied("camera and microphone".into()));
        }
        if !video && !audio {
            return Err(MediaError::NotFound("requested media".into()));
        }
        let mut tracks = Vec::new();
        if audio {
            tracks.push(self.issue(TrackKind::Audio, "microphone"));
        }
        if video {
            tracks.push(self.issue(TrackKind::Video, "camera"));
        }
        info!(video, audio, "User media acquired");
        Ok(MediaStream::new(tracks))
    }

    async fn display_media(&self) -> Result<MediaStream, MediaError> {
        if self.deny_display.load(Ordering::Relaxed) {
            return Err(MediaError::PermissionDenied("display capture".into()));
        }
        let mut tracks = vec![self.issue(TrackKind::Video, "screen")];
        if self.display_audio.load(Ordering::Relaxed) {
            tracks.push(self.issue(TrackKind::Audio, "screen-audio"));
        }
        info!(tracks = tracks.len(), "Display media acquired");
        Ok(MediaStream::new(tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingSink {
        samples: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl SampleSink for CountingSink {
        async fn write_sample(&self, data: Bytes, _duration: Duration) -> Result<(), PeerError> {
            self.samples.lock().unwrap().push(data);
            Ok(())
        }
    }

    #[tokio::test]
    async fn samples_follow_enabled_flag() {
        let track = MediaTrack::new(TrackKind::Audio, "mic");
        let sink = Arc::new(CountingSink::default());
        let frame = || Bytes::from_static(b"frame");

        assert!(!track.write_sample(frame(), Duration::from_millis(20)).await.unwrap());
        track.attach_sink(sink.clone());
        assert!(track.write_sample(frame(), Duration::from_millis(20)).await.unwrap());
        track.set_enabled(false);
        assert!(!track.write_sample(frame(), Duration::from_millis(20)).await.unwrap());
        track.set_enabled(true);
        assert!(track.write_sample(frame(), Duration::from_millis(20)).await.unwrap());
        assert_eq!(sink.samples.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_wakes_waiters() {
        let track = MediaTrack::new(TrackKind::Video, "camera");
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };
        assert!(track.stop());
        assert!(!track.stop());
        assert!(track.is_ended());
        waiter.await.unwrap();
        assert!(!track.has_sink());
    }

    #[tokio::test]
    async fn acquire_per_kind() {
        let devices = MemoryDevices::new();
        let video = acquire(&devices, MediaKind::Video).await.unwrap();
        assert!(video.audio_track().is_some() && video.video_track().is_some());

        let audio = acquire(&devices, MediaKind::Audio).await.unwrap();
        assert!(audio.video_track().is_none());

        let screen = acquire(&devices, MediaKind::Screen).await.unwrap();
        assert_eq!(screen.video_track().unwrap().label(), "screen");
        assert_eq!(screen.audio_track().unwrap().label(), "microphone");
    }

    #[tokio::test]
    async fn denied_devices_surface_errors() {
        let devices = MemoryDevices::new();
        devices.deny_display(true);
        assert!(matches!(
            acquire(&devices, MediaKind::Screen).await,
            Err(MediaError::PermissionDenied(_))
        ));
        devices.deny_display(false);
        devices.deny_user_media(true);
        assert!(acquire(&devices, MediaKind::Screen).await.is_err());
        // The display track acquired before the microphone failed is released
        assert!(devices.live_tracks().is_empty());
    }

    #[test]
    fn stream_track_bookkeeping() {
        let mic = MediaTrack::new(TrackKind::Audio, "mic");
        let mut stream = MediaStream::new(vec![mic.clone()]);
        stream.add_track(mic.clone());
        assert_eq!(stream.tracks().len(), 1);
        assert_eq!(stream.remove_track(mic.id()), Some(mic));
        assert!(stream.is_empty());
    }
}
