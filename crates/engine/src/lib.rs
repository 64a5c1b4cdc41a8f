//! Participant-side engine: live session mirroring (capture and renderer),
//! call negotiation, and the session lifecycle both depend on.

pub mod capture;
pub mod channel;
pub mod dom;
pub mod error;
pub mod lifecycle;
pub mod mask;
pub mod media;
pub mod negotiator;
pub mod page;
pub mod path;
pub mod peer;
pub mod remote;
pub mod renderer;
pub mod throttle;

pub use capture::MirrorCapture;
pub use channel::{EventChannel, MemoryChannel, Subscription};
pub use error::{CallError, ChannelError, MediaError, MirrorError, PeerError, SessionError};
pub use lifecycle::{MemorySessionStore, SessionLifecycle, SessionManager, SessionStore};
pub use media::{MediaDeviceSource, MediaKind, MediaStream, MediaTrack, MemoryDevices, TrackKind};
pub use negotiator::{
    CallContext, CallDeps, CallHandle, CallSnapshot, CallState, MediaState, Negotiator, spawn_call,
};
pub use page::{DocumentObserver, MemoryPage, PageActivity};
pub use peer::{ConnectionQuality, PeerConnector, PeerEvent, PeerTransport, RtcConnector};
pub use remote::RemoteChannel;
pub use renderer::{MirrorRenderer, RenderSurface};
