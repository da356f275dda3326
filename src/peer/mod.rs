pub mod connection;
pub mod ice;
pub mod media;
pub mod queue;
pub mod state;
pub mod types;

pub use connection::{PeerConnection, PeerConnector, PeerEvents, WebRtcConnector};
pub use media::{MediaSource, MediaStream, MediaTrack, RemoteTrack, RenderSurface, TrackKind};
pub use queue::CandidateQueue;
pub use state::{NegotiationState, StatusTx};
pub use types::{
    ConnectionState, IceCandidate, PeerEvent, Role, SdpType, ServerConfig, SessionDescription,
    SignalingState,
};
