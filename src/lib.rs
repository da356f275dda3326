pub mod config;
pub mod error;
pub mod logger;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod store;
pub mod utils;
pub mod watcher;

pub use config::{Config, RelayConfig};
pub use error::{ConfigError, MediaError, NegotiationError, PeerError, StoreError};
pub use negotiation::Negotiator;
pub use peer::{
    CandidateQueue, IceCandidate, NegotiationState, PeerConnection, PeerConnector, PeerEvent,
    Role, ServerConfig, SessionDescription, WebRtcConnector,
};
pub use session::CallSession;
pub use signaling::{CandidateRecord, RelayStore, SessionRecord, SignalingClient, Subscription};
pub use store::{MemoryRelay, PostgrestRelay};
pub use watcher::AnswerWatcher;
