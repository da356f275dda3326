#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use ssc_rendezvous::config::Config;
use ssc_rendezvous::error::{MediaError, PeerError};
use ssc_rendezvous::peer::connection::{PeerConnection, PeerConnector, PeerEvents};
use ssc_rendezvous::peer::media::{
    MediaSource, MediaStream, MediaTrack, RemoteTrack, RenderSurface, TrackKind,
};
use ssc_rendezvous::peer::types::{
    IceCandidate, PeerEvent, SdpType, ServerConfig, SessionDescription, SignalingState,
};

pub const POLL_MS: u64 = 50;

pub fn config() -> Config {
    Config {
        poll_interval_ms: POLL_MS,
        ..Config::default()
    }
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

/// Что делает поддельное соединение
#[derive(Clone, Default)]
pub struct Script {
    pub offer_sdp: String,
    pub answer_sdp: String,
    /// Кандидаты, которые «собираются» сразу после set_local_description
    pub candidates_on_set_local: Vec<IceCandidate>,
    /// Удалённый трек появляется после set_remote_description
    pub remote_track: bool,
    /// signaling_state() возвращает это значение вместо настоящего
    pub reported_state: Option<SignalingState>,
}

impl Script {
    pub fn offering(sdp: &str) -> Self {
        Self {
            offer_sdp: sdp.into(),
            answer_sdp: format!("{sdp}-ANSWER"),
            ..Default::default()
        }
    }

    pub fn answering(sdp: &str) -> Self {
        Self {
            offer_sdp: format!("{sdp}-OFFER"),
            answer_sdp: sdp.into(),
            ..Default::default()
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<IceCandidate>) -> Self {
        self.candidates_on_set_local = candidates;
        self
    }

    pub fn with_remote_track(mut self) -> Self {
        self.remote_track = true;
        self
    }

    pub fn reporting_state(mut self, state: SignalingState) -> Self {
        self.reported_state = Some(state);
        self
    }
}

/// Всё, что случилось с соединениями одного коннектора
#[derive(Default)]
pub struct Registry {
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    pub tracks_added: AtomicUsize,
    pub set_remote: Mutex<Vec<SessionDescription>>,
    pub added_candidates: Mutex<Vec<IceCandidate>>,
}

impl Registry {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.created() - self.closed()
    }

    pub fn set_remote(&self) -> Vec<SessionDescription> {
        self.set_remote.lock().clone()
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.added_candidates.lock().clone()
    }
}

pub struct FakeConnector {
    pub script: Script,
    pub registry: Arc<Registry>,
}

impl FakeConnector {
    pub fn new(script: Script) -> (Arc<Self>, Arc<Registry>) {
        let registry = Arc::new(Registry::default());
        let connector = Arc::new(Self {
            script,
            registry: registry.clone(),
        });
        (connector, registry)
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        _servers: &[ServerConfig],
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents), PeerError> {
        self.registry.created.fetch_add(1, Ordering::SeqCst);
        let (events, rx) = mpsc::unbounded_channel();
        let peer = FakePeer {
            script: self.script.clone(),
            registry: self.registry.clone(),
            events,
            inner: Mutex::new(PeerInner {
                state: SignalingState::Stable,
                remote: None,
                closed: false,
            }),
        };
        Ok((Arc::new(peer), rx))
    }
}

struct PeerInner {
    state: SignalingState,
    remote: Option<SessionDescription>,
    closed: bool,
}

/// Соединение, которое только проверяет переходы signaling state
pub struct FakePeer {
    script: Script,
    registry: Arc<Registry>,
    events: mpsc::UnboundedSender<PeerEvent>,
    inner: Mutex<PeerInner>,
}

impl FakePeer {
    fn invalid(state: SignalingState, operation: &'static str) -> PeerError {
        PeerError::InvalidState { state, operation }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, _track: &MediaTrack) -> Result<(), PeerError> {
        self.registry.tracks_added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::offer(self.script.offer_sdp.clone()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let state = self.inner.lock().state;
        if state != SignalingState::HaveRemoteOffer {
            return Err(Self::invalid(state, "create answer"));
        }
        Ok(SessionDescription::answer(self.script.answer_sdp.clone()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        {
            let mut inner = self.inner.lock();
            inner.state = match (desc.kind, inner.state) {
                (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (_, state) => return Err(Self::invalid(state, "set local description")),
            };
        }
        for candidate in &self.script.candidates_on_set_local {
            let _ = self.events.send(PeerEvent::LocalCandidate(candidate.clone()));
        }
        let _ = self.events.send(PeerEvent::GatheringComplete);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        {
            let mut inner = self.inner.lock();
            inner.state = match (desc.kind, inner.state) {
                (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (_, state) => return Err(Self::invalid(state, "set remote description")),
            };
            inner.remote = Some(desc.clone());
        }
        self.registry.set_remote.lock().push(desc);
        if self.script.remote_track {
            let _ = self.events.send(PeerEvent::RemoteTrack(RemoteTrack {
                id: "remote-video".into(),
                stream_id: "remote-stream".into(),
                kind: TrackKind::Video,
                remote: None,
            }));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.inner.lock().remote.is_none() {
            return Err(PeerError::Other("remote description is not set".into()));
        }
        self.registry.added_candidates.lock().push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.inner.lock().remote.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        self.script
            .reported_state
            .unwrap_or_else(|| self.inner.lock().state)
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.closed = true;
            inner.state = SignalingState::Closed;
            self.registry.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeMedia {
    pub fail: bool,
    pub acquired: AtomicUsize,
}

impl FakeMedia {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire(&self, video: bool, audio: bool) -> Result<MediaStream, MediaError> {
        if self.fail {
            return Err(MediaError::Unavailable("camera permission denied".into()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let mut tracks = Vec::new();
        if video {
            tracks.push(MediaTrack::new(TrackKind::Video, "video", "fake"));
        }
        if audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "audio", "fake"));
        }
        Ok(MediaStream {
            id: "fake".into(),
            tracks,
        })
    }
}

#[derive(Default)]
pub struct FakeSurface {
    pub local: AtomicUsize,
    pub remote: Mutex<Vec<String>>,
}

impl RenderSurface for FakeSurface {
    fn attach_local(&self, _stream: &MediaStream) {
        self.local.fetch_add(1, Ordering::SeqCst);
    }

    fn attach_remote(&self, track: RemoteTrack) {
        self.remote.lock().push(track.id);
    }
}

/// Ждёт условия с шагом в 10 мс
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
