use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::config::Config;
use crate::error::{NegotiationError, PeerError};
use crate::logger::dump_candidate;
use crate::peer::connection::{PeerConnection, PeerConnector, PeerEvents};
use crate::peer::ice::analyze_candidates;
use crate::peer::media::{MediaSource, RenderSurface};
use crate::peer::queue::CandidateQueue;
use crate::peer::state::{NegotiationState, StatusTx};
use crate::peer::types::{
    ConnectionState, IceCandidate, PeerEvent, Role, ServerConfig, SessionDescription,
    SignalingState,
};
use crate::signaling::{CandidateRecord, SessionRecord, SignalingClient, Subscription};
use crate::watcher::AnswerWatcher;

/// Машина согласования для одного участника.
///
/// Каждая попытка (`setup`) работает в своей задаче и владеет соединением, обеими
/// очередями кандидатов, подпиской и опросом ответа. Повторный `setup` сначала
/// полностью закрывает предыдущую попытку.
pub struct Negotiator {
    signaling: SignalingClient,
    connector: Arc<dyn PeerConnector>,
    media: Arc<dyn MediaSource>,
    surface: Arc<dyn RenderSurface>,
    ice_servers: Vec<ServerConfig>,
    poll_interval: Duration,
    status: StatusTx,
    attempt: Option<AttemptHandle>,
}

struct AttemptHandle {
    session_id: String,
    shutdown: watch::Sender<bool>,
    stalled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Negotiator {
    pub fn new(
        signaling: SignalingClient,
        connector: Arc<dyn PeerConnector>,
        media: Arc<dyn MediaSource>,
        surface: Arc<dyn RenderSurface>,
        config: &Config,
    ) -> Self {
        Self {
            signaling,
            connector,
            media,
            surface,
            ice_servers: config.ice_servers.clone(),
            poll_interval: config.poll_interval(),
            status: StatusTx::new(),
            attempt: None,
        }
    }

    pub fn status(&self) -> watch::Receiver<NegotiationState> {
        self.status.subscribe()
    }

    pub fn state(&self) -> NegotiationState {
        self.status.current()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.attempt.as_ref().map(|a| a.session_id.as_str())
    }

    pub fn is_active(&self) -> bool {
        self.attempt.is_some()
    }

    /// Инициатор, чей offer перезаписан другим инициатором: ответа не будет
    pub fn is_stalled(&self) -> bool {
        self.attempt
            .as_ref()
            .is_some_and(|a| a.stalled.load(Ordering::SeqCst))
    }

    pub async fn setup(&mut self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        // старое соединение закрывается до создания нового
        self.teardown().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = AnswerWatcher::new(self.poll_interval);
        let stalled = watcher.superseded_flag();
        let (answers_tx, answers_rx) = mpsc::unbounded_channel();

        self.status.emit(NegotiationState::Initializing);
        info!(%session_id, "starting negotiation attempt");

        let ctx = AttemptContext {
            session_id: session_id.clone(),
            signaling: self.signaling.clone(),
            connector: self.connector.clone(),
            media: self.media.clone(),
            surface: self.surface.clone(),
            ice_servers: self.ice_servers.clone(),
            status: self.status.clone(),
            shutdown: shutdown_rx,
            watcher,
            answers_tx,
            answers_rx,
        };
        let span = info_span!("attempt", session_id = %session_id);
        let task = tokio::spawn(run_attempt(ctx).instrument(span));

        self.attempt = Some(AttemptHandle {
            session_id,
            shutdown: shutdown_tx,
            stalled,
            task,
        });
    }

    /// Отписка, остановка опроса, закрытие соединения. Повторный вызов ничего не делает.
    pub async fn teardown(&mut self) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        let _ = attempt.shutdown.send(true);
        if let Err(e) = attempt.task.await {
            if e.is_panic() {
                error!(session_id = %attempt.session_id, "negotiation attempt panicked");
            }
        }
        self.status.emit(NegotiationState::Closed);
        info!(session_id = %attempt.session_id, "negotiation attempt torn down");
    }
}

impl Drop for Negotiator {
    fn drop(&mut self) {
        // задача сама освободит ресурсы, получив сигнал
        if let Some(attempt) = self.attempt.take() {
            let _ = attempt.shutdown.send(true);
        }
    }
}

struct AttemptContext {
    session_id: String,
    signaling: SignalingClient,
    connector: Arc<dyn PeerConnector>,
    media: Arc<dyn MediaSource>,
    surface: Arc<dyn RenderSurface>,
    ice_servers: Vec<ServerConfig>,
    status: StatusTx,
    shutdown: watch::Receiver<bool>,
    watcher: AnswerWatcher,
    answers_tx: mpsc::UnboundedSender<SessionDescription>,
    answers_rx: mpsc::UnboundedReceiver<SessionDescription>,
}

async fn run_attempt(ctx: AttemptContext) {
    let status = ctx.status.clone();
    let (peer, events) = match ctx.connector.connect(&ctx.ice_servers).await {
        Ok(created) => created,
        Err(e) => {
            let err = NegotiationError::Peer(e);
            error!(error = %err, "cannot create peer connection");
            status.emit(NegotiationState::Failed(err.to_string()));
            return;
        }
    };

    let mut attempt = Attempt::new(ctx, peer, events);
    let result = attempt.run().await;
    attempt.close().await;

    match result {
        Ok(()) | Err(NegotiationError::TornDown) => {}
        Err(e) => {
            error!(error = %e, "negotiation attempt failed");
            status.emit(NegotiationState::Failed(e.to_string()));
        }
    }
}

struct Attempt {
    session_id: String,
    signaling: SignalingClient,
    media: Arc<dyn MediaSource>,
    surface: Arc<dyn RenderSurface>,
    status: StatusTx,
    shutdown: watch::Receiver<bool>,
    peer: Arc<dyn PeerConnection>,
    events: PeerEvents,
    role: Option<Role>,
    // запись сессии уже записана нами: локальные кандидаты можно публиковать
    record_confirmed: bool,
    remote_answer_set: bool,
    local_pending: CandidateQueue<IceCandidate>,
    remote_pending: CandidateQueue<IceCandidate>,
    // события, пришедшие во время чужого I/O и требующие своего I/O
    deferred: VecDeque<PeerEvent>,
    subscription: Option<Subscription>,
    watcher: AnswerWatcher,
    answers_tx: mpsc::UnboundedSender<SessionDescription>,
    answers_rx: mpsc::UnboundedReceiver<SessionDescription>,
    seen_records: HashSet<u64>,
    // relay может хранить один и тот же кандидат под разными порядковыми номерами
    remote_seen: HashSet<IceCandidate>,
    published: HashSet<String>,
    gathered: Vec<IceCandidate>,
}

impl Attempt {
    fn new(ctx: AttemptContext, peer: Arc<dyn PeerConnection>, events: PeerEvents) -> Self {
        Self {
            session_id: ctx.session_id,
            signaling: ctx.signaling,
            media: ctx.media,
            surface: ctx.surface,
            status: ctx.status,
            shutdown: ctx.shutdown,
            peer,
            events,
            role: None,
            record_confirmed: false,
            remote_answer_set: false,
            local_pending: CandidateQueue::new(),
            remote_pending: CandidateQueue::new(),
            deferred: VecDeque::new(),
            subscription: None,
            watcher: ctx.watcher,
            answers_tx: ctx.answers_tx,
            answers_rx: ctx.answers_rx,
            seen_records: HashSet::new(),
            remote_seen: HashSet::new(),
            published: HashSet::new(),
            gathered: Vec::new(),
        }
    }

    async fn run(&mut self) -> Result<(), NegotiationError> {
        let media = self.media.clone();
        let stream = self
            .guarded(async move { media.acquire(true, true).await })
            .await??;
        self.surface.attach_local(&stream);
        for track in stream.tracks {
            let peer = self.peer.clone();
            self.guarded(async move { peer.add_track(&track).await })
                .await??;
        }

        let signaling = self.signaling.clone();
        let id = self.session_id.clone();
        let record = self
            .guarded(async move { signaling.read_session(&id).await })
            .await?
            .map_err(NegotiationError::StoreRead)?;

        let role = match record {
            Some(_) => Role::Responder,
            None => Role::Initiator,
        };
        self.role = Some(role);
        info!(%role, "role determined");
        self.status.emit(NegotiationState::RoleDetermined(role));

        match record {
            None => self.publish_offer().await?,
            Some(record) => self.publish_answer(record).await?,
        }

        self.record_confirmed = true;
        self.flush_local_pending().await?;
        self.subscribe_remote_candidates().await?;

        match role {
            Role::Initiator => self.start_answer_watcher(),
            Role::Responder => self.status.emit(NegotiationState::Established(Role::Responder)),
        }

        self.event_loop().await
    }

    async fn publish_offer(&mut self) -> Result<(), NegotiationError> {
        let peer = self.peer.clone();
        let offer = self.guarded(async move { peer.create_offer().await }).await??;

        let peer = self.peer.clone();
        let local = offer.clone();
        self.guarded(async move { peer.set_local_description(local).await })
            .await??;
        self.status
            .emit(NegotiationState::LocalDescriptionSet(Role::Initiator));

        let signaling = self.signaling.clone();
        let id = self.session_id.clone();
        let written = offer.clone();
        self.guarded(async move { signaling.upsert_offer(&id, &written).await })
            .await?
            .map_err(NegotiationError::StoreWrite)?;
        info!("offer written to session record");

        self.watcher.expect_offer(offer);
        Ok(())
    }

    async fn publish_answer(&mut self, record: SessionRecord) -> Result<(), NegotiationError> {
        let raw = record
            .offer
            .filter(|raw| !raw.trim().is_empty())
            .ok_or_else(|| NegotiationError::MissingOffer(self.session_id.clone()))?;
        let offer = SessionDescription::decode(&raw)?;

        let peer = self.peer.clone();
        self.guarded(async move { peer.set_remote_description(offer).await })
            .await??;

        let peer = self.peer.clone();
        let answer = self.guarded(async move { peer.create_answer().await }).await??;

        let peer = self.peer.clone();
        let local = answer.clone();
        self.guarded(async move { peer.set_local_description(local).await })
            .await??;
        self.status
            .emit(NegotiationState::LocalDescriptionSet(Role::Responder));

        let signaling = self.signaling.clone();
        let id = self.session_id.clone();
        self.guarded(async move { signaling.update_answer(&id, &answer).await })
            .await?
            .map_err(NegotiationError::StoreWrite)?;
        info!("answer written to session record");
        Ok(())
    }

    async fn flush_local_pending(&mut self) -> Result<(), NegotiationError> {
        let pending = self.local_pending.drain();
        if !pending.is_empty() {
            debug!(count = pending.len(), "publishing queued local candidates");
        }
        for candidate in pending {
            self.publish_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn subscribe_remote_candidates(&mut self) -> Result<(), NegotiationError> {
        if self.subscription.is_some() {
            return Ok(());
        }
        let signaling = self.signaling.clone();
        let id = self.session_id.clone();
        let subscription = self
            .guarded(async move { signaling.subscribe_candidates(&id).await })
            .await?
            .map_err(NegotiationError::StoreRead)?;
        self.subscription = Some(subscription);
        debug!("subscribed to remote candidates");
        Ok(())
    }

    fn start_answer_watcher(&mut self) {
        let answers = self.answers_tx.clone();
        self.watcher.start(
            self.signaling.clone(),
            self.session_id.clone(),
            move |answer| {
                let _ = answers.send(answer);
            },
        );
    }

    async fn event_loop(&mut self) -> Result<(), NegotiationError> {
        loop {
            if let Some(event) = self.deferred.pop_front() {
                self.on_peer_event(event).await?;
                continue;
            }

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return Err(NegotiationError::TornDown),
                Some(event) = self.events.recv() => {
                    self.note_gathered(&event);
                    self.on_peer_event(event).await?
                }
                record = next_record(&mut self.subscription) => match record {
                    Some(record) => self.on_remote_record(record).await?,
                    None => {
                        warn!("candidate feed closed by relay");
                        if let Some(mut subscription) = self.subscription.take() {
                            subscription.cancel();
                        }
                    }
                },
                Some(answer) = self.answers_rx.recv() => self.on_answer(answer).await?,
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) -> Result<(), NegotiationError> {
        match event {
            PeerEvent::LocalCandidate(candidate) if self.record_confirmed => {
                self.publish_candidate(candidate).await
            }
            other => {
                self.buffer_event(other);
                Ok(())
            }
        }
    }

    fn note_gathered(&mut self, event: &PeerEvent) {
        if let PeerEvent::LocalCandidate(candidate) = event {
            self.gathered.push(candidate.clone());
        }
    }

    /// Обработка событий без собственного I/O
    fn buffer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) if !self.record_confirmed => {
                trace!(candidate = %candidate.candidate, "queuing local candidate until session is written");
                self.local_pending.enqueue(candidate);
            }
            PeerEvent::LocalCandidate(candidate) => {
                self.deferred.push_back(PeerEvent::LocalCandidate(candidate));
            }
            PeerEvent::GatheringComplete => {
                debug!(count = self.gathered.len(), "local candidate gathering complete");
                analyze_candidates(&self.gathered);
            }
            PeerEvent::RemoteTrack(track) => {
                debug!(track_id = %track.id, "remote track received");
                self.surface.attach_remote(track);
            }
            PeerEvent::ConnectionState(state) => match state {
                ConnectionState::Failed | ConnectionState::Disconnected => {
                    warn!(?state, role = ?self.role, "media path degraded")
                }
                _ => debug!(?state, "media path state"),
            },
        }
    }

    async fn publish_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        dump_candidate("LOCAL", &candidate);
        if let Ok(encoded) = candidate.encode() {
            self.published.insert(encoded);
        }
        let signaling = self.signaling.clone();
        let id = self.session_id.clone();
        let inserted = self
            .guarded(async move { signaling.insert_candidate(&id, &candidate).await })
            .await?;
        if let Err(e) = inserted {
            warn!(error = %e, "failed to publish local candidate");
        }
        Ok(())
    }

    async fn on_remote_record(&mut self, record: CandidateRecord) -> Result<(), NegotiationError> {
        if !self.seen_records.insert(record.order) {
            debug!(order = record.order, "duplicate relay event dropped");
            return Ok(());
        }
        if self.published.contains(&record.candidate) {
            trace!(order = record.order, "own candidate echoed by relay");
            return Ok(());
        }
        let candidate = match IceCandidate::decode(&record.candidate) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(order = record.order, error = %e, "malformed remote candidate");
                return Ok(());
            }
        };
        if !self.remote_seen.insert(candidate.clone()) {
            debug!(order = record.order, "repeated remote candidate dropped");
            return Ok(());
        }
        dump_candidate("REMOTE", &candidate);

        let peer = self.peer.clone();
        let ready = self
            .guarded(async move { peer.has_remote_description().await })
            .await?;
        if ready {
            self.apply_remote_candidate(candidate).await
        } else {
            debug!("remote description not set yet, queuing candidate");
            self.remote_pending.enqueue(candidate);
            Ok(())
        }
    }

    async fn apply_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let peer = self.peer.clone();
        let applied = self
            .guarded(async move { peer.add_ice_candidate(candidate).await })
            .await?;
        if let Err(e) = applied {
            warn!(error = %e, "failed to add remote candidate");
        }
        Ok(())
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.remote_answer_set {
            debug!("remote answer already applied, ignoring");
            return Ok(());
        }
        let state = self.peer.signaling_state();
        if !matches!(state, SignalingState::Stable | SignalingState::HaveLocalOffer) {
            let err = NegotiationError::NegotiationState(PeerError::InvalidState {
                state,
                operation: "apply remote answer",
            });
            warn!(error = %err, "remote answer not applied");
            return Ok(());
        }

        let peer = self.peer.clone();
        let applied = self
            .guarded(async move { peer.set_remote_description(answer).await })
            .await?;
        if let Err(e) = applied {
            let err = NegotiationError::from(e);
            warn!(error = %err, "failed to apply remote answer");
            return Ok(());
        }

        self.remote_answer_set = true;
        self.watcher.resolve();
        self.watcher.stop();
        info!("remote answer applied");

        let pending = self.remote_pending.drain();
        if !pending.is_empty() {
            debug!(count = pending.len(), "applying queued remote candidates");
        }
        for candidate in pending {
            self.apply_remote_candidate(candidate).await?;
        }
        self.status
            .emit(NegotiationState::Established(Role::Initiator));
        Ok(())
    }

    /// Ждёт `fut`, продолжая принимать события соединения. Прерывается при teardown.
    async fn guarded<T>(&mut self, fut: impl Future<Output = T>) -> Result<T, NegotiationError> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return Err(NegotiationError::TornDown),
                out = &mut fut => return Ok(out),
                Some(event) = self.events.recv() => {
                    self.note_gathered(&event);
                    self.buffer_event(event)
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.cancel();
        }
        self.watcher.stop();
        self.local_pending.clear();
        self.remote_pending.clear();
        self.deferred.clear();
        self.gathered.clear();
        self.remote_seen.clear();
        if let Err(e) = self.peer.close().await {
            warn!(error = %e, "failed to close peer connection");
        }
        self.events.close();
        debug!("attempt resources released");
    }
}

async fn next_record(subscription: &mut Option<Subscription>) -> Option<CandidateRecord> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}
