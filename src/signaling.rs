use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::peer::types::{IceCandidate, SessionDescription};

/// Запись сессии: одна на идентификатор, offer и answer пишутся по одному разу
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: String,
    #[serde(default)]
    pub offer: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
}

/// Запись кандидата. `order` назначает relay, он задаёт только порядок доставки.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CandidateRecord {
    #[serde(rename = "id")]
    pub order: u64,
    pub session_id: String,
    pub candidate: String,
}

/// Внешнее хранилище, через которое пиры обмениваются сигналингом
#[async_trait]
pub trait RelayStore: Send + Sync + 'static {
    async fn read_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// Создаёт запись или перезаписывает offer (последний пишущий выигрывает)
    async fn upsert_offer(&self, session_id: &str, offer: &str) -> Result<(), StoreError>;

    /// `StoreError::NotFound`, если записи нет
    async fn update_answer(&self, session_id: &str, answer: &str) -> Result<(), StoreError>;

    /// `StoreError::Conflict` для повторной вставки
    async fn insert_candidate(&self, session_id: &str, candidate: &str) -> Result<(), StoreError>;

    /// Новые кандидаты сессии начиная с момента подписки, без истории
    async fn subscribe_candidates(&self, session_id: &str) -> Result<Subscription, StoreError>;
}

type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// Подписка на вставки кандидатов: канал + задача, которая его наполняет
pub struct Subscription {
    records: mpsc::UnboundedReceiver<CandidateRecord>,
    task: Option<JoinHandle<()>>,
    on_release: Option<ReleaseHook>,
}

impl Subscription {
    pub fn new(records: mpsc::UnboundedReceiver<CandidateRecord>, task: JoinHandle<()>) -> Self {
        Self {
            records,
            task: Some(task),
            on_release: None,
        }
    }

    /// Хук вызывается один раз при отмене (или drop)
    pub fn on_release(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        let previous = self.on_release.take();
        self.on_release = Some(Box::new(move || {
            if let Some(previous) = previous {
                previous();
            }
            hook();
        }));
        self
    }

    /// `None` после отмены или когда relay закрыл поток
    pub async fn next(&mut self) -> Option<CandidateRecord> {
        self.records.recv().await
    }

    pub fn is_active(&self) -> bool {
        self.task.is_some()
    }

    /// Повторный вызов безопасен
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.records.close();
            if let Some(hook) = self.on_release.take() {
                hook();
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Типизированный доступ к relay: кодирование описаний и кандидатов,
/// «не найдено» как обычный исход, дубликаты без ошибки.
#[derive(Clone)]
pub struct SignalingClient {
    relay: Arc<dyn RelayStore>,
}

impl SignalingClient {
    pub fn new(relay: Arc<dyn RelayStore>) -> Self {
        Self { relay }
    }

    pub async fn read_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        match self.relay.read_session(session_id).await {
            Err(StoreError::NotFound) => Ok(None),
            other => other,
        }
    }

    pub async fn read_offer(&self, session_id: &str) -> Result<Option<SessionDescription>, StoreError> {
        let record = self.read_session(session_id).await?;
        decode_field(record.and_then(|r| r.offer))
    }

    pub async fn read_answer(&self, session_id: &str) -> Result<Option<SessionDescription>, StoreError> {
        let record = self.read_session(session_id).await?;
        decode_field(record.and_then(|r| r.answer))
    }

    /// Опрашивает запись, пока в ней не появится offer. `None` по таймауту.
    pub async fn wait_for_offer(
        &self,
        session_id: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Option<SessionDescription>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(offer) = self.read_offer(session_id).await? {
                return Ok(Some(offer));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn upsert_offer(&self, session_id: &str, offer: &SessionDescription) -> Result<(), StoreError> {
        let encoded = offer.encode()?;
        self.relay.upsert_offer(session_id, &encoded).await
    }

    pub async fn update_answer(&self, session_id: &str, answer: &SessionDescription) -> Result<(), StoreError> {
        let encoded = answer.encode()?;
        self.relay.update_answer(session_id, &encoded).await
    }

    pub async fn insert_candidate(&self, session_id: &str, candidate: &IceCandidate) -> Result<(), StoreError> {
        let encoded = candidate.encode()?;
        match self.relay.insert_candidate(session_id, &encoded).await {
            Err(StoreError::Conflict) => {
                debug!(session_id, candidate = %candidate.candidate, "candidate already stored");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn subscribe_candidates(&self, session_id: &str) -> Result<Subscription, StoreError> {
        self.relay.subscribe_candidates(session_id).await
    }
}

fn decode_field(raw: Option<String>) -> Result<Option<SessionDescription>, StoreError> {
    match raw {
        Some(raw) if !raw.trim().is_empty() => match SessionDescription::decode(&raw) {
            Ok(desc) => Ok(Some(desc)),
            Err(e) => {
                warn!(error = %e, "malformed session description in relay");
                Err(StoreError::Decode(e))
            }
        },
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryRelay;

    fn client() -> (Arc<MemoryRelay>, SignalingClient) {
        let relay = Arc::new(MemoryRelay::new());
        (relay.clone(), SignalingClient::new(relay))
    }

    #[tokio::test]
    async fn absent_session_reads_as_none() {
        let (_, client) = client();
        assert_eq!(client.read_session("missing").await.unwrap(), None);
        assert_eq!(client.read_answer("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn offer_and_answer_round_trip_through_the_record() {
        let (relay, client) = client();
        client
            .upsert_offer("abc", &SessionDescription::offer("OFFER1"))
            .await
            .unwrap();
        assert_eq!(client.read_answer("abc").await.unwrap(), None);

        client
            .update_answer("abc", &SessionDescription::answer("ANSWER1"))
            .await
            .unwrap();
        assert_eq!(
            client.read_offer("abc").await.unwrap(),
            Some(SessionDescription::offer("OFFER1"))
        );
        assert_eq!(
            client.read_answer("abc").await.unwrap(),
            Some(SessionDescription::answer("ANSWER1"))
        );
        assert_eq!(relay.session_count(), 1);
    }

    #[tokio::test]
    async fn answer_requires_existing_record() {
        let (_, client) = client();
        let err = client
            .update_answer("nobody", &SessionDescription::answer("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn duplicate_candidate_is_swallowed_and_delivered_once() {
        let (relay, client) = client();
        let mut sub = client.subscribe_candidates("abc").await.unwrap();
        let cand = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host");

        client.insert_candidate("abc", &cand).await.unwrap();
        client.insert_candidate("abc", &cand).await.unwrap();

        assert_eq!(relay.candidates("abc").len(), 1);
        let first = sub.next().await.unwrap();
        assert_eq!(IceCandidate::decode(&first.candidate).unwrap(), cand);
        let second = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
        assert!(second.is_err(), "duplicate must not reach subscribers");
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_the_offer_is_written() {
        let (_, client) = client();
        let writer = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            writer
                .upsert_offer("abc", &SessionDescription::offer("OFFER1"))
                .await
                .unwrap();
        });

        let offer = client
            .wait_for_offer("abc", Duration::from_millis(50), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(offer, Some(SessionDescription::offer("OFFER1")));

        let missing = client
            .wait_for_offer("nobody", Duration::from_millis(50), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn empty_answer_is_treated_as_absent() {
        let (relay, client) = client();
        relay.upsert_offer("abc", "{\"type\":\"offer\",\"sdp\":\"o\"}").await.unwrap();
        relay.update_answer("abc", "").await.unwrap();
        assert_eq!(client.read_answer("abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_runs_release_once() {
        let (_, client) = client();
        let released = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = released.clone();
        let mut sub = client
            .subscribe_candidates("abc")
            .await
            .unwrap()
            .on_release(move || {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        assert!(sub.is_active());
        sub.cancel();
        sub.cancel();
        drop(sub);
        assert_eq!(released.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
