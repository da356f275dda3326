use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{trace, warn};

use crate::error::StoreError;
use crate::signaling::{CandidateRecord, RelayStore, SessionRecord, Subscription};

const FEED_CAPACITY: usize = 1024;

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, SessionRecord>,
    candidates: Vec<CandidateRecord>,
    // уникальность (session_id, candidate)
    unique: HashSet<(String, String)>,
    next_order: u64,
}

/// Relay в памяти процесса. Оба пира в одном процессе видят одни и те же таблицы.
pub struct MemoryRelay {
    tables: Mutex<Tables>,
    feed: broadcast::Sender<CandidateRecord>,
    latency: Option<Duration>,
    unique_candidates: bool,
    read_failure: Mutex<Option<String>>,
    session_reads: AtomicUsize,
    live_subscriptions: Arc<AtomicUsize>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            tables: Mutex::new(Tables::default()),
            feed,
            latency: None,
            unique_candidates: true,
            read_failure: Mutex::new(None),
            session_reads: AtomicUsize::new(0),
            live_subscriptions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Задержка перед каждой операцией, как у сетевого relay
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Таблица кандидатов без ограничения уникальности: повтор получает новый порядок
    pub fn without_unique_constraint(mut self) -> Self {
        self.unique_candidates = false;
        self
    }

    /// Все последующие чтения сессий завершаются ошибкой backend
    pub fn fail_reads(&self, reason: Option<&str>) {
        *self.read_failure.lock() = reason.map(str::to_owned);
    }

    pub fn session(&self, session_id: &str) -> Option<SessionRecord> {
        self.tables.lock().sessions.get(session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.tables.lock().sessions.len()
    }

    pub fn candidates(&self, session_id: &str) -> Vec<CandidateRecord> {
        self.tables
            .lock()
            .candidates
            .iter()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn live_subscriptions(&self) -> usize {
        self.live_subscriptions.load(Ordering::SeqCst)
    }

    /// Сколько раз читали записи сессий (включая опрос ответа)
    pub fn session_reads(&self) -> usize {
        self.session_reads.load(Ordering::SeqCst)
    }

    /// Повторно рассылает уже сохранённые кандидаты сессии, как при доставке at-least-once
    pub fn redeliver(&self, session_id: &str) -> usize {
        let records = self.candidates(session_id);
        let count = records.len();
        for record in records {
            let _ = self.feed.send(record);
        }
        count
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayStore for MemoryRelay {
    async fn read_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.delay().await;
        self.session_reads.fetch_add(1, Ordering::SeqCst);
        let failure = self.read_failure.lock().clone();
        if let Some(reason) = failure {
            return Err(StoreError::Backend(reason));
        }
        Ok(self.session(session_id))
    }

    async fn upsert_offer(&self, session_id: &str, offer: &str) -> Result<(), StoreError> {
        self.delay().await;
        let mut tables = self.tables.lock();
        let record = tables
            .sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| SessionRecord {
                id: session_id.to_owned(),
                ..Default::default()
            });
        record.offer = Some(offer.to_owned());
        Ok(())
    }

    async fn update_answer(&self, session_id: &str, answer: &str) -> Result<(), StoreError> {
        self.delay().await;
        let mut tables = self.tables.lock();
        match tables.sessions.get_mut(session_id) {
            Some(record) => {
                record.answer = Some(answer.to_owned());
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn insert_candidate(&self, session_id: &str, candidate: &str) -> Result<(), StoreError> {
        self.delay().await;
        let record = {
            let mut tables = self.tables.lock();
            let fresh = tables
                .unique
                .insert((session_id.to_owned(), candidate.to_owned()));
            if !fresh && self.unique_candidates {
                return Err(StoreError::Conflict);
            }
            tables.next_order += 1;
            let record = CandidateRecord {
                order: tables.next_order,
                session_id: session_id.to_owned(),
                candidate: candidate.to_owned(),
            };
            tables.candidates.push(record.clone());
            record
        };
        // подписчиков может не быть
        let _ = self.feed.send(record);
        Ok(())
    }

    async fn subscribe_candidates(&self, session_id: &str) -> Result<Subscription, StoreError> {
        self.delay().await;
        let mut feed = self.feed.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let filter = session_id.to_owned();

        let task = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(record) if record.session_id == filter => {
                        if tx.send(record).is_err() {
                            break;
                        }
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session_id = %filter, skipped, "candidate feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            trace!(session_id = %filter, "candidate feed forwarder stopped");
        });

        self.live_subscriptions.fetch_add(1, Ordering::SeqCst);
        let live = self.live_subscriptions.clone();
        Ok(Subscription::new(rx, task).on_release(move || {
            live.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}
