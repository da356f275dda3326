use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::peer::types::SessionDescription;
use crate::signaling::SignalingClient;

/// Инициатор опрашивает запись сессии, пока не появится answer.
/// Callback вызывается не больше одного раза, после этого опрос останавливается.
pub struct AnswerWatcher {
    interval: Duration,
    expected_offer: Option<SessionDescription>,
    resolved: Arc<AtomicBool>,
    superseded: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl AnswerWatcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            expected_offer: None,
            resolved: Arc::new(AtomicBool::new(false)),
            superseded: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Answer принимается только если в записи лежит именно этот offer.
    /// Иначе offer перезаписан другим инициатором и ответ адресован не нам.
    pub fn expect_offer(&mut self, offer: SessionDescription) {
        self.expected_offer = Some(offer);
    }

    pub fn start<F>(&mut self, client: SignalingClient, session_id: String, on_answer: F)
    where
        F: FnOnce(SessionDescription) + Send + 'static,
    {
        self.stop();
        let resolved = Arc::new(AtomicBool::new(false));
        self.resolved = resolved.clone();
        self.superseded.store(false, Ordering::SeqCst);
        let superseded = self.superseded.clone();
        let expected = self.expected_offer.clone();
        let period = self.interval;

        self.task = Some(tokio::spawn(async move {
            let mut on_answer = Some(on_answer);
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(%session_id, interval_ms = period.as_millis() as u64, "answer watcher started");

            loop {
                ticker.tick().await;
                if resolved.load(Ordering::SeqCst) {
                    break;
                }

                let record = match client.read_session(&session_id).await {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        trace!(%session_id, "session record not visible yet");
                        continue;
                    }
                    Err(e) => {
                        warn!(%session_id, error = %e, "answer poll failed");
                        continue;
                    }
                };

                if let Some(expected) = &expected {
                    let ours = record
                        .offer
                        .as_deref()
                        .and_then(|raw| SessionDescription::decode(raw).ok())
                        .is_some_and(|offer| offer == *expected);
                    if !ours {
                        if !superseded.swap(true, Ordering::SeqCst) {
                            warn!(%session_id, "offer was overwritten by another initiator, waiting");
                        }
                        continue;
                    }
                    superseded.store(false, Ordering::SeqCst);
                }

                let answer = match record.answer.as_deref().filter(|raw| !raw.trim().is_empty()) {
                    Some(raw) => match SessionDescription::decode(raw) {
                        Ok(answer) => answer,
                        Err(e) => {
                            warn!(%session_id, error = %e, "malformed answer in session record");
                            continue;
                        }
                    },
                    None => continue,
                };

                // тик мог совпасть с установкой remote description другим путём
                if resolved.swap(true, Ordering::SeqCst) {
                    break;
                }
                info!(%session_id, "answer received");
                if let Some(callback) = on_answer.take() {
                    callback(answer);
                }
                break;
            }
        }));
    }

    /// Remote description уже установлен, больше ничего не доставлять
    pub fn resolve(&self) {
        self.resolved.store(true, Ordering::SeqCst);
    }

    /// Повторный вызов безопасен
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::SeqCst)
    }

    pub fn superseded_flag(&self) -> Arc<AtomicBool> {
        self.superseded.clone()
    }
}

impl Drop for AnswerWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
