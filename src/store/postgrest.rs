use async_trait::async_trait;
use reqwest::header::HeaderValue;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::error::StoreError;
use crate::signaling::{CandidateRecord, RelayStore, SessionRecord, Subscription};

const REST_PREFIX: &str = "rest/v1";

/// Сколько последних id перечитывается на каждом опросе: строка с меньшим id
/// может закоммититься позже строки с большим.
const FEED_OVERLAP: u64 = 32;

#[derive(Serialize)]
struct OfferRow<'a> {
    id: &'a str,
    offer: &'a str,
}

#[derive(Serialize)]
struct AnswerPatch<'a> {
    answer: &'a str,
}

#[derive(Serialize)]
struct CandidateRow<'a> {
    session_id: &'a str,
    candidate: &'a str,
}

#[derive(Deserialize)]
struct OrderRow {
    id: u64,
}

/// Позиция опроса ленты кандидатов. Перечитывает окно в `FEED_OVERLAP` id
/// позади последнего увиденного и пропускает уже отданные строки.
/// Строки с id не больше `start` считаются историей и не отдаются никогда.
#[derive(Debug)]
struct FeedCursor {
    start: u64,
    last_seen: u64,
    delivered: BTreeSet<u64>,
}

impl FeedCursor {
    fn starting_after(start: u64) -> Self {
        Self {
            start,
            last_seen: start,
            delivered: BTreeSet::new(),
        }
    }

    /// Нижняя граница для запроса `id > after`
    fn query_after(&self) -> u64 {
        self.start.max(self.last_seen.saturating_sub(FEED_OVERLAP))
    }

    fn accept(&mut self, rows: Vec<CandidateRecord>) -> Vec<CandidateRecord> {
        let after = self.query_after();
        let fresh: Vec<CandidateRecord> = rows
            .into_iter()
            .filter(|row| row.order > after && self.delivered.insert(row.order))
            .collect();
        if let Some(max) = fresh.iter().map(|row| row.order).max() {
            self.last_seen = self.last_seen.max(max);
        }
        let after = self.query_after();
        self.delivered = self.delivered.split_off(&(after + 1));
        fresh
    }
}

/// Relay поверх PostgREST (таблицы `call_sessions` и `ice_candidates`).
/// Поток вставок реализован опросом строк через `FeedCursor`.
#[derive(Clone)]
pub struct PostgrestRelay {
    http: reqwest::Client,
    base: String,
    api_key: String,
    session_table: String,
    candidate_table: String,
    feed_interval: Duration,
}

impl PostgrestRelay {
    pub fn new(config: &RelayConfig) -> Result<Self, StoreError> {
        if config.url.trim().is_empty() {
            return Err(StoreError::Backend("relay url is not configured".into()));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base: format!("{}/{}", config.url.trim_end_matches('/'), REST_PREFIX),
            api_key: config.api_key.clone(),
            session_table: config.session_table.clone(),
            candidate_table: config.candidate_table.clone(),
            feed_interval: config.feed_interval(),
        })
    }

    fn endpoint(&self, table: &str) -> String {
        format!("{}/{}", self.base, table)
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let mut builder = self.http.request(method, self.endpoint(table));
        if !self.api_key.is_empty() {
            builder = builder.header("apikey", &self.api_key).bearer_auth(&self.api_key);
        }
        builder
    }

    async fn latest_candidate_order(&self, session_id: &str) -> Result<u64, StoreError> {
        let response = self
            .request(Method::GET, &self.candidate_table)
            .query(&[
                ("session_id", format!("eq.{session_id}")),
                ("select", "id".to_owned()),
                ("order", "id.desc".to_owned()),
                ("limit", "1".to_owned()),
            ])
            .send()
            .await?;
        let rows: Vec<OrderRow> = check(response).await?.json().await?;
        Ok(rows.first().map(|row| row.id).unwrap_or(0))
    }

    async fn candidates_after(&self, session_id: &str, after: u64) -> Result<Vec<CandidateRecord>, StoreError> {
        let response = self
            .request(Method::GET, &self.candidate_table)
            .query(&[
                ("session_id", format!("eq.{session_id}")),
                ("id", format!("gt.{after}")),
                ("select", "id,session_id,candidate".to_owned()),
                ("order", "id.asc".to_owned()),
            ])
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}

async fn check(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::CONFLICT => Err(StoreError::Conflict),
        // PGRST116: single-object запрос без строк
        StatusCode::NOT_FOUND | StatusCode::NOT_ACCEPTABLE => Err(StoreError::NotFound),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(StoreError::Backend(format!("{status}: {body}")))
        }
    }
}

#[async_trait]
impl RelayStore for PostgrestRelay {
    async fn read_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let response = self
            .request(Method::GET, &self.session_table)
            .query(&[
                ("id", format!("eq.{session_id}")),
                ("select", "id,offer,answer".to_owned()),
                ("limit", "1".to_owned()),
            ])
            .send()
            .await?;
        let rows: Vec<SessionRecord> = check(response).await?.json().await?;
        Ok(rows.into_iter().next())
    }

    async fn upsert_offer(&self, session_id: &str, offer: &str) -> Result<(), StoreError> {
        let response = self
            .request(Method::POST, &self.session_table)
            .query(&[("on_conflict", "id")])
            .header(
                "Prefer",
                HeaderValue::from_static("resolution=merge-duplicates,return=minimal"),
            )
            .json(&OfferRow { id: session_id, offer })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn update_answer(&self, session_id: &str, answer: &str) -> Result<(), StoreError> {
        let response = self
            .request(Method::PATCH, &self.session_table)
            .query(&[("id", format!("eq.{session_id}"))])
            .header("Prefer", HeaderValue::from_static("return=representation"))
            .json(&AnswerPatch { answer })
            .send()
            .await?;
        let rows: Vec<SessionRecord> = check(response).await?.json().await?;
        if rows.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn insert_candidate(&self, session_id: &str, candidate: &str) -> Result<(), StoreError> {
        let response = self
            .request(Method::POST, &self.candidate_table)
            .header("Prefer", HeaderValue::from_static("return=minimal"))
            .json(&CandidateRow {
                session_id,
                candidate,
            })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn subscribe_candidates(&self, session_id: &str) -> Result<Subscription, StoreError> {
        // всё, что уже лежит в таблице, считаем историей
        let start = self.latest_candidate_order(session_id).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = self.clone();
        let session_id = session_id.to_owned();
        debug!(%session_id, start, "candidate feed started");

        let task = tokio::spawn(async move {
            let mut cursor = FeedCursor::starting_after(start);
            let mut ticker = tokio::time::interval(relay.feed_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match relay.candidates_after(&session_id, cursor.query_after()).await {
                    Ok(rows) => {
                        for row in cursor.accept(rows) {
                            if tx.send(row).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(%session_id, error = %e, "candidate feed poll failed"),
                }
            }
        });

        Ok(Subscription::new(rx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(order: u64) -> CandidateRecord {
        CandidateRecord {
            order,
            session_id: "abc".into(),
            candidate: format!("c{order}"),
        }
    }

    fn orders(rows: Vec<CandidateRecord>) -> Vec<u64> {
        rows.into_iter().map(|row| row.order).collect()
    }

    #[test]
    fn late_committed_row_is_delivered_once() {
        let mut cursor = FeedCursor::starting_after(10);
        assert_eq!(cursor.query_after(), 10);
        // id 12 закоммитился раньше, чем 11
        assert_eq!(orders(cursor.accept(vec![row(12)])), vec![12]);
        assert_eq!(cursor.query_after(), 10);

        assert_eq!(orders(cursor.accept(vec![row(11), row(12), row(13)])), vec![11, 13]);
        assert_eq!(orders(cursor.accept(vec![row(11), row(12), row(13)])), Vec::<u64>::new());
    }

    #[test]
    fn history_before_subscription_is_never_delivered() {
        let mut cursor = FeedCursor::starting_after(10);
        assert_eq!(orders(cursor.accept(vec![row(9), row(10), row(11)])), vec![11]);
    }

    #[test]
    fn window_slides_behind_the_newest_row() {
        let mut cursor = FeedCursor::starting_after(0);
        let rows: Vec<CandidateRecord> = (1..=100).map(row).collect();
        assert_eq!(cursor.accept(rows).len(), 100);
        assert_eq!(cursor.query_after(), 100 - FEED_OVERLAP);
        assert_eq!(cursor.delivered.len() as u64, FEED_OVERLAP);
        assert_eq!(orders(cursor.accept(vec![row(80), row(101)])), vec![101]);
    }

    #[test]
    fn requires_a_url() {
        assert!(PostgrestRelay::new(&RelayConfig::default()).is_err());
    }

    #[test]
    fn endpoints_live_under_rest_prefix() {
        let relay = PostgrestRelay::new(&RelayConfig {
            url: "https://project.supabase.co/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            relay.endpoint("call_sessions"),
            "https://project.supabase.co/rest/v1/call_sessions"
        );
        assert_eq!(
            relay.endpoint(&relay.candidate_table),
            "https://project.supabase.co/rest/v1/ice_candidates"
        );
    }
}
