use crate::peer::types::SignalingState;
use thiserror::Error;

/// Ошибки relay-хранилища
#[derive(Debug, Error)]
pub enum StoreError {
    /// Запись отсутствует. Для чтения сессии это нормальный исход, а не сбой.
    #[error("record not found")]
    NotFound,

    /// Повторная вставка той же записи (гонка двух пиров или повтор)
    #[error("duplicate write conflict")]
    Conflict,

    #[error("relay backend error: {0}")]
    Backend(String),

    #[error("relay http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("relay payload decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Ошибки peer connection
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer engine error: {0}")]
    Engine(#[from] webrtc::Error),

    #[error("signaling state {state} does not allow {operation}")]
    InvalidState {
        state: SignalingState,
        operation: &'static str,
    },

    #[error("peer connection is closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// Ошибки захвата локального медиа
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media device unavailable: {0}")]
    Unavailable(String),

    #[error("neither audio nor video was requested")]
    NothingRequested,
}

/// Ошибки одной попытки согласования
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),

    #[error("session read failed: {0}")]
    StoreRead(#[source] StoreError),

    #[error("session write failed: {0}")]
    StoreWrite(#[source] StoreError),

    #[error("negotiation state error: {0}")]
    NegotiationState(#[source] PeerError),

    #[error("peer connection error: {0}")]
    Peer(#[source] PeerError),

    #[error("invalid signaling payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("session {0} exists but carries no offer")]
    MissingOffer(String),

    #[error("attempt was torn down")]
    TornDown,
}

impl From<PeerError> for NegotiationError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::InvalidState { .. } => NegotiationError::NegotiationState(err),
            other => NegotiationError::Peer(other),
        }
    }
}

/// Ошибки загрузки конфигурации
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
