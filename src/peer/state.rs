use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::peer::types::Role;

/// Состояние попытки согласования
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Initializing,
    RoleDetermined(Role),
    LocalDescriptionSet(Role),
    Established(Role),
    Closed,
    Failed(String),
}

impl NegotiationState {
    pub fn role(&self) -> Option<Role> {
        match self {
            NegotiationState::RoleDetermined(role)
            | NegotiationState::LocalDescriptionSet(role)
            | NegotiationState::Established(role) => Some(*role),
            _ => None,
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self, NegotiationState::Established(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, NegotiationState::Failed(_))
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Idle => f.write_str("idle"),
            NegotiationState::Initializing => f.write_str("initializing"),
            NegotiationState::RoleDetermined(role) => write!(f, "role determined ({role})"),
            NegotiationState::LocalDescriptionSet(role) => {
                write!(f, "local description set ({role})")
            }
            NegotiationState::Established(role) => write!(f, "established ({role})"),
            NegotiationState::Closed => f.write_str("closed"),
            NegotiationState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Публикация состояния наружу (вместо событий UI)
#[derive(Clone)]
pub struct StatusTx {
    tx: Arc<watch::Sender<NegotiationState>>,
}

impl StatusTx {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(NegotiationState::Idle);
        Self { tx: Arc::new(tx) }
    }

    pub fn emit(&self, state: NegotiationState) {
        debug!(%state, "negotiation state");
        self.tx.send_replace(state);
    }

    pub fn current(&self) -> NegotiationState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.tx.subscribe()
    }
}

impl Default for StatusTx {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_is_exposed_while_negotiating() {
        assert_eq!(NegotiationState::Idle.role(), None);
        assert_eq!(
            NegotiationState::LocalDescriptionSet(Role::Initiator).role(),
            Some(Role::Initiator)
        );
        assert!(NegotiationState::Established(Role::Responder).is_established());
        assert!(NegotiationState::Failed("x".into()).is_failed());
    }

    #[test]
    fn subscribers_see_latest_state() {
        let status = StatusTx::new();
        let rx = status.subscribe();
        status.emit(NegotiationState::Initializing);
        status.emit(NegotiationState::RoleDetermined(Role::Responder));
        assert_eq!(*rx.borrow(), NegotiationState::RoleDetermined(Role::Responder));
        assert_eq!(status.current(), NegotiationState::RoleDetermined(Role::Responder));
    }
}
