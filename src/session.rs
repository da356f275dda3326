use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::Config;
use crate::negotiation::Negotiator;
use crate::peer::connection::PeerConnector;
use crate::peer::media::{MediaSource, RenderSurface};
use crate::peer::state::NegotiationState;
use crate::signaling::{RelayStore, SignalingClient};

/// Одна «комната» вызова: держит текущую попытку согласования и
/// перезапускает её только при смене идентификатора сессии.
pub struct CallSession {
    negotiator: Negotiator,
}

impl CallSession {
    pub fn new(
        config: &Config,
        relay: Arc<dyn RelayStore>,
        connector: Arc<dyn PeerConnector>,
        media: Arc<dyn MediaSource>,
        surface: Arc<dyn RenderSurface>,
    ) -> Self {
        let signaling = SignalingClient::new(relay);
        Self {
            negotiator: Negotiator::new(signaling, connector, media, surface, config),
        }
    }

    /// Войти в сессию. Повторный вход в ту же сессию ничего не делает.
    pub async fn enter(&mut self, session_id: &str) {
        if self.negotiator.session_id() == Some(session_id) {
            debug!(%session_id, "already in session");
            return;
        }
        info!(%session_id, "entering session");
        self.negotiator.setup(session_id).await;
    }

    /// Явный перезапуск текущей сессии
    pub async fn restart(&mut self) {
        if let Some(session_id) = self.negotiator.session_id().map(str::to_owned) {
            info!(%session_id, "restarting session");
            self.negotiator.setup(session_id).await;
        }
    }

    pub async fn leave(&mut self) {
        self.negotiator.teardown().await;
    }

    pub fn session_id(&self) -> Option<&str> {
        self.negotiator.session_id()
    }

    pub fn status(&self) -> watch::Receiver<NegotiationState> {
        self.negotiator.status()
    }

    pub fn state(&self) -> NegotiationState {
        self.negotiator.state()
    }

    pub fn is_stalled(&self) -> bool {
        self.negotiator.is_stalled()
    }

    /// Ждёт состояния, удовлетворяющего `pred`. `None` по таймауту.
    pub async fn wait_for<F>(&self, timeout: Duration, mut pred: F) -> Option<NegotiationState>
    where
        F: FnMut(&NegotiationState) -> bool,
    {
        let mut status = self.status();
        let waited = tokio::time::timeout(timeout, async move {
            status.wait_for(|state| pred(state)).await.map(|state| state.clone())
        })
        .await;
        match waited {
            Ok(Ok(state)) => Some(state),
            _ => None,
        }
    }
}
