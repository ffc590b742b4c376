//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::{AuthState, SharedVerifier};
use crate::chat::{ChatConfig, ChatHub};
use crate::history::HistoryStore;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Authentication state (CORS origins, dev mode).
    pub auth: AuthState,
    /// Token verifier used by the auth middleware.
    pub verifier: SharedVerifier,
    /// Chat hub handle.
    pub hub: ChatHub,
    /// Message history.
    pub history: Arc<dyn HistoryStore>,
    /// Chat tuning.
    pub chat: Arc<ChatConfig>,
}

impl AppState {
    /// Create new application state. `auth` doubles as the token verifier.
    pub fn new(
        auth: AuthState,
        hub: ChatHub,
        history: Arc<dyn HistoryStore>,
        chat: ChatConfig,
    ) -> Self {
        let verifier: SharedVerifier = Arc::new(auth.clone());
        Self {
            auth,
            verifier,
            hub,
            history,
            chat: Arc::new(chat),
        }
    }

    /// Replace the token verifier.
    pub fn with_verifier(mut self, verifier: SharedVerifier) -> Self {
        self.verifier = verifier;
        self
    }
}
