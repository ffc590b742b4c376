//! Test utilities and common setup.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use jsonwebtoken::{EncodingKey, Header};
use nurselink::api::{self, AppState};
use nurselink::auth::{AuthConfig, AuthState, Claims, Role, SharedVerifier};
use nurselink::chat::{ChatConfig, ChatHub};
use nurselink::db::Database;
use nurselink::history::{HistoryStore, SqliteHistoryStore};
use tokio::net::TcpListener;

pub const TEST_SECRET: &str = "test-secret-for-integration-tests-minimum-32-chars";

/// Create a test AuthConfig with a JWT secret for testing.
fn test_auth_config() -> AuthConfig {
    AuthConfig {
        jwt_secret: Some(TEST_SECRET.to_string()),
        ..AuthConfig::default()
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub auth: AuthState,
}

impl TestApp {
    /// Mint a valid token for a participant.
    pub fn token(&self, user_id: &str, name: &str, role: Role) -> String {
        self.auth.generate_token(user_id, name, role).unwrap()
    }

    /// Rebuild the router around a different token verifier.
    pub fn with_verifier(mut self, verifier: SharedVerifier) -> Self {
        self.state = self.state.with_verifier(verifier);
        self.router = api::create_router(self.state.clone());
        self
    }

    /// Block until `count` users are registered with the hub.
    pub async fn wait_for_online(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let online = self.state.hub.online().await.unwrap();
            if online.len() == count {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {count} online, have {}",
                online.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Create a test application with all services initialized.
pub async fn test_app() -> TestApp {
    // Use in-memory database for tests
    let db = Database::in_memory().await.unwrap();
    let history: Arc<dyn HistoryStore> = Arc::new(SqliteHistoryStore::new(db.pool().clone()));

    let auth = AuthState::new(test_auth_config());
    let chat = ChatConfig {
        ping_interval_secs: 0,
        ..ChatConfig::default()
    };
    let hub = ChatHub::spawn(chat.hub_buffer);

    let state = AppState::new(auth.clone(), hub, history, chat);
    let router = api::create_router(state.clone());

    TestApp {
        router,
        state,
        auth,
    }
}

/// Serve the test application on an ephemeral local port.
pub async fn spawn_server() -> (SocketAddr, TestApp) {
    serve(test_app().await).await
}

/// Serve an already built application on an ephemeral local port.
pub async fn serve(app: TestApp) -> (SocketAddr, TestApp) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, app)
}

/// Sign arbitrary claims with the test secret.
pub fn sign_claims(claims: &Claims) -> String {
    jsonwebtoken::encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}

/// Claims for a valid token that carries no display name.
pub fn nameless_claims(user_id: &str) -> Claims {
    Claims {
        sub: user_id.to_string(),
        exp: Utc::now().timestamp() + 3600,
        iat: None,
        name: None,
        roles: vec![],
        role: Some("NURSE".to_string()),
    }
}
