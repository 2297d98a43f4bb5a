//! Integration tests for token refresh functionality.
//!
//! These tests verify that the TokenManager correctly:
//! - Detects expiring and expired tokens
//! - Refreshes tokens using refresh tokens and persists the result
//! - Never attempts a refresh without a refresh token
//! - Recovers from a restart when only the refresh half was durable

use chrono::{Duration, Utc};
use grantkeeper_core::{
    model::{Account, AccountRegistry},
    notify::RecordingNotifier,
    oauth::OAuthEngine,
    store::{FileStore, MemoryStore, SplitStore, TokenStore},
    token::{Freshness, Token, TokenError},
    token_manager::TokenManager,
};
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_string_contains, method, path},
};

/// Helper to create the test account pointing at a mock token endpoint.
fn test_account(token_url: &str) -> Account {
    Account::new("work")
        .with_auth_uri("https://provider.example/authorize")
        .with_token_uri(token_url)
        .with_client_id("test-client-id")
        .with_client_secret("test-client-secret")
        .with_redirect_uri("https://localhost:8080")
}

/// Helper to set up a token manager over `store`.
fn setup_manager(token_url: &str, store: Arc<dyn TokenStore>) -> TokenManager {
    let registry = Arc::new(AccountRegistry::new([test_account(token_url)]));
    TokenManager::new(
        store,
        OAuthEngine::new(registry),
        Arc::new(RecordingNotifier::new()),
    )
}

async fn mock_refresh(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=test-refresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "refreshed-access-token",
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "rotated-refresh-token"
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_ensure_access_token_returns_valid_token() {
    let server = MockServer::start().await;
    mock_refresh(&server, 0).await;

    let store = Arc::new(MemoryStore::new());
    let manager = setup_manager(&format!("{}/token", server.uri()), store.clone());

    let token = Token::new("valid-access-token")
        .with_refresh_token("test-refresh-token")
        .with_expiry(Utc::now() + Duration::hours(1));
    store.set("work", &token).await.unwrap();

    let result = manager.ensure_access_token("work").await.unwrap();
    assert_eq!(result.access_token.expose(), "valid-access-token");
}

#[tokio::test]
async fn test_expiring_token_refreshed_on_demand() {
    let server = MockServer::start().await;
    mock_refresh(&server, 1).await;

    let store = Arc::new(MemoryStore::new());
    let manager = setup_manager(&format!("{}/token", server.uri()), store.clone());

    // Expires in five minutes, inside the ten minute threshold.
    let token = Token::new("expiring-access-token")
        .with_refresh_token("test-refresh-token")
        .with_expiry(Utc::now() + Duration::minutes(5));
    store.set("work", &token).await.unwrap();
    assert_eq!(
        manager.status("work").await.unwrap(),
        Freshness::ExpiringSoon { refreshable: true }
    );

    let result = manager.ensure_access_token("work").await.unwrap();
    assert_eq!(result.access_token.expose(), "refreshed-access-token");

    let stored = store.get("work").await.unwrap();
    assert_eq!(stored.access_token.expose(), "refreshed-access-token");
    assert_eq!(
        stored.refresh_secret().unwrap().expose(),
        "rotated-refresh-token"
    );
    assert_eq!(manager.status("work").await.unwrap(), Freshness::Valid);
}

#[tokio::test]
async fn test_expired_token_without_refresh_never_calls_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let manager = setup_manager(&format!("{}/token", server.uri()), store.clone());

    let token = Token::new("expired-access-token").with_expiry(Utc::now() - Duration::hours(1));
    store.set("work", &token).await.unwrap();

    let result = manager.ensure_access_token("work").await;
    assert!(matches!(result, Err(TokenError::ReauthRequired { .. })));

    let report = manager.sweep().await;
    assert_eq!(report.expired, 1);
    assert_eq!(report.refreshed + report.failed, 0);

    assert_eq!(store.get("work").await.unwrap(), token);
}

#[tokio::test]
async fn test_sweep_refreshes_inside_threshold() {
    let server = MockServer::start().await;
    mock_refresh(&server, 1).await;

    let store = Arc::new(MemoryStore::new());
    let manager = setup_manager(&format!("{}/token", server.uri()), store.clone());

    let token = Token::new("expiring-access-token")
        .with_refresh_token("test-refresh-token")
        .with_expiry(Utc::now() + Duration::minutes(3));
    store.set("work", &token).await.unwrap();

    let report = manager.sweep().await;
    assert_eq!(report.refreshed, 1);
    assert_eq!(
        store.get("work").await.unwrap().access_token.expose(),
        "refreshed-access-token"
    );

    // Second sweep finds a fresh token and does nothing.
    assert_eq!(manager.sweep().await.refreshed, 0);
}

#[tokio::test]
async fn test_split_store_refreshes_after_restart() {
    let server = MockServer::start().await;
    mock_refresh(&server, 1).await;
    let token_url = format!("{}/token", server.uri());

    let dir = TempDir::new().unwrap();
    let token_file = dir.path().join("tokens.json");

    {
        let store = Arc::new(SplitStore::new(Arc::new(FileStore::new(&token_file))));
        let manager = setup_manager(&token_url, store);
        let token = Token::new("first-access-token")
            .with_refresh_token("test-refresh-token")
            .with_expiry(Utc::now() + Duration::hours(1));
        manager.store_authorized("work", &token).await.unwrap();
    }

    // A new process only has the durable refresh half.
    let store = Arc::new(SplitStore::new(Arc::new(FileStore::new(&token_file))));
    let manager = setup_manager(&token_url, store);
    assert_eq!(
        manager.status("work").await.unwrap(),
        Freshness::Expired { refreshable: true }
    );

    let token = manager.ensure_access_token("work").await.unwrap();
    assert_eq!(token.access_token.expose(), "refreshed-access-token");
    assert!(!std::fs::read_to_string(&token_file)
        .unwrap()
        .contains("refreshed-access-token"));
}
