use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use dxb_adapters::cloud::{CloudHttpClient, HttpCloudBackend};
use dxb_adapters::schema::HttpSchemaSource;
use dxb_core::cloud_options::{CloudOptions, LoginHints};
use dxb_core::connection_session::{ConnectOutcome, ConnectionSession, ReconnectPolicy, SessionStatus};
use dxb_core::credentials::{CredentialStore, Credentials};
use dxb_core::schema_cache::{SchemaCacheService, SchemaSource, FALLBACK_SCHEMA_SIGNATURE};
use dxb_core::storage::Storage;
use reqwest::Method;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct CaptureState {
    requests: Arc<Mutex<Vec<Captured>>>,
}

#[derive(Debug, Clone)]
struct Captured {
    path: &'static str,
    headers: HeaderMap,
    query: HashMap<String, String>,
    body: Option<Value>,
}

impl CaptureState {
    fn record(&self, captured: Captured) {
        self.requests.lock().expect("capture lock").push(captured);
    }

    fn requests_to(&self, path: &str) -> Vec<Captured> {
        self.requests
            .lock()
            .expect("capture lock")
            .iter()
            .filter(|captured| captured.path == path)
            .cloned()
            .collect()
    }
}

async fn export_handler(
    State(state): State<CaptureState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    state.record(Captured {
        path: "/export",
        headers,
        query,
        body: None,
    });
    Json(json!({
        "schema": {
            "users": "@id, name, email",
            "realms": "&realmId",
        }
    }))
}

async fn bare_export_handler() -> Json<Value> {
    Json(json!({"members": "[realmId+email], userId"}))
}

async fn broken_export_handler() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
}

async fn empty_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn not_json_handler() -> &'static str {
    "not json"
}

async fn token_handler(State(state): State<CaptureState>, Json(body): Json<Value>) -> Json<Value> {
    state.record(Captured {
        path: "/token",
        headers: HeaderMap::new(),
        query: HashMap::new(),
        body: Some(body),
    });
    Json(json!({
        "type": "tokens",
        "accessToken": "access-1",
        "accessTokenExpiration": 1_700_000_000_000_u64,
        "claims": {"sub": "service"},
    }))
}

async fn denied_token_handler() -> (StatusCode, &'static str) {
    (StatusCode::UNAUTHORIZED, "denied")
}

async fn spawn_test_server(state: CaptureState) -> String {
    let app = Router::new()
        .route("/export", get(export_handler))
        .route("/custom-export", get(bare_export_handler))
        .route("/broken", get(broken_export_handler))
        .route("/empty", get(empty_handler))
        .route("/not-json", get(not_json_handler))
        .route("/token", post(token_handler))
        .route("/denied-token", post(denied_token_handler))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server run");
    });

    format!("http://{addr}")
}

fn client() -> CloudHttpClient {
    CloudHttpClient::new(Duration::from_secs(5)).expect("client should build")
}

fn credentials_for(base: &str) -> Credentials {
    Credentials::with_database_url(format!("{base}/"))
}

#[tokio::test]
async fn export_fetch_sends_auth_headers_and_format_query() {
    let state = CaptureState::default();
    let base = spawn_test_server(state.clone()).await;
    let mut credentials = credentials_for(&base);
    credentials.api_key = "key-1".to_string();
    credentials.access_token = "token-1".to_string();

    let source = HttpSchemaSource::new(client(), None);
    let schema = source
        .fetch_remote(&credentials)
        .await
        .expect("export should succeed");

    assert_eq!(schema.get("users").map(String::as_str), Some("@id, name, email"));
    let captured = state.requests_to("/export");
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].query.get("format").map(String::as_str), Some("json"));
    assert_eq!(
        captured[0]
            .headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok()),
        Some("key-1")
    );
    assert_eq!(
        captured[0]
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok()),
        Some("Bearer token-1")
    );
}

#[tokio::test]
async fn custom_export_path_accepts_bare_mapping() {
    let base = spawn_test_server(CaptureState::default()).await;
    let mut credentials = credentials_for(&base);
    credentials.export_path = "custom-export".to_string();

    let schema = HttpSchemaSource::new(client(), None)
        .fetch_remote(&credentials)
        .await
        .expect("export should succeed");

    assert_eq!(
        schema.get("members").map(String::as_str),
        Some("[realmId+email], userId")
    );
}

#[tokio::test]
async fn failed_export_degrades_to_local_bundle() {
    let base = spawn_test_server(CaptureState::default()).await;
    let temp_dir = TempDir::new().expect("failed to create temp directory");
    let bundle = temp_dir.path().join("schema.json");
    std::fs::write(&bundle, r#"{"schema": {"dataItems": "&uuid, userId"}}"#)
        .expect("failed to write bundle");
    let mut credentials = credentials_for(&base);
    credentials.export_path = "/broken".to_string();

    let source = HttpSchemaSource::new(client(), Some(bundle));
    let err = source
        .fetch_remote(&credentials)
        .await
        .expect_err("broken export should fail");
    assert_eq!(err.to_string(), "Dexie Cloud request failed (500): boom");

    let mut cache = SchemaCacheService::new(source);
    let schema = cache.load(Some(&credentials)).await;
    assert!(schema.contains_key("dataItems"));
    assert_eq!(cache.cached_signature(), Some(FALLBACK_SCHEMA_SIGNATURE));
}

#[tokio::test]
async fn request_helper_handles_empty_and_malformed_bodies() {
    let base = spawn_test_server(CaptureState::default()).await;
    let credentials = credentials_for(&base);
    let client = client();

    let empty = client
        .get_json(&credentials, "empty", &[])
        .await
        .expect("204 should succeed");
    assert_eq!(empty, None);

    let head = client
        .request_json(&credentials, Method::HEAD, "/empty", &[], None)
        .await
        .expect("HEAD should succeed");
    assert_eq!(head, None);

    let err = client
        .get_json(&credentials, "/not-json", &[])
        .await
        .expect_err("plain text should fail to parse");
    assert_eq!(err.to_string(), "Failed to parse JSON response: not json");
}

#[tokio::test]
async fn token_request_posts_client_credentials_body() {
    let state = CaptureState::default();
    let base = spawn_test_server(state.clone()).await;
    let mut credentials = credentials_for(&base);
    credentials.client_id = "client".to_string();
    credentials.client_secret = "secret".to_string();
    credentials.audience = "aud".to_string();

    let grant = CloudOptions::from_credentials(&credentials)
        .expect("options should build")
        .fetch_tokens
        .expect("grant should be configured");
    let hints = LoginHints {
        email: Some("me@example.com".to_string()),
        user_id: None,
    };
    let tokens = client()
        .fetch_tokens(&grant, "public-key", &hints)
        .await
        .expect("token request should succeed");

    assert_eq!(tokens.access_token, "access-1");
    assert_eq!(tokens.access_token_expiration, Some(1_700_000_000_000));
    let captured = state.requests_to("/token");
    assert_eq!(
        captured[0].body,
        Some(json!({
            "client_id": "client",
            "client_secret": "secret",
            "public_key": "public-key",
            "hints": {"email": "me@example.com"},
            "grant_type": "client_credentials",
            "audience": "aud",
        }))
    );

    credentials.token_url = "/denied-token".to_string();
    let denied = CloudOptions::from_credentials(&credentials)
        .expect("options should build")
        .fetch_tokens
        .expect("grant should be configured");
    let err = client()
        .fetch_tokens(&denied, "public-key", &hints)
        .await
        .expect_err("denied token request should fail");
    assert_eq!(err.to_string(), "Token request failed (401): denied");
}

#[tokio::test]
async fn session_connects_over_http_and_reports_token_failures() {
    let base = spawn_test_server(CaptureState::default()).await;
    let store = CredentialStore::new(Storage::in_memory());
    let session = ConnectionSession::new(
        HttpCloudBackend::new(client(), "public-key"),
        HttpSchemaSource::new(client(), None),
        store.clone(),
    );

    let mut credentials = credentials_for(&base);
    credentials.client_id = "client".to_string();
    credentials.client_secret = "secret".to_string();
    store.save(&credentials).expect("credentials should save");

    assert_eq!(session.mount().await, ConnectOutcome::Connected);
    let (tables, access_token) = session
        .with_connection(|connection| {
            (
                connection
                    .tables()
                    .into_iter()
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
                connection.tokens().map(|tokens| tokens.access_token.clone()),
            )
        })
        .await
        .expect("connection should be open");
    assert_eq!(tables, vec!["realms".to_string(), "users".to_string()]);
    assert_eq!(access_token.as_deref(), Some("access-1"));

    session
        .login(&LoginHints {
            email: Some("me@example.com".to_string()),
            user_id: None,
        })
        .await
        .expect("login should refresh tokens");

    credentials.token_url = "/denied-token".to_string();
    store.save(&credentials).expect("credentials should save");
    let outcome = session.connect(ReconnectPolicy::IfChanged).await;

    let message = "Token request failed (401): denied".to_string();
    assert_eq!(outcome, ConnectOutcome::Failed(message.clone()));
    assert_eq!(session.status(), SessionStatus::Error { message });
}
