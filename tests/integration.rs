//! Integration tests: HTTP routes and multi-session sync over one log.
//!
//! Run with `cargo test`. The shared-log test needs live backends:
//! - `TEST_DATABASE_URL` (Postgres; the table is created on connect)
//! - `TEST_REDIS_URL` (defaults to redis://127.0.0.1:6379 if unset)

use axum::body::Body;
use axum::http::{Request, StatusCode};
use fugumap::auth::{AnonymousIdentity, IdentityProvider, JwtSecret};
use fugumap::config::SyncSettings;
use fugumap::geo::{self, Bounds};
use fugumap::models::position::Position;
use fugumap::prefs::MemoryPreferences;
use fugumap::repositories::{MemoryLog, MessageLog, SharedLog};
use fugumap::{create_app, AppState, SessionService};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

fn identity() -> Arc<dyn IdentityProvider> {
    Arc::new(AnonymousIdentity::new(
        JwtSecret::new("test-jwt-secret-min-32-chars!!!!!".to_string()).unwrap(),
    ))
}

fn session(log: Arc<dyn MessageLog>) -> SessionService {
    SessionService::new(
        log,
        identity(),
        Arc::new(MemoryPreferences::new()),
        SyncSettings::default(),
    )
}

fn tokyo() -> Position {
    Position::new(35.6809591, 139.7673068).unwrap()
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let res = app.oneshot(req).await.unwrap();
    let status = res.status();
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

fn app() -> axum::Router {
    create_app(AppState::new(
        Arc::new(MemoryLog::new()),
        identity(),
        SyncSettings::default(),
    ))
}

#[tokio::test]
async fn health_returns_ok() {
    let (status, json) = get_json(app(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.get("status").and_then(|v| v.as_str()), Some("ok"));
    assert_eq!(json.get("service").and_then(|v| v.as_str()), Some("fugumap"));
}

#[tokio::test]
async fn cells_lists_the_neighborhood() {
    let (status, json) = get_json(app(), "/api/cells?lat=35.6809591&lng=139.7673068").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["center"], "xn76ur");
    let cells = json["cells"].as_array().unwrap();
    assert_eq!(cells.len(), 9);
    assert_eq!(cells[0]["cell"], "xn76ur");

    let mut seen = std::collections::HashSet::new();
    for entry in cells {
        let cell = entry["cell"].as_str().unwrap();
        assert!(seen.insert(cell.to_string()));
        let b: Bounds = serde_json::from_value(entry["bounds"].clone()).unwrap();
        assert!(b.min_lat < b.max_lat && b.min_lng < b.max_lng);
        assert_eq!(geo::encode(b.center(), 6).as_str(), cell);
    }
    let first: Bounds = serde_json::from_value(cells[0]["bounds"].clone()).unwrap();
    assert!(first.contains(tokyo()));
    assert_eq!(json["share_query"], "lat=35.6809591&lng=139.7673068");
}

#[tokio::test]
async fn cells_rejects_bad_coordinates() {
    let (status, json) = get_json(app(), "/api/cells?lat=91&lng=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("Invalid position"));

    let (status, _) = get_json(app(), "/api/cells?lat=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn nearby_sessions_see_each_other() {
    let log: Arc<dyn MessageLog> = Arc::new(MemoryLog::new());
    let alice = session(log.clone());
    let bob = session(log.clone());

    let a = alice.sign_in("Alice", tokyo()).await.unwrap();
    bob.sign_in("Bob", Position::new(35.6812, 139.7671).unwrap())
        .await
        .unwrap();

    alice.send("hello").await.unwrap();

    assert!(
        eventually(|| async { bob.visible_messages().await.iter().any(|m| m.text == "hello") })
            .await
    );
    assert!(
        eventually(|| async {
            bob.presence()
                .await
                .iter()
                .any(|e| e.user_id == a.user_id && e.position == tokyo())
        })
        .await
    );
    assert!(
        eventually(|| async {
            alice
                .presence()
                .await
                .iter()
                .any(|e| e.user_id == a.user_id && e.position == tokyo())
        })
        .await
    );

    let id = bob.visible_messages().await[0].id.clone();
    bob.mark_read(&id).await.unwrap();
    assert_eq!(bob.unread_count().await, 0);
    assert_eq!(bob.message_log().await.len(), 1);
}

#[tokio::test]
async fn far_sessions_stay_apart() {
    let log: Arc<dyn MessageLog> = Arc::new(MemoryLog::new());
    let alice = session(log.clone());
    let carol = session(log.clone());
    alice.sign_in("Alice", tokyo()).await.unwrap();
    carol
        .sign_in("Carol", Position::new(57.64911, 10.40744).unwrap())
        .await
        .unwrap();

    alice.send("hello").await.unwrap();
    carol.send("hej").await.unwrap();

    assert!(eventually(|| async { alice.visible_messages().await.len() == 1 }).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let texts: Vec<_> = alice
        .visible_messages()
        .await
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(texts, vec!["hello"]);
}

#[tokio::test]
async fn moving_into_range_starts_delivery() {
    let log: Arc<dyn MessageLog> = Arc::new(MemoryLog::new());
    let alice = session(log.clone());
    let bob = session(log.clone());
    alice.sign_in("Alice", tokyo()).await.unwrap();
    bob.sign_in("Bob", Position::new(34.7025, 135.4959).unwrap())
        .await
        .unwrap();

    bob.move_to(tokyo()).await.unwrap();
    alice.send("welcome").await.unwrap();
    assert!(
        eventually(|| async { bob.visible_messages().await.iter().any(|m| m.text == "welcome") })
            .await
    );
}

#[tokio::test]
async fn shared_log_delivers_between_sessions() {
    let database_url = match std::env::var("TEST_DATABASE_URL") {
        Ok(u) => u,
        Err(_) => {
            eprintln!("Skip integration test: set TEST_DATABASE_URL and TEST_REDIS_URL");
            return;
        }
    };
    let redis_url = std::env::var("TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let log: Arc<dyn MessageLog> = match SharedLog::connect(&database_url, &redis_url).await {
        Ok(log) => Arc::new(log),
        Err(e) => {
            eprintln!("Skip integration test: {}", e);
            return;
        }
    };

    let alice = session(log.clone());
    let bob = session(log.clone());
    alice.sign_in("Alice", tokyo()).await.unwrap();
    bob.sign_in("Bob", tokyo()).await.unwrap();

    let receipt = alice.send("over postgres").await.unwrap();
    assert!(
        eventually(|| async { bob.visible_messages().await.iter().any(|m| m.id == receipt.id) })
            .await
    );

    alice.reset().await;
    bob.reset().await;
}
