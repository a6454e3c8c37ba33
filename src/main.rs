//! # chat-history-rs
//!
//! Chat history backend for the analytics console.
//!
//! Fetches the raw "all user history" payload from the analytics API,
//! normalizes it into the chat sidebar's view model and serves it:
//! - REST endpoints for sessions, folders and bookmarks
//! - SSE stream announcing every history refresh
//! - Static per-section navigation config
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │  Console UI │────▶│  Axum HTTP   │────▶│  Analytics API   │
//! │  (sidebar)  │     │  Server      │     │  (history JSON)  │
//! └─────────────┘     └──────────────┘     └──────────────────┘
//!       ▲ SSE               │ normalize
//!       │                   ▼
//! ┌─────────────┐     ┌──────────────┐
//! │ StoreEvent  │◀────│ HistoryStore │
//! └─────────────┘     └──────────────┘
//! ```
//!
//! ## API Endpoints
//!
//! - `GET /health` - Server health check
//! - `GET /api/stream` - SSE event stream
//! - `GET /api/history` - Full normalized history
//! - `GET /api/history/sessions` - Sessions (`?folder=` / `?bookmarked=true`)
//! - `GET /api/history/sessions/{id}` - One session
//! - `GET /api/history/folders` - Aitable folders
//! - `GET /api/history/bookmarks` - Bookmark groups
//! - `POST /api/history/refresh` - Refetch and replace the history
//! - `POST /api/history/normalize` - Normalize a posted payload
//! - `GET /api/nav/{route}` - Secondary navigation for a section
//!
//! ## CLI
//!
//! `chat-history-rs normalize <payload.json>` prints the normalized history
//! and exits.

mod client;
mod config;
mod history;
mod nav;
mod normalizer;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{sse::{Event, KeepAlive, Sse}, Json},
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{atomic::{AtomicU64, Ordering}, Arc},
    time::{Duration, Instant},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::client::HistoryClient;
use crate::config::Config;
use crate::history::{ChatFolder, ChatHistory, ChatSession, HistoryStore, StoreEvent};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ============================================================================
// SSE Event Types
// ============================================================================

/// Connection-level events sent alongside store events
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
enum SseEvent {
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: i64 },
    #[serde(rename = "status")]
    Status { status: String, details: Option<String> },
}

// ============================================================================
// Application State
// ============================================================================

struct AppState {
    start_time: Instant,
    config: Config,
    client: HistoryClient,
    store: Arc<HistoryStore>,
    seq: AtomicU64, // Monotonic SSE event id
}

impl AppState {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }
}

/// Outcome of a successful refresh
#[derive(Debug, Clone, Copy)]
struct RefreshSummary {
    revision: u64,
    sessions: usize,
    folders: usize,
    bookmarks: usize,
}

/// Fetch, normalize and replace the stored history.
async fn refresh(state: &AppState) -> Result<RefreshSummary, BoxError> {
    let payload = match state.client.fetch_all(state.config.user_id.as_deref()).await {
        Ok(payload) => payload,
        Err(e) => {
            state.store.record_failure(e.to_string());
            return Err(e);
        }
    };

    let history = normalizer::normalize_now(&payload);
    if history.is_empty() {
        tracing::warn!("History payload normalized to an empty history");
    }
    let (sessions, folders, bookmarks) =
        (history.chat_sessions.len(), history.folders.len(), history.bookmarks.len());
    let revision = state.store.replace(history).await;
    tracing::info!(
        "History refreshed (rev {}): {} sessions, {} folders, {} bookmarks",
        revision, sessions, folders, bookmarks
    );
    Ok(RefreshSummary { revision, sessions, folders, bookmarks })
}

// ============================================================================
// Health Endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    version: &'static str,
    revision: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        revision: state.store.revision(),
    })
}

// ============================================================================
// SSE Stream Endpoint
// ============================================================================

fn store_event_name(event: &StoreEvent) -> &'static str {
    match event {
        StoreEvent::Replaced { .. } => "history_replaced",
        StoreEvent::RefreshFailed { .. } => "refresh_failed",
    }
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.store.subscribe();

    let heartbeat_state = state.clone();
    let heartbeat = stream::unfold((), move |()| {
        let s = heartbeat_state.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            let event = SseEvent::Heartbeat {
                timestamp: chrono::Utc::now().timestamp(),
            };
            let data = serde_json::to_string(&event).unwrap_or_default();
            Some((
                Ok(Event::default()
                    .event("heartbeat")
                    .id(s.next_seq().to_string())
                    .data(data)),
                (),
            ))
        }
    });

    let store_state = state.clone();
    let store_stream = stream::unfold(rx, move |mut rx| {
        let s = store_state.clone();
        async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let data = serde_json::to_string(&event).unwrap_or_default();
                        return Some((
                            Ok(Event::default()
                                .event(store_event_name(&event))
                                .id(s.next_seq().to_string())
                                .data(data)),
                            rx,
                        ));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("SSE client lagged, skipped {} store events", n);
                    }
                    Err(_) => return None,
                }
            }
        }
    });

    let init_seq = state.next_seq();
    let revision = state.store.revision();
    let init_event = stream::once(async move {
        let event = SseEvent::Status {
            status: "connected".to_string(),
            details: Some(format!("revision: {}", revision)),
        };
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default()
            .event("status")
            .id(init_seq.to_string())
            .data(data))
    });

    let merged = futures::StreamExt::chain(
        init_event,
        tokio_stream::StreamExt::merge(heartbeat, store_stream),
    );

    Sse::new(merged).keep_alive(KeepAlive::default())
}

// ============================================================================
// History Endpoints
// ============================================================================

async fn get_history(State(state): State<Arc<AppState>>) -> Json<ChatHistory> {
    Json(state.store.snapshot().await.as_ref().clone())
}

#[derive(Deserialize, Default)]
struct SessionsQuery {
    #[serde(default)]
    folder: Option<String>,
    #[serde(default)]
    bookmarked: Option<bool>,
}

#[derive(Serialize)]
struct SessionsResponse {
    sessions: Vec<ChatSession>,
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionsQuery>,
) -> Json<SessionsResponse> {
    let only_bookmarked = query.bookmarked == Some(true);
    let mut sessions = match query.folder {
        Some(ref folder) => state.store.sessions_in_folder(folder).await,
        None if only_bookmarked => state.store.bookmarked_sessions().await,
        None => state.store.snapshot().await.chat_sessions.clone(),
    };
    if only_bookmarked {
        sessions.retain(|s| s.bookmarked);
    }
    Json(SessionsResponse { sessions })
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<ChatSession>, StatusCode> {
    state
        .store
        .get_session(&session_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Serialize)]
struct FoldersResponse {
    folders: Vec<ChatFolder>,
}

async fn list_folders(State(state): State<Arc<AppState>>) -> Json<FoldersResponse> {
    Json(FoldersResponse {
        folders: state.store.snapshot().await.folders.clone(),
    })
}

#[derive(Serialize)]
struct BookmarksResponse {
    bookmarks: Vec<ChatFolder>,
}

async fn list_bookmarks(State(state): State<Arc<AppState>>) -> Json<BookmarksResponse> {
    Json(BookmarksResponse {
        bookmarks: state.store.snapshot().await.bookmarks.clone(),
    })
}

#[derive(Serialize)]
struct RefreshResponse {
    ok: bool,
    revision: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    sessions: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    folders: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bookmarks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn refresh_history(State(state): State<Arc<AppState>>) -> (StatusCode, Json<RefreshResponse>) {
    match refresh(&state).await {
        Ok(summary) => (
            StatusCode::OK,
            Json(RefreshResponse {
                ok: true,
                revision: summary.revision,
                sessions: Some(summary.sessions),
                folders: Some(summary.folders),
                bookmarks: Some(summary.bookmarks),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!("History refresh failed: {}", e);
            (
                StatusCode::BAD_GATEWAY,
                Json(RefreshResponse {
                    ok: false,
                    revision: state.store.revision(),
                    sessions: None,
                    folders: None,
                    bookmarks: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

/// Normalize a posted payload without touching the store
async fn normalize_payload(Json(payload): Json<serde_json::Value>) -> Json<ChatHistory> {
    Json(normalizer::normalize_now(&payload))
}

// ============================================================================
// Navigation Endpoints
// ============================================================================

#[derive(Serialize)]
struct NavRoutesResponse {
    routes: Vec<&'static str>,
}

async fn list_nav_routes() -> Json<NavRoutesResponse> {
    Json(NavRoutesResponse {
        routes: nav::routes().collect(),
    })
}

async fn get_nav(Path(route): Path<String>) -> Result<Json<&'static nav::NavConfig>, StatusCode> {
    nav::lookup(&route).map(Json).ok_or(StatusCode::NOT_FOUND)
}

// ============================================================================
// Server
// ============================================================================

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health
        .route("/health", get(health))
        // SSE
        .route("/api/stream", get(stream_events))
        // History
        .route("/api/history", get(get_history))
        .route("/api/history/sessions", get(list_sessions))
        .route("/api/history/sessions/{session_id}", get(get_session))
        .route("/api/history/folders", get(list_folders))
        .route("/api/history/bookmarks", get(list_bookmarks))
        .route("/api/history/refresh", post(refresh_history))
        .route("/api/history/normalize", post(normalize_payload))
        // Navigation
        .route("/api/nav", get(list_nav_routes))
        .route("/api/nav/{route}", get(get_nav))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `normalize <file>`: print the normalized history for a saved payload
fn run_normalize_command(path: &str) -> Result<(), BoxError> {
    let content = std::fs::read_to_string(path)?;
    let payload: serde_json::Value = serde_json::from_str(&content)?;
    let history = normalizer::normalize_now(&payload);
    println!("{}", serde_json::to_string_pretty(&history)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("chat_history_rs=info".parse()?)
            .add_directive("tower_http=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("normalize") => {
            let path = args.get(1).ok_or("usage: chat-history-rs normalize <payload.json>")?;
            return run_normalize_command(path);
        }
        Some(other) => return Err(format!("unknown command: {}", other).into()),
        None => {}
    }

    let config = Config::from_env();
    let client = HistoryClient::new(&config)?;
    let store = HistoryStore::new();

    if config.user_id.is_none() {
        tracing::warn!("HISTORY_USER_ID not set, fetching history without a user filter");
    }

    let state = Arc::new(AppState {
        start_time: Instant::now(),
        config: config.clone(),
        client,
        store,
        seq: AtomicU64::new(1),
    });

    // Initial load
    let initial_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = refresh(&initial_state).await {
            tracing::error!("Initial history load failed: {}", e);
        }
    });

    // Periodic refresh (if configured)
    if let Some(interval) = config.refresh_interval {
        let refresh_state = state.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = refresh(&refresh_state).await {
                    tracing::warn!("Periodic history refresh failed: {}", e);
                }
            }
        });
        tracing::info!("Periodic refresh every {}s", interval.as_secs());
    }

    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("chat-history-rs v{} listening on {}", env!("CARGO_PKG_VERSION"), addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
