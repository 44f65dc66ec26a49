use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::error::{GraylogMcpError, Result};
use crate::mcp::handle_frame;
use crate::tools::ToolRegistry;

type Sessions = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Event>>>>;

#[derive(Clone)]
pub struct AppState {
    pub tools: Arc<ToolRegistry>,
    sessions: Sessions,
    next_session: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self {
            tools,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_session: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Event stream of one SSE session. Dropping it, which happens when the
/// client disconnects, unregisters the session.
struct SessionStream {
    inner: UnboundedReceiverStream<Event>,
    session_id: String,
    sessions: Sessions,
}

impl Stream for SessionStream {
    type Item = std::result::Result<Event, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|ev| ev.map(Ok))
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let sessions = self.sessions.clone();
        let session_id = std::mem::take(&mut self.session_id);
        handle.spawn(async move {
            sessions.write().await.remove(&session_id);
            debug!(session_id = %session_id, "sse session closed");
        });
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

/// Stateless JSON-RPC: one request in, one response out. Notifications
/// are acknowledged with `202 Accepted` and no body.
async fn mcp_handler(State(state): State<AppState>, body: String) -> Response {
    match handle_frame(&state.tools, &body).await {
        Some(resp) => (StatusCode::OK, Json(resp)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let session_id = format!(
        "{:x}-{:x}",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
        state.next_session.fetch_add(1, Ordering::Relaxed)
    );

    // Relative URI; clients resolve it against the SSE endpoint.
    let endpoint_url = format!("/message?session_id={session_id}");
    let _ = tx.send(Event::default().event("endpoint").data(endpoint_url));

    state.sessions.write().await.insert(session_id.clone(), tx);
    debug!(session_id = %session_id, "sse session opened");

    let stream = SessionStream {
        inner: UnboundedReceiverStream::new(rx),
        session_id,
        sessions: state.sessions.clone(),
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct MessageQuery {
    session_id: String,
}

/// Accepts a frame for an SSE session; the response is delivered on the
/// session's event stream.
async fn message_handler(
    State(state): State<AppState>,
    query: std::result::Result<Query<MessageQuery>, QueryRejection>,
    body: String,
) -> Response {
    let session_id = match query {
        Ok(Query(q)) => q.session_id,
        Err(e) => {
            return ErrorResponse {
                error: format!("invalid query: {e}"),
            }
            .into_response()
        }
    };

    let sender = state.sessions.read().await.get(&session_id).cloned();
    let Some(sender) = sender else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("unknown session: {session_id}"),
            }),
        )
            .into_response();
    };

    let tools = state.tools.clone();
    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        let Some(resp) = handle_frame(&tools, &body).await else {
            return;
        };
        let frame = match serde_json::to_string(&resp) {
            Ok(f) => f,
            Err(e) => {
                warn!("failed to encode response: {e}");
                return;
            }
        };
        if sender.send(Event::default().event("message").data(frame)).is_err() {
            debug!(session_id = %session_id, "sse session closed");
            sessions.write().await.remove(&session_id);
        }
    });
    StatusCode::ACCEPTED.into_response()
}

pub fn build_router(tools: Arc<ToolRegistry>) -> Router {
    router(AppState::new(tools))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

pub async fn serve_http(bind: &str, tools: Arc<ToolRegistry>) -> Result<()> {
    let router = build_router(tools);
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| GraylogMcpError::Config(format!("bind {bind} failed: {e}")))?;
    info!("HTTP server listening on http://{bind}");
    warn!("HTTP transport has no TLS or authentication; front it with a TLS-terminating proxy");
    axum::serve(listener, router).await.map_err(Into::into)
}
