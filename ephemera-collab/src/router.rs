//! Public HTTP surface.
//!
//! ```text
//! POST /api/docs        create a document        201 {id, url, expiresAt}
//! GET  /d/{id}/meta     document metadata        200 {expiresAt, ttl, createdAt}
//! GET  /d/{id}/raw      markdown download        200 text/markdown
//! GET  /d/{id}/ws       editor channel           101 upgrade
//! ```
//!
//! Identifiers that are not well-formed never reach a document actor.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::actor::InboundFrame;
use crate::channels::{ChannelAttachment, ConnectionId, Outbound};
use crate::document::Ttl;
use crate::error::DocumentError;
use crate::host::{DocumentHandle, DocumentHost};
use crate::id::DocumentId;
use crate::rate_limit::{client_address, RateLimiter};

/// Shared state of every route.
#[derive(Clone)]
pub struct AppState {
    pub host: DocumentHost,
    pub limiter: Arc<RateLimiter>,
    /// Origin used to build document URLs; the request `Host` when unset
    pub public_origin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    #[serde(default)]
    ttl: serde_json::Value,
}

/// Build the router with permissive CORS.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/docs", post(create_document))
        .route("/d/{id}/meta", get(document_meta))
        .route("/d/{id}/raw", get(document_raw))
        .route("/d/{id}/ws", get(open_channel))
        .fallback(not_found)
        .layer(cors)
        .with_state(state)
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

async fn create_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let decision = state.limiter.check(&client_address(&headers));
    if !decision.allowed {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            decision.headers(),
            Json(serde_json::json!({ "error": "Rate limit exceeded" })),
        )
            .into_response();
    }

    let request: CreateRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "Invalid JSON"),
    };
    let Some(ttl) = request.ttl.as_str().and_then(|s| s.parse::<Ttl>().ok()) else {
        return json_error(StatusCode::BAD_REQUEST, "Invalid TTL. Use 24h, 7d, or 30d");
    };

    let id = DocumentId::generate();
    let created = match state.host.document(&id).create(ttl.as_str()).await {
        Ok(created) => created,
        Err(e) => {
            log::error!("Failed to create document {id}: {e}");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create document");
        }
    };

    let origin = match &state.public_origin {
        Some(origin) => origin.trim_end_matches('/').to_string(),
        None => {
            let host = headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("localhost");
            format!("http://{host}")
        }
    };

    (
        StatusCode::CREATED,
        decision.headers(),
        Json(serde_json::json!({
            "id": id.as_str(),
            "url": format!("{origin}/d/{id}"),
            "expiresAt": created.expires_at,
        })),
    )
        .into_response()
}

async fn document_meta(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(id) = DocumentId::parse(&id) else {
        return json_error(StatusCode::NOT_FOUND, "Not found");
    };
    match state.host.document(&id).meta().await {
        Ok(meta) => Json(meta).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn document_raw(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(id) = DocumentId::parse(&id) else {
        return not_found().await;
    };
    match state.host.document(&id).raw().await {
        Ok(content) => (
            [
                (header::CONTENT_TYPE, "text/markdown; charset=utf-8"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"document.md\"",
                ),
            ],
            content,
        )
            .into_response(),
        Err(DocumentError::NotFound) => not_found().await,
        Err(e) => e.into_response(),
    }
}

async fn open_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(id) = DocumentId::parse(&id) else {
        return not_found().await;
    };
    let Ok(upgrade) = upgrade else {
        return (StatusCode::UPGRADE_REQUIRED, "Expected WebSocket").into_response();
    };

    let doc = state.host.document(&id);
    let attachment = match doc.connect().await {
        Ok(attachment) => attachment,
        Err(DocumentError::NotFound) => {
            return (StatusCode::NOT_FOUND, "Document not found").into_response()
        }
        Err(DocumentError::Capacity { .. }) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response()
        }
        Err(e) => return e.into_response(),
    };

    let conn = attachment.id;
    // Dropped with the upgrade callback if the socket never materializes
    let pending = PendingChannel::new(doc.clone(), conn);
    upgrade
        .on_failed_upgrade(move |e: axum::Error| {
            log::warn!("WebSocket upgrade for channel {conn} failed: {e}");
        })
        .on_upgrade(move |socket| {
            pending.claim();
            pump_channel(socket, doc, attachment)
        })
}

/// A channel admitted before its upgrade completed.
///
/// Detaches the channel on drop unless claimed by the pump, so a client that
/// vanishes mid-handshake does not hold a connection slot forever.
struct PendingChannel {
    doc: DocumentHandle,
    conn: ConnectionId,
    claimed: bool,
}

impl PendingChannel {
    fn new(doc: DocumentHandle, conn: ConnectionId) -> Self {
        Self {
            doc,
            conn,
            claimed: false,
        }
    }

    /// The pump owns the channel from here on.
    fn claim(mut self) {
        self.claimed = true;
    }
}

impl Drop for PendingChannel {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let doc = self.doc.clone();
        let conn = self.conn;
        log::debug!("Channel {conn} never upgraded, detaching");
        runtime.spawn(async move { doc.detach(conn, true).await });
    }
}

/// Shuttle frames between one socket and its document until either side closes.
async fn pump_channel(socket: WebSocket, doc: DocumentHandle, attachment: ChannelAttachment) {
    let ChannelAttachment {
        id, mut outbound, ..
    } = attachment;
    let (mut sink, mut stream) = socket.split();
    let mut errored = false;

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let message = match queued {
                    Some(Outbound::Binary(frame)) => Message::Binary(Bytes::copy_from_slice(&frame)),
                    Some(Outbound::Text(text)) => Message::Text(text.into()),
                    Some(Outbound::Close { code, reason }) => {
                        let frame = CloseFrame { code, reason: reason.into() };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        break;
                    }
                    // Detached elsewhere
                    None => break,
                };
                if let Err(e) = sink.send(message).await {
                    log::debug!("Send to channel {id} failed: {e}");
                    errored = true;
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(bytes))) => {
                    doc.send_frame(id, InboundFrame::Binary(bytes.to_vec())).await;
                }
                Some(Ok(Message::Text(text))) => {
                    doc.send_frame(id, InboundFrame::Text(text.as_str().to_string())).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("Channel {id} errored: {e}");
                    errored = true;
                    break;
                }
            },
        }
    }

    doc.detach(id, errored).await;
}
