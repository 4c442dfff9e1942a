//! HTTP/WebSocket server.
//!
//! Routes:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/ws` | Chat session (WebSocket upgrade) |
//! | `POST` | `/documents` | Upload a document; ingestion runs in the background |
//! | `GET`  | `/documents` | List the caller's documents |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! HTTP error responses follow the JSON schema
//! `{ "error": { "code": "...", "message": "..." } }`. WebSocket errors are
//! protocol frames with a numeric code (see [`crate::session`]).
//!
//! The WebSocket handshake accepts the connection first so a structured
//! error frame can be delivered before closing with the matching close
//! code. The bearer token travels either in the `token` query parameter or
//! in the `Sec-WebSocket-Protocol` header.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::{HmacTokenValidator, TokenValidator};
use crate::config::Config;
use crate::db;
use crate::generate::{ChatCompletionGenerator, Generator};
use crate::ingest::{self, IngestQueue};
use crate::migrate;
use crate::models::Document;
use crate::retrieval::RetrievalService;
use crate::session::{self, Outbound, ServerMessage, Session};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: sqlx::SqlitePool,
    validator: Arc<dyn TokenValidator>,
    generator: Arc<dyn Generator>,
    retrieval: Arc<RetrievalService>,
    ingest: IngestQueue,
}

/// Starts the server: opens the database, runs migrations, spawns the
/// ingestion worker, and serves until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(&config.db.path).await?;
    migrate::run_migrations(&pool).await?;

    let config = Arc::new(config.clone());
    let validator: Arc<dyn TokenValidator> =
        Arc::new(HmacTokenValidator::new(&config.auth.secret));
    let generator: Arc<dyn Generator> =
        Arc::new(ChatCompletionGenerator::new(config.generation.clone())?);
    let retrieval = Arc::new(RetrievalService::new(
        pool.clone(),
        &config.storage.index_root,
    ));
    let ingest = IngestQueue::start(pool.clone(), (*config).clone());

    let state = AppState {
        config: config.clone(),
        pool,
        validator,
        generator,
        retrieval,
        ingest,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(handle_ws))
        .route("/documents", post(handle_upload).get(handle_list_documents))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!(bind = %config.server.bind, "server listening");

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Resolve the principal from an `Authorization: Bearer` header.
fn bearer_principal(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<crate::models::Principal, AppError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| unauthorized("missing bearer token"))?;

    state
        .validator
        .validate(token)
        .map_err(|e| unauthorized(e.to_string()))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /documents ============

#[derive(Deserialize)]
struct UploadParams {
    /// Original filename; the extension decides the extraction format.
    filename: String,
    title: Option<String>,
}

#[derive(Serialize)]
struct UploadResponse {
    success: bool,
    message: String,
    document: Document,
}

/// Upload boundary: store the raw bytes, create the document row, enqueue
/// ingestion, and acknowledge immediately without waiting for the index.
async fn handle_upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let principal = bearer_principal(&state, &headers)?;

    if body.is_empty() {
        return Err(bad_request("request body must not be empty"));
    }

    let title = params
        .title
        .clone()
        .unwrap_or_else(|| params.filename.clone());

    let document = ingest::create_document(
        &state.pool,
        &state.config.storage.upload_root,
        &principal.user_id,
        &title,
        &params.filename,
        &body,
    )
    .await
    .map_err(|e| internal(e.to_string()))?;

    state
        .ingest
        .enqueue(document.clone())
        .await
        .map_err(|e| internal(e.to_string()))?;

    tracing::info!(user = %principal.user_id, document = %document.id, "upload accepted");

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            success: true,
            message: "Document uploaded. Processing started.".to_string(),
            document,
        }),
    ))
}

// ============ GET /documents ============

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<Document>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DocumentListResponse>, AppError> {
    let principal = bearer_principal(&state, &headers)?;

    let rows = sqlx::query_as::<_, (String, String, String, String, i64)>(
        "SELECT id, user_id, title, file_path, uploaded_at FROM documents \
         WHERE user_id = ? ORDER BY uploaded_at DESC, id",
    )
    .bind(&principal.user_id)
    .fetch_all(&state.pool)
    .await
    .map_err(|e| internal(e.to_string()))?;

    let documents = rows
        .into_iter()
        .map(|(id, user_id, title, file_path, uploaded_at)| Document {
            id,
            user_id,
            title,
            file_path,
            uploaded_at,
        })
        .collect();

    Ok(Json(DocumentListResponse { documents }))
}

// ============ GET /ws ============

#[derive(Deserialize)]
struct WsParams {
    token: Option<String>,
    document_id: Option<String>,
}

async fn handle_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Response {
    let protocol_header = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    ws.on_upgrade(move |socket| run_session(socket, state, params, protocol_header))
}

/// Outbound frames for a live socket. Serialization failures fall back to
/// a bare internal-error frame (code 4006).
struct WsOutbound<'a> {
    socket: &'a mut WebSocket,
}

#[async_trait]
impl Outbound for WsOutbound<'_> {
    async fn send(&mut self, msg: ServerMessage) {
        let frame = serde_json::to_string(&msg).unwrap_or_else(|_| {
            format!(
                r#"{{"type":"error","message":"Internal error","code":{}}}"#,
                session::CODE_INTERNAL
            )
        });
        if let Err(e) = self.socket.send(Message::Text(frame.into())).await {
            tracing::debug!(error = %e, "websocket send failed");
        }
    }
}

/// Send an error frame and close the socket with the rejection's code.
async fn reject(socket: &mut WebSocket, rejection: session::Rejection) {
    {
        let mut out = WsOutbound {
            socket: &mut *socket,
        };
        out.send(ServerMessage::error(
            rejection.message.clone(),
            rejection.code,
        ))
        .await;
    }

    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: rejection.code,
            reason: rejection.message.into(),
        })))
        .await;
}

/// Drive one connection: authenticate, validate scope, then loop over text
/// frames until disconnect. Frames within a session are handled strictly
/// in arrival order.
async fn run_session(
    mut socket: WebSocket,
    state: AppState,
    params: WsParams,
    protocol_header: Option<String>,
) {
    let principal = match session::authenticate(
        state.validator.as_ref(),
        params.token.as_deref(),
        protocol_header.as_deref(),
    ) {
        Ok(principal) => principal,
        Err(rejection) => {
            reject(&mut socket, rejection).await;
            return;
        }
    };

    if let Some(document_id) = &params.document_id {
        if let Err(rejection) =
            session::validate_scope(&state.pool, &principal, document_id).await
        {
            reject(&mut socket, rejection).await;
            return;
        }
    }

    {
        let mut out = WsOutbound {
            socket: &mut socket,
        };
        out.send(ServerMessage::ConnectionEstablished {
            message: "Connected. You can now ask questions about your documents.".to_string(),
        })
        .await;
    }

    tracing::info!(user = %principal.user_id, scope = ?params.document_id, "websocket connected");

    let mut session = Session::new(
        principal,
        params.document_id,
        state.retrieval.clone(),
        state.generator.clone(),
        state.config.retrieval.top_k,
    );

    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                let mut out = WsOutbound {
                    socket: &mut socket,
                };
                session.handle_frame(text.as_str(), &mut out).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {
                // Binary, ping, and pong frames are not part of the protocol.
            }
            Some(Err(e)) => {
                tracing::debug!(error = %e, "websocket receive failed");
                break;
            }
        }
    }

    tracing::info!(user = %session.principal().user_id, "websocket disconnected");
}
