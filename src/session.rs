//! Per-connection session state machine.
//!
//! States: `Connecting → Authenticated → Ready ⇄ Processing → Closed`.
//! The connect-time steps (credential extraction, validation, scope
//! ownership check) and the message loop are transport-independent; the
//! WebSocket glue lives in [`crate::server`]. Only authentication and
//! scope failures close the connection; per-query failures are reported
//! as structured error frames and the session returns to `Ready`.
//!
//! Wire protocol: JSON text frames. Client frames carry a `type` field
//! (defaulting to `query`); server frames are [`ServerMessage`]. Error
//! frames carry a stable numeric code from the 4000-4009 space.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::auth::TokenValidator;
use crate::generate::Generator;
use crate::models::Principal;
use crate::retrieval::RetrievalService;

pub const CLOSE_CONNECTION_FAILED: u16 = 4000;
pub const CLOSE_AUTH: u16 = 4001;
pub const CLOSE_FORBIDDEN: u16 = 4003;
pub const CODE_UNKNOWN_TYPE: u16 = 4004;
pub const CODE_MALFORMED: u16 = 4005;
pub const CODE_INTERNAL: u16 = 4006;
pub const CODE_EMPTY_QUERY: u16 = 4007;
pub const CODE_RETRIEVAL: u16 = 4008;
pub const CODE_GENERATION: u16 = 4009;

/// Canned reply when retrieval finds nothing relevant.
const NO_CONTEXT_RESPONSE: &str = "I couldn't find relevant information in your documents.";

/// Server-to-client frame.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished { message: String },
    Processing { message: String },
    Response { response: String, complete: bool },
    Error { message: String, code: Option<u16> },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, code: u16) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
        }
    }
}

/// Client-to-server frame after tag dispatch. The `type` field defaults to
/// `query` when absent; anything unrecognized lands in `Unknown` and is
/// answered with code 4004.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Query { query: String },
    Unknown { message_type: String },
}

/// Parse a text frame into a [`ClientMessage`]. Malformed JSON or a
/// non-object payload is a protocol error (code 4005 at the caller).
pub fn parse_client_message(text: &str) -> Result<ClientMessage, String> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| "Invalid JSON format".to_string())?;
    let obj = value
        .as_object()
        .ok_or_else(|| "Expected a JSON object".to_string())?;

    let message_type = obj
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("query");

    match message_type {
        "query" => {
            let query = obj
                .get("query")
                .and_then(|q| q.as_str())
                .unwrap_or("")
                .to_string();
            Ok(ClientMessage::Query { query })
        }
        other => Ok(ClientMessage::Unknown {
            message_type: other.to_string(),
        }),
    }
}

/// Connect-time rejection: an error frame plus a close code.
#[derive(Debug, PartialEq)]
pub struct Rejection {
    pub message: String,
    pub code: u16,
}

/// Extract the bearer credential from the `token` query parameter or,
/// failing that, from the protocol-negotiation header (second token if the
/// header holds two space-separated tokens, else the whole value).
pub fn extract_token(query_token: Option<&str>, protocol_header: Option<&str>) -> Option<String> {
    if let Some(token) = query_token {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    let header = protocol_header?.trim();
    if header.is_empty() {
        return None;
    }
    let parts: Vec<&str> = header.split_whitespace().collect();
    match parts.as_slice() {
        [single] => Some(single.to_string()),
        [_, second, ..] => Some(second.to_string()),
        [] => None,
    }
}

/// Credential step of the handshake. Missing or invalid credentials are a
/// trust boundary violation and close the connection with 4001.
pub fn authenticate(
    validator: &dyn TokenValidator,
    query_token: Option<&str>,
    protocol_header: Option<&str>,
) -> Result<Principal, Rejection> {
    let token = extract_token(query_token, protocol_header).ok_or_else(|| Rejection {
        message: "Authentication required".to_string(),
        code: CLOSE_AUTH,
    })?;

    validator.validate(&token).map_err(|_| Rejection {
        message: "Invalid token".to_string(),
        code: CLOSE_AUTH,
    })
}

/// Scope step of the handshake: the requested document must exist and be
/// owned by the principal, else the connection closes with 4003.
pub async fn validate_scope(
    pool: &SqlitePool,
    principal: &Principal,
    document_id: &str,
) -> Result<(), Rejection> {
    let owned: Option<String> =
        sqlx::query_scalar("SELECT id FROM documents WHERE id = ? AND user_id = ?")
            .bind(document_id)
            .bind(&principal.user_id)
            .fetch_optional(pool)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "scope validation query failed");
                Rejection {
                    message: "Connection failed".to_string(),
                    code: CLOSE_CONNECTION_FAILED,
                }
            })?;

    match owned {
        Some(_) => Ok(()),
        None => Err(Rejection {
            message: "Document not found or access denied".to_string(),
            code: CLOSE_FORBIDDEN,
        }),
    }
}

/// Outbound half of the transport. The session pushes frames through this
/// so the protocol logic stays testable without a live socket.
#[async_trait]
pub trait Outbound: Send {
    async fn send(&mut self, msg: ServerMessage);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Ready,
    Processing,
}

/// Live state for one authenticated connection. Frames are handled one at
/// a time in arrival order, so at most one query is in flight per session.
pub struct Session {
    principal: Principal,
    document_id: Option<String>,
    retrieval: Arc<RetrievalService>,
    generator: Arc<dyn Generator>,
    top_k: usize,
    state: SessionState,
}

impl Session {
    pub fn new(
        principal: Principal,
        document_id: Option<String>,
        retrieval: Arc<RetrievalService>,
        generator: Arc<dyn Generator>,
        top_k: usize,
    ) -> Self {
        Self {
            principal,
            document_id,
            retrieval,
            generator,
            top_k,
            state: SessionState::Ready,
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Handle one inbound text frame. Every outcome leaves the session in
    /// `Ready`; none of the per-message error codes terminate the
    /// connection.
    pub async fn handle_frame(&mut self, text: &str, out: &mut dyn Outbound) {
        debug_assert_eq!(self.state, SessionState::Ready);

        let message = match parse_client_message(text) {
            Ok(m) => m,
            Err(reason) => {
                out.send(ServerMessage::error(reason, CODE_MALFORMED)).await;
                return;
            }
        };

        match message {
            ClientMessage::Query { query } => self.handle_query(&query, out).await,
            ClientMessage::Unknown { message_type } => {
                out.send(ServerMessage::error(
                    format!("Unknown message type: {}", message_type),
                    CODE_UNKNOWN_TYPE,
                ))
                .await;
            }
        }

        self.state = SessionState::Ready;
    }

    async fn handle_query(&mut self, query: &str, out: &mut dyn Outbound) {
        let query = query.trim();
        if query.is_empty() {
            out.send(ServerMessage::error(
                "Query cannot be empty",
                CODE_EMPTY_QUERY,
            ))
            .await;
            return;
        }

        self.state = SessionState::Processing;

        // Immediate feedback before the potentially slow retrieval and
        // generation work.
        out.send(ServerMessage::Processing {
            message: "Searching documents...".to_string(),
        })
        .await;

        let hits = match self
            .retrieval
            .search(
                &self.principal,
                self.document_id.as_deref(),
                query,
                self.top_k,
            )
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(
                    user = %self.principal.user_id,
                    scope = ?self.document_id,
                    error = %e,
                    "retrieval failed"
                );
                out.send(ServerMessage::error(
                    format!("Failed to process query: {}", e),
                    CODE_RETRIEVAL,
                ))
                .await;
                return;
            }
        };

        if hits.is_empty() {
            out.send(ServerMessage::Response {
                response: NO_CONTEXT_RESPONSE.to_string(),
                complete: true,
            })
            .await;
            return;
        }

        match self.generator.generate(query, &hits).await {
            Ok(answer) => {
                out.send(ServerMessage::Response {
                    response: answer,
                    complete: true,
                })
                .await;
            }
            Err(e) => {
                tracing::warn!(
                    user = %self.principal.user_id,
                    error = %e,
                    "generation failed"
                );
                out.send(ServerMessage::error(
                    format!("Failed to generate response: {}", e),
                    CODE_GENERATION,
                ))
                .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults_to_query() {
        let msg = parse_client_message(r#"{"query": "hello"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Query {
                query: "hello".to_string()
            }
        );
    }

    #[test]
    fn test_parse_explicit_type() {
        let msg = parse_client_message(r#"{"type": "query", "query": "hi"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Query { .. }));
    }

    #[test]
    fn test_parse_unknown_type() {
        let msg = parse_client_message(r#"{"type": "subscribe"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Unknown {
                message_type: "subscribe".to_string()
            }
        );
    }

    #[test]
    fn test_parse_malformed() {
        assert!(parse_client_message("not json").is_err());
        assert!(parse_client_message("[1, 2, 3]").is_err());
    }

    #[test]
    fn test_extract_token_query_param_wins() {
        let token = extract_token(Some("abc"), Some("chat xyz"));
        assert_eq!(token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_extract_token_protocol_header_second_token() {
        assert_eq!(
            extract_token(None, Some("chat my-token")).as_deref(),
            Some("my-token")
        );
    }

    #[test]
    fn test_extract_token_protocol_header_whole_value() {
        assert_eq!(
            extract_token(None, Some("just-a-token")).as_deref(),
            Some("just-a-token")
        );
    }

    #[test]
    fn test_extract_token_missing() {
        assert_eq!(extract_token(None, None), None);
        assert_eq!(extract_token(Some(""), Some("  ")), None);
    }

    #[test]
    fn test_error_frame_serializes_with_null_code() {
        let msg = ServerMessage::Error {
            message: "boom".to_string(),
            code: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], serde_json::Value::Null);
    }

    #[test]
    fn test_response_frame_shape() {
        let msg = ServerMessage::Response {
            response: "answer".to_string(),
            complete: true,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["complete"], true);
    }
}
