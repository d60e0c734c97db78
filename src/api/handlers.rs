//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    ConversationWithMessagesResponse, ErrorResponse, FeedbackRequest, InboundResponse,
    ModelsResponse, ParseRequest, RpcAck, SuccessResponse,
};
use super::AppState;
use crate::db::{DbError, Feedback};
use crate::fsm::DefinitionError;
use crate::rpc::{RpcError, WorkerReply};
use crate::runtime::{CheckpointStore, MessageStore, RuntimeError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Inbound platform messages
        .route(
            "/api/:platform/:fsm/conversations/:conversation/messages",
            post(post_message),
        )
        // Outbound stream
        .route("/api/conversations/:conversation/stream", get(stream_conversation))
        .route("/api/conversations/:conversation/messages", get(get_messages))
        // Lifecycle
        .route(
            "/api/conversations/:conversation/disconnect",
            post(disconnect_conversation),
        )
        .route("/api/conversations/:conversation/delete", post(delete_conversation))
        // Feedback
        .route(
            "/api/conversations/:conversation/messages/:message_id/feedback",
            post(post_feedback),
        )
        // Worker replies and requests
        .route("/api/rpc", post(post_rpc_reply))
        .route("/api/data-sources/:data_source_id/parse", post(parse_data_source))
        .route("/api/models", get(list_models))
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Inbound Messages
// ============================================================

async fn post_message(
    State(state): State<AppState>,
    Path((platform, fsm, conversation)): Path<(String, String, String)>,
    Json(payload): Json<Value>,
) -> Result<Json<InboundResponse>, AppError> {
    let outcome = state
        .runtime
        .handle_inbound(&platform, &fsm, &conversation, payload)
        .await?;

    Ok(Json(InboundResponse {
        conversation_id: outcome.conversation_id,
        message_id: outcome.message_id,
        state: outcome.state,
    }))
}

// ============================================================
// Outbound Stream
// ============================================================

async fn stream_conversation(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    // Subscribe first so nothing sent after the snapshot is missed
    let broadcast_rx = state.runtime.subscribe(&conversation).await;

    let init = match conversation_snapshot(&state, &conversation).await {
        Ok(snapshot) => serde_json::to_value(snapshot).unwrap_or(Value::Null),
        Err(AppError::NotFound(_)) => json!({ "conversation": null, "messages": [] }),
        Err(e) => return Err(e),
    };

    Ok(sse_stream(init, broadcast_rx))
}

async fn get_messages(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> Result<Json<ConversationWithMessagesResponse>, AppError> {
    Ok(Json(conversation_snapshot(&state, &conversation).await?))
}

async fn conversation_snapshot(
    state: &AppState,
    platform_conversation_id: &str,
) -> Result<ConversationWithMessagesResponse, AppError> {
    let storage = state.runtime.storage();
    let conv = storage
        .find_conversation(platform_conversation_id)
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| {
            AppError::NotFound(format!("Conversation not found: {platform_conversation_id}"))
        })?;

    let messages = storage
        .get_messages(&conv.id)
        .await
        .map_err(AppError::Internal)?;
    let checkpoint = storage
        .get_checkpoint(&conv.id)
        .await
        .map_err(AppError::Internal)?;

    Ok(ConversationWithMessagesResponse {
        conversation: serde_json::to_value(&conv).unwrap_or(Value::Null),
        messages: messages
            .iter()
            .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
            .collect(),
        state: checkpoint.map(|c| c.state.name),
    })
}

// ============================================================
// Lifecycle
// ============================================================

async fn disconnect_conversation(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> Json<SuccessResponse> {
    let success = state.runtime.disconnect(&conversation).await;
    Json(SuccessResponse { success })
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.runtime.delete_conversation(&conversation).await?;
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Feedback
// ============================================================

async fn post_feedback(
    State(state): State<AppState>,
    Path((conversation, message_id)): Path<(String, String)>,
    Json(req): Json<FeedbackRequest>,
) -> Result<Json<Feedback>, AppError> {
    let db = state.runtime.storage().inner();
    let conv = db
        .find_conversation(&conversation)?
        .ok_or_else(|| AppError::NotFound(format!("Conversation not found: {conversation}")))?;

    let feedback = db.add_feedback(&conv.id, &message_id, req.vote, req.comment.as_deref())?;
    tracing::info!(
        conv_id = %conv.id,
        message_id = %message_id,
        vote = %feedback.vote,
        "Recorded feedback"
    );
    Ok(Json(feedback))
}

// ============================================================
// Worker RPC
// ============================================================

/// Replies from out-of-process workers. A reply for a channel nobody
/// listens on any more is acknowledged with nothing delivered.
async fn post_rpc_reply(
    State(state): State<AppState>,
    Json(reply): Json<WorkerReply>,
) -> Result<Json<RpcAck>, AppError> {
    match state.runtime.bridge().dispatch(reply) {
        Ok(delivered) => Ok(Json(RpcAck { delivered })),
        Err(RpcError::ChannelNotFound(_)) => Ok(Json(RpcAck { delivered: 0 })),
        Err(e) => Err(AppError::BadRequest(e.to_string())),
    }
}

async fn parse_data_source(
    State(state): State<AppState>,
    Path(data_source_id): Path<String>,
    Json(req): Json<ParseRequest>,
) -> Result<Json<SuccessResponse>, AppError> {
    state
        .runtime
        .request_parse(&req.parser, &data_source_id)
        .await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.models.available_models(),
        default: state.runtime.settings().default_model.clone(),
    })
}

async fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ============================================================
// Error Handling
// ============================================================

enum AppError {
    Validation(String),
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl From<RuntimeError> for AppError {
    fn from(err: RuntimeError) -> Self {
        let message = err.to_string();
        match err {
            RuntimeError::Validation(_) => AppError::Validation(message),
            RuntimeError::UnknownPlatform(_)
            | RuntimeError::ConversationNotFound(_)
            | RuntimeError::Definition(DefinitionError::NotFound(_)) => AppError::NotFound(message),
            RuntimeError::Rpc(_) | RuntimeError::SessionClosed => AppError::Unavailable(message),
            RuntimeError::Definition(_) | RuntimeError::Machine(_) => {
                tracing::error!(error = %message, "Conversation cannot proceed");
                AppError::Internal(message)
            }
            RuntimeError::Store(_) => AppError::Internal(message),
        }
    }
}

impl From<DbError> for AppError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::ConversationNotFound(_) | DbError::MessageNotFound(_) => {
                AppError::NotFound(err.to_string())
            }
            DbError::Validation(_) => AppError::Validation(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorResponse::new(msg).with_kind("validation"),
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorResponse::new(msg)),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorResponse::new(msg)),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, ErrorResponse::new(msg)),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::new(msg)),
        };

        (status, Json(body)).into_response()
    }
}
