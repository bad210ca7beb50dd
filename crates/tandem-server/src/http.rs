//! HTTP surface: REST handlers for the lifecycle and store operations.
//!
//! Every `/api` route expects a bearer credential in the `Authorization`
//! header; the verified principal is the actor for the operation. Engine
//! errors map onto status codes and a stable JSON shape, and never tear
//! down the server.

use crate::metrics;
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tandem_engine::{
    CredentialVerifier, CreditLedger, EngineError, MessageKind, NewSwap, PrincipalId,
};
use tokio::net::TcpListener;
use tracing::{error, info};

/// JSON error response derived from an engine error.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
            metrics::record_error("internal");
        }
        let body = json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Resolve the bearer credential on a request to a principal.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> ApiResult<PrincipalId> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    let principal = state.verifier.verify(token).await?;
    Ok(principal)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.bind_addr();

    let app = Router::new()
        .route("/ws", get(crate::ws::ws_handler))
        .route("/health", get(health_handler))
        .route("/api/presence", get(presence_snapshot))
        .route("/api/balance", get(balance))
        .route("/api/swaps", post(create_swap).get(list_swaps))
        .route("/api/swaps/:id", get(get_swap))
        .route("/api/swaps/:id/accept", post(accept_swap))
        .route("/api/swaps/:id/reject", post(reject_swap))
        .route("/api/swaps/:id/start", post(start_swap))
        .route("/api/swaps/:id/complete", post(complete_swap))
        .route("/api/swaps/:id/cancel", post(cancel_swap))
        .route("/api/swaps/:id/review", post(review_swap))
        .route(
            "/api/conversations",
            post(open_conversation).get(list_conversations),
        )
        .route("/api/conversations/:id", get(get_conversation))
        .route(
            "/api/conversations/:id/messages",
            post(send_message).get(message_history),
        )
        .route("/api/conversations/:id/read", post(mark_conversation_read))
        .route("/api/messages/:id", patch(edit_message).delete(delete_message))
        .route("/api/workshops/:id/enroll", post(enroll_workshop))
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/unread", get(unread_notifications))
        .route("/api/notifications/:id/read", post(mark_notification_read))
        .route("/api/notifications/read-all", post(mark_all_notifications_read))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;

    info!("Tandem server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn presence_snapshot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    authenticate(&state, &headers).await?;
    Ok(Json(json!({
        "online": state.registry.online_principals(),
        "connections": state.registry.connection_total(),
    })))
}

async fn balance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let balance = state.ledger.balance(&principal).await?;
    Ok(Json(json!({ "balance": balance })))
}

// ---- Swaps ----

async fn create_swap(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<NewSwap>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let swap = state.swaps.create(&principal, body).await?;
    metrics::record_swap_transition("pending");
    Ok((StatusCode::CREATED, Json(swap)))
}

async fn list_swaps(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let swaps = state.swaps.list(&principal).await?;
    Ok(Json(swaps))
}

async fn get_swap(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let swap = state.swaps.get(&principal, id).await?;
    Ok(Json(swap))
}

#[derive(Debug, Deserialize, Default)]
struct AcceptBody {
    #[serde(default)]
    confirmed_schedule: Option<String>,
}

async fn accept_swap(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    body: Option<Json<AcceptBody>>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let swap = state
        .swaps
        .accept(&principal, id, body.confirmed_schedule)
        .await?;
    metrics::record_swap_transition("accepted");
    Ok(Json(swap))
}

#[derive(Debug, Deserialize, Default)]
struct ReasonBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn reject_swap(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    body: Option<Json<ReasonBody>>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let swap = state.swaps.reject(&principal, id, body.reason).await?;
    metrics::record_swap_transition("rejected");
    Ok(Json(swap))
}

async fn start_swap(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let swap = state.swaps.start(&principal, id).await?;
    metrics::record_swap_transition("in_progress");
    Ok(Json(swap))
}

#[derive(Debug, Deserialize, Default)]
struct CompleteBody {
    #[serde(default)]
    session_notes: Option<String>,
}

async fn complete_swap(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    body: Option<Json<CompleteBody>>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let swap = state
        .swaps
        .complete(&principal, id, body.session_notes)
        .await?;
    metrics::record_swap_transition("completed");
    Ok(Json(swap))
}

async fn cancel_swap(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    body: Option<Json<ReasonBody>>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let swap = state.swaps.cancel(&principal, id, body.reason).await?;
    metrics::record_swap_transition("cancelled");
    Ok(Json(swap))
}

#[derive(Debug, Deserialize)]
struct ReviewBody {
    review_id: u64,
}

async fn review_swap(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<ReviewBody>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let swap = state.swaps.review(&principal, id, body.review_id).await?;
    Ok(Json(swap))
}

// ---- Conversations and messages ----

#[derive(Debug, Deserialize)]
struct OpenConversationBody {
    participant: String,
    #[serde(default)]
    swap_id: Option<u64>,
}

async fn open_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<OpenConversationBody>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let conversation = state
        .chat
        .get_or_create(&principal, &body.participant, body.swap_id)
        .await?;
    Ok(Json(conversation))
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let conversations = state.chat.conversations(&principal).await?;
    Ok(Json(conversations))
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let conversation = state.chat.conversation(&principal, id).await?;
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
struct SendMessageBody {
    content: String,
    #[serde(default)]
    kind: Option<MessageKind>,
    #[serde(default)]
    attachment: Option<String>,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let message = state
        .chat
        .send(
            &principal,
            id,
            body.content,
            body.kind.unwrap_or(MessageKind::Text),
            body.attachment,
        )
        .await?;
    metrics::record_message_sent();
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    before_ts: Option<u64>,
    #[serde(default)]
    before_id: Option<u64>,
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    50
}

async fn message_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let cursor = match (query.before_ts, query.before_id) {
        (Some(ts), Some(id)) => Some((ts, id)),
        _ => None,
    };
    let messages = state
        .chat
        .history(&principal, id, cursor, query.limit)
        .await?;
    Ok(Json(messages))
}

async fn mark_conversation_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let newly_read = state.chat.mark_read(&principal, id).await?;
    Ok(Json(json!({ "newly_read": newly_read })))
}

#[derive(Debug, Deserialize)]
struct EditMessageBody {
    content: String,
}

async fn edit_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<EditMessageBody>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let message = state.chat.edit(&principal, id, body.content).await?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let message = state.chat.delete(&principal, id).await?;
    Ok(Json(message))
}

// ---- Workshops ----

#[derive(Debug, Deserialize)]
struct EnrollBody {
    host: String,
}

/// Record a workshop enrollment in the live layer: announce the attendee to
/// the workshop room and hand the host's notification to the dispatcher.
/// Enrollment bookkeeping itself lives in the marketplace backend.
async fn enroll_workshop(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<EnrollBody>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;

    state.router.publish_to(
        &tandem_core::workshop_channel(id),
        tandem_core::event_names::PARTICIPANT_JOINED,
        json!({ "workshopId": id, "participant": principal }),
    );
    state.events.emit(tandem_engine::DomainEvent::WorkshopEnrollment {
        workshop_id: id,
        host: body.host,
        attendee: principal,
    });

    Ok(StatusCode::ACCEPTED)
}

// ---- Notifications ----

#[derive(Debug, Deserialize, Default)]
struct NotificationQuery {
    #[serde(default)]
    unread: bool,
}

async fn list_notifications(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<NotificationQuery>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let notifications = state
        .dispatcher
        .store()
        .list_for(&principal, query.unread)
        .await?;
    Ok(Json(notifications))
}

async fn unread_notifications(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let count = state.dispatcher.store().unread_count(&principal).await?;
    Ok(Json(json!({ "unread": count })))
}

async fn mark_notification_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let changed = state.dispatcher.store().mark_read(&principal, id).await?;
    Ok(Json(json!({ "changed": changed })))
}

async fn mark_all_notifications_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let principal = authenticate(&state, &headers).await?;
    let changed = state.dispatcher.store().mark_all_read(&principal).await?;
    Ok(Json(json!({ "changed": changed })))
}
