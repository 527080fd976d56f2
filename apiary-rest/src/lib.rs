//! apiary-rest - HTTP gateway for the apiary orchestrator.
//!
//! The only wire/domain conversion layer. Endpoints:
//! - `GET/PUT /swarm` - registry snapshot and replacement
//! - `GET/POST /nodes`, `DELETE /nodes/{id}` - agent CRUD
//! - `POST /nodes/{id}/start|stop`, `GET /nodes/{id}/status` - lifecycle
//! - `GET /nodes/{id}/hierarchy|transcript|inbox|outbox` - introspection
//! - `GET/POST/DELETE /connections`, `POST /connections/bidirectional`
//! - `POST /mail/send`, `GET /human/inbox|outbox`, `GET /mail/counts`
//! - `GET /events` - SSE stream of the event bus
//! - `POST /files`, `GET /files/{id}`, `GET /files/{id}/meta`
//! - `GET/PUT /canvas` - opaque layout passthrough

use std::convert::Infallible;
use std::sync::Arc;

use apiary_core::{
    AttachmentRef, Bee, BeeStatus, HiveError, Mail, MergedConnection, NodeId, QueueSnapshot,
    SwarmConfig,
};
use apiary_hive::{Hive, HierarchyFile};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub hive: Arc<Hive>,
}

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Wrapper turning [`HiveError`] into an HTTP response.
pub struct ApiError(HiveError);

impl From<HiveError> for ApiError {
    fn from(err: HiveError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            HiveError::NoRoute { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            HiveError::UnknownNode(_) | HiveError::NotFound(_) => StatusCode::NOT_FOUND,
            HiveError::Validation(_) => StatusCode::BAD_REQUEST,
            HiveError::AlreadyExists(_) | HiveError::Busy(_) => StatusCode::CONFLICT,
            HiveError::ContainerRuntime(_) => StatusCode::BAD_GATEWAY,
            HiveError::MailCorrupt { .. } | HiveError::Io(_) | HiveError::Cancelled => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: self.0.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/swarm", get(swarm_get).put(swarm_put))
        .route("/nodes", get(node_list).post(node_add))
        .route("/nodes/{id}", delete(node_remove))
        .route("/nodes/{id}/start", post(node_start))
        .route("/nodes/{id}/stop", post(node_stop))
        .route("/nodes/{id}/status", get(node_status))
        .route("/nodes/{id}/hierarchy", get(node_hierarchy))
        .route("/nodes/{id}/transcript", get(node_transcript))
        .route("/nodes/{id}/inbox", get(node_inbox))
        .route("/nodes/{id}/outbox", get(node_outbox))
        .route(
            "/connections",
            get(conn_list).post(conn_add).delete(conn_remove),
        )
        .route("/connections/bidirectional", post(conn_set_bidir))
        .route("/mail/send", post(mail_send))
        .route("/mail/counts", get(mail_counts))
        .route("/human/inbox", get(human_inbox))
        .route("/human/outbox", get(human_outbox))
        .route("/events", get(events_subscribe))
        .route("/files", post(file_upload))
        .route("/files/{id}", get(file_fetch))
        .route("/files/{id}/meta", get(file_meta))
        .route("/canvas", get(canvas_get).put(canvas_put))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

// --- swarm ------------------------------------------------------------------

async fn swarm_get(State(state): State<AppState>) -> Json<SwarmConfig> {
    Json(state.hive.swarm_get().await)
}

async fn swarm_put(
    State(state): State<AppState>,
    Json(config): Json<SwarmConfig>,
) -> Result<StatusCode, ApiError> {
    state.hive.swarm_put(config).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- nodes ------------------------------------------------------------------

async fn node_list(State(state): State<AppState>) -> Result<Json<Vec<BeeStatus>>, ApiError> {
    Ok(Json(state.hive.list_agents().await?))
}

async fn node_add(
    State(state): State<AppState>,
    Json(bee): Json<Bee>,
) -> Result<StatusCode, ApiError> {
    state.hive.add_bee(bee).await?;
    Ok(StatusCode::CREATED)
}

async fn node_remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.hive.remove_node(&NodeId::from(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn node_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BeeStatus>, ApiError> {
    Ok(Json(state.hive.start_agent(&NodeId::from(id)).await?))
}

async fn node_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BeeStatus>, ApiError> {
    Ok(Json(state.hive.stop_agent(&NodeId::from(id)).await?))
}

async fn node_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BeeStatus>, ApiError> {
    Ok(Json(state.hive.agent_status(&NodeId::from(id)).await?))
}

async fn node_hierarchy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HierarchyFile>, ApiError> {
    Ok(Json(state.hive.hierarchy(&NodeId::from(id)).await?))
}

#[derive(Debug, Deserialize)]
struct TranscriptParams {
    #[serde(default = "default_transcript_limit")]
    limit: usize,
}

fn default_transcript_limit() -> usize {
    100
}

async fn node_transcript(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TranscriptParams>,
) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(
        state
            .hive
            .transcript(&NodeId::from(id), params.limit)
            .await?,
    ))
}

async fn node_inbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Mail>>, ApiError> {
    Ok(Json(state.hive.node_inbox(&NodeId::from(id)).await?))
}

async fn node_outbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Mail>>, ApiError> {
    Ok(Json(state.hive.node_outbox(&NodeId::from(id)).await?))
}

// --- connections ------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ConnectionRequest {
    from: NodeId,
    to: NodeId,
    #[serde(default)]
    bidirectional: bool,
}

#[derive(Debug, Deserialize)]
struct SetBidirRequest {
    from: NodeId,
    to: NodeId,
    enabled: bool,
}

async fn conn_list(State(state): State<AppState>) -> Json<Vec<MergedConnection>> {
    Json(state.hive.merged_connections().await)
}

async fn conn_add(
    State(state): State<AppState>,
    Json(req): Json<ConnectionRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .hive
        .connect(req.from, req.to, req.bidirectional)
        .await?;
    Ok(StatusCode::CREATED)
}

async fn conn_remove(
    State(state): State<AppState>,
    Json(req): Json<ConnectionRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .hive
        .disconnect(req.from, req.to, req.bidirectional)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn conn_set_bidir(
    State(state): State<AppState>,
    Json(req): Json<SetBidirRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .hive
        .set_bidirectional(req.from, req.to, req.enabled)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- mail -------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SendMailRequest {
    to: NodeId,
    subject: String,
    body: String,
    #[serde(default)]
    attachments: Option<Vec<AttachmentRef>>,
}

async fn mail_send(
    State(state): State<AppState>,
    Json(req): Json<SendMailRequest>,
) -> Result<Json<Mail>, ApiError> {
    let mail = state
        .hive
        .send_human_mail(req.to, req.subject, req.body, req.attachments)
        .await?;
    Ok(Json(mail))
}

async fn mail_counts(
    State(state): State<AppState>,
) -> Result<Json<std::collections::BTreeMap<NodeId, QueueSnapshot>>, ApiError> {
    Ok(Json(state.hive.counts().await?))
}

async fn human_inbox(State(state): State<AppState>) -> Result<Json<Vec<Mail>>, ApiError> {
    Ok(Json(state.hive.human_inbox().await?))
}

async fn human_outbox(State(state): State<AppState>) -> Result<Json<Vec<Mail>>, ApiError> {
    Ok(Json(state.hive.human_outbox().await?))
}

// --- events -----------------------------------------------------------------

/// SSE fan-out of the event bus. The stream ends when the orchestrator
/// drops this subscriber for falling behind; clients reconnect.
async fn events_subscribe(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut events = state.hive.subscribe();
    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().event(event.topic()).data(data));
        }
    };
    Sse::new(stream)
}

// --- files ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UploadParams {
    filename: String,
    #[serde(default = "default_mime")]
    mime_type: String,
}

fn default_mime() -> String {
    "application/octet-stream".to_string()
}

async fn file_upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<Json<AttachmentRef>, ApiError> {
    let attachment = state
        .hive
        .upload_file(&params.filename, &params.mime_type, &body)
        .await?;
    Ok(Json(attachment))
}

async fn file_fetch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let (meta, bytes) = state.hive.fetch_file(&id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, meta.mime_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", meta.filename),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn file_meta(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<apiary_hive::BlobMeta>, ApiError> {
    Ok(Json(state.hive.file_meta(&id).await?))
}

// --- canvas -----------------------------------------------------------------

async fn canvas_get(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.hive.canvas_get().await?))
}

async fn canvas_put(
    State(state): State<AppState>,
    Json(layout): Json<Value>,
) -> Result<StatusCode, ApiError> {
    state.hive.canvas_put(layout).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                HiveError::NoRoute {
                    from: NodeId::human(),
                    to: NodeId::from("x"),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                HiveError::UnknownNode(NodeId::from("x")),
                StatusCode::NOT_FOUND,
            ),
            (HiveError::Validation("v".into()), StatusCode::BAD_REQUEST),
            (HiveError::Busy("b".into()), StatusCode::CONFLICT),
            (
                HiveError::ContainerRuntime("c".into()),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
