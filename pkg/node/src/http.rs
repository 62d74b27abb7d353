//! Per-node HTTP API: write entry point, status/log endpoints, the
//! multicast receiver, reset, and the liveness probe.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::context::NodeContext;
use crate::errors::Error;
use crate::multicast;
use crate::protos::{LogStatus, LogsQuery, MulticastMessage, WriteRequest, WriteResponse};
use crate::recovery;

pub fn router(ctx: Arc<NodeContext>) -> Router {
    Router::new()
        .route("/write", post(write))
        .route("/leader", get(leader))
        .route("/log-status", get(log_status))
        .route("/logs", get(logs))
        .route("/recvMulticast", post(recv_multicast))
        .route("/reset", post(reset))
        .route("/healthz", get(healthz))
        .with_state(ctx)
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            Error::Rejected(_) => StatusCode::FORBIDDEN,
            Error::ProtocolViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Transient(_) | Error::Http(_) | Error::Io(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::FatalLocal(_) | Error::Sqlite(_) | Error::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

async fn write(
    State(ctx): State<Arc<NodeContext>>,
    Json(req): Json<WriteRequest>,
) -> Result<Json<WriteResponse>, Error> {
    let pid = multicast::send_write(&ctx, req).await?;
    Ok(Json(WriteResponse { pid }))
}

async fn leader(State(ctx): State<Arc<NodeContext>>) -> String {
    let state = ctx.election.snapshot().await;
    let role = state.role();
    match state.last_known_leader {
        Some(id) => format!("Current leader: Node {id} (Term: {}, self: {role:?})", state.term),
        None => format!("Current leader: unknown (self: {role:?})"),
    }
}

async fn log_status(State(ctx): State<Arc<NodeContext>>) -> Result<Json<LogStatus>, Error> {
    let storage = ctx.storage.clone();
    let (last_log_id, last_log_timestamp) = tokio::task::spawn_blocking(move || {
        let id = storage.last_applied_pid()?;
        let ts = storage.last_applied_timestamp()?.unwrap_or_else(chrono::Utc::now);
        Ok::<_, Error>((id, ts))
    })
    .await
    .map_err(|e| Error::FatalLocal(e.to_string()))??;

    Ok(Json(LogStatus { node_id: ctx.self_id, last_log_id, last_log_timestamp }))
}

async fn logs(
    State(ctx): State<Arc<NodeContext>>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<serde_json::Value>, Error> {
    if !ctx.election.is_leader().await {
        return Err(Error::Rejected("only the current leader serves /logs".into()));
    }

    let storage = ctx.storage.clone();
    let last_id = query.last_id.unwrap_or(0);
    let entries = tokio::task::spawn_blocking(move || storage.entries_after(last_id))
        .await
        .map_err(|e| Error::FatalLocal(e.to_string()))??;

    Ok(Json(serde_json::to_value(entries)?))
}

/// Only two outcomes are part of this endpoint's external contract:
/// 200 on accept or duplicate, 500 on a recovery failure. Any error from the
/// receive path means the gap could not be closed, so it is reported as 500
/// regardless of the underlying error kind rather than through the generic
/// `Error -> status` mapping used elsewhere.
async fn recv_multicast(State(ctx): State<Arc<NodeContext>>, Json(msg): Json<MulticastMessage>) -> StatusCode {
    match multicast::receive(&ctx, msg).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "recvMulticast failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn reset(State(ctx): State<Arc<NodeContext>>) -> Result<StatusCode, Error> {
    recovery::reset(&ctx).await?;
    Ok(StatusCode::OK)
}

async fn healthz(State(ctx): State<Arc<NodeContext>>) -> StatusCode {
    if ctx.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_ctx() -> Arc<NodeContext> {
        let dir = tempfile::tempdir().unwrap().into_path();
        let mut config = Config::for_test(1);
        config.data_dir = dir.to_str().unwrap().to_string();
        Arc::new(NodeContext::new(config).unwrap())
    }

    #[tokio::test]
    async fn healthz_is_unavailable_until_marked_ready() {
        let ctx = test_ctx();
        let app = router(ctx.clone());

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        ctx.mark_ready();
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn write_is_rejected_when_not_leader() {
        let ctx = test_ctx();
        let app = router(ctx);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/write")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"query_type":"INSERT","table":"users","query":"q","args":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn logs_rejected_when_not_leader() {
        let ctx = test_ctx();
        let app = router(ctx);

        let resp = app
            .oneshot(Request::builder().uri("/logs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn log_status_reports_zero_on_fresh_node() {
        let ctx = test_ctx();
        let app = router(ctx);

        let resp = app
            .oneshot(Request::builder().uri("/log-status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["lastLogId"], 0);
    }
}
