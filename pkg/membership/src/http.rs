use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::errors::Error;
use crate::types::{KeepaliveRequest, RegisterRequest, RegisterResponse};
use crate::Registry;

pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/keepalive", post(keepalive))
        .route("/members", get(members))
        .with_state(registry)
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::BAD_REQUEST, self.to_string()).into_response()
    }
}

async fn register(
    State(registry): State<Arc<Registry>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, Error> {
    let lease_id = registry.register(req.id, req.address).await?;
    Ok(Json(RegisterResponse { lease_id }))
}

async fn keepalive(
    State(registry): State<Arc<Registry>>,
    Json(req): Json<KeepaliveRequest>,
) -> Result<StatusCode, Error> {
    registry.keepalive(req.id, req.address, req.is_leader).await?;
    Ok(StatusCode::OK)
}

async fn members(State(registry): State<Arc<Registry>>) -> Json<serde_json::Value> {
    // Keyed by id as a string: JSON object keys are always strings, and the
    // external interface specifies a mapping of id to entry.
    let entries = registry.members().await;
    let keyed: std::collections::HashMap<String, _> =
        entries.into_iter().map(|(id, e)| (id.to_string(), e)).collect();
    Json(serde_json::to_value(keyed).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_registry() -> Arc<Registry> {
        Arc::new(Registry::new(&crate::config::Config {
            http_port: 0,
            lease_duration_ms: 5_000,
            sweep_interval_ms: 2_500,
        }))
    }

    #[tokio::test]
    async fn register_and_list() {
        let app = router(test_registry());

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/register")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"id":1,"address":"127.0.0.1:9001"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::builder().uri("/members").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value.get("1").is_some());
    }

    #[tokio::test]
    async fn register_with_malformed_address_is_rejected() {
        let app = router(test_registry());

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/register")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"id":1,"address":"not-a-host-port"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
