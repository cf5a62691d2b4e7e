//! HTTP surface: batch submission and identity echo.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use mast_proto::{CommandBatch, Issuer};
use serde_json::json;
use tracing::{info, warn};

use crate::state::AppState;
use crate::websocket::websocket_handler;

pub fn build_router(state: AppState) -> Router {
    use tower_http::{cors::CorsLayer, trace::TraceLayer};

    Router::new()
        .route("/health", get(health))
        .route("/logininfo", get(logininfo))
        .route("/send-command-batch", post(send_command_batch))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub enum ApiError {
    Unauthorized(String),
    Forbidden(String),
    BadRequest(String),
    Upstream(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))
}

async fn logininfo(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = bearer_token(&headers)?;
    let claims = state
        .verifier
        .verify(token)
        .await
        .map_err(|err| ApiError::Unauthorized(format!("invalid token: {err}")))?;
    Ok(Json(json!({
        "user": claims.display_or_subject(),
        "userid": claims.subject,
        "groups": claims.groups,
        "email": claims.email,
    })))
}

async fn send_command_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<serde_json::Value>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = bearer_token(&headers)?;
    let claims = state
        .verifier
        .verify(token)
        .await
        .map_err(|err| ApiError::Unauthorized(format!("invalid token: {err}")))?;

    let required = &state.config.required_group;
    if !claims.groups.contains(required) {
        warn!(subject = %claims.subject, %required, "caller lacks required group");
        return Err(ApiError::Forbidden("insufficient group".into()));
    }

    let commands = body
        .as_ref()
        .and_then(|Json(data)| data.get("commands"))
        .and_then(|value| value.as_array())
        .and_then(|items| {
            items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect::<Option<Vec<String>>>()
        })
        .ok_or_else(|| ApiError::BadRequest("invalid commands format".into()))?;

    let issuer = Issuer {
        subject: claims.subject.clone(),
        display_name: claims.display_name.clone(),
        groups: claims.groups.clone(),
        raw_token: token.to_string(),
    };
    let batch = CommandBatch::new(&commands, issuer);

    // Record the submitter before publishing so a fast client can join the
    // room the moment it gets the batch id back.
    state
        .submitters
        .insert(batch.batch_id.clone(), claims.subject.clone());

    if let Err(err) = state.publisher.publish(&batch).await {
        state.submitters.remove(&batch.batch_id);
        warn!(batch_id = %batch.batch_id, error = %err, "failed to publish batch");
        return Err(ApiError::Upstream("broker unavailable".into()));
    }

    info!(
        event = "send-command-batch",
        subject = %claims.subject,
        batch_id = %batch.batch_id,
        commands = batch.commands.len(),
        "batch accepted"
    );
    Ok(Json(json!({
        "msg": "Command batch accepted",
        "batch_id": batch.batch_id,
        "issued_by": claims.subject,
        "groups": claims.groups,
    })))
}
