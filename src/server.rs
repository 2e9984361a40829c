use axum::{
    extract::{rejection::JsonRejection, State},
    http::{self, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::device_detection::AcceleratorInventory;
use crate::error::{ErrorKind, InferenceError};
use crate::generation::{GenerateRequest, StreamFragment};
use crate::service::{HealthReport, InferenceService, ServiceOutcome};

/// Error body returned by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    fn from_inference(err: &InferenceError) -> Self {
        let details = match err {
            InferenceError::ModelUnavailable { phase } => Some(serde_json::json!({ "phase": phase })),
            _ => None,
        };
        Self {
            error: err.to_string(),
            error_code: err.kind().as_str().to_string(),
            details,
        }
    }
}

pub fn status_code(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ModelUnavailable | ErrorKind::ModelLoadFailed | ErrorKind::AcceleratorOutOfMemory => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::GenerationFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Transport wrapper so handlers can return `InferenceError` with `?`.
pub struct HttpError(pub InferenceError);

impl From<InferenceError> for HttpError {
    fn from(err: InferenceError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for HttpError {
    fn from(rejection: JsonRejection) -> Self {
        Self(InferenceError::invalid(rejection.body_text()))
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = status_code(self.0.kind());
        (status, Json(ApiError::from_inference(&self.0))).into_response()
    }
}

pub fn create_router(service: InferenceService) -> Router {
    let cors_layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([http::header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::any());

    Router::new()
        .route("/health", get(health_check))
        .route("/gpu_info", get(gpu_info))
        .route("/generate", post(generate))
        .layer(cors_layer)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(service))
}

async fn health_check(State(service): State<Arc<InferenceService>>) -> Json<HealthReport> {
    Json(service.health().await)
}

async fn gpu_info(State(service): State<Arc<InferenceService>>) -> Json<AcceleratorInventory> {
    Json(service.gpu_info().await)
}

async fn generate(
    State(service): State<Arc<InferenceService>>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response, HttpError> {
    let Json(request) = payload?;
    match service.generate(request).await? {
        ServiceOutcome::Complete(result) => Ok(Json(result).into_response()),
        ServiceOutcome::Stream(stream) => {
            let events = stream.map(|fragment| Ok::<Event, Infallible>(fragment_event(fragment)));
            Ok(Sse::new(events)
                .keep_alive(
                    KeepAlive::new()
                        .interval(Duration::from_secs(30))
                        .text("keepalive"),
                )
                .into_response())
        }
    }
}

/// `Text` becomes a data event, `End` the `[DONE]` marker, `Error` an
/// `error` event carrying the error body.
pub fn fragment_event(fragment: StreamFragment) -> Event {
    match fragment {
        StreamFragment::Text(text) => Event::default().data(text),
        StreamFragment::End => Event::default().data("[DONE]"),
        StreamFragment::Error(err) => {
            let body = serde_json::to_string(&ApiError::from_inference(&err))
                .unwrap_or_else(|_| err.to_string());
            Event::default().event("error").data(body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Phase;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_code(InferenceError::ModelUnavailable { phase: Phase::Loading }.kind()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_code(InferenceError::AcceleratorOutOfMemory("oom".into()).kind()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_code(InferenceError::invalid("x").kind()), StatusCode::BAD_REQUEST);
        assert_eq!(status_code(InferenceError::Timeout(5).kind()), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_code(InferenceError::GenerationFailure("x".into()).kind()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_body_carries_phase() {
        let body = ApiError::from_inference(&InferenceError::ModelUnavailable { phase: Phase::Loading });
        assert_eq!(body.error_code, "MODEL_UNAVAILABLE");
        assert_eq!(body.details, Some(serde_json::json!({ "phase": "loading" })));
    }
}
