use axum::body::Body;
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;

use llmgate_common::GatewayError;

/// Renders a [`GatewayError`] as a JSON error body with a matching HTTP status.
/// `Retry-After` is attached when the error carries a meaningful hint.
pub fn error_response(err: &GatewayError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::to_vec(&err.to_body()).unwrap_or_else(|_| b"{}".to_vec());
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(secs) = err.retry_after_secs()
        && let Ok(value) = HeaderValue::from_str(&secs.to_string())
    {
        resp.headers_mut().insert("retry-after", value);
    }
    resp
}
