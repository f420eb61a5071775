use serde_json::Value;

use llmgate_common::GatewayError;
use llmgate_credential::state::FailureKind;

use crate::upstream_client::{UpstreamFailure, UpstreamTransportErrorKind};

/// What a single dispatch attempt produced, reduced to the shape the
/// credential pool and the retry loop both need to act on.
pub enum Outcome {
    Ok,
    Retryable(FailureKind, GatewayError),
    Terminal(GatewayError),
}

/// Classifies a transport-level failure (connection refused, timeout, DNS, ...)
/// as a retryable transient upstream error; these never implicate the credential
/// itself, but still count against the attempt budget.
pub fn classify_transport_failure(failure: &UpstreamFailure) -> Outcome {
    let kind = match failure.kind {
        UpstreamTransportErrorKind::Timeout
        | UpstreamTransportErrorKind::ReadTimeout
        | UpstreamTransportErrorKind::Dns
        | UpstreamTransportErrorKind::Tls
        | UpstreamTransportErrorKind::Connect
        | UpstreamTransportErrorKind::Other => FailureKind::TransientUpstream,
    };
    Outcome::Retryable(kind, GatewayError::TransientUpstream(failure.message.clone()))
}

/// Classifies a well-formed HTTP response from the upstream per the status/body
/// table: 401/403 → credential rejected, 429 or a quota-shaped body → quota
/// exceeded, 5xx → transient, 400 → bad request, 404 → unknown model, and a
/// safety/content-filter body → content filtered. Anything 2xx is `Outcome::Ok`.
pub fn classify_response(status: u16, body: Option<&[u8]>) -> Outcome {
    if (200..300).contains(&status) {
        return Outcome::Ok;
    }

    let body_text = body.and_then(|b| std::str::from_utf8(b).ok()).unwrap_or("");
    let parsed: Option<Value> = serde_json::from_str(body_text).ok();
    let message = parsed
        .as_ref()
        .and_then(extract_message)
        .unwrap_or_else(|| format!("upstream returned status {status}"));

    match status {
        401 | 403 => Outcome::Retryable(FailureKind::AuthRejected, GatewayError::AuthRejected),
        429 => Outcome::Retryable(FailureKind::QuotaExceeded, GatewayError::QuotaExceeded),
        404 => Outcome::Terminal(GatewayError::ModelNotFound(message)),
        400 if looks_like_content_filter(&message) => {
            Outcome::Terminal(GatewayError::ContentFiltered)
        }
        400 => Outcome::Terminal(GatewayError::BadRequest(message)),
        status if (500..600).contains(&status) => {
            Outcome::Retryable(FailureKind::TransientUpstream, GatewayError::TransientUpstream(message))
        }
        _ if looks_like_quota_message(&message) => {
            Outcome::Retryable(FailureKind::QuotaExceeded, GatewayError::QuotaExceeded)
        }
        _ => Outcome::Terminal(GatewayError::BadRequest(message)),
    }
}

fn extract_message(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| value.get("message").and_then(Value::as_str).map(str::to_string))
}

fn looks_like_quota_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("quota") || lower.contains("rate limit") || lower.contains("resource exhausted")
}

fn looks_like_content_filter(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("safety") || lower.contains("blocked") || lower.contains("content filter")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_401_to_auth_rejected() {
        match classify_response(401, None) {
            Outcome::Retryable(FailureKind::AuthRejected, GatewayError::AuthRejected) => {}
            _ => panic!("expected auth rejected"),
        }
    }

    #[test]
    fn maps_429_to_quota_exceeded() {
        match classify_response(429, None) {
            Outcome::Retryable(FailureKind::QuotaExceeded, GatewayError::QuotaExceeded) => {}
            _ => panic!("expected quota exceeded"),
        }
    }

    #[test]
    fn maps_503_to_transient() {
        match classify_response(503, None) {
            Outcome::Retryable(FailureKind::TransientUpstream, GatewayError::TransientUpstream(_)) => {}
            _ => panic!("expected transient upstream"),
        }
    }

    #[test]
    fn maps_404_to_model_not_found() {
        match classify_response(404, None) {
            Outcome::Terminal(GatewayError::ModelNotFound(_)) => {}
            _ => panic!("expected model not found"),
        }
    }

    #[test]
    fn maps_safety_blocked_400_to_content_filtered() {
        let body = br#"{"error":{"message":"response blocked by safety settings"}}"#;
        match classify_response(400, Some(body)) {
            Outcome::Terminal(GatewayError::ContentFiltered) => {}
            _ => panic!("expected content filtered"),
        }
    }

    #[test]
    fn maps_plain_400_to_bad_request() {
        let body = br#"{"error":{"message":"missing field: contents"}}"#;
        match classify_response(400, Some(body)) {
            Outcome::Terminal(GatewayError::BadRequest(_)) => {}
            _ => panic!("expected bad request"),
        }
    }

    #[test]
    fn success_status_is_ok() {
        assert!(matches!(classify_response(200, None), Outcome::Ok));
    }
}
