use serde::Serialize;

/// Internal error taxonomy. `llmgate-core` maps this to an HTTP status and
/// JSON body at the handler boundary; nothing downstream of the dispatcher
/// matches on HTTP concepts directly.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    ValidationError(String),
    #[error("upstream rejected credential")]
    AuthRejected,
    #[error("upstream quota exceeded")]
    QuotaExceeded,
    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),
    #[error("upstream rejected the request: {0}")]
    BadRequest(String),
    #[error("unknown model: {0}")]
    ModelNotFound(String),
    #[error("content filtered by upstream safety policy")]
    ContentFiltered,
    #[error("no healthy credential available")]
    NoHealthyCredential { retry_after_secs: Option<u64> },
    #[error("all credentials exhausted: {0}")]
    AllCredentialsExhausted(String),
    #[error("client cancelled the request")]
    ClientCancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("unauthorized")]
    Unauthorized,
}

impl GatewayError {
    /// HTTP status mirroring the failure class.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::ValidationError(_) => 400,
            GatewayError::BadRequest(_) => 400,
            GatewayError::Unauthorized => 401,
            GatewayError::ModelNotFound(_) => 404,
            GatewayError::ContentFiltered => 422,
            GatewayError::NoHealthyCredential { .. } => 429,
            GatewayError::AllCredentialsExhausted(_) => 502,
            GatewayError::DeadlineExceeded => 504,
            GatewayError::ClientCancelled => 499,
            GatewayError::AuthRejected | GatewayError::QuotaExceeded => 502,
            GatewayError::TransientUpstream(_) => 502,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::ValidationError(_) => "invalid_request_error",
            GatewayError::BadRequest(_) => "invalid_request_error",
            GatewayError::Unauthorized => "authentication_error",
            GatewayError::ModelNotFound(_) => "model_not_found",
            GatewayError::ContentFiltered => "content_filtered",
            GatewayError::NoHealthyCredential { .. } => "no_healthy_credential",
            GatewayError::AllCredentialsExhausted(_) => "upstream_exhausted",
            GatewayError::DeadlineExceeded => "deadline_exceeded",
            GatewayError::ClientCancelled => "client_cancelled",
            GatewayError::AuthRejected => "auth_rejected",
            GatewayError::QuotaExceeded => "quota_exceeded",
            GatewayError::TransientUpstream(_) => "transient_upstream",
        }
    }

    /// Seconds to suggest in a `Retry-After` header, when meaningful.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::NoHealthyCredential { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorPayload {
                message: self.to_string(),
                r#type: self.error_type().to_string(),
                code: self.status_code(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub message: String,
    pub r#type: String,
    pub code: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorPayload,
}
