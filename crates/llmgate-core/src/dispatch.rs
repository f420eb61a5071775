use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use llmgate_common::GatewayError;
use llmgate_credential::pool::CredentialId;
use llmgate_credential::CredentialPool;
use llmgate_protocol::gemini::count_tokens::types::Content;
use llmgate_protocol::gemini::generate_content::types::{Candidate, FinishReason};
use llmgate_protocol::gemini::generate_content::{GenerateContentRequestBody, GenerateContentResponse};

use crate::classify::{classify_response, classify_transport_failure, Outcome};
use crate::upstream_client::{
    Headers, HttpMethod, UpstreamBody, UpstreamClient, UpstreamHttpRequest,
};

/// Outcome of a committed dispatch: either a buffered native response, or a
/// raw byte stream from the upstream plus the credential id that served it.
pub enum DispatchOutcome {
    Buffered(GenerateContentResponse, CredentialId),
    Streaming(mpsc::Receiver<Bytes>, CredentialId),
}

pub struct Dispatcher {
    pool: Arc<CredentialPool>,
    client: Arc<dyn UpstreamClient>,
    upstream_base_url: String,
    max_attempts: u32,
    per_attempt_timeout: Duration,
    overall_deadline: Duration,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<CredentialPool>,
        client: Arc<dyn UpstreamClient>,
        upstream_base_url: String,
        max_attempts: u32,
        per_attempt_timeout: Duration,
        overall_deadline: Duration,
    ) -> Self {
        Self {
            pool,
            client,
            upstream_base_url,
            max_attempts,
            per_attempt_timeout,
            overall_deadline,
        }
    }

    fn build_url(&self, model: &str, stream: bool) -> String {
        let base = self.upstream_base_url.trim_end_matches('/');
        if stream {
            format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("{base}/v1beta/models/{model}:generateContent")
        }
    }

    /// Runs the attempt loop: lease → invoke → classify → retry/return.
    /// `stream` selects the upstream endpoint; the commit point for a streaming
    /// attempt is the receipt of a successful response status, after which no
    /// retry is attempted even if the body later errors mid-stream.
    pub async fn execute(
        &self,
        body: &GenerateContentRequestBody,
        model: &str,
        stream: bool,
    ) -> Result<DispatchOutcome, GatewayError> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| GatewayError::ValidationError(format!("could not serialize request: {e}")))?;
        let url = self.build_url(model, stream);
        let start = Instant::now();
        let deadline = start + self.overall_deadline;

        let mut tried: Vec<CredentialId> = Vec::new();
        let mut last_error: Option<GatewayError> = None;

        loop {
            if tried.len() as u32 >= self.max_attempts {
                return Err(GatewayError::AllCredentialsExhausted(
                    last_error.map(|e| e.to_string()).unwrap_or_else(|| "attempts exhausted".to_string()),
                ));
            }
            let now = Instant::now();
            if now >= deadline {
                if tried.is_empty() {
                    return Err(GatewayError::DeadlineExceeded);
                }
                return Err(GatewayError::AllCredentialsExhausted(
                    last_error.map(|e| e.to_string()).unwrap_or_else(|| "deadline exceeded".to_string()),
                ));
            }

            let (cred_id, secret) = match self.pool.lease(&tried) {
                Ok(leased) => leased,
                Err(_) => {
                    warn!(attempt = tried.len(), "no healthy credential to lease");
                    return Err(GatewayError::NoHealthyCredential {
                        retry_after_secs: self.pool.earliest_cooling_deadline().map(|d| d.as_secs()),
                    });
                }
            };
            debug!(credential = %cred_id, attempt = tried.len() + 1, model = %model, "leased credential");
            tried.push(cred_id.clone());

            let attempt_deadline = deadline.min(now + self.per_attempt_timeout);
            let remaining = attempt_deadline.saturating_duration_since(now);

            let req = UpstreamHttpRequest {
                method: HttpMethod::Post,
                url: url.clone(),
                headers: credential_headers(&secret),
                body: Some(Bytes::from(payload.clone())),
                is_stream: stream,
            };

            let send = tokio::time::timeout(remaining, self.client.send(req)).await;
            let sent = match send {
                Ok(result) => result,
                Err(_) => {
                    let outcome = Outcome::Retryable(
                        llmgate_credential::FailureKind::TransientUpstream,
                        GatewayError::TransientUpstream("per-attempt timeout".to_string()),
                    );
                    self.apply_outcome(&cred_id, outcome, &mut last_error);
                    continue;
                }
            };

            match sent {
                Err(failure) => {
                    let outcome = classify_transport_failure(&failure);
                    self.apply_outcome(&cred_id, outcome, &mut last_error);
                    continue;
                }
                Ok(resp) => {
                    if stream {
                        match resp.body {
                            UpstreamBody::Stream(rx) if (200..300).contains(&resp.status) => {
                                self.pool.report_success(&cred_id);
                                return Ok(DispatchOutcome::Streaming(rx, cred_id));
                            }
                            UpstreamBody::Bytes(bytes) => {
                                let outcome = classify_response(resp.status, Some(&bytes));
                                match outcome {
                                    Outcome::Ok => {
                                        // A 2xx with a buffered body still commits the stream;
                                        // the handler will emit it as a single SSE frame.
                                        self.pool.report_success(&cred_id);
                                        let (tx, rx) = mpsc::channel(1);
                                        let _ = tx.try_send(sse_data_frame(&bytes));
                                        return Ok(DispatchOutcome::Streaming(rx, cred_id));
                                    }
                                    Outcome::Terminal(GatewayError::ContentFiltered) => {
                                        let synthetic = serde_json::to_vec(&content_filtered_response())
                                            .expect("synthetic response serializes");
                                        let (tx, rx) = mpsc::channel(1);
                                        let _ = tx.try_send(sse_data_frame(&synthetic));
                                        return Ok(DispatchOutcome::Streaming(rx, cred_id));
                                    }
                                    Outcome::Terminal(err) => return Err(err),
                                    outcome @ Outcome::Retryable(..) => {
                                        self.apply_outcome(&cred_id, outcome, &mut last_error);
                                        continue;
                                    }
                                }
                            }
                            UpstreamBody::Stream(_) => {
                                // Non-2xx status but the transport still opened a stream;
                                // there is nothing bufferable to classify, treat as transient.
                                let outcome = Outcome::Retryable(
                                    llmgate_credential::FailureKind::TransientUpstream,
                                    GatewayError::TransientUpstream(format!(
                                        "upstream returned status {} on stream open",
                                        resp.status
                                    )),
                                );
                                self.apply_outcome(&cred_id, outcome, &mut last_error);
                                continue;
                            }
                        }
                    } else {
                        let bytes = match resp.body {
                            UpstreamBody::Bytes(bytes) => bytes,
                            UpstreamBody::Stream(_) => {
                                unreachable!("non-streaming request never yields a streaming body")
                            }
                        };
                        let outcome = classify_response(resp.status, Some(&bytes));
                        match outcome {
                            Outcome::Ok => {
                                let parsed: GenerateContentResponse = serde_json::from_slice(&bytes)
                                    .map_err(|e| {
                                        GatewayError::TransientUpstream(format!(
                                            "could not parse upstream response: {e}"
                                        ))
                                    })?;
                                self.pool.report_success(&cred_id);
                                return Ok(DispatchOutcome::Buffered(parsed, cred_id));
                            }
                            Outcome::Terminal(GatewayError::ContentFiltered) => {
                                return Ok(DispatchOutcome::Buffered(content_filtered_response(), cred_id));
                            }
                            Outcome::Terminal(err) => return Err(err),
                            outcome @ Outcome::Retryable(..) => {
                                self.apply_outcome(&cred_id, outcome, &mut last_error);
                                continue;
                            }
                        }
                    }
                }
            }
        }
    }

    fn apply_outcome(&self, cred_id: &str, outcome: Outcome, last_error: &mut Option<GatewayError>) {
        match outcome {
            Outcome::Retryable(kind, err) => {
                warn!(credential = %cred_id, kind = ?kind, "attempt failed, classified retryable");
                self.pool.report_failure(cred_id, kind);
                *last_error = Some(err);
            }
            Outcome::Terminal(err) => {
                *last_error = Some(err);
            }
            Outcome::Ok => {}
        }
    }
}

/// An upstream-rejected-before-generation safety block carries no candidate
/// content to translate; synthesized here so it still reaches the client as
/// a normal completion with `finish_reason=content_filter` rather than an
/// error envelope, matching the 200-with-SAFETY-candidate case.
fn content_filtered_response() -> GenerateContentResponse {
    GenerateContentResponse {
        candidates: vec![Candidate {
            content: Content {
                parts: Vec::new(),
                role: None,
            },
            finish_reason: Some(FinishReason::Safety),
            safety_ratings: None,
            citation_metadata: None,
            token_count: None,
            grounding_attributions: None,
            grounding_metadata: None,
            avg_logprobs: None,
            logprobs_result: None,
            url_context_metadata: None,
            index: None,
            finish_message: None,
        }],
        prompt_feedback: None,
        usage_metadata: None,
        model_version: None,
        response_id: None,
        model_status: None,
    }
}

/// Wraps a single JSON body as one `data:`-framed SSE event, matching the
/// framing `SseParser` and a real SSE client both expect on the wire.
fn sse_data_frame(json: &[u8]) -> Bytes {
    let mut framed = Vec::with_capacity(json.len() + 8);
    framed.extend_from_slice(b"data: ");
    framed.extend_from_slice(json);
    framed.extend_from_slice(b"\n\n");
    Bytes::from(framed)
}

fn credential_headers(secret: &str) -> Headers {
    vec![
        ("content-type".to_string(), "application/json".to_string()),
        ("x-goog-api-key".to_string(), secret.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;

    use llmgate_credential::CoolingPeriods;

    use super::*;
    use crate::upstream_client::{UpstreamFailure, UpstreamTransportErrorKind};

    fn body() -> GenerateContentRequestBody {
        serde_json::from_value(serde_json::json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}]
        }))
        .unwrap()
    }

    enum ScriptedReply {
        Status(u16, serde_json::Value),
        Transport(UpstreamTransportErrorKind),
    }

    struct ScriptedClient {
        replies: StdMutex<Vec<ScriptedReply>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<ScriptedReply>) -> Self {
            Self {
                replies: StdMutex::new(replies),
            }
        }
    }

    impl UpstreamClient for ScriptedClient {
        fn send<'a>(
            &'a self,
            _req: UpstreamHttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<crate::upstream_client::UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
        {
            let next = self.replies.lock().unwrap().remove(0);
            Box::pin(async move {
                match next {
                    ScriptedReply::Status(status, json) => Ok(crate::upstream_client::UpstreamHttpResponse {
                        status,
                        headers: vec![],
                        body: UpstreamBody::Bytes(Bytes::from(json.to_string())),
                    }),
                    ScriptedReply::Transport(kind) => Err(UpstreamFailure {
                        kind,
                        message: "scripted transport failure".to_string(),
                    }),
                }
            })
        }
    }

    fn dispatcher(pool: Arc<CredentialPool>, client: ScriptedClient, max_attempts: u32) -> Dispatcher {
        Dispatcher::new(
            pool,
            Arc::new(client),
            "https://upstream.example".to_string(),
            max_attempts,
            Duration::from_secs(5),
            Duration::from_secs(30),
        )
    }

    fn ok_body() -> serde_json::Value {
        serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "hi"}]}, "finishReason": "STOP"}]
        })
    }

    #[tokio::test]
    async fn happy_path_serves_on_first_attempt_and_increments_only_that_credential() {
        let pool = Arc::new(CredentialPool::new(3, CoolingPeriods::default()));
        let a = pool.add("key-a".to_string());
        let b = pool.add("key-b".to_string());
        let client = ScriptedClient::new(vec![ScriptedReply::Status(200, ok_body())]);
        let dispatcher = dispatcher(pool.clone(), client, 3);

        let outcome = dispatcher.execute(&body(), "gemini-1.5-pro", false).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Buffered(_, cred) if cred == a));

        let snap = pool.snapshot();
        let snap_a = snap.iter().find(|c| c.id == a).unwrap();
        let snap_b = snap.iter().find(|c| c.id == b).unwrap();
        assert_eq!(snap_a.total_requests, 1);
        assert_eq!(snap_b.total_requests, 0);
    }

    #[tokio::test]
    async fn failover_retries_on_second_credential_after_quota_exceeded() {
        let pool = Arc::new(CredentialPool::new(3, CoolingPeriods::default()));
        let a = pool.add("key-a".to_string());
        let b = pool.add("key-b".to_string());
        let client = ScriptedClient::new(vec![
            ScriptedReply::Status(429, serde_json::json!({"error": {"message": "quota exceeded"}})),
            ScriptedReply::Status(200, ok_body()),
        ]);
        let dispatcher = dispatcher(pool.clone(), client, 3);

        let outcome = dispatcher.execute(&body(), "gemini-1.5-pro", false).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Buffered(_, cred) if cred == b));

        let snap = pool.snapshot();
        let snap_a = snap.iter().find(|c| c.id == a).unwrap();
        let snap_b = snap.iter().find(|c| c.id == b).unwrap();
        assert_eq!(snap_a.total_requests, 1);
        assert_eq!(snap_a.state, llmgate_credential::CredentialState::Cooling);
        assert_eq!(snap_b.total_requests, 1);
        assert_eq!(snap_b.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn exhaustion_returns_all_credentials_exhausted_after_max_attempts() {
        let pool = Arc::new(CredentialPool::new(3, CoolingPeriods::default()));
        pool.add("key-a".to_string());
        pool.add("key-b".to_string());
        let client = ScriptedClient::new(vec![
            ScriptedReply::Status(500, serde_json::json!({"error": {"message": "boom"}})),
            ScriptedReply::Status(500, serde_json::json!({"error": {"message": "boom"}})),
        ]);
        let dispatcher = dispatcher(pool.clone(), client, 2);

        let err = dispatcher.execute(&body(), "gemini-1.5-pro", false).await.unwrap_err();
        assert!(matches!(err, GatewayError::AllCredentialsExhausted(_)));
        for snap in pool.snapshot() {
            assert_eq!(snap.state, llmgate_credential::CredentialState::Cooling);
        }
    }

    #[tokio::test]
    async fn bad_request_is_terminal_and_not_retried() {
        let pool = Arc::new(CredentialPool::new(3, CoolingPeriods::default()));
        pool.add("key-a".to_string());
        pool.add("key-b".to_string());
        let client = ScriptedClient::new(vec![ScriptedReply::Status(
            400,
            serde_json::json!({"error": {"message": "missing field: contents"}}),
        )]);
        let dispatcher = dispatcher(pool.clone(), client, 3);

        let err = dispatcher.execute(&body(), "gemini-1.5-pro", false).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
        assert!(pool.snapshot().iter().all(|c| c.state == llmgate_credential::CredentialState::Active));
    }

    #[tokio::test]
    async fn safety_blocked_400_is_returned_as_a_normal_completion_not_an_error() {
        let pool = Arc::new(CredentialPool::new(3, CoolingPeriods::default()));
        pool.add("key-a".to_string());
        let client = ScriptedClient::new(vec![ScriptedReply::Status(
            400,
            serde_json::json!({"error": {"message": "response blocked by safety settings"}}),
        )]);
        let dispatcher = dispatcher(pool.clone(), client, 3);

        let outcome = dispatcher.execute(&body(), "gemini-1.5-pro", false).await.unwrap();
        let DispatchOutcome::Buffered(response, _) = outcome else {
            panic!("expected a buffered outcome");
        };
        assert_eq!(response.candidates.len(), 1);
        assert_eq!(response.candidates[0].finish_reason, Some(FinishReason::Safety));
        assert!(response.candidates[0].content.parts.is_empty());
        assert!(pool.snapshot().iter().all(|c| c.state == llmgate_credential::CredentialState::Active));
    }

    #[tokio::test]
    async fn no_healthy_credential_when_pool_is_empty() {
        let pool = Arc::new(CredentialPool::new(3, CoolingPeriods::default()));
        let client = ScriptedClient::new(vec![]);
        let dispatcher = dispatcher(pool, client, 3);

        let err = dispatcher.execute(&body(), "gemini-1.5-pro", false).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyCredential { .. }));
    }

    #[tokio::test]
    async fn streaming_buffered_2xx_body_still_commits_as_a_single_frame_stream() {
        let pool = Arc::new(CredentialPool::new(3, CoolingPeriods::default()));
        pool.add("key-a".to_string());
        let client = ScriptedClient::new(vec![ScriptedReply::Status(200, ok_body())]);
        let dispatcher = dispatcher(pool, client, 3);

        let outcome = dispatcher.execute(&body(), "gemini-1.5-pro", true).await.unwrap();
        let DispatchOutcome::Streaming(mut rx, _) = outcome else {
            panic!("expected a streaming outcome");
        };
        let chunk = rx.recv().await.unwrap();
        let expected = format!("data: {}\n\n", ok_body());
        assert_eq!(&chunk[..], expected.as_bytes());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn transport_failure_is_retried_as_transient() {
        let pool = Arc::new(CredentialPool::new(3, CoolingPeriods::default()));
        let a = pool.add("key-a".to_string());
        let b = pool.add("key-b".to_string());
        let client = ScriptedClient::new(vec![
            ScriptedReply::Transport(UpstreamTransportErrorKind::Connect),
            ScriptedReply::Status(200, ok_body()),
        ]);
        let dispatcher = dispatcher(pool.clone(), client, 3);

        let outcome = dispatcher.execute(&body(), "gemini-1.5-pro", false).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Buffered(_, cred) if cred == b));
        assert_eq!(
            pool.snapshot().iter().find(|c| c.id == a).unwrap().state,
            llmgate_credential::CredentialState::Active
        );
    }
}
