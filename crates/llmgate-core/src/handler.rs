use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use bytes::Bytes;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use llmgate_common::GatewayError;
use llmgate_protocol::gemini::{GenerateContentRequestBody, GenerateContentResponse, ListModelsResponse, Model as GeminiModel};
use llmgate_protocol::openai::create_chat_completions::{
    CreateChatCompletionRequest, CreateChatCompletionRequestBody, CreateChatCompletionResponse,
};
use llmgate_protocol::openai::list_models::{Model as OpenAiModel, ModelListObjectType, ModelObjectType, ModelsListResponse};
use llmgate_protocol::SseParser;
use llmgate_translate::generate_content::gemini2openai_chat_completions::response::transform_response;
use llmgate_translate::generate_content::gemini2openai_chat_completions::stream::GeminiToOpenAIChatCompletionStreamState;
use llmgate_translate::generate_content::openai_chat_completions2gemini::request::transform_request;

use crate::cache::{is_cacheable, CachedCompletion, Fingerprint};
use crate::dispatch::DispatchOutcome;
use crate::error::error_response;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/gemini/health", get(health))
        .route("/v1/models", get(openai_models))
        .route("/v1/chat/completions", post(openai_chat_completions))
        .route("/gemini/v1beta/models", get(gemini_models))
        .route("/gemini/v1beta/models/{*model_and_action}", post(gemini_generate))
        .route("/stats", get(stats))
        .route("/admin/keys", get(admin_list_keys).post(admin_add_key))
        .route("/admin/keys/{id}", delete(admin_remove_key))
        .route("/admin/keys/{id}/enable", post(admin_enable_key))
        .route("/admin/keys/{id}/disable", post(admin_disable_key))
        .route("/admin/keys/{id}/reset", post(admin_reset_key))
        .route("/admin/cache", delete(admin_invalidate_cache))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

fn require_client(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    state.auth.check_client(headers).map_err(|e| error_response(&e))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    state.auth.check_admin(headers).map_err(|e| error_response(&e))
}

async fn openai_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_client(&state, &headers) {
        return resp;
    }
    let data = state
        .config
        .model_mapping
        .advertised_names()
        .into_iter()
        .map(|id| OpenAiModel {
            id,
            object: ModelObjectType::Model,
            created: 0,
            owned_by: "llmgate".to_string(),
        })
        .collect();
    Json(ModelsListResponse {
        object: ModelListObjectType::List,
        data,
    })
    .into_response()
}

async fn gemini_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_client(&state, &headers) {
        return resp;
    }
    let models = state
        .config
        .model_mapping
        .advertised_names()
        .into_iter()
        .map(|name| GeminiModel {
            name: name.clone(),
            display_name: name,
            description: None,
        })
        .collect();
    Json(ListModelsResponse { models }).into_response()
}

#[derive(Serialize)]
struct StatsResponse {
    credentials: Vec<llmgate_credential::CredentialSnapshot>,
    cache_size: usize,
    cache_max_size: u64,
    cache_enabled: bool,
}

async fn stats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_client(&state, &headers) {
        return resp;
    }
    Json(StatsResponse {
        credentials: state.pool.snapshot(),
        cache_size: state.cache.len(),
        cache_max_size: state.config.cache_max_size,
        cache_enabled: state.config.cache_enabled,
    })
    .into_response()
}

async fn openai_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateChatCompletionRequestBody>,
) -> Response {
    if let Err(resp) = require_client(&state, &headers) {
        return resp;
    }

    let trace_id = Uuid::new_v4().to_string();

    if body.messages.is_empty() {
        return error_response(&GatewayError::ValidationError("messages must not be empty".to_string()));
    }

    let resolved_model = state.config.model_mapping.resolve(&body.model);
    let wants_stream = body.stream.unwrap_or(false);

    if wants_stream {
        return stream_openai_chat(state, body, resolved_model, trace_id).await;
    }

    let eligible = is_cacheable(&body, state.config.cache_enabled);
    let requested_model = body.model.clone();

    if eligible {
        let fingerprint = Fingerprint::from_request(&body, &resolved_model);
        let state_for_compute = state.clone();
        let body_for_compute = body.clone();
        let model_for_compute = resolved_model.clone();
        let requested_for_compute = requested_model.clone();
        let trace_id_for_compute = trace_id.clone();
        let result = state
            .cache
            .get_or_compute(fingerprint, move || {
                compute_buffered_completion(
                    state_for_compute,
                    body_for_compute,
                    model_for_compute,
                    requested_for_compute,
                    trace_id_for_compute,
                )
            })
            .await;
        return match result {
            Ok(CachedCompletion { response_json }) => Json(response_json).into_response(),
            Err(e) => error_response(&e),
        };
    }

    match compute_buffered_completion(state.clone(), body, resolved_model, requested_model, trace_id).await {
        Ok(CachedCompletion { response_json }) => Json(response_json).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn compute_buffered_completion(
    state: Arc<AppState>,
    body: CreateChatCompletionRequestBody,
    resolved_model: String,
    requested_model: String,
    trace_id: String,
) -> Result<CachedCompletion, GatewayError> {
    let native_request = transform_request(CreateChatCompletionRequest { body });
    let outcome = state
        .dispatcher
        .execute(&native_request.body, &resolved_model, false)
        .await?;
    let native_response = match outcome {
        DispatchOutcome::Buffered(resp, cred_id) => {
            info!(trace_id = %trace_id, credential = %cred_id, model = %resolved_model, "chat completion served");
            resp
        }
        DispatchOutcome::Streaming(..) => {
            return Err(GatewayError::TransientUpstream(
                "expected a buffered response for a non-streaming dispatch".to_string(),
            ));
        }
    };
    let openai_response: CreateChatCompletionResponse = transform_response(native_response, &requested_model);
    let response_json = serde_json::to_value(&openai_response)
        .map_err(|e| GatewayError::TransientUpstream(format!("could not encode response: {e}")))?;
    Ok(CachedCompletion { response_json })
}

async fn stream_openai_chat(
    state: Arc<AppState>,
    body: CreateChatCompletionRequestBody,
    resolved_model: String,
    trace_id: String,
) -> Response {
    let requested_model = body.model.clone();
    let native_request = transform_request(CreateChatCompletionRequest { body });

    let outcome = state.dispatcher.execute(&native_request.body, &resolved_model, true).await;
    let (rx, cred_id) = match outcome {
        Ok(DispatchOutcome::Streaming(rx, cred_id)) => (rx, cred_id),
        Ok(DispatchOutcome::Buffered(..)) => {
            return error_response(&GatewayError::TransientUpstream(
                "expected a streaming response for a streaming dispatch".to_string(),
            ));
        }
        Err(e) => return error_response(&e),
    };
    info!(trace_id = %trace_id, credential = %cred_id, model = %resolved_model, "chat completion stream started");

    let body_stream = openai_sse_stream(rx, requested_model);
    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| error_response(&GatewayError::TransientUpstream("failed to build stream response".to_string())))
}

fn openai_sse_stream(
    mut rx: mpsc::Receiver<Bytes>,
    requested_model: String,
) -> impl futures_util::Stream<Item = Result<Bytes, Infallible>> {
    stream::unfold(
        StreamState {
            rx_open: true,
            parser: SseParser::new(),
            translator: GeminiToOpenAIChatCompletionStreamState::new(),
            pending: std::collections::VecDeque::new(),
            done: false,
            _requested_model: requested_model,
        },
        move |mut st| async move {
            loop {
                if let Some(frame) = st.pending.pop_front() {
                    return Some((Ok(frame), st));
                }
                if st.done {
                    return None;
                }
                if !st.rx_open {
                    for event in std::mem::take(&mut st.parser).finish() {
                        enqueue_translated(&mut st, event);
                    }
                    st.done = true;
                    st.pending.push_back(Bytes::from_static(b"data: [DONE]\n\n"));
                    continue;
                }
                match rx.recv().await {
                    Some(chunk) => {
                        let events = st.parser.push_bytes(&chunk);
                        for event in events {
                            enqueue_translated(&mut st, event);
                        }
                    }
                    None => {
                        st.rx_open = false;
                    }
                }
            }
        },
    )
}

struct StreamState {
    rx_open: bool,
    parser: llmgate_protocol::sse::SseParser,
    translator: GeminiToOpenAIChatCompletionStreamState,
    pending: std::collections::VecDeque<Bytes>,
    done: bool,
    _requested_model: String,
}

fn enqueue_translated(st: &mut StreamState, event: llmgate_protocol::SseEvent) {
    let Ok(native): Result<GenerateContentResponse, _> = serde_json::from_str(&event.data) else {
        warn!("dropping malformed upstream stream chunk");
        return;
    };
    for chunk in st.translator.transform_response(native) {
        match serde_json::to_string(&chunk) {
            Ok(json) => st.pending.push_back(Bytes::from(format!("data: {json}\n\n"))),
            Err(_) => warn!("failed to encode translated stream chunk"),
        }
    }
}

async fn gemini_generate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(model_and_action): Path<String>,
    Json(body): Json<GenerateContentRequestBody>,
) -> Response {
    if let Err(resp) = require_client(&state, &headers) {
        return resp;
    }

    let Some((model, action)) = model_and_action.split_once(':') else {
        return error_response(&GatewayError::ValidationError(
            "expected path of the form {model}:generateContent".to_string(),
        ));
    };

    let trace_id = Uuid::new_v4().to_string();

    match action {
        "generateContent" => gemini_generate_buffered(state, model, body, trace_id).await,
        "streamGenerateContent" => gemini_generate_stream(state, model, body, trace_id).await,
        other => error_response(&GatewayError::ValidationError(format!("unknown action: {other}"))),
    }
}

async fn gemini_generate_buffered(
    state: Arc<AppState>,
    model: &str,
    body: GenerateContentRequestBody,
    trace_id: String,
) -> Response {
    match state.dispatcher.execute(&body, model, false).await {
        Ok(DispatchOutcome::Buffered(resp, cred_id)) => {
            info!(trace_id = %trace_id, credential = %cred_id, model = %model, "native generate served");
            Json(resp).into_response()
        }
        Ok(DispatchOutcome::Streaming(..)) => {
            error_response(&GatewayError::TransientUpstream("unexpected streaming response".to_string()))
        }
        Err(e) => error_response(&e),
    }
}

async fn gemini_generate_stream(
    state: Arc<AppState>,
    model: &str,
    body: GenerateContentRequestBody,
    trace_id: String,
) -> Response {
    match state.dispatcher.execute(&body, model, true).await {
        Ok(DispatchOutcome::Streaming(rx, cred_id)) => {
            info!(trace_id = %trace_id, credential = %cred_id, model = %model, "native stream started");
            let passthrough = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|chunk| (Ok::<Bytes, Infallible>(chunk), rx)) });
            Response::builder()
                .status(StatusCode::OK)
                .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
                .header("cache-control", "no-cache")
                .body(Body::from_stream(passthrough))
                .unwrap_or_else(|_| {
                    error_response(&GatewayError::TransientUpstream("failed to build stream response".to_string()))
                })
        }
        Ok(DispatchOutcome::Buffered(..)) => {
            error_response(&GatewayError::TransientUpstream("unexpected buffered response".to_string()))
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct AddKeyRequest {
    secret: String,
}

#[derive(Debug, Serialize)]
struct AddKeyResponse {
    id: String,
}

async fn admin_list_keys(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    Json(state.pool.snapshot()).into_response()
}

async fn admin_add_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AddKeyRequest>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let id = state.pool.add(req.secret);
    (StatusCode::CREATED, Json(AddKeyResponse { id })).into_response()
}

async fn admin_invalidate_cache(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    state.cache.invalidate_all();
    StatusCode::NO_CONTENT.into_response()
}

async fn admin_remove_key(State(state): State<Arc<AppState>>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    if state.pool.remove(&id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(&GatewayError::ValidationError(format!("unknown credential id: {id}")))
    }
}

async fn admin_enable_key(State(state): State<Arc<AppState>>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    admin_mutate(state, headers, id, |pool, id| pool.enable(id)).await
}

async fn admin_disable_key(State(state): State<Arc<AppState>>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    admin_mutate(state, headers, id, |pool, id| pool.disable(id)).await
}

async fn admin_reset_key(State(state): State<Arc<AppState>>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    admin_mutate(state, headers, id, |pool, id| pool.reset(id)).await
}

async fn admin_mutate(
    state: Arc<AppState>,
    headers: HeaderMap,
    id: String,
    f: impl FnOnce(&llmgate_credential::CredentialPool, &str) -> bool,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    if f(&state.pool, &id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(&GatewayError::ValidationError(format!("unknown credential id: {id}")))
    }
}
